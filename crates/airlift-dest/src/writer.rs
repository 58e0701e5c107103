use std::fs::File;
use std::io::Write;
use std::sync::Arc;

use airlift_pagemap::{BitmapReader, BitmapWriter};
use airlift_protocol::{write_request, Request};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::debug;

use crate::shared::Shared;
use crate::state::DaemonState;
use crate::{Flow, Result, MAX_REQUESTS};

pub(crate) struct WriterBlock {
    pub requested: BitmapWriter,
    pub received: BitmapReader,
    pub clean: BitmapReader,
}

/// The mig-write worker: drains pending faults from each backing store,
/// serves what is already local and turns the rest into page requests. Sole
/// writer of the `requested` bitmaps.
pub(crate) struct MigWriter {
    shared: Arc<Shared>,
    stream: Option<File>,
    blocks: Vec<WriterBlock>,
    last_block: Option<usize>,
}

impl MigWriter {
    pub fn new(shared: Arc<Shared>, stream: File, blocks: Vec<WriterBlock>) -> Self {
        Self {
            shared,
            stream: Some(stream),
            blocks,
            last_block: None,
        }
    }

    pub fn tick(&mut self) -> Result<Flow> {
        // The one-second timeout doubles as the polling cadence for the
        // EOC-pending flag.
        let readable: Vec<usize> = {
            let mut fds: Vec<PollFd> = self
                .shared
                .blocks
                .iter()
                .map(|b| PollFd::new(b.store.fault_fd(), PollFlags::POLLIN))
                .collect();
            match poll(&mut fds, PollTimeout::from(1000u16)) {
                Ok(0) => Vec::new(),
                Ok(_) => fds
                    .iter()
                    .enumerate()
                    .filter(|(_, fd)| {
                        fd.revents()
                            .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
                    })
                    .map(|(idx, _)| idx)
                    .collect(),
                Err(nix::errno::Errno::EINTR) => return Ok(Flow::Continue),
                Err(e) => return Err(std::io::Error::from(e).into()),
            }
        };

        for idx in readable {
            self.send_page_req(idx)?;
        }
        self.check_eoc()?;
        Ok(Flow::Continue)
    }

    /// Drains one block's faults and emits at most one framed request.
    fn send_page_req(&mut self, idx: usize) -> Result<()> {
        let faults = self.shared.blocks[idx].store.take_faults(MAX_REQUESTS)?;
        if faults.is_empty() {
            return Ok(());
        }

        let geo = self.shared.geometry;
        let precopy = self.shared.precopy;
        let wb = &self.blocks[idx];
        // Host pages servable without the source, and target pages owed it.
        let mut local: Vec<u64> = Vec::new();
        let mut wanted: Vec<u64> = Vec::new();

        if geo.target_covers_host() {
            for hp in faults {
                let tp = geo.host_to_target(hp);
                // Readers race the clean-bitmap load and the stream reader;
                // a stale miss only costs a request the source discards.
                if (precopy && wb.clean.test(tp)) || wb.received.test(tp) {
                    local.extend(geo.host_pages_of_target(tp));
                } else if !wb.requested.test_and_set(tp) {
                    wanted.push(tp);
                }
            }
        } else {
            for hp in faults {
                let siblings = geo.target_pages_of_host(hp);
                let satisfied = siblings
                    .clone()
                    .all(|tp| (precopy && wb.clean.test(tp)) || wb.received.test(tp));
                if satisfied {
                    local.push(hp);
                } else {
                    for tp in siblings {
                        if !wb.requested.test_and_set(tp) {
                            wanted.push(tp);
                        }
                    }
                }
            }
        }

        if !local.is_empty() {
            // Data already in place; the store wakes the faulters directly.
            self.shared.blocks[idx].store.mark_cached(&local)?;
        }
        if !wanted.is_empty() {
            if let Some(stream) = self.stream.as_mut() {
                let request = if self.last_block == Some(idx) {
                    Request::PageCont { pgoffs: wanted }
                } else {
                    Request::Page {
                        id: self.shared.blocks[idx].ram.id.clone(),
                        pgoffs: wanted,
                    }
                };
                write_request(stream, &request)?;
                stream.flush()?;
                self.last_block = Some(idx);
            }
        }
        Ok(())
    }

    /// Emits the EOC request once asked to, then closes the write half.
    fn check_eoc(&mut self) -> Result<()> {
        if self.shared.claim(
            DaemonState::EOC_SEND_REQ,
            DaemonState::EOC_SENDING | DaemonState::EOC_SENT,
            DaemonState::EOC_SENDING,
        ) {
            if let Some(mut stream) = self.stream.take() {
                write_request(&mut stream, &Request::Eoc)?;
                stream.flush()?;
            }
            self.shared.set_state(DaemonState::EOC_SENT);
            debug!("EOC sent, write half closed");
        }
        Ok(())
    }
}
