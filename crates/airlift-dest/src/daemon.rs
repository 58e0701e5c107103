use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::thread::JoinHandle;

use airlift_pagemap::{AtomicBitmap, PageGeometry};
use airlift_protocol::{read_section, Options, Section};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::control::ControlPipe;
use crate::fault;
use crate::reader::{MigReader, ReaderBlock};
pub use crate::shared::DestBlock;
use crate::shared::{worker_loop, Shared};
use crate::state::DaemonState;
use crate::writer::{MigWriter, WriterBlock};
use crate::{DestError, Result};

/// Destination engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub target_page_size: u64,
    pub host_page_size: u64,
    /// Whether the source announced a precopy phase in its `INIT` options.
    pub precopy: bool,
}

impl DaemonConfig {
    pub fn geometry(&self) -> Result<PageGeometry> {
        Ok(PageGeometry::new(
            self.target_page_size,
            self.host_page_size,
        )?)
    }
}

/// File descriptors the daemon runs on. The embedder creates the pipes (and
/// the fault forwarder on its own side) and hands the daemon its ends.
pub struct DaemonChannels {
    /// Connected migration socket, read/write capable; duplicated
    /// internally into independent read and write handles.
    pub stream: OwnedFd,
    /// Supervisor-to-daemon control pipe, read end.
    pub control_rx: OwnedFd,
    /// Daemon-to-supervisor control pipe, write end.
    pub control_tx: OwnedFd,
    /// Wake pipe to the fault forwarder, write end; switched to
    /// non-blocking here.
    pub wake_tx: OwnedFd,
    /// Echo pipe from the fault forwarder, read end.
    pub fault_rx: OwnedFd,
}

/// Parses the handshake envelope off the migration socket: the `INIT`
/// option mask, then the opaque device state the embedder loads before the
/// on-demand phase starts.
pub fn read_handshake(stream: &mut impl Read) -> Result<(Options, Vec<u8>)> {
    let Section::Init(options) = read_section(stream)? else {
        return Err(DestError::UnexpectedRecord);
    };
    let Section::Full(device_state) = read_section(stream)? else {
        return Err(DestError::UnexpectedRecord);
    };
    debug!(?options, "handshake complete");
    Ok((options, device_state))
}

/// The destination incoming daemon. [`Daemon::run`] drives the whole
/// post-copy phase and returns the final state word.
pub struct Daemon {
    shared: Arc<Shared>,
    reader: MigReader,
    writer: MigWriter,
    control: ControlPipe,
    fault_rx: OwnedFd,
}

impl Daemon {
    pub fn new(
        config: DaemonConfig,
        blocks: Vec<DestBlock>,
        channels: DaemonChannels,
    ) -> Result<Daemon> {
        let geometry = config.geometry()?;
        let write_half = channels.stream.try_clone()?;
        fcntl(
            channels.wake_tx.as_raw_fd(),
            FcntlArg::F_SETFL(OFlag::O_NONBLOCK),
        )
        .map_err(std::io::Error::from)?;

        let npages: Vec<u64> = blocks
            .iter()
            .map(|b| b.ram.target_pages(&geometry))
            .collect();
        let shared = Arc::new(Shared::new(
            geometry,
            config.precopy,
            blocks,
            File::from(channels.wake_tx),
        ));

        let mut reader_blocks = Vec::with_capacity(npages.len());
        let mut writer_blocks = Vec::with_capacity(npages.len());
        for &n in &npages {
            let (received_w, received_r) = AtomicBitmap::split(n);
            let (clean_w, clean_r) = AtomicBitmap::split(n);
            let (requested_w, _) = AtomicBitmap::split(n);
            reader_blocks.push(ReaderBlock {
                received: received_w,
                clean: clean_w,
            });
            writer_blocks.push(WriterBlock {
                requested: requested_w,
                received: received_r,
                clean: clean_r,
            });
        }

        Ok(Daemon {
            reader: MigReader::new(
                shared.clone(),
                File::from(channels.stream),
                reader_blocks,
            ),
            writer: MigWriter::new(shared.clone(), File::from(write_half), writer_blocks),
            control: ControlPipe::new(shared.clone(), channels.control_tx, channels.control_rx),
            fault_rx: channels.fault_rx,
            shared,
        })
    }

    /// Runs the daemon to completion on the calling thread and returns the
    /// final state word. The caller decides what to do with the process
    /// afterwards; nothing here tears down shared runtime state.
    pub fn run(self) -> Result<DaemonState> {
        let Daemon {
            shared,
            mut reader,
            mut writer,
            mut control,
            fault_rx,
        } = self;

        let fault_receive = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("fault-receive".into())
                .spawn(move || fault::fault_receive_loop(shared, fault_rx))?
        };

        let mig_read = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("mig-read".into())
                .spawn(move || {
                    if let Err(e) = reader.init() {
                        warn!(error = %e, "incoming stream init failed");
                        shared.error_req();
                        return;
                    }
                    worker_loop(&shared, "mig-read", || reader.tick());
                })?
        };

        let mig_write = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("mig-write".into())
                .spawn(move || worker_loop(&shared, "mig-write", || writer.tick()))?
        };

        let pipe = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("pipe".into())
                .spawn(move || {
                    if let Err(e) = control.init() {
                        warn!(error = %e, "control handshake failed");
                        shared.error_req();
                        return;
                    }
                    worker_loop(&shared, "pipe", || control.tick());
                })?
        };

        join_worker(mig_read, "mig-read");
        let walker = shared.walker.lock().expect("walker slot poisoned").take();
        if let Some(walker) = walker {
            join_worker(walker, "clean-bitmap");
        }
        join_worker(mig_write, "mig-write");
        join_worker(pipe, "pipe");

        {
            let mut pending = shared.pending.lock().expect("pending-clean lock poisoned");
            pending.exit = true;
        }
        shared.pending_cv.notify_all();
        let drainer = shared.drainer.lock().expect("drainer slot poisoned").take();
        if let Some(drainer) = drainer {
            join_worker(drainer, "pending-clean");
        }

        // Closing the wake pipe is what unblocks the fault threads: the
        // forwarder sees EOF, closes its side, and fault-receive follows.
        shared.close_fault_tx();
        join_worker(fault_receive, "fault-receive");

        let state = shared.state();
        debug!(?state, "daemon done");
        Ok(state)
    }
}

fn join_worker(handle: JoinHandle<()>, name: &str) {
    if handle.join().is_err() {
        warn!(worker = name, "worker panicked");
    }
}
