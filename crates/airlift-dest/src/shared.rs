use std::fs::File;
use std::io::{ErrorKind, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use airlift_pagemap::{Bitmap, PageGeometry, RamBlock};
use airlift_umem::UMem;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, warn};

use crate::state::DaemonState;
use crate::Result;

/// One RAM block as the destination daemon sees it.
pub struct DestBlock {
    pub ram: RamBlock,
    pub store: Arc<dyn UMem>,
}

pub(crate) struct PendingClean {
    /// Host pages per block whose wake-up is still owed to the fault pipe.
    pub bitmaps: Vec<Bitmap>,
    pub nr: u64,
    pub exit: bool,
}

/// State every worker holds a handle to. The bitmap handles live with their
/// writer threads, not here; this is only the cross-thread residue.
pub(crate) struct Shared {
    pub geometry: PageGeometry,
    pub precopy: bool,
    pub blocks: Vec<DestBlock>,
    state: Mutex<DaemonState>,
    /// Wake pipe to the supervisor-side fault forwarder. Writes are kept
    /// within `PIPE_BUF` so they are atomic; the fd is non-blocking and a
    /// full pipe falls back to the pending-clean bitmaps.
    fault_tx: Mutex<Option<File>>,
    fault_tx_raw: RawFd,
    pub pending: Mutex<PendingClean>,
    pub pending_cv: Condvar,
    unmapped: Mutex<Vec<bool>>,
    pub walker: Mutex<Option<JoinHandle<()>>>,
    pub drainer: Mutex<Option<JoinHandle<()>>>,
}

/// Largest batch of page offsets that still writes atomically.
pub(crate) fn pipe_batch() -> usize {
    libc::PIPE_BUF / std::mem::size_of::<u64>()
}

impl Shared {
    pub fn new(
        geometry: PageGeometry,
        precopy: bool,
        blocks: Vec<DestBlock>,
        fault_tx: File,
    ) -> Self {
        let pending_bitmaps = blocks
            .iter()
            .map(|b| Bitmap::new(b.ram.host_pages(&geometry)))
            .collect();
        let nblocks = blocks.len();
        Self {
            geometry,
            precopy,
            blocks,
            state: Mutex::new(DaemonState::empty()),
            fault_tx_raw: fault_tx.as_raw_fd(),
            fault_tx: Mutex::new(Some(fault_tx)),
            pending: Mutex::new(PendingClean {
                bitmaps: pending_bitmaps,
                nr: 0,
                exit: false,
            }),
            pending_cv: Condvar::new(),
            unmapped: Mutex::new(vec![false; nblocks]),
            walker: Mutex::new(None),
            drainer: Mutex::new(None),
        }
    }

    pub fn state(&self) -> DaemonState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn set_state(&self, bits: DaemonState) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if !state.contains(bits) {
            *state |= bits;
            debug!(state = ?*state, "state |= {bits:?}");
        }
    }

    /// Claims a one-shot transition: if `req` is set and `progress` has not
    /// begun, sets `begin` and hands the work to the caller.
    pub fn claim(&self, req: DaemonState, progress: DaemonState, begin: DaemonState) -> bool {
        let mut state = self.state.lock().expect("state lock poisoned");
        if state.contains(req) && !state.intersects(progress) {
            *state |= begin;
            debug!(state = ?*state, "state |= {begin:?}");
            return true;
        }
        false
    }

    pub fn end_reached(&self) -> bool {
        self.state() & DaemonState::END_MASK == DaemonState::END_MASK
    }

    pub fn error_req(&self) {
        self.set_state(DaemonState::ERROR_REQ);
    }

    /// Ask the mig-write worker to emit the EOC request.
    pub fn req_eoc(&self) {
        self.set_state(DaemonState::EOC_SEND_REQ);
    }

    pub fn queue_quit(&self) {
        self.set_state(DaemonState::QUIT_QUEUED);
    }

    /// Everything owed has been served: queue both termination halves.
    pub fn done(&self) {
        self.req_eoc();
        self.queue_quit();
    }

    pub fn find_block_by_addr(&self, addr: u64) -> Option<usize> {
        self.blocks.iter().position(|b| b.ram.contains_addr(addr))
    }

    /// Marks host pages cached in the store and queues their wake-up
    /// through the fault pipe, falling back to the pending-clean bitmaps
    /// when the pipe is full. `host_pgoffs` are block-relative.
    pub fn mark_cached_and_wake(&self, block_idx: usize, host_pgoffs: &[u64]) -> Result<()> {
        let block = &self.blocks[block_idx];
        block.store.mark_cached(host_pgoffs)?;
        let base = block.ram.offset >> self.geometry.host_page_bits();
        let abs: Vec<u64> = host_pgoffs.iter().map(|p| base + p).collect();
        self.fault_request(&abs, false)
    }

    /// Pushes absolute host-page offsets down the fault pipe in
    /// `PIPE_BUF`-atomic batches. Non-blocking mode records a full pipe in
    /// `pending_clean` and returns; blocking mode waits for pipe space.
    pub fn fault_request(&self, abs_pgoffs: &[u64], blocking: bool) -> Result<()> {
        let mut rest = abs_pgoffs;
        while !rest.is_empty() {
            let n = rest.len().min(pipe_batch());
            let mut buf = Vec::with_capacity(n * 8);
            for pgoff in &rest[..n] {
                buf.extend_from_slice(&pgoff.to_ne_bytes());
            }
            let outcome = {
                let guard = self.fault_tx.lock().expect("fault pipe lock poisoned");
                match guard.as_ref() {
                    // Pipe already closed during teardown; wake-ups are moot.
                    None => return Ok(()),
                    Some(mut file) => file.write_all(&buf),
                }
            };
            match outcome {
                Ok(()) => rest = &rest[n..],
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if blocking {
                        self.wait_fault_writable()?;
                    } else {
                        self.mark_pending_clean(rest);
                        return Ok(());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn mark_pending_clean(&self, abs_pgoffs: &[u64]) {
        let mut wakeup = false;
        {
            let mut pending = self.pending.lock().expect("pending-clean lock poisoned");
            for &pgoff in abs_pgoffs {
                let addr = pgoff << self.geometry.host_page_bits();
                let Some(idx) = self.find_block_by_addr(addr) else {
                    warn!(addr, "pending-clean page outside every block");
                    continue;
                };
                let rel = (addr - self.blocks[idx].ram.offset) >> self.geometry.host_page_bits();
                if !pending.bitmaps[idx].test_and_set(rel) {
                    pending.nr += 1;
                    wakeup = true;
                }
            }
        }
        if wakeup {
            debug!("fault pipe full; deferred wake-ups to the drainer");
            self.pending_cv.notify_all();
        }
    }

    /// Blocks until the fault pipe has room again.
    pub fn wait_fault_writable(&self) -> Result<()> {
        // SAFETY: the raw fd stays open until `Daemon::run` closes it, which
        // happens only after the threads calling this have been joined.
        let fd = unsafe { BorrowedFd::borrow_raw(self.fault_tx_raw) };
        let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(std::io::Error::from(e).into()),
            }
        }
    }

    /// Drops the fault-pipe write end; EOF then ripples through the
    /// forwarder to unblock the fault-receive worker.
    pub fn close_fault_tx(&self) {
        self.fault_tx
            .lock()
            .expect("fault pipe lock poisoned")
            .take();
    }

    /// Unmaps every block whose store has gone quiet, exactly once each.
    /// When the last one goes, the termination halves are queued.
    pub fn check_done(&self) -> Result<bool> {
        let mut all_done = true;
        {
            let mut unmapped = self.unmapped.lock().expect("unmap ledger poisoned");
            for (idx, block) in self.blocks.iter().enumerate() {
                if unmapped[idx] {
                    continue;
                }
                if block.store.finished() {
                    block.store.unmap()?;
                    unmapped[idx] = true;
                    debug!(id = %block.ram.id, "block complete, unmapped");
                } else {
                    all_done = false;
                }
            }
        }
        if all_done {
            self.done();
        }
        Ok(all_done)
    }

    /// Starts the pending-clean drainer; a second call is a no-op.
    pub fn start_drainer(self: &Arc<Self>) -> std::io::Result<()> {
        let mut slot = self.drainer.lock().expect("drainer slot poisoned");
        if slot.is_some() {
            return Ok(());
        }
        let shared = self.clone();
        let handle = std::thread::Builder::new()
            .name("pending-clean".into())
            .spawn(move || crate::drainer::drainer_loop(shared))?;
        *slot = Some(handle);
        Ok(())
    }
}

/// Shared worker loop: run ticks until the end mask fills in, the tick asks
/// to exit, or it fails (which latches `ERROR_REQ` for the control pipe to
/// report).
pub(crate) fn worker_loop(
    shared: &Shared,
    name: &str,
    mut tick: impl FnMut() -> Result<crate::Flow>,
) {
    loop {
        if shared.end_reached() {
            debug!(worker = name, "end state reached");
            break;
        }
        match tick() {
            Ok(crate::Flow::Continue) => {}
            Ok(crate::Flow::Exit) => {
                debug!(worker = name, "worker done");
                break;
            }
            Err(e) => {
                warn!(worker = name, error = %e, "worker failed");
                shared.error_req();
                break;
            }
        }
    }
}
