use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow, Signal};
use tracing::warn;

use crate::shared::Shared;
use crate::{DestError, Result};

/// Spawns the supervisor-side fault forwarder.
///
/// It reads host-page offsets the daemon has just marked cached, performs a
/// benign one-byte read through `materialize` so the supervisor's own
/// mapping registers the page, and echoes the offsets back to the daemon.
/// Offsets are absolute host-page numbers, one `u64` per page, batched
/// within `PIPE_BUF`.
pub fn spawn_fault_forwarder(
    rx: OwnedFd,
    tx: OwnedFd,
    materialize: impl Fn(u64) + Send + 'static,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("fault-forward".into())
        .spawn(move || {
            // The daemon may close its read end first; a broken pipe must
            // end this loop, not the process.
            let mut sigpipe = SigSet::empty();
            sigpipe.add(Signal::SIGPIPE);
            if let Err(e) = pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&sigpipe), None) {
                warn!(error = %e, "masking SIGPIPE failed");
            }
            forward_loop(File::from(rx), File::from(tx), materialize);
        })
}

fn forward_loop(mut rx: File, mut tx: File, materialize: impl Fn(u64)) {
    let mut buf = vec![0u8; libc::PIPE_BUF];
    let mut filled = 0usize;
    loop {
        let n = match rx.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "fault pipe read failed");
                break;
            }
        };
        filled += n;
        let whole = filled - filled % 8;
        if whole == 0 {
            continue;
        }
        for chunk in buf[..whole].chunks_exact(8) {
            materialize(u64::from_ne_bytes(chunk.try_into().expect("8-byte chunk")));
        }
        if let Err(e) = tx.write_all(&buf[..whole]) {
            if e.kind() != ErrorKind::BrokenPipe {
                warn!(error = %e, "fault pipe write failed");
            }
            break;
        }
        buf.copy_within(whole..filled, 0);
        filled -= whole;
    }
    // Dropping rx and tx closes both ends; the daemon's fault-receive
    // worker sees EOF and exits.
}

/// Daemon-side fault-receive worker: consumes the echoed offsets, releases
/// each page's shadow copy and watches for overall completion.
pub(crate) fn fault_receive_loop(shared: Arc<Shared>, rx: OwnedFd) {
    if let Err(e) = receive(&shared, File::from(rx)) {
        warn!(error = %e, "fault-receive failed");
        shared.error_req();
    }
}

fn receive(shared: &Shared, mut rx: File) -> Result<()> {
    let host_bits = shared.geometry.host_page_bits();
    let host_page = shared.geometry.host_page_size();
    let mut buf = vec![0u8; libc::PIPE_BUF];
    let mut filled = 0usize;
    loop {
        let n = match rx.read(&mut buf[filled..]) {
            // EOF: the forwarder is gone, either because the migration
            // finished or as the hard-abort signal.
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        filled += n;
        let whole = filled - filled % 8;
        for chunk in buf[..whole].chunks_exact(8) {
            let pgoff = u64::from_ne_bytes(chunk.try_into().expect("8-byte chunk"));
            let addr = pgoff << host_bits;
            let idx = shared
                .find_block_by_addr(addr)
                .ok_or(DestError::UnknownAddress(addr))?;
            let block = &shared.blocks[idx];
            block.store.release(addr - block.ram.offset, host_page)?;
        }
        buf.copy_within(whole..filled, 0);
        filled -= whole;
        if shared.check_done()? {
            return Ok(());
        }
    }
}
