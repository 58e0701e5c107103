use std::fs::File;
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use airlift_protocol::{
    read_request, write_clean_map, write_eos, write_fill_record, write_full, write_init,
    write_manifest, write_page_record, Options, PeekBuf, ProtocolError, Request,
};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::ram::SourceRam;
use crate::ratelimit::RateLimiter;
use crate::{Result, SourceError};

/// Outgoing engine knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationParams {
    /// Number of precopy sweeps the embedder intends to run; zero disables
    /// precopy and the clean bitmap.
    pub precopy_count: u32,
    /// Pages pushed after each requested page.
    pub prefault_forward: u64,
    /// Pages pushed before each requested page.
    pub prefault_backward: u64,
    /// Serve only what is requested; no opportunistic pushes.
    pub no_background: bool,
    /// Outgoing byte budget; `None` is unthrottled.
    pub max_bytes_per_second: Option<u64>,
}

impl Default for MigrationParams {
    fn default() -> Self {
        Self {
            precopy_count: 0,
            prefault_forward: 0,
            prefault_backward: 0,
            no_background: false,
            max_bytes_per_second: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingPhase {
    Active,
    /// EOC arrived while pages were still owed; the next tick emits the
    /// end-of-stream marker and completes.
    EocReceived,
    /// Dirty bitmap exhausted and EOS emitted; only an EOC is expected now.
    AllPagesSent,
    Completed,
    ErrorReceive,
}

/// A background burst yields after this many pages or this much wall-clock,
/// whichever comes first, to bound how long requests can queue behind it.
const MAX_BURST_PAGES: u32 = 64;
const MAX_BURST: Duration = Duration::from_millis(50);

enum Served {
    Continue,
    Stop,
}

/// The source outgoing engine.
///
/// The connected socket is duplicated: the original handle stays blocking
/// for writes, the duplicate turns non-blocking and feeds the peek buffer
/// so a half-arrived request never wedges the scheduler.
pub struct Outgoing {
    params: MigrationParams,
    ram: SourceRam,
    write: File,
    peek: PeekBuf<File>,
    phase: OutgoingPhase,
    /// Block named by the last `PAGE` request.
    last_block_read: Option<usize>,
    /// Block named on the outgoing record stream.
    last_block_sent: Option<usize>,
    bg_cursor: (usize, u64),
    limiter: RateLimiter,
    force_postcopy: Arc<AtomicBool>,
}

impl Outgoing {
    pub fn new(stream: OwnedFd, ram: SourceRam, params: MigrationParams) -> Result<Self> {
        let read_half = stream.try_clone().map_err(SourceError::Io)?;
        let limiter = RateLimiter::new(params.max_bytes_per_second);
        Ok(Self {
            params,
            ram,
            write: File::from(stream),
            peek: PeekBuf::new(File::from(read_half)),
            phase: OutgoingPhase::Active,
            last_block_read: None,
            last_block_sent: None,
            bg_cursor: (0, 0),
            limiter,
            force_postcopy: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn phase(&self) -> OutgoingPhase {
        self.phase
    }

    /// The dirty-log side of the engine, for feeding re-dirtied pages
    /// between precopy passes.
    pub fn ram_mut(&mut self) -> &mut SourceRam {
        &mut self.ram
    }

    /// Shared flag that cuts precopy short from outside the loop.
    pub fn force_postcopy_handle(&self) -> Arc<AtomicBool> {
        self.force_postcopy.clone()
    }

    /// Emits the handshake envelope: the option mask, the opaque device
    /// state and the block manifest.
    pub fn begin(&mut self, device_state: &[u8]) -> Result<()> {
        let mut options = Options::empty();
        if self.params.precopy_count > 0 {
            options |= Options::PRECOPY;
        }
        self.force_postcopy.store(false, Ordering::Relaxed);
        write_init(&mut self.write, options)?;
        write_full(&mut self.write, device_state)?;
        write_manifest(&mut self.write, &self.ram.manifest())?;
        self.write.flush()?;
        debug!(?options, blocks = self.ram.len(), "handshake sent");
        Ok(())
    }

    /// One precopy sweep over the dirty bitmap. Returns how many pages are
    /// still dirty; the embedder loops up to `precopy_count` times, feeding
    /// the dirty log in between, and may stop early via the force flag.
    pub fn precopy_pass(&mut self) -> Result<u64> {
        let mut cursor = (0usize, 0u64);
        loop {
            if self.force_postcopy.load(Ordering::Relaxed) {
                debug!("precopy cut short");
                break;
            }
            let Some((b, pg)) = self.ram.next_dirty_from(cursor) else {
                break;
            };
            self.send_page_at(b, pg)?;
            cursor = (b, pg + 1);
        }
        self.write.flush()?;
        let remaining = self.ram.dirty_remaining();
        debug!(remaining, "precopy pass done");
        Ok(remaining)
    }

    /// Marks the phase boundary: end-of-stream after the initial (and any
    /// precopy) records, then the clean bitmap when precopy ran. The rate
    /// budget restarts so the demand phase gets a full period.
    pub fn start_postcopy(&mut self) -> Result<()> {
        write_eos(&mut self.write)?;
        if self.params.precopy_count > 0 {
            write_clean_map(&mut self.write, &self.ram.clean_map())?;
        }
        self.write.flush()?;
        self.limiter.reset();
        Ok(())
    }

    /// Drives the demand phase until the engine completes or fails.
    pub fn run(&mut self) -> Result<OutgoingPhase> {
        debug!(
            forward = self.params.prefault_forward,
            backward = self.params.prefault_backward,
            "demand phase running"
        );
        while !matches!(
            self.phase,
            OutgoingPhase::Completed | OutgoingPhase::ErrorReceive
        ) {
            self.tick()?;
        }
        debug!(phase = ?self.phase, "demand phase over");
        Ok(self.phase)
    }

    fn tick(&mut self) -> Result<()> {
        let read_watch = matches!(
            self.phase,
            OutgoingPhase::Active | OutgoingPhase::AllPagesSent
        );
        // With background off there is nothing to do on write-readiness
        // until the dirty bitmap drains; watching it would spin.
        let mut write_watch = self.phase == OutgoingPhase::EocReceived
            || (self.phase == OutgoingPhase::Active
                && (!self.params.no_background || self.ram.dirty_remaining() == 0));
        let mut timeout = PollTimeout::NONE;
        if write_watch {
            if let Some(sleep) = self.limiter.throttled(Instant::now()) {
                write_watch = false;
                timeout = PollTimeout::from(sleep.as_millis().min(1000).max(1) as u16);
            }
        }

        let (read_ready, write_ready) = {
            let mut fds = Vec::with_capacity(2);
            if read_watch {
                fds.push(PollFd::new(self.peek.get_ref().as_fd(), PollFlags::POLLIN));
            }
            if write_watch {
                fds.push(PollFd::new(self.write.as_fd(), PollFlags::POLLOUT));
            }
            match poll(&mut fds, timeout) {
                Ok(_) => {
                    let mut it = fds.iter();
                    let read_ready = read_watch
                        && it.next().is_some_and(|fd| {
                            fd.revents()
                                .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
                        });
                    let write_ready = write_watch
                        && it.next().is_some_and(|fd| {
                            fd.revents().is_some_and(|r| r.contains(PollFlags::POLLOUT))
                        });
                    (read_ready, write_ready)
                }
                Err(nix::errno::Errno::EINTR) => (false, false),
                Err(e) => return Err(SourceError::Io(std::io::Error::from(e))),
            }
        };

        if read_ready {
            self.recv_requests()?;
            return Ok(());
        }
        if write_ready {
            self.background()?;
        }
        Ok(())
    }

    /// The two socket handles share one file description, so non-blocking
    /// mode is toggled on only for the peek-parse and restored before any
    /// page goes out the write half.
    fn set_nonblocking(&self, on: bool) -> Result<()> {
        let flags = if on { OFlag::O_NONBLOCK } else { OFlag::empty() };
        fcntl(self.peek.get_ref().as_raw_fd(), FcntlArg::F_SETFL(flags))
            .map_err(std::io::Error::from)?;
        Ok(())
    }

    /// Drains every fully arrived request, then flushes whatever servicing
    /// queued on the write side.
    fn recv_requests(&mut self) -> Result<()> {
        loop {
            self.set_nonblocking(true)?;
            let parsed = read_request(&mut self.peek);
            self.set_nonblocking(false)?;
            match parsed {
                Ok(Some(req)) => match self.handle_req(req) {
                    Ok(Served::Continue) => {}
                    Ok(Served::Stop) => break,
                    Err(
                        e @ (SourceError::UnknownBlock(_)
                        | SourceError::NoCurrentBlock
                        | SourceError::OutOfRangeRequest { .. }),
                    ) => {
                        warn!(error = %e, "bad request");
                        self.phase = OutgoingPhase::ErrorReceive;
                        break;
                    }
                    Err(e) => return Err(e),
                },
                Ok(None) => break,
                Err(ProtocolError::PeerClosed) => {
                    if self.phase == OutgoingPhase::AllPagesSent {
                        // Everything was sent; the peer hanging up instead
                        // of an explicit EOC still counts as done.
                        self.phase = OutgoingPhase::Completed;
                    } else {
                        warn!("peer closed before EOC");
                        self.phase = OutgoingPhase::ErrorReceive;
                    }
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "request stream broke");
                    self.phase = OutgoingPhase::ErrorReceive;
                    break;
                }
            }
        }
        self.write.flush()?;
        Ok(())
    }

    fn handle_req(&mut self, req: Request) -> Result<Served> {
        match req {
            Request::Eoc => {
                self.phase = if self.phase == OutgoingPhase::AllPagesSent {
                    OutgoingPhase::Completed
                } else {
                    OutgoingPhase::EocReceived
                };
                debug!(phase = ?self.phase, "EOC received");
                Ok(Served::Stop)
            }
            Request::Page { id, pgoffs } => {
                let idx = self
                    .ram
                    .find_by_id(&id)
                    .ok_or(SourceError::UnknownBlock(id))?;
                self.last_block_read = Some(idx);
                self.serve(idx, pgoffs)
            }
            Request::PageCont { pgoffs } => {
                let idx = self.last_block_read.ok_or(SourceError::NoCurrentBlock)?;
                self.serve(idx, pgoffs)
            }
        }
    }

    /// Serves one request frame: the asked-for pages first, then the
    /// forward and backward prefault windows.
    fn serve(&mut self, idx: usize, pgoffs: Vec<u64>) -> Result<Served> {
        if self.phase == OutgoingPhase::AllPagesSent {
            // EOS is already out; page requests at this point are stale
            // duplicates, only an EOC still matters.
            return Ok(Served::Continue);
        }
        let tps = self.ram.target_page_size();
        let npages = self.ram.get(idx).target_pages(tps);
        for &pg in &pgoffs {
            if pg >= npages {
                return Err(SourceError::OutOfRangeRequest {
                    id: self.ram.get(idx).ram.id.clone(),
                    pgoff: pg,
                });
            }
            self.send_page_at(idx, pg)?;
        }
        for j in 1..=self.params.prefault_forward {
            for &pg in &pgoffs {
                if pg + j < npages {
                    self.send_page_at(idx, pg + j)?;
                }
            }
        }
        if !self.params.no_background {
            if let Some(&last) = pgoffs.last() {
                // Pull the background cursor up to the fault locality, but
                // never backwards within the same block.
                let target = (last + self.params.prefault_forward).min(npages - 1);
                if self.bg_cursor.0 == idx {
                    self.bg_cursor.1 = self.bg_cursor.1.max(target);
                } else {
                    self.bg_cursor = (idx, target);
                }
            }
        }
        for j in 1..=self.params.prefault_backward {
            for &pg in &pgoffs {
                if pg >= j {
                    self.send_page_at(idx, pg - j)?;
                }
            }
        }
        Ok(Served::Continue)
    }

    /// One write-side slot: finish an EOC handover, or push background
    /// pages until the burst cap, the rate budget or a pending request
    /// stops it.
    fn background(&mut self) -> Result<()> {
        match self.phase {
            OutgoingPhase::EocReceived => {
                write_eos(&mut self.write)?;
                self.write.flush()?;
                self.phase = OutgoingPhase::Completed;
                debug!("EOS sent after EOC, completed");
                return Ok(());
            }
            OutgoingPhase::Active => {}
            _ => return Ok(()),
        }

        if self.params.no_background {
            if self.ram.dirty_remaining() == 0 {
                self.all_sent()?;
            }
            return Ok(());
        }

        let start = Instant::now();
        let mut sent = 0u32;
        loop {
            if self.limiter.throttled(Instant::now()).is_some() {
                break;
            }
            let Some((b, pg)) = self.ram.next_dirty_from(self.bg_cursor) else {
                self.all_sent()?;
                break;
            };
            self.send_page_at(b, pg)?;
            self.bg_cursor = (b, pg + 1);
            sent += 1;
            if sent >= MAX_BURST_PAGES || start.elapsed() >= MAX_BURST {
                break;
            }
            if self.request_pending()? {
                trace!("request preempts background");
                break;
            }
        }
        self.write.flush()?;
        Ok(())
    }

    fn all_sent(&mut self) -> Result<()> {
        debug_assert_eq!(self.phase, OutgoingPhase::Active);
        self.phase = OutgoingPhase::AllPagesSent;
        write_eos(&mut self.write)?;
        self.write.flush()?;
        debug!("all pages sent, EOS out");
        Ok(())
    }

    /// Zero-timeout readiness probe between background pages: a pending
    /// request, or a write side that would block, ends the burst.
    fn request_pending(&mut self) -> Result<bool> {
        let mut fds = [
            PollFd::new(self.peek.get_ref().as_fd(), PollFlags::POLLIN),
            PollFd::new(self.write.as_fd(), PollFlags::POLLOUT),
        ];
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(0) => Ok(true),
            Ok(_) => {
                let read_pending = fds[0]
                    .revents()
                    .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP));
                let write_stalled = !fds[1]
                    .revents()
                    .is_some_and(|r| r.contains(PollFlags::POLLOUT));
                Ok(read_pending || write_stalled)
            }
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(e) => Err(SourceError::Io(std::io::Error::from(e))),
        }
    }

    /// Emits one page if it is still owed; the dirty-bit test doubles as
    /// the duplicate-request filter.
    fn send_page_at(&mut self, idx: usize, pgoff: u64) -> Result<()> {
        if !self.ram.get_mut(idx).take_dirty(pgoff) {
            return Ok(());
        }
        let tps = self.ram.target_page_size();
        let id_owned;
        let id: Option<&str> = if self.last_block_sent == Some(idx) {
            None
        } else {
            id_owned = self.ram.get(idx).ram.id.clone();
            Some(&id_owned)
        };
        let offset = pgoff * tps;
        let page = self.ram.get(idx).page(pgoff, tps);
        if let Some(byte) = fill_byte(page) {
            write_fill_record(&mut self.write, offset, byte, id)?;
            self.limiter.note(9 + id.map_or(0, |i| i.len() as u64 + 1));
        } else {
            write_page_record(&mut self.write, offset, page, id)?;
            self.limiter
                .note(8 + tps + id.map_or(0, |i| i.len() as u64 + 1));
        }
        self.last_block_sent = Some(idx);
        trace!(block = idx, pgoff, "page sent");
        Ok(())
    }
}

fn fill_byte(page: &[u8]) -> Option<u8> {
    let byte = *page.first()?;
    page.iter().all(|&b| b == byte).then_some(byte)
}
