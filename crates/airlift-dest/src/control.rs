use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, warn};

use crate::shared::Shared;
use crate::state::DaemonState;
use crate::{DestError, Flow, Result};

pub(crate) const CMD_READY: u8 = b'R';
pub(crate) const CMD_OK: u8 = b'O';
pub(crate) const CMD_QUIT: u8 = b'Q';
pub(crate) const CMD_ERROR: u8 = b'E';

fn read_command(file: &mut &File) -> Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        return match file.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => Err(e.into()),
        };
    }
}

/// Daemon side of the supervisor control channel.
pub(crate) struct ControlPipe {
    shared: Arc<Shared>,
    to_supervisor: Option<File>,
    from_supervisor: Option<File>,
}

impl ControlPipe {
    pub fn new(shared: Arc<Shared>, to_supervisor: OwnedFd, from_supervisor: OwnedFd) -> Self {
        Self {
            shared,
            to_supervisor: Some(File::from(to_supervisor)),
            from_supervisor: Some(File::from(from_supervisor)),
        }
    }

    /// Announces readiness and waits for the supervisor to hand over the
    /// migration socket.
    pub fn init(&mut self) -> Result<()> {
        let Some(to) = self.to_supervisor.as_ref() else {
            return Err(DestError::ControlClosed);
        };
        let mut to = to;
        to.write_all(&[CMD_READY])?;
        let Some(mut from) = self.from_supervisor.as_ref() else {
            return Err(DestError::ControlClosed);
        };
        match read_command(&mut from)? {
            Some(CMD_OK) => {
                debug!("supervisor acknowledged ready");
                Ok(())
            }
            Some(other) => Err(DestError::UnknownControl(other)),
            None => Err(DestError::ControlClosed),
        }
    }

    pub fn tick(&mut self) -> Result<Flow> {
        let readable = match self.from_supervisor.as_ref() {
            Some(from) => {
                let mut fds = [PollFd::new(from.as_fd(), PollFlags::POLLIN)];
                match poll(&mut fds, PollTimeout::from(1000u16)) {
                    Ok(0) => false,
                    Ok(_) => true,
                    Err(nix::errno::Errno::EINTR) => return Ok(Flow::Continue),
                    Err(e) => return Err(std::io::Error::from(e).into()),
                }
            }
            // Both directions may already be gone; keep pacing the state
            // checks at the same one-second cadence.
            None => {
                std::thread::sleep(std::time::Duration::from_secs(1));
                false
            }
        };

        if readable {
            let Some(mut from) = self.from_supervisor.as_ref() else {
                return Ok(Flow::Continue);
            };
            match read_command(&mut from)? {
                Some(CMD_QUIT) => {
                    self.recv_quit();
                    self.shared.done();
                }
                Some(other) => return Err(DestError::UnknownControl(other)),
                None => {
                    // Supervisor went away without a QUIT; treat it as one
                    // so the daemon still winds down.
                    warn!("control pipe closed without QUIT");
                    self.recv_quit();
                    self.shared.done();
                }
            }
        }

        self.push()?;
        Ok(Flow::Continue)
    }

    fn recv_quit(&mut self) {
        if self.shared.state().contains(DaemonState::QUIT_RECEIVED) {
            return;
        }
        self.shared.set_state(DaemonState::QUIT_RECEIVED);
        self.from_supervisor.take();
        self.shared.set_state(DaemonState::QUIT_HANDLED);
    }

    /// Pushes any queued ERROR/QUIT notification to the supervisor.
    fn push(&mut self) -> Result<()> {
        if self.to_supervisor.is_none() {
            return Ok(());
        }
        if self.shared.claim(
            DaemonState::ERROR_REQ,
            DaemonState::ERROR_SENDING | DaemonState::ERROR_SENT,
            DaemonState::ERROR_SENDING,
        ) {
            if let Some(mut to) = self.to_supervisor.as_ref() {
                to.write_all(&[CMD_ERROR])?;
            }
            self.shared.set_state(DaemonState::ERROR_SENT);
        }
        if self.shared.claim(
            DaemonState::QUIT_QUEUED,
            DaemonState::QUIT_SENDING | DaemonState::QUIT_SENT,
            DaemonState::QUIT_SENDING,
        ) {
            if let Some(mut to) = self.to_supervisor.take() {
                to.write_all(&[CMD_QUIT])?;
            }
            self.shared.set_state(DaemonState::QUIT_SENT);
        }
        Ok(())
    }
}

/// What the daemon told the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonEvent {
    /// Daemon finished (or acknowledged a quit) and closed its side.
    Quit,
    /// Daemon hit trouble; the guest must be halted with an I/O error.
    Error,
    /// Daemon closed the pipe without a command.
    Closed,
}

/// Supervisor side of the control channel. The embedder (the process that
/// owns the guest) runs this; in tests it doubles as the harness.
pub struct Supervisor {
    to_daemon: Option<File>,
    from_daemon: Option<File>,
}

impl Supervisor {
    pub fn new(to_daemon: OwnedFd, from_daemon: OwnedFd) -> Self {
        Self {
            to_daemon: Some(File::from(to_daemon)),
            from_daemon: Some(File::from(from_daemon)),
        }
    }

    /// Blocks until the daemon reports READY, then acknowledges so it may
    /// start using the migration socket.
    pub fn wait_ready(&mut self) -> Result<()> {
        let Some(mut from) = self.from_daemon.as_ref() else {
            return Err(DestError::ControlClosed);
        };
        match read_command(&mut from)? {
            Some(CMD_READY) => {}
            Some(other) => return Err(DestError::UnknownControl(other)),
            None => return Err(DestError::ControlClosed),
        }
        let Some(mut to) = self.to_daemon.as_ref() else {
            return Err(DestError::ControlClosed);
        };
        to.write_all(&[CMD_OK])?;
        Ok(())
    }

    /// Tells the daemon to tear down, closing our half afterwards.
    pub fn send_quit(&mut self) -> Result<()> {
        if let Some(mut to) = self.to_daemon.take() {
            to.write_all(&[CMD_QUIT])?;
        }
        Ok(())
    }

    /// Blocking read of the next daemon command.
    pub fn recv_event(&mut self) -> Result<DaemonEvent> {
        let Some(mut from) = self.from_daemon.as_ref() else {
            return Ok(DaemonEvent::Closed);
        };
        match read_command(&mut from)? {
            None => {
                self.from_daemon.take();
                Ok(DaemonEvent::Closed)
            }
            Some(CMD_QUIT) => Ok(DaemonEvent::Quit),
            Some(CMD_ERROR) => Ok(DaemonEvent::Error),
            Some(other) => Err(DestError::UnknownControl(other)),
        }
    }

    /// Services the daemon until it closes the channel. Returns whether an
    /// ERROR was reported; the guest must not be resumed in that case.
    pub fn run_to_completion(&mut self) -> Result<bool> {
        let mut saw_error = false;
        loop {
            match self.recv_event()? {
                DaemonEvent::Error => {
                    saw_error = true;
                    // An erroring daemon still needs the quit handshake to
                    // wind its workers down.
                    self.send_quit()?;
                }
                DaemonEvent::Quit => self.send_quit()?,
                DaemonEvent::Closed => return Ok(saw_error),
            }
        }
    }
}
