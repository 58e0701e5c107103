//! Destination incoming engine.
//!
//! Once the guest is running here, every page it touches that has not yet
//! arrived traps in the backing store. Five workers turn those traps into
//! requests on the migration socket and incoming pages into wake-ups:
//! fault-receive, mig-read, mig-write, the supervisor control pipe and the
//! pending-clean drainer. They share one state word and per-block bitmaps
//! with a single writer each; the state word is the only thing behind a
//! mutex on the hot path.

mod control;
mod daemon;
mod drainer;
mod fault;
mod reader;
mod shared;
mod state;
mod writer;

pub use control::{DaemonEvent, Supervisor};
pub use daemon::{read_handshake, Daemon, DaemonChannels, DaemonConfig, DestBlock};
pub use fault::spawn_fault_forwarder;
pub use state::DaemonState;

use thiserror::Error;

/// Upper bound on faults drained from one block per tick; matches the most
/// demand the hypervisor can have outstanding.
pub const MAX_REQUESTS: usize = 512 * 65;

#[derive(Debug, Error)]
pub enum DestError {
    #[error(transparent)]
    Protocol(#[from] airlift_protocol::ProtocolError),
    #[error(transparent)]
    PageMap(#[from] airlift_pagemap::PageMapError),
    #[error(transparent)]
    Store(#[from] airlift_umem::UMemError),
    #[error("unknown block id {0:?} on the stream")]
    UnknownBlock(String),
    #[error("no block covers guest address {0:#x}")]
    UnknownAddress(u64),
    #[error("page record continues a block, but no block is current")]
    NoCurrentBlock,
    #[error("manifest entry {id:?}/{length:#x} does not match the prepared blocks")]
    ManifestMismatch { id: String, length: u64 },
    #[error("unexpected record during the incoming handshake")]
    UnexpectedRecord,
    #[error("unknown control command {0:#04x}")]
    UnknownControl(u8),
    #[error("control channel closed during handshake")]
    ControlClosed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DestError>;

/// What a worker's tick tells its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Exit,
}
