//! Source outgoing engine.
//!
//! Single-threaded and event-driven: one loop multiplexes request
//! servicing, opportunistic background pushes, precopy completion and rate
//! limiting over the two halves of the migration socket. Requests always
//! win over background work.

mod engine;
mod ram;
mod ratelimit;

pub use engine::{MigrationParams, Outgoing, OutgoingPhase};
pub use ram::{SourceBlock, SourceRam};
pub use ratelimit::RateLimiter;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Protocol(#[from] airlift_protocol::ProtocolError),
    #[error(transparent)]
    PageMap(#[from] airlift_pagemap::PageMapError),
    #[error("unknown block id {0:?} requested")]
    UnknownBlock(String),
    #[error("page continuation without a current block")]
    NoCurrentBlock,
    #[error("requested page {pgoff:#x} outside block {id:?}")]
    OutOfRangeRequest { id: String, pgoff: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SourceError>;
