//! The backing-store seam of the destination engine.
//!
//! A [`UMem`] provides user-faultable guest memory for one RAM block: the
//! guest's accesses to absent pages block inside the store, the daemon
//! drains the resulting demand notifications from an fd, writes page data
//! into the store's shadow mapping and marks pages cached to wake the
//! accessors. [`MemStore`] is the in-process implementation; its demand
//! plumbing is a real pipe so the daemon's fd-driven loops run against it
//! unmodified.

mod shmem;

pub use shmem::MemStore;

use std::os::fd::BorrowedFd;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UMemError {
    #[error("offset {0:#x} outside the mapped region")]
    OutOfRange(u64),
    #[error("backing store already unmapped")]
    AlreadyUnmapped,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, UMemError>;

/// User-faultable page container for one RAM block. All page offsets are
/// block-relative host pages; byte offsets are block-relative.
pub trait UMem: Send + Sync {
    /// Readable whenever the guest has faulted on absent pages since the
    /// last [`UMem::take_faults`] call.
    fn fault_fd(&self) -> BorrowedFd<'_>;

    /// Drains up to `max` pending faulted host-page offsets. Non-blocking;
    /// returns an empty list when nothing is pending.
    fn take_faults(&self, max: usize) -> Result<Vec<u64>>;

    /// Writes page data into the shadow mapping. `offset` is byte-aligned
    /// to the caller's page granularity; the data does not become visible
    /// to the guest until the covering host pages are marked cached.
    fn write_page(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Fills `length` bytes of the shadow mapping with one byte value.
    fn fill_page(&self, offset: u64, length: u64, byte: u8) -> Result<()>;

    /// Declares host pages present and wakes every blocked accessor.
    fn mark_cached(&self, host_pgoffs: &[u64]) -> Result<()>;

    /// Makes the pages in `offset..offset + length` fault again on next
    /// access.
    fn unmark(&self, offset: u64, length: u64) -> Result<()>;

    /// Releases the shadow copy of already-woken pages.
    fn release(&self, offset: u64, length: u64) -> Result<()>;

    /// True once every host page has been marked cached.
    fn finished(&self) -> bool;

    /// Tears the mapping down. Exactly one call is legal; a second returns
    /// [`UMemError::AlreadyUnmapped`].
    fn unmap(&self) -> Result<()>;
}
