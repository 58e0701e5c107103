//! Per-block page state for the migration engines.
//!
//! The hot-path bitmaps (`requested`, `received`, `clean`) are lock-free
//! word arrays with exactly one logical writer each; ownership of the write
//! half is enforced by handing out a non-cloneable [`BitmapWriter`] and any
//! number of read-only [`BitmapReader`]s. The page-size geometry handles the
//! target-page / host-page mismatch in either direction.

mod bitmap;
mod block;
mod geometry;

pub use bitmap::{AtomicBitmap, Bitmap, BitmapReader, BitmapWriter};
pub use block::{BlockSet, RamBlock};
pub use geometry::PageGeometry;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PageMapError {
    #[error("page size {0:#x} is not a nonzero power of two")]
    BadPageSize(u64),
    #[error("block id {0:?} is empty or longer than 255 bytes")]
    BadBlockId(String),
    #[error("duplicate block id {0:?}")]
    DuplicateBlock(String),
    #[error("block {id:?} of length {length:#x} is not page aligned")]
    UnalignedBlock { id: String, length: u64 },
    #[error("block {id:?} overlaps the block before it")]
    OverlappingBlock { id: String },
}

pub type Result<T> = std::result::Result<T, PageMapError>;
