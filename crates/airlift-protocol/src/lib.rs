//! Wire protocol for the post-copy page-migration stream.
//!
//! Everything that crosses the migration socket is framed here: the
//! destination's page requests, the source's RAM-save records, the one-shot
//! section envelope exchanged at handshake time, and the clean-bitmap
//! preamble emitted when a precopy phase ran. All multi-byte integers are
//! big-endian on the wire.

mod cleanmap;
mod peek;
mod ram;
mod request;
mod section;

pub use cleanmap::{clean_bitmap_len, read_clean_map, write_clean_map, CleanMapRecord};
pub use peek::PeekBuf;
pub use ram::{
    read_record, write_eos, write_fill_record, write_hook, write_manifest, write_page_record,
    PageData, RamRecord, RecordFlags,
};
pub use request::{read_request, write_request, Request, MAX_FRAME, MAX_PAGE_NR};
pub use section::{
    read_section, write_full, write_init, Options, Section, MAX_FULL_SECTION, SECTION_FULL,
    SECTION_INIT,
};

use thiserror::Error;

/// Hard cap on a block id, one length byte on the wire.
pub const MAX_ID_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown request command {0:#04x}")]
    UnknownCommand(u8),
    #[error("unknown section subtype {0:#04x}")]
    UnknownSection(u8),
    #[error("unknown init options {0:#018x}")]
    UnknownOptions(u64),
    #[error("unknown record flags {0:#x}")]
    UnknownFlags(u64),
    #[error("record encoding {0:?} is not supported on this stream")]
    UnsupportedEncoding(RecordFlags),
    #[error("section payload of {got} bytes exceeds the {max}-byte limit")]
    OversizedSection { got: u32, max: u32 },
    #[error("request claims {nr} page offsets, more than fit one frame")]
    OversizedRequest { nr: u32 },
    #[error("block id of {0} bytes exceeds {max}", max = MAX_ID_LEN)]
    OversizedId(usize),
    #[error("empty block id")]
    EmptyId,
    #[error("clean-bitmap length {0:#x} is not a multiple of 8")]
    MisalignedBitmap(u64),
    #[error("peer closed the stream before a phase marker")]
    PeerClosed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

pub(crate) fn check_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(ProtocolError::EmptyId);
    }
    if id.len() > MAX_ID_LEN {
        return Err(ProtocolError::OversizedId(id.len()));
    }
    Ok(())
}

/// Reads exactly `len` bytes, mapping a clean EOF to [`ProtocolError::PeerClosed`].
pub(crate) fn read_exact(r: &mut impl std::io::Read, buf: &mut [u8]) -> Result<()> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::PeerClosed
        } else {
            ProtocolError::Io(e)
        }
    })
}

pub(crate) fn read_u8(r: &mut impl std::io::Read) -> Result<u8> {
    let mut b = [0u8; 1];
    read_exact(r, &mut b)?;
    Ok(b[0])
}

pub(crate) fn read_be32(r: &mut impl std::io::Read) -> Result<u32> {
    let mut b = [0u8; 4];
    read_exact(r, &mut b)?;
    Ok(u32::from_be_bytes(b))
}

pub(crate) fn read_be64(r: &mut impl std::io::Read) -> Result<u64> {
    let mut b = [0u8; 8];
    read_exact(r, &mut b)?;
    Ok(u64::from_be_bytes(b))
}

pub(crate) fn read_idstr(r: &mut impl std::io::Read) -> Result<String> {
    let len = read_u8(r)? as usize;
    let mut buf = vec![0u8; len];
    read_exact(r, &mut buf)?;
    String::from_utf8(buf)
        .map_err(|e| ProtocolError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}
