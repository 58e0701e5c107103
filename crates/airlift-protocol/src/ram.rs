use std::io::{Read, Write};

use bitflags::bitflags;

use crate::{check_id, read_be64, read_idstr, ProtocolError, Result};

bitflags! {
    /// Flag bits carried in the low bits of a RAM-save record header. The
    /// page offset occupies the bits at and above the target-page shift, so
    /// every flag must fit below the smallest supported target page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFlags: u64 {
        const COMPRESS = 0x02;
        const MEM_SIZE = 0x04;
        const PAGE     = 0x08;
        const EOS      = 0x10;
        const CONTINUE = 0x20;
        const XBZRLE   = 0x40;
        const HOOK     = 0x80;
    }
}

/// One record of the source's RAM stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RamRecord {
    /// Phase boundary: no further pages in this phase.
    Eos,
    /// Transport hook; carries no payload on the file transport.
    Hook,
    /// Block manifest: `(id, length)` per block, in block order.
    MemSize(Vec<(String, u64)>),
    /// One target page. `id` is `None` when the record continues the
    /// previously named block.
    Page {
        id: Option<String>,
        offset: u64,
        data: PageData,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageData {
    Raw(Vec<u8>),
    /// The whole page holds one repeated byte.
    Fill(u8),
}

fn write_header(w: &mut impl Write, offset: u64, flags: RecordFlags) -> Result<()> {
    w.write_all(&(offset | flags.bits()).to_be_bytes())?;
    Ok(())
}

fn write_page_header(
    w: &mut impl Write,
    offset: u64,
    mut flags: RecordFlags,
    id: Option<&str>,
) -> Result<()> {
    if id.is_none() {
        flags |= RecordFlags::CONTINUE;
    }
    write_header(w, offset, flags)?;
    if let Some(id) = id {
        check_id(id)?;
        w.write_all(&[id.len() as u8])?;
        w.write_all(id.as_bytes())?;
    }
    Ok(())
}

/// Emits a raw page record. `offset` is block-relative and must be
/// target-page aligned; `data` is exactly one target page.
pub fn write_page_record(
    w: &mut impl Write,
    offset: u64,
    data: &[u8],
    id: Option<&str>,
) -> Result<()> {
    write_page_header(w, offset, RecordFlags::PAGE, id)?;
    w.write_all(data)?;
    Ok(())
}

/// Emits a fill record: one byte replicated across the target page.
pub fn write_fill_record(w: &mut impl Write, offset: u64, byte: u8, id: Option<&str>) -> Result<()> {
    write_page_header(w, offset, RecordFlags::COMPRESS, id)?;
    w.write_all(&[byte])?;
    Ok(())
}

pub fn write_eos(w: &mut impl Write) -> Result<()> {
    write_header(w, 0, RecordFlags::EOS)
}

pub fn write_hook(w: &mut impl Write) -> Result<()> {
    write_header(w, 0, RecordFlags::HOOK)
}

/// Emits the block manifest. The header carries the total RAM size; the
/// reader consumes block entries until their lengths account for it.
pub fn write_manifest(w: &mut impl Write, blocks: &[(String, u64)]) -> Result<()> {
    let total: u64 = blocks.iter().map(|(_, len)| len).sum();
    write_header(w, total, RecordFlags::MEM_SIZE)?;
    for (id, len) in blocks {
        check_id(id)?;
        w.write_all(&[id.len() as u8])?;
        w.write_all(id.as_bytes())?;
        w.write_all(&len.to_be_bytes())?;
    }
    Ok(())
}

/// Reads one record. `target_page_size` fixes both the flag/offset split in
/// the header and the length of a raw page payload.
pub fn read_record(r: &mut impl Read, target_page_size: u64) -> Result<RamRecord> {
    debug_assert!(target_page_size.is_power_of_two());
    let header = read_be64(r)?;
    let offset = header & !(target_page_size - 1);
    let flags = RecordFlags::from_bits(header & (target_page_size - 1))
        .ok_or(ProtocolError::UnknownFlags(header & (target_page_size - 1)))?;

    if flags.contains(RecordFlags::EOS) {
        return Ok(RamRecord::Eos);
    }
    if flags.contains(RecordFlags::HOOK) {
        return Ok(RamRecord::Hook);
    }
    if flags.contains(RecordFlags::MEM_SIZE) {
        let total = offset;
        let mut blocks = Vec::new();
        let mut acc = 0u64;
        while acc < total {
            let id = read_idstr(r)?;
            let len = read_be64(r)?;
            acc = acc.saturating_add(len);
            blocks.push((id, len));
        }
        if acc != total {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "manifest block lengths exceed the advertised total",
            )));
        }
        return Ok(RamRecord::MemSize(blocks));
    }
    if flags.contains(RecordFlags::XBZRLE) {
        return Err(ProtocolError::UnsupportedEncoding(flags));
    }
    if !flags.intersects(RecordFlags::PAGE | RecordFlags::COMPRESS) {
        return Err(ProtocolError::UnknownFlags(flags.bits()));
    }

    let id = if flags.contains(RecordFlags::CONTINUE) {
        None
    } else {
        Some(read_idstr(r)?)
    };
    let data = if flags.contains(RecordFlags::COMPRESS) {
        let mut b = [0u8; 1];
        crate::read_exact(r, &mut b)?;
        PageData::Fill(b[0])
    } else {
        let mut page = vec![0u8; target_page_size as usize];
        crate::read_exact(r, &mut page)?;
        PageData::Raw(page)
    };
    Ok(RamRecord::Page { id, offset, data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const PAGE: u64 = 4096;

    #[test]
    fn page_then_continue() {
        let mut wire = Vec::new();
        write_page_record(&mut wire, 0x2000, &[0xaa; 4096], Some("ram0")).unwrap();
        write_fill_record(&mut wire, 0x3000, 0, None).unwrap();
        write_eos(&mut wire).unwrap();

        let mut r = Cursor::new(wire);
        assert_eq!(
            read_record(&mut r, PAGE).unwrap(),
            RamRecord::Page {
                id: Some("ram0".into()),
                offset: 0x2000,
                data: PageData::Raw(vec![0xaa; 4096]),
            }
        );
        assert_eq!(
            read_record(&mut r, PAGE).unwrap(),
            RamRecord::Page {
                id: None,
                offset: 0x3000,
                data: PageData::Fill(0),
            }
        );
        assert_eq!(read_record(&mut r, PAGE).unwrap(), RamRecord::Eos);
    }

    #[test]
    fn manifest_roundtrip() {
        let blocks = vec![("ram0".to_string(), 0x4000u64), ("vga".to_string(), 0x1000)];
        let mut wire = Vec::new();
        write_manifest(&mut wire, &blocks).unwrap();
        assert_eq!(
            read_record(&mut Cursor::new(wire), PAGE).unwrap(),
            RamRecord::MemSize(blocks)
        );
    }

    #[test]
    fn xbzrle_is_rejected() {
        let mut wire = Vec::new();
        write_header(&mut wire, 0x1000, RecordFlags::XBZRLE).unwrap();
        assert!(matches!(
            read_record(&mut Cursor::new(wire), PAGE),
            Err(ProtocolError::UnsupportedEncoding(_))
        ));
    }

    #[test]
    fn garbage_flags_are_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&0x1fffu64.to_be_bytes());
        assert!(matches!(
            read_record(&mut Cursor::new(wire), PAGE),
            Err(ProtocolError::UnknownFlags(_))
        ));
    }

    #[test]
    fn truncated_page_is_peer_closed() {
        let mut wire = Vec::new();
        write_page_record(&mut wire, 0, &[1; 4096], Some("ram0")).unwrap();
        wire.truncate(wire.len() - 10);
        assert!(matches!(
            read_record(&mut Cursor::new(wire), PAGE),
            Err(ProtocolError::PeerClosed)
        ));
    }
}
