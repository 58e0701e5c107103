use std::io::{Read, Write};

use bitflags::bitflags;

use crate::{read_be32, read_be64, read_u8, ProtocolError, Result};

pub const SECTION_INIT: u8 = 0;
pub const SECTION_FULL: u8 = 1;

/// Device state rides in one `FULL` section; cap what a peer can make us
/// buffer.
pub const MAX_FULL_SECTION: u32 = 16 * 1024 * 1024;

bitflags! {
    /// Option mask of the `INIT` section.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Options: u64 {
        /// The source ran a bounded precopy pass and will send a clean
        /// bitmap after the initial stream.
        const PRECOPY = 1;
    }
}

/// One section of the post-copy handshake envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    Init(Options),
    Full(Vec<u8>),
}

pub fn write_init(w: &mut impl Write, options: Options) -> Result<()> {
    w.write_all(&[SECTION_INIT])?;
    w.write_all(&8u32.to_be_bytes())?;
    w.write_all(&options.bits().to_be_bytes())?;
    Ok(())
}

pub fn write_full(w: &mut impl Write, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_FULL_SECTION as usize {
        return Err(ProtocolError::OversizedSection {
            got: payload.len() as u32,
            max: MAX_FULL_SECTION,
        });
    }
    w.write_all(&[SECTION_FULL])?;
    w.write_all(&(payload.len() as u32).to_be_bytes())?;
    w.write_all(payload)?;
    Ok(())
}

pub fn read_section(r: &mut impl Read) -> Result<Section> {
    let subtype = read_u8(r)?;
    let size = read_be32(r)?;
    match subtype {
        SECTION_INIT => {
            if size != 8 {
                return Err(ProtocolError::OversizedSection { got: size, max: 8 });
            }
            let bits = read_be64(r)?;
            let options =
                Options::from_bits(bits).ok_or(ProtocolError::UnknownOptions(bits))?;
            Ok(Section::Init(options))
        }
        SECTION_FULL => {
            if size > MAX_FULL_SECTION {
                return Err(ProtocolError::OversizedSection {
                    got: size,
                    max: MAX_FULL_SECTION,
                });
            }
            let mut payload = vec![0u8; size as usize];
            crate::read_exact(r, &mut payload)?;
            Ok(Section::Full(payload))
        }
        other => Err(ProtocolError::UnknownSection(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn init_roundtrip() {
        let mut wire = Vec::new();
        write_init(&mut wire, Options::PRECOPY).unwrap();
        assert_eq!(
            read_section(&mut Cursor::new(wire)).unwrap(),
            Section::Init(Options::PRECOPY)
        );
    }

    #[test]
    fn unknown_option_bits_rejected() {
        let mut wire = vec![SECTION_INIT];
        wire.extend_from_slice(&8u32.to_be_bytes());
        wire.extend_from_slice(&0x8000_0000_0000_0001u64.to_be_bytes());
        assert!(matches!(
            read_section(&mut Cursor::new(wire)),
            Err(ProtocolError::UnknownOptions(_))
        ));
    }

    #[test]
    fn full_roundtrip() {
        let mut wire = Vec::new();
        write_full(&mut wire, b"device state blob").unwrap();
        assert_eq!(
            read_section(&mut Cursor::new(wire)).unwrap(),
            Section::Full(b"device state blob".to_vec())
        );
    }

    #[test]
    fn oversized_full_rejected_before_allocation() {
        let mut wire = vec![SECTION_FULL];
        wire.extend_from_slice(&(MAX_FULL_SECTION + 1).to_be_bytes());
        assert!(matches!(
            read_section(&mut Cursor::new(wire)),
            Err(ProtocolError::OversizedSection { .. })
        ));
    }
}
