use std::io::{Read, Write};

use crate::peek::PeekBuf;
use crate::{check_id, ProtocolError, Result, MAX_ID_LEN};

/// One framed message must fit the 32 KiB stream buffer.
pub const MAX_FRAME: usize = 32 * 1024;

/// Worst-case page offsets per frame: the frame budget minus the largest
/// possible header (cmd byte, idlen byte, 255-byte id, u32 count), in u64s.
pub const MAX_PAGE_NR: usize = (MAX_FRAME - (1 + 1 + MAX_ID_LEN + 4)) / 8;

const CMD_EOC: u8 = 0;
const CMD_PAGE: u8 = 1;
const CMD_PAGE_CONT: u8 = 2;

/// A destination-to-source request.
///
/// `PageCont` addresses the same block as the last `Page` seen on the
/// connection; the request builder relies on that to keep frames small when
/// faults cluster in one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// End of commands: no further requests will follow.
    Eoc,
    Page { id: String, pgoffs: Vec<u64> },
    PageCont { pgoffs: Vec<u64> },
}

fn write_pgoffs(w: &mut impl Write, pgoffs: &[u64]) -> Result<()> {
    w.write_all(&(pgoffs.len() as u32).to_be_bytes())?;
    for pgoff in pgoffs {
        w.write_all(&pgoff.to_be_bytes())?;
    }
    Ok(())
}

fn write_one(w: &mut impl Write, req: &Request) -> Result<()> {
    match req {
        Request::Eoc => w.write_all(&[CMD_EOC])?,
        Request::Page { id, pgoffs } => {
            check_id(id)?;
            debug_assert!(pgoffs.len() <= MAX_PAGE_NR);
            w.write_all(&[CMD_PAGE])?;
            w.write_all(&[id.len() as u8])?;
            w.write_all(id.as_bytes())?;
            write_pgoffs(w, pgoffs)?;
        }
        Request::PageCont { pgoffs } => {
            debug_assert!(pgoffs.len() <= MAX_PAGE_NR);
            w.write_all(&[CMD_PAGE_CONT])?;
            write_pgoffs(w, pgoffs)?;
        }
    }
    Ok(())
}

/// Writes a request, splitting bursts larger than [`MAX_PAGE_NR`] into a
/// leading `PAGE` frame followed by `PAGE_CONT` frames.
pub fn write_request(w: &mut impl Write, req: &Request) -> Result<()> {
    match req {
        Request::Eoc => write_one(w, req),
        Request::Page { id, pgoffs } => {
            let (head, mut rest) = pgoffs.split_at(pgoffs.len().min(MAX_PAGE_NR));
            write_one(
                w,
                &Request::Page {
                    id: id.clone(),
                    pgoffs: head.to_vec(),
                },
            )?;
            while !rest.is_empty() {
                let (chunk, tail) = rest.split_at(rest.len().min(MAX_PAGE_NR));
                write_one(
                    w,
                    &Request::PageCont {
                        pgoffs: chunk.to_vec(),
                    },
                )?;
                rest = tail;
            }
            Ok(())
        }
        Request::PageCont { pgoffs } => {
            let mut rest = &pgoffs[..];
            loop {
                let (chunk, tail) = rest.split_at(rest.len().min(MAX_PAGE_NR));
                write_one(
                    w,
                    &Request::PageCont {
                        pgoffs: chunk.to_vec(),
                    },
                )?;
                rest = tail;
                if rest.is_empty() {
                    return Ok(());
                }
            }
        }
    }
}

fn peek_pgoffs(pb: &PeekBuf<impl Read>, offset: &mut usize) -> Result<Option<Vec<u64>>> {
    let Some(nr) = pb.peek_be32(*offset) else {
        return Ok(None);
    };
    *offset += 4;
    if nr as usize > MAX_PAGE_NR {
        return Err(ProtocolError::OversizedRequest { nr });
    }
    let mut pgoffs = Vec::with_capacity(nr as usize);
    for _ in 0..nr {
        let Some(pgoff) = pb.peek_be64(*offset) else {
            return Ok(None);
        };
        *offset += 8;
        pgoffs.push(pgoff);
    }
    Ok(Some(pgoffs))
}

/// Attempts to parse one request out of the peek buffer.
///
/// Pulls whatever the underlying stream has ready, then parses with an
/// offset cursor. A partially arrived frame consumes nothing and yields
/// `Ok(None)`; the caller retries on the next readiness edge. EOF before a
/// complete frame is [`ProtocolError::PeerClosed`].
pub fn read_request(pb: &mut PeekBuf<impl Read>) -> Result<Option<Request>> {
    pb.fill()?;

    let mut offset = 0usize;
    let Some(cmd) = pb.peek_u8(offset) else {
        if pb.is_eof() {
            return Err(ProtocolError::PeerClosed);
        }
        return Ok(None);
    };
    offset += 1;

    let req = match cmd {
        CMD_EOC => Request::Eoc,
        CMD_PAGE => {
            let Some(idlen) = pb.peek_u8(offset) else {
                return need_more(pb);
            };
            offset += 1;
            if idlen == 0 {
                return Err(ProtocolError::EmptyId);
            }
            let Some(idbytes) = pb.peek(offset, idlen as usize) else {
                return need_more(pb);
            };
            let id = String::from_utf8(idbytes.to_vec()).map_err(|e| {
                ProtocolError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            })?;
            offset += idlen as usize;
            let Some(pgoffs) = peek_pgoffs(pb, &mut offset)? else {
                return need_more(pb);
            };
            Request::Page { id, pgoffs }
        }
        CMD_PAGE_CONT => {
            let Some(pgoffs) = peek_pgoffs(pb, &mut offset)? else {
                return need_more(pb);
            };
            Request::PageCont { pgoffs }
        }
        other => return Err(ProtocolError::UnknownCommand(other)),
    };

    pb.skip(offset);
    Ok(Some(req))
}

fn need_more(pb: &PeekBuf<impl Read>) -> Result<Option<Request>> {
    if pb.is_eof() {
        return Err(ProtocolError::PeerClosed);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(req: &Request) -> Vec<Request> {
        let mut wire = Vec::new();
        write_request(&mut wire, req).unwrap();
        assert!(frame_sizes(&wire).iter().all(|&len| len <= MAX_FRAME));
        let mut pb = PeekBuf::new(Cursor::new(wire));
        let mut out = Vec::new();
        loop {
            match read_request(&mut pb) {
                Ok(Some(req)) => out.push(req),
                Ok(None) => {}
                Err(ProtocolError::PeerClosed) => break,
                Err(e) => panic!("{e}"),
            }
        }
        out
    }

    /// Walks the encoded bytes and returns each frame's length.
    fn frame_sizes(mut wire: &[u8]) -> Vec<usize> {
        let mut sizes = Vec::new();
        while !wire.is_empty() {
            let start = wire.len();
            match wire[0] {
                CMD_EOC => wire = &wire[1..],
                CMD_PAGE => {
                    let idlen = wire[1] as usize;
                    let nr =
                        u32::from_be_bytes(wire[2 + idlen..6 + idlen].try_into().unwrap()) as usize;
                    wire = &wire[2 + idlen + 4 + nr * 8..];
                }
                CMD_PAGE_CONT => {
                    let nr = u32::from_be_bytes(wire[1..5].try_into().unwrap()) as usize;
                    wire = &wire[5 + nr * 8..];
                }
                other => panic!("bad cmd {other}"),
            }
            sizes.push(start - wire.len());
        }
        sizes
    }

    #[test]
    fn header_budget_holds() {
        assert_eq!(MAX_PAGE_NR, 4063);
        assert!(1 + 1 + MAX_ID_LEN + 4 + 8 * MAX_PAGE_NR <= MAX_FRAME);
    }

    #[test]
    fn eoc_roundtrip() {
        assert_eq!(roundtrip(&Request::Eoc), vec![Request::Eoc]);
    }

    #[test]
    fn small_page_request_is_one_frame() {
        let req = Request::Page {
            id: "ram0".into(),
            pgoffs: vec![2, 5, 9],
        };
        assert_eq!(roundtrip(&req), vec![req]);
    }

    #[test]
    fn exactly_max_page_nr_is_one_frame() {
        let req = Request::Page {
            id: "ram0".into(),
            pgoffs: (0..MAX_PAGE_NR as u64).collect(),
        };
        assert_eq!(roundtrip(&req), vec![req]);
    }

    #[test]
    fn max_page_nr_plus_one_splits_into_page_and_cont() {
        let pgoffs: Vec<u64> = (0..MAX_PAGE_NR as u64 + 1).collect();
        let got = roundtrip(&Request::Page {
            id: "ram0".into(),
            pgoffs: pgoffs.clone(),
        });
        assert_eq!(
            got,
            vec![
                Request::Page {
                    id: "ram0".into(),
                    pgoffs: pgoffs[..MAX_PAGE_NR].to_vec(),
                },
                Request::PageCont {
                    pgoffs: pgoffs[MAX_PAGE_NR..].to_vec(),
                },
            ]
        );
    }

    #[test]
    fn partial_frame_consumes_nothing() {
        let mut wire = Vec::new();
        write_request(
            &mut wire,
            &Request::Page {
                id: "ram0".into(),
                pgoffs: vec![7],
            },
        )
        .unwrap();
        // Deliver all but the last byte: parser must keep its hands off.
        let cut = wire.len() - 1;
        let mut pb = PeekBuf::new(Cursor::new(wire[..cut].to_vec()));
        assert!(read_request(&mut pb).unwrap().is_none());
        assert_eq!(pb.buffered(), cut);
    }

    #[test]
    fn unknown_command_rejected() {
        let mut pb = PeekBuf::new(Cursor::new(vec![0x7fu8]));
        assert!(matches!(
            read_request(&mut pb),
            Err(ProtocolError::UnknownCommand(0x7f))
        ));
    }

    #[test]
    fn oversized_count_rejected() {
        let mut wire = vec![CMD_PAGE_CONT];
        wire.extend_from_slice(&(MAX_PAGE_NR as u32 + 1).to_be_bytes());
        let mut pb = PeekBuf::new(Cursor::new(wire));
        assert!(matches!(
            read_request(&mut pb),
            Err(ProtocolError::OversizedRequest { .. })
        ));
    }
}
