use std::io::{ErrorKind, Read};

const FILL_CHUNK: usize = 4096;

/// Peek-then-commit read buffer.
///
/// Requests arrive on a byte stream and are variable length, so the parser
/// must be able to look at a candidate frame without consuming it: a short
/// read leaves every buffered byte in place and the next readiness edge
/// retries from the same position. Only a fully parsed frame is removed,
/// via [`PeekBuf::skip`].
pub struct PeekBuf<R> {
    inner: R,
    buf: Vec<u8>,
    eof: bool,
}

impl<R: Read> PeekBuf<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            eof: false,
        }
    }

    /// Pulls more bytes from the underlying stream into the buffer.
    ///
    /// Returns the number of bytes added. `WouldBlock` from a non-blocking
    /// source is not an error; it simply adds nothing.
    pub fn fill(&mut self) -> std::io::Result<usize> {
        if self.eof {
            return Ok(0);
        }
        let mut chunk = [0u8; FILL_CHUNK];
        match self.inner.read(&mut chunk) {
            Ok(0) => {
                self.eof = true;
                Ok(0)
            }
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(n)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// True once the underlying stream reported EOF.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// The underlying stream, e.g. for readiness polling.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Number of buffered, unconsumed bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// `len` bytes starting `offset` into the unconsumed buffer, or `None`
    /// if that many bytes have not arrived yet.
    pub fn peek(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        self.buf.get(offset..end)
    }

    pub fn peek_u8(&self, offset: usize) -> Option<u8> {
        self.buf.get(offset).copied()
    }

    pub fn peek_be32(&self, offset: usize) -> Option<u32> {
        let b = self.peek(offset, 4)?;
        Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn peek_be64(&self, offset: usize) -> Option<u64> {
        let b = self.peek(offset, 8)?;
        Some(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// Consumes `n` bytes off the front of the buffer.
    pub fn skip(&mut self, n: usize) {
        debug_assert!(n <= self.buf.len());
        self.buf.drain(..n.min(self.buf.len()));
    }
}
