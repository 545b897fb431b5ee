//! Position-tracking stream wrappers.
//!
//! The archive format pads to 4-byte boundaries measured from the start of
//! the archive.  The underlying stream is usually a pipe from a decompressor,
//! so it cannot be asked where it is: [`PositionedReader`] and
//! [`PositionedWriter`] count every byte that passes through them instead,
//! and every read or write of archive bytes must go through them.

use std::io::{self, Read, Write};

use crate::error::CpioError;

/// Payload bytes moved per read/write call.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Filler bytes needed to bring `position` up to a multiple of `modulo`.
pub fn padding(position: u64, modulo: u64) -> u64 {
    (modulo - position % modulo) % modulo
}

// ── Progress ──────────────────────────────────────────────────────────────────

/// One progress report for an entry being installed or built.
#[derive(Debug, Clone, Copy)]
pub struct Progress<'a> {
    /// Archive path of the entry.
    pub path:     &'a str,
    /// Payload size of the entry.
    pub total:    u64,
    /// Payload bytes handled so far.
    pub done:     u64,
    /// Cumulative archive stream position.
    pub position: u64,
}

pub type ProgressFn<'a> = dyn FnMut(&Progress<'_>) + 'a;

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct PositionedReader<R: Read> {
    inner:    R,
    position: u64,
}

impl<R: Read> PositionedReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, position: 0 }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Fill `buf` completely.  A short read is fatal.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), CpioError> {
        self.inner.read_exact(buf).map_err(CpioError::ReadFailed)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    /// Read `n` bytes, then consume the filler up to the next `modulo` boundary.
    pub fn read_padded(&mut self, n: usize, modulo: u64) -> Result<Vec<u8>, CpioError> {
        let mut buf = vec![0u8; n];
        self.read_exact(&mut buf)?;
        self.skip_padding(modulo)?;
        Ok(buf)
    }

    pub fn skip_padding(&mut self, modulo: u64) -> Result<(), CpioError> {
        self.skip(padding(self.position, modulo))
    }

    /// Discard `n` bytes.
    pub fn skip(&mut self, n: u64) -> Result<(), CpioError> {
        let copied = io::copy(&mut (&mut self.inner).take(n), &mut io::sink())
            .map_err(CpioError::ReadFailed)?;
        self.position += copied;
        if copied != n {
            return Err(CpioError::ReadFailed(io::ErrorKind::UnexpectedEof.into()));
        }
        Ok(())
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct PositionedWriter<W: Write> {
    inner:    W,
    position: u64,
}

impl<W: Write> PositionedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, position: 0 }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn write_all(&mut self, buf: &[u8]) -> Result<(), CpioError> {
        self.inner.write_all(buf).map_err(CpioError::WriteFailed)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    /// Write `buf`, then zero filler up to the next `modulo` boundary.
    pub fn write_padded(&mut self, buf: &[u8], modulo: u64) -> Result<(), CpioError> {
        self.write_all(buf)?;
        self.pad(modulo)
    }

    pub fn pad(&mut self, modulo: u64) -> Result<(), CpioError> {
        let pad = padding(self.position, modulo);
        let written = io::copy(&mut io::repeat(0).take(pad), &mut self.inner)
            .map_err(CpioError::WriteFailed)?;
        self.position += written;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), CpioError> {
        self.inner.flush().map_err(CpioError::WriteFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn padding_amounts() {
        assert_eq!(padding(0, 4), 0);
        assert_eq!(padding(1, 4), 3);
        assert_eq!(padding(2, 4), 2);
        assert_eq!(padding(3, 4), 1);
        assert_eq!(padding(121, 4), 3);
        assert_eq!(padding(124, 4), 0);
    }

    #[test]
    fn reader_tracks_position_across_padding() {
        let mut r = PositionedReader::new(Cursor::new(vec![1, 2, 3, 0, 0, 0, 7, 8]));
        let got = r.read_padded(3, 4).unwrap();
        assert_eq!(got, vec![1, 2, 3]);
        assert_eq!(r.position(), 4);
        r.skip(2).unwrap();
        assert_eq!(r.position(), 6);
        let mut two = [0u8; 2];
        r.read_exact(&mut two).unwrap();
        assert_eq!(two, [7, 8]);
        assert_eq!(r.position(), 8);
    }

    #[test]
    fn short_read_is_read_failed() {
        let mut r = PositionedReader::new(Cursor::new(vec![1, 2]));
        let mut buf = [0u8; 4];
        assert!(matches!(r.read_exact(&mut buf), Err(CpioError::ReadFailed(_))));

        let mut r = PositionedReader::new(Cursor::new(vec![1, 2]));
        assert!(matches!(r.skip(5), Err(CpioError::ReadFailed(_))));
    }

    #[test]
    fn writer_pads_with_zeros() {
        let mut w = PositionedWriter::new(Vec::new());
        w.write_padded(b"hello", 4).unwrap();
        assert_eq!(w.position(), 8);
        w.pad(4).unwrap();
        assert_eq!(w.position(), 8);
        assert_eq!(w.into_inner(), b"hello\0\0\0");
    }

    #[test]
    fn wide_alignment_pads_past_sixteen_bytes() {
        let mut w = PositionedWriter::new(Vec::new());
        w.write_all(b"x").unwrap();
        w.pad(32).unwrap();
        assert_eq!(w.position(), 32);
        let bytes = w.into_inner();
        assert_eq!(bytes.len(), 32);
        assert!(bytes[1..].iter().all(|&b| b == 0));

        let mut stream = bytes.clone();
        stream.push(9);
        let mut r = PositionedReader::new(Cursor::new(stream));
        assert_eq!(r.read_padded(1, 32).unwrap(), b"x");
        assert_eq!(r.position(), 32);
        let mut next = [0u8; 1];
        r.read_exact(&mut next).unwrap();
        assert_eq!(next, [9]);

        let mut r = PositionedReader::new(Cursor::new(vec![1u8; 10]));
        assert!(matches!(r.read_padded(1, 64), Err(CpioError::ReadFailed(_))));
    }
}
