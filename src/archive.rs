//! Read-only inspection and filtering of archive streams.
//!
//! ```no_run
//! use newcpio::archive::{self, Entries};
//!
//! // List
//! let file = std::fs::File::open("initrd.cpio")?;
//! for header in archive::list(file)? {
//!     println!("{} {}", header.path, header.size);
//! }
//!
//! // Walk, reading symlink targets
//! let mut entries = Entries::new(std::fs::File::open("initrd.cpio")?);
//! while let Some(header) = entries.next_entry()? {
//!     if header.kind() == Some(newcpio::FileKind::Symlink) {
//!         let target = entries.read_payload()?;
//!         println!("{} -> {}", header.path, String::from_utf8_lossy(&target));
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::io::{self, Read, Write};

use glob::{MatchOptions, Pattern};

use crate::error::{CpioError, Failure};
use crate::header::{EntryHeader, ALIGN};
use crate::io_stream::{PositionedReader, PositionedWriter, CHUNK_SIZE};

// ── Entries ───────────────────────────────────────────────────────────────────

/// Sequential walk over the headers of an archive.  Payloads the caller does
/// not read are skipped; iteration ends at the trailer.
pub struct Entries<R: Read> {
    reader:  PositionedReader<R>,
    /// Payload size of the last returned entry, until it is consumed.
    pending: Option<u64>,
    done:    bool,
}

impl<R: Read> Entries<R> {
    pub fn new(reader: R) -> Self {
        Self { reader: PositionedReader::new(reader), pending: None, done: false }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> u64 {
        self.reader.position()
    }

    pub fn next_entry(&mut self) -> Result<Option<EntryHeader>, CpioError> {
        if self.done {
            return Ok(None);
        }
        if let Some(size) = self.pending.take() {
            self.reader.skip(size)?;
            self.reader.skip_padding(ALIGN)?;
        }
        let header = EntryHeader::read(&mut self.reader)?;
        if header.is_trailer() {
            self.done = true;
            return Ok(None);
        }
        self.pending = Some(u64::from(header.size));
        Ok(Some(header))
    }

    /// Payload of the entry last returned by [`next_entry`](Self::next_entry).
    /// Empty if it was already consumed.
    ///
    /// The buffer grows one chunk at a time as data arrives, so a header
    /// that claims more bytes than the stream holds fails with `ReadFailed`
    /// instead of allocating the claimed size up front.
    pub fn read_payload(&mut self) -> Result<Vec<u8>, CpioError> {
        let Some(size) = self.pending.take() else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        let mut left = size as usize;
        while left > 0 {
            let n = left.min(CHUNK_SIZE);
            out.try_reserve(n)
                .map_err(|e| CpioError::ReadFailed(io::Error::new(io::ErrorKind::OutOfMemory, e)))?;
            let start = out.len();
            out.resize(start + n, 0);
            self.reader.read_exact(&mut out[start..])?;
            left -= n;
        }
        self.reader.skip_padding(ALIGN)?;
        Ok(out)
    }

    /// Copy the pending payload into `out` unchanged.
    fn copy_payload<W: Write>(&mut self, out: &mut PositionedWriter<W>) -> Result<(), CpioError> {
        let Some(size) = self.pending.take() else {
            return Ok(());
        };
        let mut buf = vec![0u8; CHUNK_SIZE.min(size as usize)];
        let mut left = size;
        while left > 0 {
            let n = left.min(buf.len() as u64) as usize;
            self.reader.read_exact(&mut buf[..n])?;
            out.write_all(&buf[..n])?;
            left -= n as u64;
        }
        self.reader.skip_padding(ALIGN)
    }
}

impl<R: Read> Iterator for Entries<R> {
    type Item = Result<EntryHeader, CpioError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.next_entry().transpose();
        if matches!(item, Some(Err(_))) {
            self.done = true;
        }
        item
    }
}

/// Every header of the archive, in stream order, trailer excluded.
pub fn list<R: Read>(reader: R) -> Result<Vec<EntryHeader>, CpioError> {
    Entries::new(reader).collect()
}

// ── Filter ────────────────────────────────────────────────────────────────────

const MATCH: MatchOptions = MatchOptions {
    case_sensitive:              true,
    require_literal_separator:   true,
    require_literal_leading_dot: false,
};

/// Whether any pattern matches `path`, with or without a leading `./`.
pub fn matches(patterns: &[Pattern], path: &str) -> bool {
    let bare = path.strip_prefix("./").unwrap_or(path);
    patterns
        .iter()
        .any(|p| p.matches_with(path, MATCH) || p.matches_with(bare, MATCH))
}

/// Copy the entries of `reader` whose path matches any of `patterns` into a
/// new archive on `writer`.  Headers and payloads are copied unchanged except
/// for the check field.  Returns the number of bytes written.
///
/// Hardlink groups are copied member by member; a pattern set that keeps
/// some links of a group but not the one carrying the data produces an
/// archive that fails to install.
pub fn filter<R: Read, W: Write>(
    reader:   R,
    writer:   W,
    patterns: &[Pattern],
) -> Result<u64, Failure> {
    let mut entries = Entries::new(reader);
    let mut out = PositionedWriter::new(writer);
    let mut kept = 0u64;

    while let Some(header) = entries.next_entry()? {
        if !matches(patterns, &header.path) {
            tracing::trace!(path = %header.path, "filtered out");
            continue;
        }
        let fail = |error: CpioError| Failure::new(Some(header.path.clone()), error);
        header.write(&mut out).map_err(fail)?;
        entries.copy_payload(&mut out).map_err(fail)?;
        out.pad(ALIGN).map_err(fail)?;
        kept += 1;
    }

    EntryHeader::trailer().write(&mut out)?;
    out.pad(ALIGN)?;
    out.flush()?;
    tracing::debug!(kept, total = out.position(), "filter complete");
    Ok(out.position())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{S_IFDIR, S_IFLNK, S_IFREG};
    use std::io::Cursor;

    fn sample() -> Vec<u8> {
        let mut w = PositionedWriter::new(Vec::new());
        let mut push = |path: &str, mode: u32, data: &[u8]| {
            let mut h = EntryHeader::new(path, mode);
            h.size = data.len() as u32;
            h.write(&mut w).unwrap();
            w.write_all(data).unwrap();
            w.pad(ALIGN).unwrap();
        };
        push("./etc", S_IFDIR | 0o755, b"");
        push("./etc/hosts", S_IFREG | 0o644, b"127.0.0.1 localhost\n");
        push("./etc/localtime", S_IFLNK | 0o777, b"/usr/share/zoneinfo/UTC");
        push("./usr/bin/true", S_IFREG | 0o755, b"\x7fELF");
        EntryHeader::trailer().write(&mut w).unwrap();
        w.into_inner()
    }

    fn paths(headers: &[EntryHeader]) -> Vec<&str> {
        headers.iter().map(|h| h.path.as_str()).collect()
    }

    #[test]
    fn list_stops_at_trailer() {
        let mut bytes = sample();
        bytes.extend_from_slice(b"garbage that is not a header");
        let headers = list(Cursor::new(bytes)).unwrap();
        assert_eq!(
            paths(&headers),
            vec!["./etc", "./etc/hosts", "./etc/localtime", "./usr/bin/true"]
        );
    }

    #[test]
    fn payload_can_be_read_or_skipped() {
        let mut entries = Entries::new(Cursor::new(sample()));
        let mut targets = Vec::new();
        while let Some(h) = entries.next_entry().unwrap() {
            if h.kind() == Some(crate::header::FileKind::Symlink) {
                targets.push(entries.read_payload().unwrap());
                assert!(entries.read_payload().unwrap().is_empty());
            }
        }
        assert_eq!(targets, vec![b"/usr/share/zoneinfo/UTC".to_vec()]);
        assert_eq!(entries.next_entry().unwrap(), None);
    }

    #[test]
    fn oversized_payload_claim_is_read_failed() {
        let mut w = PositionedWriter::new(Vec::new());
        let mut h = EntryHeader::new("huge", S_IFREG | 0o644);
        h.size = 0xFFFF_FFF0;
        h.write(&mut w).unwrap();
        w.write_all(b"only a few bytes").unwrap();

        let mut entries = Entries::new(Cursor::new(w.into_inner()));
        assert_eq!(entries.next_entry().unwrap().unwrap().size, 0xFFFF_FFF0);
        assert!(matches!(entries.read_payload(), Err(CpioError::ReadFailed(_))));
    }

    #[test]
    fn iterator_fuses_after_error() {
        let mut bytes = sample();
        bytes[0] = b'x';
        let mut it = Entries::new(Cursor::new(bytes));
        assert!(matches!(it.next(), Some(Err(CpioError::BadMagic))));
        assert!(it.next().is_none());
    }

    #[test]
    fn filter_keeps_matching_entries() {
        let patterns = vec![Pattern::new("etc/*").unwrap()];
        let mut out = Vec::new();
        let written = filter(Cursor::new(sample()), &mut out, &patterns).unwrap();
        assert_eq!(written, out.len() as u64);
        assert_eq!(written % 4, 0);

        let headers = list(Cursor::new(&out)).unwrap();
        assert_eq!(paths(&headers), vec!["./etc/hosts", "./etc/localtime"]);

        let mut entries = Entries::new(Cursor::new(&out));
        entries.next_entry().unwrap();
        assert_eq!(entries.read_payload().unwrap(), b"127.0.0.1 localhost\n");
    }

    #[test]
    fn star_does_not_cross_directories() {
        let patterns = vec![Pattern::new("usr/*").unwrap()];
        assert!(!matches(&patterns, "./usr/bin/true"));
        assert!(matches(&[Pattern::new("usr/**/true").unwrap()], "./usr/bin/true"));
    }
}
