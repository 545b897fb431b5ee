//! Read path: extract an archive stream onto the filesystem.
//!
//! Entries are processed strictly in stream order until the trailer.  The
//! first error stops the install; the entry being processed is removed (best
//! effort) and reported by archive path.  Everything extracted before it is
//! left in place.

use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{CpioError, Failure};
use crate::hardlink::{Admission, InodeKey, LinkSet, Member};
use crate::header::{EntryHeader, FileKind, ALIGN};
use crate::io_stream::{PositionedReader, Progress, ProgressFn};
use crate::mapping::{resolve, MappingTable, Target};
use crate::materialize::{self, Materializer};

// ── InstallOptions ────────────────────────────────────────────────────────────

/// Configuration for [`install`].
#[derive(Default)]
pub struct InstallOptions<'a> {
    /// Re-root every destination below this directory.
    pub root:     Option<PathBuf>,
    /// Extract only the entries named here, with their overrides applied.
    pub mappings: Option<&'a MappingTable>,
    pub progress: Option<&'a mut ProgressFn<'a>>,
}

// ── InstallSummary ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct InstallSummary {
    /// Entries materialized or linked.
    pub entries:       u64,
    /// Entries without a mapping.
    pub skipped:       u64,
    /// Payload bytes written to disk.
    pub bytes:         u64,
    /// Hardlinks that could not be created.  These do not stop the install.
    pub link_failures: Vec<Failure>,
}

/// Extract every entry of `reader` up to the trailer.
pub fn install<R: Read>(reader: R, opts: InstallOptions<'_>) -> Result<InstallSummary, Failure> {
    let mut installer = Installer::new(reader, opts);
    loop {
        let header = EntryHeader::read(&mut installer.reader)?;
        if header.is_trailer() {
            break;
        }
        if let Err(error) = installer.entry(&header) {
            installer.discard(&header, &error);
            return Err(Failure::new(Some(header.path), error));
        }
    }
    installer.finish()
}

struct Installer<'a, R: Read> {
    reader:   PositionedReader<R>,
    root:     Option<PathBuf>,
    mappings: Option<&'a MappingTable>,
    progress: Option<&'a mut ProgressFn<'a>>,
    links:    LinkSet,
    fs:       Materializer,
    summary:  InstallSummary,
}

impl<'a, R: Read> Installer<'a, R> {
    fn new(reader: R, opts: InstallOptions<'a>) -> Self {
        Self {
            reader:   PositionedReader::new(reader),
            root:     opts.root,
            mappings: opts.mappings,
            progress: opts.progress,
            links:    LinkSet::new(),
            fs:       Materializer::new(),
            summary:  InstallSummary::default(),
        }
    }

    fn target(&self, header: &EntryHeader) -> Option<Target> {
        resolve(self.mappings, self.root.as_deref(), header)
    }

    fn entry(&mut self, header: &EntryHeader) -> Result<(), CpioError> {
        let Some(target) = self.target(header) else {
            tracing::trace!(path = %header.path, "no mapping, skipping");
            self.reader.skip(u64::from(header.size))?;
            self.reader.skip_padding(ALIGN)?;
            self.summary.skipped += 1;
            return Ok(());
        };

        let kind = FileKind::from_mode(target.mode).ok_or(CpioError::UnknownFileType)?;
        if kind == FileKind::Regular && header.nlink > 1 {
            self.hardlinked(header, &target)?;
        } else {
            self.fs.materialize(header, &target, &mut self.reader, self.progress.as_deref_mut())?;
            self.summary.bytes += u64::from(header.size);
            self.summary.entries += 1;
        }
        self.reader.skip_padding(ALIGN)?;

        if let Some(cb) = self.progress.as_deref_mut() {
            let size = u64::from(header.size);
            cb(&Progress {
                path:     &header.path,
                total:    size,
                done:     size,
                position: self.reader.position(),
            });
        }
        Ok(())
    }

    fn hardlinked(&mut self, header: &EntryHeader, target: &Target) -> Result<(), CpioError> {
        let key = InodeKey::of(header);
        let member = Member { archive_path: header.path.clone(), dest: target.path.clone() };

        match self.links.admit(key, header.nlink, header.size > 0, member) {
            Admission::Defer => {
                tracing::trace!(path = %header.path, ino = header.ino, "deferring hardlink");
            }
            Admission::Materialize => {
                self.fs.materialize(header, target, &mut self.reader, self.progress.as_deref_mut())?;
                self.summary.bytes += u64::from(header.size);
                self.summary.entries += 1;
                let replay = self.links.commit(key);
                for m in replay.members {
                    self.link(&replay.target, &m.archive_path, &m.dest);
                    self.summary.entries += 1;
                }
            }
            Admission::Link { target: existing } => {
                // The data is already on disk under another name.
                self.reader.skip(u64::from(header.size))?;
                self.link(&existing, &header.path, &target.path);
                self.links.settle(key);
                self.summary.entries += 1;
            }
        }
        Ok(())
    }

    fn link(&mut self, existing: &Path, archive_path: &str, dest: &Path) {
        if let Err(error) = self.fs.hard_link(existing, dest) {
            tracing::warn!("cannot link {} to {}: {}", dest.display(), existing.display(), error);
            self.summary.link_failures.push(Failure::new(Some(archive_path.to_string()), error));
        }
    }

    fn discard(&self, header: &EntryHeader, error: &CpioError) {
        if matches!(error, CpioError::UnknownFileType) {
            return;
        }
        if let Some(target) = self.target(header) {
            materialize::discard(&target.path);
        }
    }

    fn finish(self) -> Result<InstallSummary, Failure> {
        if let Err(orphan) = self.links.finish() {
            return Err(Failure::new(Some(orphan.archive_path), CpioError::Internal));
        }
        tracing::debug!(
            entries = self.summary.entries,
            skipped = self.summary.skipped,
            bytes = self.summary.bytes,
            position = self.reader.position(),
            "install complete"
        );
        Ok(self.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{S_IFDIR, S_IFREG};
    use crate::io_stream::PositionedWriter;
    use std::fs;
    use std::io::Cursor;
    use std::os::unix::fs::MetadataExt;

    fn push(w: &mut PositionedWriter<Vec<u8>>, h: &EntryHeader, data: &[u8]) {
        h.write(w).unwrap();
        w.write_padded(data, ALIGN).unwrap();
    }

    fn file(path: &str, data: &[u8]) -> EntryHeader {
        let mut h = EntryHeader::new(path, S_IFREG | 0o644);
        h.size = data.len() as u32;
        h
    }

    fn finish(mut w: PositionedWriter<Vec<u8>>) -> Vec<u8> {
        EntryHeader::trailer().write(&mut w).unwrap();
        w.into_inner()
    }

    fn opts(root: &Path) -> InstallOptions<'static> {
        InstallOptions { root: Some(root.to_path_buf()), ..Default::default() }
    }

    #[test]
    fn extracts_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PositionedWriter::new(Vec::new());
        push(&mut w, &EntryHeader::new("etc", S_IFDIR | 0o755), b"");
        push(&mut w, &file("etc/motd", b"hello"), b"hello");
        push(&mut w, &file("usr/share/doc/x", b"abcdefg"), b"abcdefg");

        let summary = install(Cursor::new(finish(w)), opts(dir.path())).unwrap();
        assert_eq!(summary.entries, 3);
        assert_eq!(summary.bytes, 12);
        assert_eq!(fs::read(dir.path().join("etc/motd")).unwrap(), b"hello");
        assert_eq!(fs::read(dir.path().join("usr/share/doc/x")).unwrap(), b"abcdefg");
    }

    #[test]
    fn data_on_first_link_then_links() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PositionedWriter::new(Vec::new());
        for (i, name) in ["a", "b"].iter().enumerate() {
            let data: &[u8] = if i == 0 { b"shared" } else { b"" };
            let mut h = file(name, data);
            h.ino = 5;
            h.nlink = 2;
            push(&mut w, &h, data);
        }
        let summary = install(Cursor::new(finish(w)), opts(dir.path())).unwrap();
        assert_eq!(summary.entries, 2);
        let a = fs::metadata(dir.path().join("a")).unwrap();
        let b = fs::metadata(dir.path().join("b")).unwrap();
        assert_eq!(a.ino(), b.ino());
        assert_eq!(fs::read(dir.path().join("b")).unwrap(), b"shared");
    }

    #[test]
    fn empty_hardlinked_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PositionedWriter::new(Vec::new());
        for name in ["e1", "e2"] {
            let mut h = file(name, b"");
            h.ino = 9;
            h.nlink = 2;
            push(&mut w, &h, b"");
        }
        let summary = install(Cursor::new(finish(w)), opts(dir.path())).unwrap();
        assert_eq!(summary.entries, 2);
        let a = fs::metadata(dir.path().join("e1")).unwrap();
        assert_eq!(a.len(), 0);
        assert_eq!(a.nlink(), 2);
    }

    #[test]
    fn truncated_stream_reports_entry_and_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PositionedWriter::new(Vec::new());
        let mut h = file("partial", b"");
        h.size = 100;
        h.write(&mut w).unwrap();
        w.write_all(b"only a few bytes").unwrap();
        let err = install(Cursor::new(w.into_inner()), opts(dir.path())).unwrap_err();
        assert_eq!(err.path.as_deref(), Some("partial"));
        assert!(matches!(err.error, CpioError::ReadFailed(_)));
        assert!(!dir.path().join("partial").exists());
    }

    #[test]
    fn progress_gets_completion_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = PositionedWriter::new(Vec::new());
        push(&mut w, &file("one", b"12345"), b"12345");
        push(&mut w, &EntryHeader::new("d", S_IFDIR | 0o755), b"");
        let bytes = finish(w);

        let mut seen: Vec<(String, u64, u64)> = Vec::new();
        let mut cb = |p: &Progress<'_>| seen.push((p.path.to_string(), p.done, p.total));
        let opts = InstallOptions {
            root:     Some(dir.path().to_path_buf()),
            progress: Some(&mut cb),
            ..Default::default()
        };
        install(Cursor::new(bytes), opts).unwrap();
        assert_eq!(seen.last(), Some(&("d".to_string(), 0, 0)));
        assert!(seen.contains(&("one".to_string(), 5, 5)));
    }
}
