//! Write path: serialize filesystem objects into an archive stream.
//!
//! Mappings are processed in caller order.  Members of a hardlink group are
//! held back until the last one is seen and then written together, the
//! first carrying the data and the others written with size 0.  Groups whose
//! remaining links were never supplied are written at the end, before the
//! trailer.  A group's `nlink` is the number of members actually written.
//!
//! Inode numbers are assigned sequentially per distinct `(dev, ino)` source,
//! so linked entries share a number and the 32-bit field never aliases two
//! different files.

use std::collections::HashMap;
use std::fs::{self, File, Metadata};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::sys::stat::{major, minor};

use crate::error::{CpioError, Failure};
use crate::hardlink::{InodeKey, LinkBatcher};
use crate::header::{EntryHeader, FileKind, ALIGN};
use crate::io_stream::{PositionedWriter, Progress, ProgressFn, CHUNK_SIZE};
use crate::mapping::{FileMapping, MAP_FOLLOW_SYMLINKS};

// ── BuildOptions ──────────────────────────────────────────────────────────────

/// Configuration for [`build`].
#[derive(Default)]
pub struct BuildOptions<'a> {
    /// Called once per written entry.
    pub progress: Option<&'a mut ProgressFn<'a>>,
}

/// Archive every mapping into `writer`, append the trailer, and return the
/// total number of bytes written.
pub fn build<W: Write>(
    writer:   W,
    mappings: &[FileMapping],
    opts:     BuildOptions<'_>,
) -> Result<u64, Failure> {
    let mut builder = Builder {
        writer:   PositionedWriter::new(writer),
        progress: opts.progress,
    };
    let mut batcher = LinkBatcher::new();
    let mut inodes = InodeTable::default();

    for mapping in mappings {
        let fail = |error: CpioError| Failure::new(Some(mapping.archive_path.clone()), error);
        let mut source = Source::stat(mapping).map_err(fail)?;
        source.header.ino = inodes.number(source.inode).map_err(fail)?;

        match source.link_key {
            Some((key, nlink)) => {
                tracing::trace!(path = %mapping.archive_path, nlink, "holding hardlink");
                if let Some(group) = batcher.push(key, nlink, source) {
                    builder.group(group)?;
                }
            }
            None => builder.entry(&source, true).map_err(fail)?,
        }
    }
    for group in batcher.drain() {
        builder.group(group)?;
    }

    builder.finish().map_err(Failure::from)
}

// ── Source ────────────────────────────────────────────────────────────────────

/// A stat'ed mapping, ready to be written.
struct Source<'m> {
    mapping:  &'m FileMapping,
    header:   EntryHeader,
    /// Symlink target text, written as the payload.
    link:     Option<Vec<u8>>,
    inode:    InodeKey,
    /// Set for regular files with more than one link.
    link_key: Option<(InodeKey, u64)>,
}

impl<'m> Source<'m> {
    fn stat(mapping: &'m FileMapping) -> Result<Self, CpioError> {
        let path = mapping.fs_path.as_path();
        let md = if mapping.has(MAP_FOLLOW_SYMLINKS) {
            fs::metadata(path)
        } else {
            fs::symlink_metadata(path)
        }
        .map_err(CpioError::StatFailed)?;

        let kind = FileKind::from_mode(md.mode()).ok_or(CpioError::UnknownFileType)?;
        let mut header = header_from(&mapping.archive_path, &md);
        let (mode, uid, gid) = mapping.apply(&header);
        header.mode = mode;
        header.uid = uid;
        header.gid = gid;

        let inode = InodeKey::new(md.dev(), md.ino());
        let mut link = None;
        let mut link_key = None;
        match kind {
            FileKind::Regular => {
                header.size = u32::try_from(md.len()).map_err(|_| CpioError::HeaderSizeTooBig)?;
                if md.nlink() > 1 {
                    link_key = Some((inode, md.nlink()));
                }
            }
            FileKind::Symlink => {
                let target = fs::read_link(path).map_err(CpioError::ReadlinkFailed)?;
                let text = target.as_os_str().as_bytes().to_vec();
                header.size = u32::try_from(text.len()).map_err(|_| CpioError::HeaderSizeTooBig)?;
                link = Some(text);
            }
            _ => {}
        }

        Ok(Self { mapping, header, link, inode, link_key })
    }
}

/// Archive inode numbers, one per distinct source inode, starting at 1.
#[derive(Default)]
struct InodeTable {
    numbers: HashMap<InodeKey, u32>,
}

impl InodeTable {
    fn number(&mut self, key: InodeKey) -> Result<u32, CpioError> {
        if let Some(&n) = self.numbers.get(&key) {
            return Ok(n);
        }
        let n = u32::try_from(self.numbers.len() + 1).map_err(|_| CpioError::HeaderSizeTooBig)?;
        self.numbers.insert(key, n);
        Ok(n)
    }
}

fn header_from(archive_path: &str, md: &Metadata) -> EntryHeader {
    let mut h = EntryHeader::new(archive_path, md.mode());
    h.uid = md.uid();
    h.gid = md.gid();
    h.nlink = md.nlink() as u32;
    h.mtime = u32::try_from(md.mtime().max(0)).unwrap_or(u32::MAX);
    h.dev_major = major(md.dev()) as u32;
    h.dev_minor = minor(md.dev()) as u32;
    h.rdev_major = major(md.rdev()) as u32;
    h.rdev_minor = minor(md.rdev()) as u32;
    h
}

// ── Builder ───────────────────────────────────────────────────────────────────

struct Builder<'a, W: Write> {
    writer:   PositionedWriter<W>,
    progress: Option<&'a mut ProgressFn<'a>>,
}

impl<'a, W: Write> Builder<'a, W> {
    fn group(&mut self, mut group: Vec<Source<'_>>) -> Result<(), Failure> {
        // Links that were not supplied must not be waited for on install.
        let nlink = u32::try_from(group.len()).unwrap_or(u32::MAX);
        for source in &mut group {
            source.header.nlink = nlink;
        }
        for (i, source) in group.iter().enumerate() {
            self.entry(source, i == 0)
                .map_err(|e| Failure::new(Some(source.mapping.archive_path.clone()), e))?;
        }
        Ok(())
    }

    fn entry(&mut self, source: &Source<'_>, with_data: bool) -> Result<(), CpioError> {
        let mut header = source.header.clone();
        if !with_data {
            header.size = 0;
        }
        tracing::debug!("archiving {} ({} bytes)", header.path, header.size);
        header.write(&mut self.writer)?;

        let size = u64::from(header.size);
        if size > 0 {
            match &source.link {
                Some(text) => self.writer.write_all(text)?,
                None => self.copy(&source.mapping.fs_path, size)?,
            }
        }
        self.writer.pad(ALIGN)?;

        if let Some(cb) = self.progress.as_deref_mut() {
            cb(&Progress {
                path:     &header.path,
                total:    size,
                done:     size,
                position: self.writer.position(),
            });
        }
        Ok(())
    }

    /// Stream exactly `size` bytes of `path`.  A file that shrank since it
    /// was stat'ed is a `CopyFailed`.
    fn copy(&mut self, path: &Path, size: u64) -> Result<(), CpioError> {
        let mut file = File::open(path).map_err(CpioError::OpenFailed)?;
        let mut buf = vec![0u8; CHUNK_SIZE.min(size as usize)];
        let mut left = size;
        while left > 0 {
            let want = left.min(buf.len() as u64) as usize;
            let n = match file.read(&mut buf[..want]) {
                Ok(0) => {
                    return Err(CpioError::CopyFailed(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} shrank by {left} bytes", path.display()),
                    )))
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CpioError::ReadFailed(e)),
            };
            self.writer.write_all(&buf[..n])?;
            left -= n as u64;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<u64, CpioError> {
        EntryHeader::trailer().write(&mut self.writer)?;
        self.writer.pad(ALIGN)?;
        self.writer.flush()?;
        let total = self.writer.position();
        tracing::debug!(total, "archive written");
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{S_IFLNK, S_IFMT, S_IFREG};
    use crate::io_stream::PositionedReader;
    use std::io::Cursor;

    /// Decode every entry, payload included, up to and including the trailer.
    fn entries(bytes: &[u8]) -> Vec<(EntryHeader, Vec<u8>)> {
        let mut r = PositionedReader::new(Cursor::new(bytes));
        let mut out = Vec::new();
        loop {
            let h = EntryHeader::read(&mut r).unwrap();
            assert_eq!(r.position() % 4, 0);
            let data = r.read_padded(h.size as usize, ALIGN).unwrap();
            assert_eq!(r.position() % 4, 0);
            let done = h.is_trailer();
            out.push((h, data));
            if done {
                break;
            }
        }
        assert_eq!(r.position(), bytes.len() as u64);
        out
    }

    fn names(e: &[(EntryHeader, Vec<u8>)]) -> Vec<&str> {
        e.iter().map(|(h, _)| h.path.as_str()).collect()
    }

    #[test]
    fn writes_files_and_trailer() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"hello").unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();

        let mappings = vec![
            FileMapping::new("d", dir.path().join("d")),
            FileMapping::new("d/f", dir.path().join("f")),
        ];
        let mut out = Vec::new();
        let total = build(&mut out, &mappings, BuildOptions::default()).unwrap();
        assert_eq!(total, out.len() as u64);

        let e = entries(&out);
        assert_eq!(names(&e), vec!["d", "d/f", "TRAILER!!!"]);
        assert_eq!(e[1].1, b"hello");
        assert_eq!(e[2].0.nlink, 1);
        assert_eq!(e[2].0.size, 0);
    }

    #[test]
    fn hardlinks_are_grouped_with_data_first() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        fs::write(&a, b"linked").unwrap();
        fs::hard_link(&a, dir.path().join("b")).unwrap();
        fs::write(dir.path().join("plain"), b"p").unwrap();

        let mappings = vec![
            FileMapping::new("a", &a),
            FileMapping::new("plain", dir.path().join("plain")),
            FileMapping::new("b", dir.path().join("b")),
        ];
        let mut out = Vec::new();
        build(&mut out, &mappings, BuildOptions::default()).unwrap();
        let e = entries(&out);
        assert_eq!(names(&e), vec!["plain", "a", "b", "TRAILER!!!"]);
        assert_eq!(e[1].1, b"linked");
        assert_eq!(e[2].0.size, 0);
        assert_eq!(e[1].0.ino, e[2].0.ino);
        assert_eq!(e[1].0.nlink, 2);
    }

    #[test]
    fn incomplete_group_is_flushed_before_trailer() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        fs::write(&a, b"x").unwrap();
        fs::hard_link(&a, dir.path().join("unlisted")).unwrap();

        let mut out = Vec::new();
        build(&mut out, &[FileMapping::new("a", &a)], BuildOptions::default()).unwrap();
        let e = entries(&out);
        assert_eq!(names(&e), vec!["a", "TRAILER!!!"]);
        assert_eq!(e[0].1, b"x");
        assert_eq!(e[0].0.nlink, 1);
    }

    #[test]
    fn partial_group_counts_written_links() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        fs::write(&a, b"").unwrap();
        fs::hard_link(&a, dir.path().join("b")).unwrap();
        fs::hard_link(&a, dir.path().join("unlisted")).unwrap();

        let mappings = vec![
            FileMapping::new("a", &a),
            FileMapping::new("b", dir.path().join("b")),
        ];
        let mut out = Vec::new();
        build(&mut out, &mappings, BuildOptions::default()).unwrap();
        let e = entries(&out);
        assert_eq!(names(&e), vec!["a", "b", "TRAILER!!!"]);
        assert_eq!(e[0].0.nlink, 2);
        assert_eq!(e[1].0.nlink, 2);
        assert_eq!(e[0].0.size, 0);
    }

    #[test]
    fn inodes_are_numbered_per_source_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        fs::write(&a, b"1").unwrap();
        fs::hard_link(&a, dir.path().join("b")).unwrap();
        fs::write(dir.path().join("c"), b"2").unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();

        let mappings = vec![
            FileMapping::new("d", dir.path().join("d")),
            FileMapping::new("a", &a),
            FileMapping::new("c", dir.path().join("c")),
            FileMapping::new("b", dir.path().join("b")),
            FileMapping::new("c2", dir.path().join("c")),
        ];
        let mut out = Vec::new();
        build(&mut out, &mappings, BuildOptions::default()).unwrap();
        let e = entries(&out);
        assert_eq!(names(&e), vec!["d", "c", "a", "b", "c2", "TRAILER!!!"]);
        let ino: Vec<u32> = e.iter().map(|(h, _)| h.ino).collect();
        assert_eq!(ino, vec![1, 3, 2, 2, 3, 0]);
    }

    #[test]
    fn symlink_payload_is_target_text() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real"), b"0123456789").unwrap();
        std::os::unix::fs::symlink("real", dir.path().join("ln")).unwrap();

        let mappings = vec![
            FileMapping::new("ln", dir.path().join("ln")),
            FileMapping::new("followed", dir.path().join("ln")).follow_symlinks(),
        ];
        let mut out = Vec::new();
        build(&mut out, &mappings, BuildOptions::default()).unwrap();
        let e = entries(&out);
        assert_eq!(e[0].0.mode & S_IFMT, S_IFLNK);
        assert_eq!(e[0].1, b"real");
        assert_eq!(e[1].0.mode & S_IFMT, S_IFREG);
        assert_eq!(e[1].1, b"0123456789");
    }

    #[test]
    fn overrides_are_written() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"").unwrap();
        let mappings = vec![
            FileMapping::new("f", dir.path().join("f")).with_mode(0o4711).with_owner(7, 8),
        ];
        let mut out = Vec::new();
        build(&mut out, &mappings, BuildOptions::default()).unwrap();
        let h = &entries(&out)[0].0;
        assert_eq!(h.mode, S_IFREG | 0o4711);
        assert_eq!((h.uid, h.gid), (7, 8));
    }

    #[test]
    fn missing_source_names_the_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let mappings = vec![FileMapping::new("gone", dir.path().join("nope"))];
        let err = build(Vec::new(), &mappings, BuildOptions::default()).unwrap_err();
        assert_eq!(err.path.as_deref(), Some("gone"));
        assert!(matches!(err.error, CpioError::StatFailed(_)));
        assert_eq!(err.error.raw_os_error(), Some(nix::errno::Errno::ENOENT as i32));
    }

    #[test]
    fn progress_once_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"abc").unwrap();
        let mappings = vec![FileMapping::new("f", dir.path().join("f"))];
        let mut calls = Vec::new();
        let mut cb = |p: &Progress<'_>| calls.push((p.path.to_string(), p.done, p.position));
        let opts = BuildOptions { progress: Some(&mut cb) };
        build(Vec::new(), &mappings, opts).unwrap();
        // header 110 + "f\0" = 112, data 3 padded to 4
        assert_eq!(calls, vec![("f".to_string(), 3, 116)]);
    }
}
