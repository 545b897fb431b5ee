//! Archive-path → filesystem-path mapping table with attribute overrides.
//!
//! On install the table doubles as a filter: entries without a mapping are
//! skipped.  On build each mapping names one source file, and the mappings
//! are processed in caller order.
//!
//! Tables can be loaded from JSON:
//!
//! ```json
//! [
//!   { "archive_path": "./etc/motd", "fs_path": "/tmp/motd", "mode": 420 },
//!   { "archive_path": "./bin/sh" }
//! ]
//! ```
//!
//! Each optional field that is present sets the matching override flag.

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};

use crate::header::{EntryHeader, S_IFMT};

/// Install to `fs_path` instead of the archive path.
pub const MAP_PATH:            u32 = 1 << 0;
/// Replace the permission bits with `mode`.
pub const MAP_MODE:            u32 = 1 << 1;
pub const MAP_UID:             u32 = 1 << 2;
pub const MAP_GID:             u32 = 1 << 3;
/// Build only: stat through a symlink instead of archiving the link.
pub const MAP_FOLLOW_SYMLINKS: u32 = 1 << 4;

// ── FileMapping ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMapping {
    pub archive_path: String,
    pub fs_path:      PathBuf,
    pub mode:         u32,
    pub uid:          u32,
    pub gid:          u32,
    pub flags:        u32,
}

impl FileMapping {
    /// Map `archive_path` to `fs_path` with no attribute overrides.
    pub fn new(archive_path: impl Into<String>, fs_path: impl Into<PathBuf>) -> Self {
        Self {
            archive_path: archive_path.into(),
            fs_path:      fs_path.into(),
            mode:         0,
            uid:          0,
            gid:          0,
            flags:        MAP_PATH,
        }
    }

    /// Select `archive_path` and keep it as the destination.
    pub fn keep(archive_path: impl Into<String>) -> Self {
        let archive_path = archive_path.into();
        Self {
            fs_path: PathBuf::from(&archive_path),
            flags:   0,
            ..Self::new(archive_path, PathBuf::new())
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self.flags |= MAP_MODE;
        self
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self.flags |= MAP_UID | MAP_GID;
        self
    }

    pub fn follow_symlinks(mut self) -> Self {
        self.flags |= MAP_FOLLOW_SYMLINKS;
        self
    }

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    /// Apply the overrides to `header`'s attributes.  File-type bits are
    /// always taken from the header.
    pub fn apply(&self, header: &EntryHeader) -> (u32, u32, u32) {
        let mode = if self.has(MAP_MODE) {
            (header.mode & S_IFMT) | (self.mode & !S_IFMT)
        } else {
            header.mode
        };
        let uid = if self.has(MAP_UID) { self.uid } else { header.uid };
        let gid = if self.has(MAP_GID) { self.gid } else { header.gid };
        (mode, uid, gid)
    }
}

// Present-means-override wire form.
#[derive(Deserialize)]
struct FileMappingRaw {
    archive_path: String,
    #[serde(default)]
    fs_path: Option<PathBuf>,
    #[serde(default)]
    mode: Option<u32>,
    #[serde(default)]
    uid: Option<u32>,
    #[serde(default)]
    gid: Option<u32>,
    #[serde(default)]
    follow_symlinks: bool,
}

impl<'de> Deserialize<'de> for FileMapping {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = FileMappingRaw::deserialize(deserializer)?;
        if raw.archive_path.is_empty() {
            return Err(serde::de::Error::custom("archive_path must not be empty"));
        }

        let mut flags = 0;
        let fs_path = match raw.fs_path {
            Some(p) => { flags |= MAP_PATH; p }
            None    => PathBuf::from(&raw.archive_path),
        };
        if raw.mode.is_some()   { flags |= MAP_MODE; }
        if raw.uid.is_some()    { flags |= MAP_UID; }
        if raw.gid.is_some()    { flags |= MAP_GID; }
        if raw.follow_symlinks  { flags |= MAP_FOLLOW_SYMLINKS; }

        Ok(FileMapping {
            archive_path: raw.archive_path,
            fs_path,
            mode:  raw.mode.unwrap_or(0),
            uid:   raw.uid.unwrap_or(0),
            gid:   raw.gid.unwrap_or(0),
            flags,
        })
    }
}

/// Ordering shared by table sorting and lookup.
fn compare(a: &str, b: &str) -> Ordering {
    a.as_bytes().cmp(b.as_bytes())
}

// ── MappingTable ──────────────────────────────────────────────────────────────

/// Immutable, sorted mapping table searched by exact archive path.
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    entries: Vec<FileMapping>,
}

impl MappingTable {
    pub fn new(mut entries: Vec<FileMapping>) -> Self {
        entries.sort_by(|a, b| compare(&a.archive_path, &b.archive_path));
        Self { entries }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let entries: Vec<FileMapping> = serde_json::from_slice(bytes)?;
        Ok(Self::new(entries))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_json(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn lookup(&self, archive_path: &str) -> Option<&FileMapping> {
        self.entries
            .binary_search_by(|m| compare(&m.archive_path, archive_path))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = &FileMapping> {
        self.entries.iter()
    }
}

// ── Resolution ────────────────────────────────────────────────────────────────

/// Where and how an accepted entry is materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub path: PathBuf,
    pub mode: u32,
    pub uid:  u32,
    pub gid:  u32,
}

/// Decide the fate of `header`.  `None` means "skip this entry".
///
/// Without a table every entry is accepted at its archive path.  With a
/// `root`, the destination is re-rooted below it (leading `/` stripped).
pub fn resolve(
    table:  Option<&MappingTable>,
    root:   Option<&Path>,
    header: &EntryHeader,
) -> Option<Target> {
    let (path, mode, uid, gid) = match table {
        None => (PathBuf::from(&header.path), header.mode, header.uid, header.gid),
        Some(table) => {
            let mapping = table.lookup(&header.path)?;
            let path = if mapping.has(MAP_PATH) {
                mapping.fs_path.clone()
            } else {
                PathBuf::from(&header.path)
            };
            let (mode, uid, gid) = mapping.apply(header);
            (path, mode, uid, gid)
        }
    };

    let path = match root {
        Some(root) => root.join(path.strip_prefix("/").unwrap_or(&path)),
        None       => path,
    };
    Some(Target { path, mode, uid, gid })
}
