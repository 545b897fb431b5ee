//! Create filesystem objects that match entry headers.
//!
//! Every creation step is idempotent against what is already on disk: an
//! existing directory is kept, an existing symlink with the right target is
//! kept, an existing FIFO or device node of the right type and number is
//! kept.  Anything else in the way is unlinked first.

use std::ffi::OsStr;
use std::fs::{self, Metadata, OpenOptions, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use filetime::FileTime;
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{geteuid, mkfifo};

use crate::error::{errno, CpioError};
use crate::header::{EntryHeader, FileKind, PATH_MAX};
use crate::io_stream::{PositionedReader, Progress, ProgressFn, CHUNK_SIZE};
use crate::mapping::Target;

/// Mode used for parent directories created on demand.
const PARENT_DIR_MODE: u32 = 0o755;

/// Per-call materializer.  Holds the last directory known to exist so
/// consecutive entries sharing a parent skip the component walk.
#[derive(Debug)]
pub struct Materializer {
    last_dir:     Option<PathBuf>,
    can_chown:    bool,
    chown_warned: bool,
}

impl Default for Materializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Materializer {
    pub fn new() -> Self {
        Self {
            last_dir:     None,
            can_chown:    geteuid().is_root(),
            chown_warned: false,
        }
    }

    /// Create the object described by `header` at `target`, reading any
    /// payload (file data or symlink text) from `payload`.  Trailing payload
    /// padding is left for the caller.
    pub fn materialize<R: Read>(
        &mut self,
        header:   &EntryHeader,
        target:   &Target,
        payload:  &mut PositionedReader<R>,
        progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<(), CpioError> {
        let kind = FileKind::from_mode(target.mode).ok_or(CpioError::UnknownFileType)?;
        let path = target.path.as_path();
        self.ensure_parent(path)?;

        match kind {
            FileKind::Regular => {
                tracing::debug!("extracting {}", path.display());
                write_regular(header, path, payload, progress)?;
            }
            FileKind::Directory => {
                tracing::debug!("creating directory {}", path.display());
                ensure_dir(path, 0)?;
            }
            FileKind::Symlink => {
                return self.write_symlink(header, target, payload);
            }
            // Sockets cannot be recreated from an archive; a FIFO stands in.
            FileKind::Fifo | FileKind::Socket => {
                tracing::debug!("creating fifo {}", path.display());
                make_fifo(path)?;
            }
            FileKind::CharDevice | FileKind::BlockDevice => {
                tracing::debug!(
                    "creating device {} ({}:{})",
                    path.display(),
                    header.rdev_major,
                    header.rdev_minor
                );
                make_device(path, kind, header.rdev_major, header.rdev_minor)?;
            }
        }

        self.apply_attributes(path, target, header.mtime)
    }

    /// Replace whatever is at `link` with a hardlink to `target`.
    pub fn hard_link(&mut self, target: &Path, link: &Path) -> Result<(), CpioError> {
        if target == link {
            return Ok(());
        }
        self.ensure_parent(link)?;
        remove_existing(link)?;
        tracing::debug!("linking {} => {}", link.display(), target.display());
        fs::hard_link(target, link).map_err(CpioError::LinkFailed)
    }

    /// Create every missing ancestor of `path`, one component at a time.
    pub fn ensure_parent(&mut self, path: &Path) -> Result<(), CpioError> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => return Ok(()),
        };
        if self.last_dir.as_deref() == Some(parent) {
            return Ok(());
        }

        let mut walked = PathBuf::new();
        for component in parent.components() {
            walked.push(component);
            if let Component::Normal(_) = component {
                ensure_dir(&walked, PARENT_DIR_MODE)?;
            }
        }
        self.last_dir = Some(parent.to_path_buf());
        Ok(())
    }

    fn write_symlink<R: Read>(
        &mut self,
        header:  &EntryHeader,
        target:  &Target,
        payload: &mut PositionedReader<R>,
    ) -> Result<(), CpioError> {
        let size = header.size as usize;
        if size > PATH_MAX {
            return Err(CpioError::HeaderSizeTooBig);
        }
        let mut text = vec![0u8; size];
        payload.read_exact(&mut text)?;
        let wanted = Path::new(OsStr::from_bytes(&text));
        let path = target.path.as_path();

        let current = match fs::symlink_metadata(path) {
            Ok(md) if md.file_type().is_symlink() => {
                Some(fs::read_link(path).map_err(CpioError::ReadlinkFailed)?)
            }
            Ok(_) => None,
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(CpioError::StatFailed(e)),
        };

        if current.as_deref() == Some(wanted) {
            tracing::trace!("symlink {} already points to {}", path.display(), wanted.display());
        } else {
            remove_existing(path)?;
            tracing::debug!("symlinking {} -> {}", path.display(), wanted.display());
            std::os::unix::fs::symlink(wanted, path).map_err(CpioError::SymlinkFailed)?;
        }

        if self.can_chown {
            std::os::unix::fs::lchown(path, Some(target.uid), Some(target.gid))
                .map_err(CpioError::ChownFailed)?;
        }
        Ok(())
    }

    fn apply_attributes(&mut self, path: &Path, target: &Target, mtime: u32) -> Result<(), CpioError> {
        // chown before chmod: chown clears set-id bits.
        if self.can_chown {
            std::os::unix::fs::chown(path, Some(target.uid), Some(target.gid))
                .map_err(CpioError::ChownFailed)?;
        } else if !self.chown_warned {
            tracing::warn!("not running as root, file ownership is not restored");
            self.chown_warned = true;
        }
        fs::set_permissions(path, Permissions::from_mode(target.mode & 0o7777))
            .map_err(CpioError::ChmodFailed)?;
        // By path: opening a FIFO or device node to stamp it would block or
        // touch the device.
        let time = FileTime::from_unix_time(i64::from(mtime), 0);
        filetime::set_symlink_file_times(path, time, time).map_err(CpioError::UtimeFailed)
    }
}

/// Best-effort removal of a half-created entry.  Directories are left alone.
pub fn discard(path: &Path) {
    if let Ok(md) = fs::symlink_metadata(path) {
        if !md.is_dir() {
            let _ = fs::remove_file(path);
        }
    }
}

fn write_regular<R: Read>(
    header:       &EntryHeader,
    path:         &Path,
    payload:      &mut PositionedReader<R>,
    mut progress: Option<&mut ProgressFn<'_>>,
) -> Result<(), CpioError> {
    // Unlink first so we never write through an existing hardlink or symlink.
    remove_existing(path)?;
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(CpioError::OpenFailed)?;

    let total = u64::from(header.size);
    let mut buf = vec![0u8; CHUNK_SIZE.min(total as usize)];
    let mut done = 0u64;
    while done < total {
        let n = (total - done).min(CHUNK_SIZE as u64) as usize;
        payload.read_exact(&mut buf[..n])?;
        file.write_all(&buf[..n]).map_err(CpioError::WriteFailed)?;
        done += n as u64;
        if let Some(cb) = progress.as_deref_mut() {
            cb(&Progress { path: &header.path, total, done, position: payload.position() });
        }
    }
    Ok(())
}

/// Make sure a directory exists at `path`.  A symlink that resolves to a
/// directory counts as one; anything else in the way is unlinked.
fn ensure_dir(path: &Path, mode: u32) -> Result<(), CpioError> {
    let in_the_way = match fs::symlink_metadata(path) {
        Ok(md) if md.is_dir() => return Ok(()),
        Ok(md) if md.file_type().is_symlink() => match fs::metadata(path) {
            Ok(resolved) if resolved.is_dir() => return Ok(()),
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => return Err(CpioError::StatFailed(e)),
        },
        Ok(_) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => return Err(CpioError::StatFailed(e)),
    };
    if in_the_way {
        fs::remove_file(path).map_err(CpioError::UnlinkFailed)?;
    }
    fs::DirBuilder::new()
        .mode(mode)
        .create(path)
        .map_err(CpioError::MkdirFailed)
}

/// Unlink a non-directory at `path`, if any.
fn remove_existing(path: &Path) -> Result<(), CpioError> {
    match fs::symlink_metadata(path) {
        Ok(md) if md.is_dir() => Ok(()),
        Ok(_) => fs::remove_file(path).map_err(CpioError::UnlinkFailed),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CpioError::StatFailed(e)),
    }
}

/// Stat `path`; `Ok(true)` if what is there already satisfies `matches`,
/// otherwise clear the path and return `Ok(false)`.
fn reuse_or_clear(path: &Path, matches: impl Fn(&Metadata) -> bool) -> Result<bool, CpioError> {
    match fs::symlink_metadata(path) {
        Ok(md) if matches(&md) => Ok(true),
        Ok(_) => remove_existing(path).map(|_| false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CpioError::StatFailed(e)),
    }
}

fn make_fifo(path: &Path) -> Result<(), CpioError> {
    if reuse_or_clear(path, |md| md.file_type().is_fifo())? {
        return Ok(());
    }
    mkfifo(path, Mode::empty()).map_err(|e| CpioError::MkfifoFailed(errno(e)))
}

fn make_device(path: &Path, kind: FileKind, major: u32, minor: u32) -> Result<(), CpioError> {
    let dev = makedev(u64::from(major), u64::from(minor));
    let (flag, block) = match kind {
        FileKind::BlockDevice => (SFlag::S_IFBLK, true),
        _                     => (SFlag::S_IFCHR, false),
    };
    let same = |md: &Metadata| {
        let ft = md.file_type();
        let type_ok = if block { ft.is_block_device() } else { ft.is_char_device() };
        type_ok && md.rdev() == dev
    };
    if reuse_or_clear(path, same)? {
        return Ok(());
    }
    mknod(path, flag, Mode::empty(), dev).map_err(|e| CpioError::MknodFailed(errno(e)))
}
