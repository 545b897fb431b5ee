//! Error taxonomy shared by the read and write paths.
//!
//! Lower layers (header codec, stream cursor, materializer) return
//! [`CpioError`].  The top-level entry points (`install`, `build`, `filter`)
//! wrap it in a [`Failure`] that also names the archive entry being processed
//! when the error happened.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CpioError {
    #[error("Bad magic")]
    BadMagic,
    #[error("Bad / unreadable header")]
    BadHeader,
    #[error("open failed - {0}")]
    OpenFailed(#[source] io::Error),
    #[error("chmod failed - {0}")]
    ChmodFailed(#[source] io::Error),
    #[error("chown failed - {0}")]
    ChownFailed(#[source] io::Error),
    #[error("write failed - {0}")]
    WriteFailed(#[source] io::Error),
    #[error("utime failed - {0}")]
    UtimeFailed(#[source] io::Error),
    #[error("unlink failed - {0}")]
    UnlinkFailed(#[source] io::Error),
    #[error("symlink failed - {0}")]
    SymlinkFailed(#[source] io::Error),
    #[error("stat failed - {0}")]
    StatFailed(#[source] io::Error),
    #[error("mkdir failed - {0}")]
    MkdirFailed(#[source] io::Error),
    #[error("mknod failed - {0}")]
    MknodFailed(#[source] io::Error),
    #[error("mkfifo failed - {0}")]
    MkfifoFailed(#[source] io::Error),
    #[error("link failed - {0}")]
    LinkFailed(#[source] io::Error),
    #[error("readlink failed - {0}")]
    ReadlinkFailed(#[source] io::Error),
    #[error("read failed - {0}")]
    ReadFailed(#[source] io::Error),
    #[error("copy failed - {0}")]
    CopyFailed(#[source] io::Error),
    #[error("Internal error")]
    Internal,
    #[error("Header size too big")]
    HeaderSizeTooBig,
    #[error("Unknown file type")]
    UnknownFileType,
}

impl CpioError {
    /// The OS errno carried by syscall-adjacent variants, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        self.io_error().and_then(io::Error::raw_os_error)
    }

    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            CpioError::OpenFailed(e)
            | CpioError::ChmodFailed(e)
            | CpioError::ChownFailed(e)
            | CpioError::WriteFailed(e)
            | CpioError::UtimeFailed(e)
            | CpioError::UnlinkFailed(e)
            | CpioError::SymlinkFailed(e)
            | CpioError::StatFailed(e)
            | CpioError::MkdirFailed(e)
            | CpioError::MknodFailed(e)
            | CpioError::MkfifoFailed(e)
            | CpioError::LinkFailed(e)
            | CpioError::ReadlinkFailed(e)
            | CpioError::ReadFailed(e)
            | CpioError::CopyFailed(e) => Some(e),
            CpioError::BadMagic
            | CpioError::BadHeader
            | CpioError::Internal
            | CpioError::HeaderSizeTooBig
            | CpioError::UnknownFileType => None,
        }
    }
}

/// Converts a `nix` errno into an `io::Error` so it can ride inside a
/// [`CpioError`] variant.
pub(crate) fn errno(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// First error of an install / build / filter call, plus the archive path of
/// the entry that was being processed.
#[derive(Error, Debug)]
#[error("{}: {}", .path.as_deref().unwrap_or("<archive>"), .error)]
pub struct Failure {
    pub path:  Option<String>,
    #[source]
    pub error: CpioError,
}

impl Failure {
    pub fn new(path: Option<String>, error: CpioError) -> Self {
        Self { path, error }
    }
}

impl From<CpioError> for Failure {
    fn from(error: CpioError) -> Self {
        Self { path: None, error }
    }
}
