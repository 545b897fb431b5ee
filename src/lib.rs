//! Reader and writer for "newc" / "crc" ASCII cpio archives.
//!
//! [`install`] extracts an archive stream onto the filesystem, [`build`]
//! writes one from a list of [`FileMapping`]s, and [`archive`] inspects or
//! filters a stream without touching the filesystem.

#[cfg(not(unix))]
compile_error!("newcpio only supports Unix targets");

pub mod error;
pub mod header;
pub mod io_stream;
pub mod mapping;
pub mod hardlink;
pub mod materialize;
pub mod install;
pub mod builder;
pub mod archive;

pub use error::{CpioError, Failure};
pub use header::{EntryHeader, FileKind};
pub use io_stream::Progress;
pub use mapping::{FileMapping, MappingTable};
pub use install::{install, InstallOptions, InstallSummary};
pub use builder::{build, BuildOptions};
