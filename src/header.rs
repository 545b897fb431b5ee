//! Fixed-width ASCII-hex entry header ("newc" / "crc" variants).
//!
//! # Layout
//! ```text
//! magic[6] ino mode uid gid nlink mtime filesize devmajor devminor
//!          rdevmajor rdevminor namesize check          (13 × 8 hex digits)
//! name[namesize]  (NUL-terminated)  pad to 4
//! data[filesize]                    pad to 4
//! ```
//! Both magics are accepted on read; the check field is never verified and
//! is always written as zeros.

use std::io::{Read, Write};

use serde::Serialize;

use crate::error::CpioError;
use crate::io_stream::{PositionedReader, PositionedWriter};

pub const MAGIC_NEWC: &[u8; 6] = b"070701";
pub const MAGIC_CRC:  &[u8; 6] = b"070702";
/// Size of the fixed part of a header: magic plus 13 eight-digit fields.
pub const HEADER_SIZE: usize = 6 + 13 * 8;
/// Path of the end-of-archive sentinel entry.
pub const TRAILER: &str = "TRAILER!!!";
/// Largest accepted `namesize`, terminating NUL included.
pub const PATH_MAX: usize = 4096;
/// Every header+name block and every payload block ends on this boundary.
pub const ALIGN: u64 = 4;

pub const S_IFMT:   u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK:  u32 = 0o120000;
pub const S_IFREG:  u32 = 0o100000;
pub const S_IFBLK:  u32 = 0o060000;
pub const S_IFDIR:  u32 = 0o040000;
pub const S_IFCHR:  u32 = 0o020000;
pub const S_IFIFO:  u32 = 0o010000;

// ── FileKind ──────────────────────────────────────────────────────────────────

/// File type encoded in the `S_IFMT` bits of an entry's mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Fifo,
    CharDevice,
    BlockDevice,
    Socket,
}

impl FileKind {
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG  => Some(FileKind::Regular),
            S_IFDIR  => Some(FileKind::Directory),
            S_IFLNK  => Some(FileKind::Symlink),
            S_IFIFO  => Some(FileKind::Fifo),
            S_IFCHR  => Some(FileKind::CharDevice),
            S_IFBLK  => Some(FileKind::BlockDevice),
            S_IFSOCK => Some(FileKind::Socket),
            _        => None,
        }
    }

    pub fn type_bits(self) -> u32 {
        match self {
            FileKind::Regular     => S_IFREG,
            FileKind::Directory   => S_IFDIR,
            FileKind::Symlink     => S_IFLNK,
            FileKind::Fifo        => S_IFIFO,
            FileKind::CharDevice  => S_IFCHR,
            FileKind::BlockDevice => S_IFBLK,
            FileKind::Socket      => S_IFSOCK,
        }
    }
}

// ── EntryHeader ───────────────────────────────────────────────────────────────

/// In-memory form of one archive entry header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryHeader {
    pub ino:        u32,
    pub mode:       u32,
    pub uid:        u32,
    pub gid:        u32,
    pub nlink:      u32,
    pub mtime:      u32,
    /// Payload bytes that follow the name block.
    pub size:       u32,
    pub dev_major:  u32,
    pub dev_minor:  u32,
    pub rdev_major: u32,
    pub rdev_minor: u32,
    pub path:       String,
}

impl EntryHeader {
    /// A header with every numeric field zeroed except `nlink = 1`.
    pub fn new(path: impl Into<String>, mode: u32) -> Self {
        Self {
            ino:        0,
            mode,
            uid:        0,
            gid:        0,
            nlink:      1,
            mtime:      0,
            size:       0,
            dev_major:  0,
            dev_minor:  0,
            rdev_major: 0,
            rdev_minor: 0,
            path:       path.into(),
        }
    }

    pub fn trailer() -> Self {
        Self::new(TRAILER, 0)
    }

    pub fn is_trailer(&self) -> bool {
        self.path == TRAILER
    }

    pub fn kind(&self) -> Option<FileKind> {
        FileKind::from_mode(self.mode)
    }

    /// `namesize` as stored on the wire: path bytes plus the NUL.
    pub fn name_size(&self) -> usize {
        self.path.len() + 1
    }

    /// Encode the fixed 110-byte block.  Fails if the name does not fit.
    pub fn encode(&self) -> Result<[u8; HEADER_SIZE], CpioError> {
        if self.name_size() > PATH_MAX {
            return Err(CpioError::HeaderSizeTooBig);
        }
        let name_size = self.name_size() as u32;
        if self.path.as_bytes().contains(&0) {
            return Err(CpioError::BadHeader);
        }

        let fields = [
            self.ino,
            self.mode,
            self.uid,
            self.gid,
            self.nlink,
            self.mtime,
            self.size,
            self.dev_major,
            self.dev_minor,
            self.rdev_major,
            self.rdev_minor,
            name_size,
            0, // check
        ];

        let mut out = [0u8; HEADER_SIZE];
        out[..6].copy_from_slice(MAGIC_NEWC);
        for (i, value) in fields.iter().enumerate() {
            let start = 6 + i * 8;
            out[start..start + 8].copy_from_slice(format!("{value:08x}").as_bytes());
        }
        Ok(out)
    }

    /// Decode the fixed block.  Returns the header (with an empty path) and
    /// the `namesize` that follows it.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<(Self, usize), CpioError> {
        let magic = &buf[..6];
        if magic != MAGIC_NEWC && magic != MAGIC_CRC {
            return Err(CpioError::BadMagic);
        }

        let mut fields = [0u32; 13];
        for (i, field) in fields.iter_mut().enumerate() {
            let start = 6 + i * 8;
            *field = parse_hex(&buf[start..start + 8])?;
        }

        let name_size = fields[11] as usize;
        if name_size == 0 {
            return Err(CpioError::BadHeader);
        }
        if name_size > PATH_MAX {
            return Err(CpioError::HeaderSizeTooBig);
        }

        let header = Self {
            ino:        fields[0],
            mode:       fields[1],
            uid:        fields[2],
            gid:        fields[3],
            nlink:      fields[4],
            mtime:      fields[5],
            size:       fields[6],
            dev_major:  fields[7],
            dev_minor:  fields[8],
            rdev_major: fields[9],
            rdev_minor: fields[10],
            path:       String::new(),
        };
        Ok((header, name_size))
    }

    /// Read header, name and the name padding from `reader`.
    pub fn read<R: Read>(reader: &mut PositionedReader<R>) -> Result<Self, CpioError> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;
        let (mut header, name_size) = Self::decode(&buf)?;

        let mut name = reader.read_padded(name_size, ALIGN)?;
        if name.pop() != Some(0) || name.contains(&0) {
            return Err(CpioError::BadHeader);
        }
        header.path = String::from_utf8(name).map_err(|_| CpioError::BadHeader)?;

        tracing::trace!(path = %header.path, size = header.size, position = reader.position(), "decoded header");
        Ok(header)
    }

    /// Write header, name, NUL and the name padding to `writer`.
    pub fn write<W: Write>(&self, writer: &mut PositionedWriter<W>) -> Result<(), CpioError> {
        let fixed = self.encode()?;
        writer.write_all(&fixed)?;
        writer.write_all(self.path.as_bytes())?;
        writer.write_all(&[0])?;
        writer.pad(ALIGN)
    }
}

fn parse_hex(field: &[u8]) -> Result<u32, CpioError> {
    // from_str_radix would accept a leading '+'.
    if !field.iter().all(u8::is_ascii_hexdigit) {
        return Err(CpioError::BadHeader);
    }
    let s = std::str::from_utf8(field).map_err(|_| CpioError::BadHeader)?;
    u32::from_str_radix(s, 16).map_err(|_| CpioError::BadHeader)
}
