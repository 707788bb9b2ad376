//! Unified error taxonomy for the card and filesystem layers.
//!
//! The teacher splits errors per module (`FatError`, `DirError`, `FileError`,
//! wrapped by `BlockDeviceError`). This crate threads a single flat enum
//! through every layer instead, since `Card`, `FatTable`, `DirIter`,
//! `PathResolver`, `Volume` and `File` all need to report into the same
//! taxonomy a caller can match on without four separate `From` impls.

use core::fmt;

/// Coarse grouping of an [`Error`], useful for callers that want to branch
/// on "hardware problem" vs. "filesystem problem" without matching every
/// variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Hardware,
    Filesystem,
    File,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    // Hardware
    NoCard,
    Spi,
    Timeout,
    Crc,
    Voltage,
    Init,
    Command,
    WriteProtect,
    Busy,
    Read,
    Write,
    Erase,

    // Filesystem
    NoFs,
    InvalidFs,
    NotFat,
    FatCorrupt,
    Full,
    RootFull,

    // File
    NotFound,
    Exists,
    NotFile,
    NotDir,
    DirNotEmpty,
    InvalidName,
    PathTooLong,
    TooManyOpen,
    InvalidHandle,
    Eof,
    ReadOnly,
    Seek,
    Locked,

    // Generic
    InvalidParam,
    OutOfMemory,
    NotMounted,
    AlreadyMounted,
    NotSupported,
    General,
    Internal,
}

impl Error {
    pub fn kind(self) -> Kind {
        use Error::*;
        match self {
            NoCard | Spi | Timeout | Crc | Voltage | Init | Command | WriteProtect | Busy
            | Read | Write | Erase => Kind::Hardware,
            NoFs | InvalidFs | NotFat | FatCorrupt | Full | RootFull => Kind::Filesystem,
            NotFound | Exists | NotFile | NotDir | DirNotEmpty | InvalidName | PathTooLong
            | TooManyOpen | InvalidHandle | Eof | ReadOnly | Seek | Locked => Kind::File,
            InvalidParam | OutOfMemory | NotMounted | AlreadyMounted | NotSupported | General
            | Internal => Kind::Generic,
        }
    }

    /// Stable short English label, required by the external interface
    /// (`error_label` in `lib.rs`) so a shell can print something
    /// human-readable without matching on the enum itself.
    pub fn label(self) -> &'static str {
        use Error::*;
        match self {
            NoCard => "no card present",
            Spi => "SPI transfer error",
            Timeout => "operation timed out",
            Crc => "CRC mismatch",
            Voltage => "unsupported voltage range",
            Init => "card initialization failed",
            Command => "card rejected command",
            WriteProtect => "card is write-protected",
            Busy => "card busy",
            Read => "read error",
            Write => "write error",
            Erase => "erase error",

            NoFs => "no filesystem found",
            InvalidFs => "invalid filesystem layout",
            NotFat => "not a FAT filesystem",
            FatCorrupt => "FAT table corrupt",
            Full => "volume full",
            RootFull => "root directory full",

            NotFound => "not found",
            Exists => "already exists",
            NotFile => "not a file",
            NotDir => "not a directory",
            DirNotEmpty => "directory not empty",
            InvalidName => "invalid name",
            PathTooLong => "path too long",
            TooManyOpen => "too many open handles",
            InvalidHandle => "invalid handle",
            Eof => "end of file",
            ReadOnly => "read-only",
            Seek => "invalid seek",
            Locked => "locked",

            InvalidParam => "invalid parameter",
            OutOfMemory => "out of memory",
            NotMounted => "volume not mounted",
            AlreadyMounted => "volume already mounted",
            NotSupported => "not supported",
            General => "general error",
            Internal => "internal error",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
