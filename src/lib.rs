#![no_std]
//! Portable SD/MMC-over-SPI driver and FAT12/16/32 filesystem engine for
//! microcontrollers with no general-purpose OS underneath.
//!
//! Layered one-directionally: [`link`] is the board's physical SPI glue,
//! [`card`] speaks the SD/MMC command protocol over it, and everything
//! above ([`bpb`], [`fat`], [`dir`], [`path`], [`volume`], [`file`]) reads
//! and writes the card only through 512-byte sectors. Nothing above
//! `card` ever talks to `link` directly.

extern crate alloc;

pub mod bpb;
pub mod cache;
pub mod card;
pub mod dir;
pub mod endian;
pub mod entry;
pub mod error;
pub mod fat;
pub mod file;
pub mod link;
pub mod path;
pub mod volume;

pub use card::{Card, CardType};
pub use error::{Error, Kind, Result};
pub use file::{Dir, File, OpenMode, SeekFrom};
pub use link::Link;
pub use volume::{Volume, VolumeInfo};

pub use dir::DirInfo;
pub use bpb::FatType;
