//! The hardware-abstraction contract a platform must satisfy.
//!
//! This plays the role the teacher's `device::BlockDevice` trait plays
//! (`Send + Sync` so a `Link` can live behind an `Arc` and be shared by a
//! `Card` the way the teacher shares a `BlockDevice`), but one layer lower:
//! the teacher's trait already assumes sector-addressed block I/O exists.
//! Here the implementer only has to drive raw SPI bytes and a chip-select
//! line; `Card` (see `card.rs`) builds sector I/O on top of this.

use core::any::Any;

use crate::error::Error;

/// Six required entry points plus optional hints, per the external
/// interface (Link, §6).
pub trait Link: Send + Sync + Any {
    /// Bring the link up at the requested clock rate in Hz, returning the
    /// rate actually achieved (implementations commonly round down to the
    /// nearest divider the peripheral supports).
    fn init(&self, hz: u32) -> Result<u32, Error>;

    /// Blocking full-duplex single byte transfer: clock `tx` out, return
    /// what came back.
    fn transfer(&self, tx: u8) -> Result<u8, Error>;

    /// Blocking bulk transfer. When `tx` is `None`, `0xFF` filler bytes are
    /// clocked out. When `rx` is `None`, incoming bytes are discarded.
    /// `tx` and `rx`, when both present, must be the same length.
    fn transfer_bulk(&self, tx: Option<&[u8]>, rx: Option<&mut [u8]>) -> Result<(), Error>;

    /// Assert chip-select (drive the line active).
    fn cs_assert(&self);

    /// Deassert chip-select (drive the line idle).
    fn cs_deassert(&self);

    /// Blocking millisecond delay.
    fn delay_ms(&self, ms: u32);

    /// Monotonic millisecond counter, for computing elapsed time in
    /// busy-wait loops. Wraps are tolerated by callers via wrapping
    /// subtraction.
    fn millis(&self) -> u32;

    /// Card-presence hint. Default: always present (no detect line wired).
    fn card_present(&self) -> bool {
        true
    }

    /// Write-protect hint. Default: never protected.
    fn write_protected(&self) -> bool {
        false
    }

    /// Wall-clock date/time for timestamping newly written directory
    /// entries, as `(year, month, day, hour, minute, second)`. Default: a
    /// fixed epoch (the FAT epoch itself), for platforms with no RTC.
    fn now(&self) -> (u16, u8, u8, u8, u8, u8) {
        (1980, 1, 1, 0, 0, 0)
    }
}
