//! SD/MMC command-layer driver over a synchronous serial [`Link`].
//!
//! None of the five example repositories speak the SD wire protocol — they
//! all start one layer up, from an already-satisfied block-device trait
//! (the teacher's `device::BlockDevice`, `rrbutani-fatfs`'s
//! `storage-traits::Storage`, …). This module has no direct teacher
//! counterpart; it is written directly from the protocol description,
//! structured the way the teacher structures a stateful driver object
//! (a single struct guarding its fields behind `spin` locks, small focused
//! methods, counters as plain fields) and using the `crc` crate the way
//! `rrbutani-fatfs` does for on-the-wire checksums.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use log::{debug, trace, warn};
use spin::Mutex;

use crate::error::Error;
use crate::link::Link;

/// SD/MMC commands used by this driver (index = CMD number).
mod cmd {
    pub const GO_IDLE_STATE: u8 = 0;
    pub const SEND_OP_COND_MMC: u8 = 1;
    pub const SEND_IF_COND: u8 = 8;
    pub const SEND_CSD: u8 = 9;
    pub const SEND_CID: u8 = 10;
    pub const STOP_TRANSMISSION: u8 = 12;
    pub const SET_BLOCKLEN: u8 = 16;
    pub const READ_SINGLE_BLOCK: u8 = 17;
    pub const READ_MULTIPLE_BLOCK: u8 = 18;
    pub const WRITE_BLOCK: u8 = 24;
    pub const WRITE_MULTIPLE_BLOCK: u8 = 25;
    pub const ERASE_WR_BLK_START: u8 = 32;
    pub const ERASE_WR_BLK_END: u8 = 33;
    pub const ERASE: u8 = 38;
    pub const APP_SEND_OP_COND: u8 = 41; // sent as ACMD41
    pub const APP_CMD: u8 = 55;
    pub const READ_OCR: u8 = 58;
    pub const SET_WR_BLOCK_ERASE_COUNT: u8 = 23; // sent as ACMD23
}

const R1_IDLE: u8 = 0x01;
const R1_ILLEGAL_COMMAND: u8 = 0x04;
const TOKEN_SINGLE: u8 = 0xFE;
const TOKEN_MULTI_WRITE: u8 = 0xFC;
const TOKEN_STOP_WRITE: u8 = 0xFD;

pub const BLOCK_SIZE: usize = 512;

/// CRC-7/MMC over the CRC crate's generic bit-width engine, matching how
/// `rrbutani-fatfs` reaches for the `crc` crate rather than a hand-rolled
/// table. Polynomial `x^7 + x^3 + 1` = 0x09, non-reflected, no-shift.
const CRC7: crc::Algorithm<u8> = crc::Algorithm {
    width: 7,
    poly: 0x09,
    init: 0x00,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0x75,
    residue: 0x00,
};

fn crc7(data: &[u8]) -> u8 {
    crc::Crc::<u8>::new(&CRC7).checksum(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardType {
    None,
    Mmc,
    SdV1,
    SdV2,
    Sdhc,
    Sdxc,
}

impl CardType {
    pub fn name(self) -> &'static str {
        match self {
            CardType::None => "none",
            CardType::Mmc => "MMC",
            CardType::SdV1 => "SD v1",
            CardType::SdV2 => "SD v2",
            CardType::Sdhc => "SDHC",
            CardType::Sdxc => "SDXC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninit,
    Idle,
    Initializing,
    Ready,
    Reading,
    MultiReading,
    Writing,
    MultiWriting,
    Erasing,
}

/// Error-token classification returned in the high three bits being zero
/// during the data-token protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataError {
    Crc,
    Ecc,
    OutOfRange,
    Generic,
}

fn classify_data_error(token: u8) -> DataError {
    if token & 0x08 != 0 {
        DataError::OutOfRange
    } else if token & 0x04 != 0 {
        DataError::Ecc
    } else if token & 0x02 != 0 {
        DataError::Crc
    } else {
        DataError::Generic
    }
}

struct Counters {
    reads: u64,
    writes: u64,
    errors: u64,
}

struct Inner {
    state: State,
    card_type: CardType,
    initialized: bool,
    link_hz: u32,
    block_addressing: bool,
    capacity_bytes: u64,
    sector_count: u32,
    cid: [u8; 16],
    csd: [u8; 16],
    counters: Counters,
}

/// SD/MMC card, addressed one 512-byte sector at a time over `Link`.
pub struct Card {
    link: Arc<dyn Link>,
    inner: Mutex<Inner>,
    /// Whether a `Volume` currently has a FAT mount open on this card.
    /// Tracked here rather than on `Volume` since the card is the shared
    /// resource a second `Volume::mount` call would actually collide on.
    mounted: AtomicBool,
}

impl Card {
    pub const INIT_TIMEOUT_MS: u32 = 1_000;
    pub const READ_TIMEOUT_MS: u32 = 200;
    pub const WRITE_TIMEOUT_MS: u32 = 500;
    pub const ERASE_TIMEOUT_MS: u32 = 30_000;
    const INIT_CLOCK_HZ: u32 = 400_000;
    const FAST_CLOCK_CAP_HZ: u32 = 25_000_000;

    pub fn new(link: Arc<dyn Link>) -> Self {
        Self {
            link,
            mounted: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                state: State::Uninit,
                card_type: CardType::None,
                initialized: false,
                link_hz: 0,
                block_addressing: false,
                capacity_bytes: 0,
                sector_count: 0,
                cid: [0; 16],
                csd: [0; 16],
                counters: Counters {
                    reads: 0,
                    writes: 0,
                    errors: 0,
                },
            }),
        }
    }

    pub fn card_type(&self) -> CardType {
        self.inner.lock().card_type
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().initialized
    }

    pub fn block_addressing(&self) -> bool {
        self.inner.lock().block_addressing
    }

    pub fn sector_count(&self) -> u32 {
        self.inner.lock().sector_count
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.inner.lock().capacity_bytes
    }

    pub fn cid(&self) -> [u8; 16] {
        self.inner.lock().cid
    }

    pub fn csd(&self) -> [u8; 16] {
        self.inner.lock().csd
    }

    /// Wall-clock hint from the underlying [`Link`], for timestamping
    /// newly written directory entries.
    pub fn now(&self) -> (u16, u8, u8, u8, u8, u8) {
        self.link.now()
    }

    pub fn error_count(&self) -> u64 {
        self.inner.lock().counters.errors
    }

    /// Run the §4.2 initialization protocol, bringing the link to
    /// `fast_hz` (capped at 25 MHz) on success.
    pub fn init(&self, fast_hz: u32) -> Result<(), Error> {
        if !self.link.card_present() {
            return Err(Error::NoCard);
        }

        {
            let mut inner = self.inner.lock();
            inner.state = State::Uninit;
            inner.initialized = false;
        }

        let actual = self.link.init(Self::INIT_CLOCK_HZ)?;
        debug!("card: link up at {} Hz for init", actual);
        self.link.delay_ms(1);

        self.link.cs_deassert();
        let dummy = [0xFFu8; 10]; // >= 80 clocks
        self.link.transfer_bulk(Some(&dummy), None)?;

        self.link.cs_assert();
        let r1 = self.send_command(cmd::GO_IDLE_STATE, 0)?;
        self.link.cs_deassert();
        self.clock_trailer();
        if r1 != R1_IDLE {
            self.bump_error();
            warn!("card: CMD0 did not return idle (r1={:#04x})", r1);
            return Err(Error::Init);
        }
        self.inner.lock().state = State::Idle;

        self.link.cs_assert();
        let r1 = self.send_command(cmd::SEND_IF_COND, 0x0000_01AA)?;
        let mut card_type = CardType::SdV2;
        let mut high_capacity_capable = true;
        if r1 & R1_ILLEGAL_COMMAND != 0 {
            card_type = CardType::SdV1;
            high_capacity_capable = false;
        } else {
            let mut echo = [0u8; 4];
            self.link.transfer_bulk(None, Some(&mut echo))?;
            if echo[2] != 0x01 || echo[3] != 0xAA {
                self.link.cs_deassert();
                self.clock_trailer();
                self.bump_error();
                return Err(Error::Voltage);
            }
        }
        self.link.cs_deassert();
        self.clock_trailer();
        debug!("card: CMD8 classified card as {}", card_type.name());

        self.inner.lock().state = State::Initializing;
        let start = self.link.millis();
        let hcs_bit = if high_capacity_capable { 1u32 << 30 } else { 0 };
        let mut acmd_rejected = false;
        loop {
            self.link.cs_assert();
            let _ = self.send_command(cmd::APP_CMD, 0)?;
            self.link.cs_deassert();
            self.clock_trailer();

            self.link.cs_assert();
            let r1 = self.send_command(cmd::APP_SEND_OP_COND, hcs_bit)?;
            self.link.cs_deassert();
            self.clock_trailer();

            if r1 & R1_ILLEGAL_COMMAND != 0 {
                acmd_rejected = true;
                break;
            }
            if r1 == 0 {
                break;
            }
            if self.link.millis().wrapping_sub(start) > Self::INIT_TIMEOUT_MS {
                self.bump_error();
                return Err(Error::Timeout);
            }
        }

        if acmd_rejected {
            let start = self.link.millis();
            loop {
                self.link.cs_assert();
                let r1 = self.send_command(cmd::SEND_OP_COND_MMC, 0)?;
                self.link.cs_deassert();
                self.clock_trailer();
                if r1 == 0 {
                    card_type = CardType::Mmc;
                    break;
                }
                if self.link.millis().wrapping_sub(start) > Self::INIT_TIMEOUT_MS {
                    self.bump_error();
                    return Err(Error::Timeout);
                }
            }
        }

        let mut block_addressing = false;
        if matches!(card_type, CardType::SdV2) {
            self.link.cs_assert();
            let r1 = self.send_command(cmd::READ_OCR, 0)?;
            let mut ocr = [0u8; 4];
            self.link.transfer_bulk(None, Some(&mut ocr))?;
            self.link.cs_deassert();
            self.clock_trailer();
            if r1 != 0 {
                self.bump_error();
                return Err(Error::Command);
            }
            if ocr[0] & 0x40 != 0 {
                block_addressing = true;
                card_type = CardType::Sdhc;
            }
        }

        if !block_addressing {
            self.link.cs_assert();
            let r1 = self.send_command(cmd::SET_BLOCKLEN, BLOCK_SIZE as u32)?;
            self.link.cs_deassert();
            self.clock_trailer();
            if r1 != 0 {
                self.bump_error();
                return Err(Error::Command);
            }
        }

        let csd = self.read_register(cmd::SEND_CSD)?;
        let (sector_count, capacity_bytes) = decode_csd_capacity(&csd);
        if capacity_bytes > 32u64 * 1024 * 1024 * 1024 {
            card_type = CardType::Sdxc;
        }

        let cid = self.read_register(cmd::SEND_CID)?;

        let actual_fast = self
            .link
            .init(fast_hz.min(Self::FAST_CLOCK_CAP_HZ))?;
        debug!(
            "card: init complete, type={}, {} sectors, running at {} Hz",
            card_type.name(),
            sector_count,
            actual_fast
        );

        let mut inner = self.inner.lock();
        inner.state = State::Ready;
        inner.card_type = card_type;
        inner.initialized = true;
        inner.link_hz = actual_fast;
        inner.block_addressing = block_addressing;
        inner.capacity_bytes = capacity_bytes;
        inner.sector_count = sector_count;
        inner.cid = cid;
        inner.csd = csd;
        Ok(())
    }

    /// Claim this card for a new `Volume::mount`. Fails with
    /// `Error::AlreadyMounted` if a `Volume` is already mounted on it.
    pub fn mark_mounted(&self) -> Result<(), Error> {
        self.mounted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| Error::AlreadyMounted)
    }

    pub fn mark_unmounted(&self) {
        self.mounted.store(false, Ordering::SeqCst);
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    pub fn require_ready(&self) -> Result<(), Error> {
        if !self.link.card_present() {
            self.inner.lock().state = State::Uninit;
            self.inner.lock().initialized = false;
            return Err(Error::NoCard);
        }
        if !self.inner.lock().initialized {
            return Err(Error::Init);
        }
        Ok(())
    }

    /// Address argument for a block command: sector index on
    /// block-addressed cards, byte offset otherwise.
    fn block_arg(&self, sector: u32) -> u32 {
        if self.inner.lock().block_addressing {
            sector
        } else {
            sector.saturating_mul(BLOCK_SIZE as u32)
        }
    }

    pub fn read_sector(&self, sector: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), Error> {
        self.require_ready()?;
        self.inner.lock().state = State::Reading;
        let arg = self.block_arg(sector);

        self.link.cs_assert();
        let result = (|| {
            let r1 = self.send_command(cmd::READ_SINGLE_BLOCK, arg)?;
            if r1 != 0 {
                return Err(Error::Command);
            }
            self.read_data_token(buf)
        })();
        self.link.cs_deassert();
        self.clock_trailer();
        self.inner.lock().state = State::Ready;

        match &result {
            Ok(()) => self.inner.lock().counters.reads += 1,
            Err(_) => self.bump_error(),
        }
        result
    }

    pub fn write_sector(&self, sector: u32, buf: &[u8; BLOCK_SIZE]) -> Result<(), Error> {
        self.require_ready()?;
        if self.link.write_protected() {
            return Err(Error::WriteProtect);
        }
        self.inner.lock().state = State::Writing;
        let arg = self.block_arg(sector);

        self.link.cs_assert();
        let result = (|| {
            let r1 = self.send_command(cmd::WRITE_BLOCK, arg)?;
            if r1 != 0 {
                return Err(Error::Command);
            }
            self.link.transfer(0xFF)?;
            self.link.transfer(TOKEN_SINGLE)?;
            self.link.transfer_bulk(Some(buf), None)?;
            self.link.transfer_bulk(Some(&[0xFF, 0xFF]), None)?;

            let resp = self.link.transfer(0xFF)? & 0x1F;
            match resp {
                0x05 => {}
                0x0B => return Err(Error::Crc),
                0x0D => return Err(Error::Write),
                _ => return Err(Error::Write),
            }
            self.wait_ready(Self::WRITE_TIMEOUT_MS)
        })();
        self.link.cs_deassert();
        self.clock_trailer();
        self.inner.lock().state = State::Ready;

        match &result {
            Ok(()) => self.inner.lock().counters.writes += 1,
            Err(_) => self.bump_error(),
        }
        result
    }

    pub fn read_sectors(&self, start: u32, bufs: &mut [[u8; BLOCK_SIZE]]) -> Result<(), Error> {
        self.require_ready()?;
        self.inner.lock().state = State::MultiReading;
        let arg = self.block_arg(start);

        self.link.cs_assert();
        let result = (|| {
            let r1 = self.send_command(cmd::READ_MULTIPLE_BLOCK, arg)?;
            if r1 != 0 {
                return Err(Error::Command);
            }
            for buf in bufs.iter_mut() {
                self.read_data_token(buf)?;
            }
            self.link.cs_deassert();
            self.clock_trailer();
            self.link.cs_assert();
            let _ = self.send_command(cmd::STOP_TRANSMISSION, 0)?;
            self.link.transfer(0xFF)?; // stop-transmission stuff byte
            self.wait_ready(Self::READ_TIMEOUT_MS)
        })();
        self.link.cs_deassert();
        self.clock_trailer();
        self.inner.lock().state = State::Ready;

        match &result {
            Ok(()) => self.inner.lock().counters.reads += bufs.len() as u64,
            Err(_) => self.bump_error(),
        }
        result
    }

    pub fn write_sectors(&self, start: u32, bufs: &[[u8; BLOCK_SIZE]]) -> Result<(), Error> {
        self.require_ready()?;
        if self.link.write_protected() {
            return Err(Error::WriteProtect);
        }
        self.inner.lock().state = State::MultiWriting;
        let arg = self.block_arg(start);

        self.link.cs_assert();
        let result = (|| {
            let _ = self.send_command(cmd::APP_CMD, 0)?;
            self.link.cs_deassert();
            self.clock_trailer();
            self.link.cs_assert();
            let _ = self.send_command(cmd::SET_WR_BLOCK_ERASE_COUNT, bufs.len() as u32)?;
            self.link.cs_deassert();
            self.clock_trailer();

            self.link.cs_assert();
            let r1 = self.send_command(cmd::WRITE_MULTIPLE_BLOCK, arg)?;
            if r1 != 0 {
                return Err(Error::Command);
            }
            for buf in bufs {
                self.link.transfer(0xFF)?;
                self.link.transfer(TOKEN_MULTI_WRITE)?;
                self.link.transfer_bulk(Some(buf), None)?;
                self.link.transfer_bulk(Some(&[0xFF, 0xFF]), None)?;
                let resp = self.link.transfer(0xFF)? & 0x1F;
                if resp != 0x05 {
                    return Err(Error::Write);
                }
                self.wait_ready(Self::WRITE_TIMEOUT_MS)?;
            }
            self.link.transfer(0xFF)?;
            self.link.transfer(TOKEN_STOP_WRITE)?;
            self.wait_ready(Self::WRITE_TIMEOUT_MS)
        })();
        self.link.cs_deassert();
        self.clock_trailer();
        self.inner.lock().state = State::Ready;

        match &result {
            Ok(()) => self.inner.lock().counters.writes += bufs.len() as u64,
            Err(_) => self.bump_error(),
        }
        result
    }

    pub fn erase(&self, start_sector: u32, end_sector: u32) -> Result<(), Error> {
        self.require_ready()?;
        if self.link.write_protected() {
            return Err(Error::WriteProtect);
        }
        self.inner.lock().state = State::Erasing;
        let start_arg = self.block_arg(start_sector);
        let end_arg = self.block_arg(end_sector);

        let result = (|| {
            self.link.cs_assert();
            let r1 = self.send_command(cmd::ERASE_WR_BLK_START, start_arg)?;
            self.link.cs_deassert();
            self.clock_trailer();
            if r1 != 0 {
                return Err(Error::Command);
            }

            self.link.cs_assert();
            let r1 = self.send_command(cmd::ERASE_WR_BLK_END, end_arg)?;
            self.link.cs_deassert();
            self.clock_trailer();
            if r1 != 0 {
                return Err(Error::Command);
            }

            self.link.cs_assert();
            let r1 = self.send_command(cmd::ERASE, 0)?;
            if r1 != 0 {
                return Err(Error::Command);
            }
            self.wait_ready(Self::ERASE_TIMEOUT_MS)
        })();
        self.link.cs_deassert();
        self.clock_trailer();
        self.inner.lock().state = State::Ready;

        if result.is_err() {
            self.bump_error();
        }
        result
    }

    fn bump_error(&self) {
        self.inner.lock().counters.errors += 1;
    }

    /// Send a 6-byte command frame and collect the R1 byte.
    fn send_command(&self, command: u8, arg: u32) -> Result<u8, Error> {
        let mut frame = [0u8; 6];
        frame[0] = 0x40 | command;
        frame[1..5].copy_from_slice(&arg.to_be_bytes());
        let trailer = (crc7(&frame[0..5]) << 1) | 1;
        frame[5] = trailer;
        trace!("card: -> CMD{} arg={:#010x}", command, arg);

        self.link.transfer_bulk(Some(&frame), None)?;

        for _ in 0..8 {
            let byte = self.link.transfer(0xFF)?;
            if byte & 0x80 == 0 {
                trace!("card: <- R1={:#04x}", byte);
                return Ok(byte);
            }
        }
        Err(Error::Timeout)
    }

    /// One trailing 0xFF clocked after CS deassertion, per §5's
    /// shared-resource discipline for the chip-select line.
    fn clock_trailer(&self) {
        let _ = self.link.transfer(0xFF);
    }

    fn wait_ready(&self, timeout_ms: u32) -> Result<(), Error> {
        let start = self.link.millis();
        loop {
            if self.link.transfer(0xFF)? != 0x00 {
                return Ok(());
            }
            if self.link.millis().wrapping_sub(start) > timeout_ms {
                return Err(Error::Busy);
            }
        }
    }

    fn read_data_token(&self, buf: &mut [u8; BLOCK_SIZE]) -> Result<(), Error> {
        let start = self.link.millis();
        let token = loop {
            let byte = self.link.transfer(0xFF)?;
            if byte != 0xFF {
                break byte;
            }
            if self.link.millis().wrapping_sub(start) > Self::READ_TIMEOUT_MS {
                return Err(Error::Timeout);
            }
        };

        if token != TOKEN_SINGLE {
            return Err(match classify_data_error(token) {
                DataError::Crc => Error::Crc,
                DataError::Ecc | DataError::OutOfRange | DataError::Generic => Error::Read,
            });
        }

        self.link.transfer_bulk(None, Some(buf))?;
        self.link.transfer_bulk(Some(&[0xFF, 0xFF]), None)?; // discard CRC
        Ok(())
    }

    /// Read a 16-byte register (CSD or CID) via the single-block data
    /// protocol with CMD9/CMD10.
    fn read_register(&self, command: u8) -> Result<[u8; 16], Error> {
        self.link.cs_assert();
        let result = (|| {
            let r1 = self.send_command(command, 0)?;
            if r1 != 0 {
                return Err(Error::Command);
            }
            let start = self.link.millis();
            let token = loop {
                let byte = self.link.transfer(0xFF)?;
                if byte != 0xFF {
                    break byte;
                }
                if self.link.millis().wrapping_sub(start) > Self::READ_TIMEOUT_MS {
                    return Err(Error::Timeout);
                }
            };
            if token != TOKEN_SINGLE {
                return Err(Error::Read);
            }
            let mut reg = [0u8; 16];
            self.link.transfer_bulk(None, Some(&mut reg))?;
            self.link.transfer_bulk(Some(&[0xFF, 0xFF]), None)?;
            Ok(reg)
        })();
        self.link.cs_deassert();
        self.clock_trailer();
        result
    }
}

/// CSD v1 uses `C_SIZE`/`C_SIZE_MULT`/`READ_BL_LEN`; CSD v2 uses a 22-bit
/// `C_SIZE` giving capacity directly in 512 KiB units.
fn decode_csd_capacity(csd: &[u8; 16]) -> (u32, u64) {
    let version = csd[0] >> 6;
    if version == 0 {
        let read_bl_len = csd[5] & 0x0F;
        let c_size = (((csd[6] & 0x03) as u32) << 10) | ((csd[7] as u32) << 2) | ((csd[8] as u32) >> 6);
        let c_size_mult = (((csd[9] & 0x03) as u32) << 1) | ((csd[10] as u32) >> 7);
        let block_len = 1u64 << read_bl_len;
        let mult = 1u64 << (c_size_mult + 2);
        let block_count = (c_size as u64 + 1) * mult;
        let capacity = block_count * block_len;
        ((capacity / BLOCK_SIZE as u64) as u32, capacity)
    } else {
        let c_size = (((csd[7] & 0x3F) as u32) << 16) | ((csd[8] as u32) << 8) | (csd[9] as u32);
        let capacity = (c_size as u64 + 1) * 512 * 1024;
        ((capacity / BLOCK_SIZE as u64) as u32, capacity)
    }
}
