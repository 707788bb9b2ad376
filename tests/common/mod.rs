//! A RAM-backed virtual SD card, standing in for real hardware in the
//! integration tests. It implements [`sdfat_rs::Link`] by running the
//! same CMD0/8/55/41/58/9/10/17/24 sequence `Card::init` and
//! `read_sector`/`write_sector` actually drive, so these tests exercise
//! the genuine SPI framing rather than a shortcut mock.

pub mod disk;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use sdfat_rs::error::Error;
use sdfat_rs::link::Link;

const BLOCK_SIZE: usize = 512;

const TOKEN_SINGLE: u8 = 0xFE;

#[derive(Clone, Copy, PartialEq, Eq)]
enum WritePhase {
    ExpectDummy,
    ExpectToken,
    ReceivingData,
    ExpectCrc(u8),
}

struct WriteState {
    sector: u32,
    phase: WritePhase,
    buf: Vec<u8>,
}

struct RamState {
    disk: Vec<u8>,
    resp: VecDeque<u8>,
    cmd_buf: Vec<u8>,
    write: Option<WriteState>,
    millis: u32,
}

/// A virtual SD card with `sector_count` 512-byte sectors, all zeroed
/// until the test fills in a disk image.
pub struct RamLink {
    state: Mutex<RamState>,
}

impl RamLink {
    pub fn new(sector_count: u32) -> Arc<RamLink> {
        Arc::new(RamLink {
            state: Mutex::new(RamState {
                disk: vec![0u8; sector_count as usize * BLOCK_SIZE],
                resp: VecDeque::new(),
                cmd_buf: Vec::new(),
                write: None,
                millis: 0,
            }),
        })
    }

    /// Install a prebuilt disk image (a full set of sectors), as tests
    /// do to seed a boot sector / FAT / root directory / data region
    /// before mounting.
    pub fn install_image(&self, image: &[u8]) {
        let mut st = self.state.lock().unwrap();
        let len = image.len().min(st.disk.len());
        st.disk[..len].copy_from_slice(&image[..len]);
    }

    /// Snapshot the whole virtual disk, for asserting on written bytes
    /// directly rather than only through the crate's own read path.
    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().unwrap().disk.clone()
    }

    fn handle_command(st: &mut RamState, frame: &[u8]) {
        let command = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);

        match command {
            0 => st.resp.push_back(0x01), // GO_IDLE_STATE
            55 => st.resp.push_back(0x01), // APP_CMD
            41 => st.resp.push_back(0x00), // APP_SEND_OP_COND: ready on first poll
            8 => {
                // SEND_IF_COND: R1 ok, echo the argument back
                st.resp.push_back(0x00);
                st.resp.push_back(frame[1]);
                st.resp.push_back(frame[2]);
                st.resp.push_back(frame[3]);
                st.resp.push_back(frame[4]);
            }
            58 => {
                // READ_OCR: R1 ok, OCR with CCS set so init skips SET_BLOCKLEN
                st.resp.push_back(0x00);
                st.resp.push_back(0xC0);
                st.resp.push_back(0xFF);
                st.resp.push_back(0x80);
                st.resp.push_back(0x00);
            }
            9 | 10 => {
                // SEND_CSD / SEND_CID: R1 ok, single-block token, a
                // register that decodes as a small CSD v2 capacity.
                st.resp.push_back(0x00);
                st.resp.push_back(TOKEN_SINGLE);
                let total_sectors = (st.disk.len() / BLOCK_SIZE) as u64;
                let capacity = total_sectors * BLOCK_SIZE as u64;
                let c_size = (capacity / (512 * 1024)).saturating_sub(1) as u32;
                let mut reg = [0u8; 16];
                reg[0] = 0x40; // CSD version 2
                reg[7] = ((c_size >> 16) & 0x3F) as u8;
                reg[8] = ((c_size >> 8) & 0xFF) as u8;
                reg[9] = (c_size & 0xFF) as u8;
                for b in reg {
                    st.resp.push_back(b);
                }
                st.resp.push_back(0xFF);
                st.resp.push_back(0xFF);
            }
            16 => st.resp.push_back(0x00), // SET_BLOCKLEN, unused once CCS is set
            17 => {
                // READ_SINGLE_BLOCK: block-addressed, so arg is the sector index
                st.resp.push_back(0x00);
                st.resp.push_back(TOKEN_SINGLE);
                let off = arg as usize * BLOCK_SIZE;
                st.resp.extend_from_slice(&st.disk[off..off + BLOCK_SIZE]);
                st.resp.push_back(0xFF);
                st.resp.push_back(0xFF);
            }
            24 => {
                // WRITE_BLOCK: R1 ok now, the rest streams in over
                // subsequent bytes and is captured by the write state
                // machine below.
                st.resp.push_back(0x00);
                st.write = Some(WriteState {
                    sector: arg,
                    phase: WritePhase::ExpectDummy,
                    buf: Vec::with_capacity(BLOCK_SIZE),
                });
            }
            _ => st.resp.push_back(0x04), // R1_ILLEGAL_COMMAND
        }
    }

    fn byte(&self, tx: u8) -> Result<u8, Error> {
        let mut st = self.state.lock().unwrap();
        st.millis += 1;

        if let Some(b) = st.resp.pop_front() {
            return Ok(b);
        }

        if let Some(write) = st.write.as_mut() {
            match write.phase {
                WritePhase::ExpectDummy => {
                    write.phase = WritePhase::ExpectToken;
                    return Ok(0xFF);
                }
                WritePhase::ExpectToken => {
                    write.phase = WritePhase::ReceivingData;
                    return Ok(0xFF);
                }
                WritePhase::ReceivingData => {
                    write.buf.push(tx);
                    if write.buf.len() == BLOCK_SIZE {
                        write.phase = WritePhase::ExpectCrc(2);
                    }
                    return Ok(0xFF);
                }
                WritePhase::ExpectCrc(remaining) => {
                    if remaining > 1 {
                        write.phase = WritePhase::ExpectCrc(remaining - 1);
                        return Ok(0xFF);
                    }
                    let finished = st.write.take().unwrap();
                    let off = finished.sector as usize * BLOCK_SIZE;
                    st.disk[off..off + BLOCK_SIZE].copy_from_slice(&finished.buf);
                    st.resp.push_back(0x05); // data accepted
                    st.resp.push_back(0xFF); // card ready
                    return Ok(0xFF);
                }
            }
        }

        st.cmd_buf.push(tx);
        if st.cmd_buf.len() == 6 {
            let frame = st.cmd_buf.clone();
            st.cmd_buf.clear();
            RamLink::handle_command(&mut st, &frame);
        }
        Ok(0xFF)
    }
}

impl Link for RamLink {
    fn init(&self, hz: u32) -> Result<u32, Error> {
        Ok(hz)
    }

    fn transfer(&self, tx: u8) -> Result<u8, Error> {
        self.byte(tx)
    }

    fn transfer_bulk(&self, tx: Option<&[u8]>, rx: Option<&mut [u8]>) -> Result<(), Error> {
        match (tx, rx) {
            (Some(t), Some(r)) => {
                for i in 0..t.len() {
                    r[i] = self.byte(t[i])?;
                }
            }
            (Some(t), None) => {
                for &b in t {
                    self.byte(b)?;
                }
            }
            (None, Some(r)) => {
                for slot in r.iter_mut() {
                    *slot = self.byte(0xFF)?;
                }
            }
            (None, None) => {}
        }
        Ok(())
    }

    fn cs_assert(&self) {}

    fn cs_deassert(&self) {
        self.state.lock().unwrap().cmd_buf.clear();
    }

    fn delay_ms(&self, _ms: u32) {}

    fn millis(&self) -> u32 {
        self.state.lock().unwrap().millis
    }
}
