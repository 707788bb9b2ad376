//! Directory entry iteration, across a fixed root run or a cluster chain,
//! with Long File Name assembly.
//!
//! Grounded on the teacher's `dir.rs` — specifically `ls_with_attr`'s
//! walk-and-accumulate loop ("if long, fold `order` fragments into one
//! name before emitting the short entry's record") and `find_by_lfn`'s
//! last-fragment-first/checksum-gated matching — but restructured from a
//! byte-offset-into-one-file model (`self.read_at(offset, ..)` against a
//! `VirtFile`) into a true forward iterator over raw sectors, since this
//! crate has no `VirtFile`-style byte-addressable read underneath
//! directories; `DirIter` talks to [`Card`]/[`FatTable`] sector-at-a-time
//! directly. Writes (`create`'s LFN-fragment emission) are dropped: per
//! scope, this crate creates 8.3 entries only.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use alloc::sync::Arc;

use crate::bpb::Bpb;
use crate::card::{Card, BLOCK_SIZE};
use crate::entry::{LongDirEntry, ShortDirEntry, ENTRY_SIZE};
use crate::error::Error;
use crate::fat::FatTable;

#[derive(Debug, Clone)]
pub struct DirInfo {
    pub name: String,
    pub attr: u8,
    pub size: u32,
    pub first_cluster: u32,
    pub is_dir: bool,
    pub entry_sector: u32,
    pub entry_offset: usize,
}

pub enum DirEvent {
    Entry(DirInfo),
    Eof,
}

enum Root {
    Fixed { first_sector: u32, sector_count: u32 },
    Chain { first_cluster: u32 },
}

struct LfnState {
    expected_next: u8,
    checksum: u8,
    units: Vec<u16>,
    total: u8,
}

/// Forward-only iterator over one directory's 32-byte entry slots.
pub struct DirIter {
    card: Arc<Card>,
    root: Root,
    sectors_per_cluster: u32,
    cluster: u32,
    sector_in_cluster: u32,
    sector_idx: u32,
    byte_offset: usize,
    buf: [u8; BLOCK_SIZE],
    buf_sector: Option<u32>,
    exhausted: bool,
    lfn: Option<LfnState>,
}

impl DirIter {
    /// Directory rooted at the FAT12/16 fixed root run.
    pub fn fixed_root(card: Arc<Card>, first_sector: u32, sector_count: u32) -> DirIter {
        DirIter {
            card,
            root: Root::Fixed {
                first_sector,
                sector_count,
            },
            sectors_per_cluster: 0,
            cluster: 0,
            sector_in_cluster: 0,
            sector_idx: 0,
            byte_offset: 0,
            buf: [0; BLOCK_SIZE],
            buf_sector: None,
            exhausted: sector_count == 0,
            lfn: None,
        }
    }

    /// Directory backed by an ordinary cluster chain (FAT32 root, or any
    /// subdirectory on any FAT type).
    pub fn chain(card: Arc<Card>, first_cluster: u32, sectors_per_cluster: u32) -> DirIter {
        let exhausted = first_cluster < 2;
        DirIter {
            card,
            root: Root::Chain { first_cluster },
            sectors_per_cluster,
            cluster: first_cluster,
            sector_in_cluster: 0,
            sector_idx: 0,
            byte_offset: 0,
            buf: [0; BLOCK_SIZE],
            buf_sector: None,
            exhausted,
            lfn: None,
        }
    }

    fn current_abs_sector(&self, bpb: &Bpb) -> u32 {
        match self.root {
            Root::Fixed { first_sector, .. } => first_sector + self.sector_idx,
            Root::Chain { .. } => bpb.first_sector_of_cluster(self.cluster) + self.sector_in_cluster,
        }
    }

    fn ensure_loaded(&mut self, bpb: &Bpb) -> Result<(), Error> {
        let sector = self.current_abs_sector(bpb);
        if self.buf_sector != Some(sector) {
            self.card.read_sector(sector, &mut self.buf)?;
            self.buf_sector = Some(sector);
        }
        Ok(())
    }

    fn advance_sector(&mut self, fat: &mut FatTable) -> Result<(), Error> {
        match self.root {
            Root::Fixed { sector_count, .. } => {
                self.sector_idx += 1;
                if self.sector_idx >= sector_count {
                    self.exhausted = true;
                }
            }
            Root::Chain { .. } => {
                self.sector_in_cluster += 1;
                if self.sector_in_cluster >= self.sectors_per_cluster {
                    let next = fat.read_entry(self.cluster)?;
                    if fat.is_eoc(next) || next < 2 {
                        self.exhausted = true;
                    } else {
                        self.cluster = next;
                        self.sector_in_cluster = 0;
                    }
                }
            }
        }
        Ok(())
    }

    fn advance_entry(&mut self, fat: &mut FatTable) -> Result<(), Error> {
        self.byte_offset += ENTRY_SIZE;
        if self.byte_offset >= BLOCK_SIZE {
            self.byte_offset = 0;
            self.advance_sector(fat)?;
        }
        Ok(())
    }

    /// Advance to the next non-skipped entry, assembling any LFN run
    /// that precedes it.
    pub fn next_entry(&mut self, bpb: &Bpb, fat: &mut FatTable) -> Result<DirEvent, Error> {
        loop {
            if self.exhausted {
                return Ok(DirEvent::Eof);
            }
            self.ensure_loaded(bpb)?;
            let raw = &self.buf[self.byte_offset..self.byte_offset + ENTRY_SIZE];

            if raw[0] == crate::entry::NAME_END {
                self.exhausted = true;
                return Ok(DirEvent::Eof);
            }
            if raw[0] == crate::entry::NAME_FREE {
                self.lfn = None;
                let sector = self.current_abs_sector(bpb);
                self.advance_entry(fat)?;
                let _ = sector;
                continue;
            }

            let short = ShortDirEntry::decode(raw);
            if short.is_long_name_fragment() {
                let lde = LongDirEntry::decode(raw);
                self.fold_lfn_fragment(&lde);
                self.advance_entry(fat)?;
                continue;
            }
            if short.is_volume_id() {
                self.lfn = None;
                self.advance_entry(fat)?;
                continue;
            }

            let entry_sector = self.current_abs_sector(bpb);
            let entry_offset = self.byte_offset;
            let name = self.take_name(&short);
            let info = DirInfo {
                name,
                attr: short.attr,
                size: short.file_size,
                first_cluster: short.first_cluster(),
                is_dir: short.is_dir(),
                entry_sector,
                entry_offset,
            };
            self.advance_entry(fat)?;
            return Ok(DirEvent::Entry(info));
        }
    }

    fn fold_lfn_fragment(&mut self, lde: &LongDirEntry) {
        if lde.is_free() {
            self.lfn = None;
            return;
        }
        if lde.is_last_fragment() {
            let total = lde.ordinal();
            let mut units = vec![0xFFFFu16; total as usize * 13];
            let slot = (total as usize - 1) * 13;
            units[slot..slot + 13].copy_from_slice(&lde.name_units());
            self.lfn = Some(LfnState {
                expected_next: total.saturating_sub(1),
                checksum: lde.chk_sum,
                units,
                total,
            });
            return;
        }

        let ordinal = lde.ordinal();
        let broken = match &self.lfn {
            Some(state) => ordinal != state.expected_next || lde.chk_sum != state.checksum,
            None => true,
        };
        if broken {
            self.lfn = None;
            return;
        }
        if let Some(state) = self.lfn.as_mut() {
            let slot = (ordinal as usize - 1) * 13;
            state.units[slot..slot + 13].copy_from_slice(&lde.name_units());
            state.expected_next = ordinal.saturating_sub(1);
        }
    }

    /// Consume any pending LFN state against `short`'s checksum, falling
    /// back to the 8.3 name on mismatch or an incomplete run.
    fn take_name(&mut self, short: &ShortDirEntry) -> String {
        let lfn = self.lfn.take();
        if let Some(state) = lfn {
            if state.expected_next == 0 && state.checksum == short.checksum() {
                let end = state
                    .units
                    .iter()
                    .position(|&u| u == 0)
                    .unwrap_or(state.total as usize * 13);
                return decode_utf16_lossy(&state.units[..end]);
            }
        }
        short.short_name_string()
    }
}

fn decode_utf16_lossy(units: &[u16]) -> String {
    char::decode_utf16(units.iter().copied())
        .map(|r| r.unwrap_or('\u{FFFD}'))
        .collect()
}
