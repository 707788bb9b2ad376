//! FAT12/16/32 entry table: packing, cluster-chain allocation and free.
//!
//! Grounded on the teacher's `fat.rs`: the allocate-scan-recycle shape of
//! `FatManager`/`ClusterChain`, the single-buffer load-before-read pattern,
//! and the FAT offset arithmetic from its own doc comments
//! (`FATOffset = N * 4; ThisFATSecNum = ...`). This module generalizes
//! that FAT32-only arithmetic to all three widths (including FAT12's
//! straddling nibble packing, which the teacher's FAT32-only code never
//! had to deal with), replaces the teacher's `recycled_cluster: Vec<u32>`
//! free list with the spec's hint-and-wrap allocation scan, and adds FAT
//! mirroring across `num_fats` copies and a free-cluster-count cache.

use alloc::sync::Arc;

use log::{debug, warn};

use crate::bpb::FatType;
use crate::card::{Card, BLOCK_SIZE};
use crate::endian::{u16_le, u32_le, put_u16_le, put_u32_le};
use crate::error::Error;

pub const FREE_UNKNOWN: u32 = u32::MAX;

pub struct FatTable {
    card: Arc<Card>,
    fat_type: FatType,
    fat_start_sector: u32,
    sectors_per_fat: u32,
    num_fats: u8,
    cluster_count: u32,
    buffer: [u8; BLOCK_SIZE],
    buffer_sector: Option<u32>,
    dirty: bool,
    free_clusters: u32,
    last_alloc_cluster: u32,
}

impl FatTable {
    pub fn new(
        card: Arc<Card>,
        fat_type: FatType,
        fat_start_sector: u32,
        sectors_per_fat: u32,
        num_fats: u8,
        cluster_count: u32,
    ) -> FatTable {
        FatTable {
            card,
            fat_type,
            fat_start_sector,
            sectors_per_fat,
            num_fats,
            cluster_count,
            buffer: [0; BLOCK_SIZE],
            buffer_sector: None,
            dirty: false,
            free_clusters: FREE_UNKNOWN,
            last_alloc_cluster: 1,
        }
    }

    pub fn set_free_hint(&mut self, free_clusters: Option<u32>, next_free: Option<u32>) {
        if let Some(f) = free_clusters {
            self.free_clusters = f;
        }
        if let Some(n) = next_free {
            if n >= 2 {
                self.last_alloc_cluster = n - 1;
            }
        }
    }

    pub fn free_clusters_raw(&self) -> u32 {
        self.free_clusters
    }

    pub fn next_free_hint(&self) -> u32 {
        self.last_alloc_cluster + 1
    }

    fn ensure_loaded(&mut self, sector: u32) -> Result<(), Error> {
        if self.buffer_sector == Some(sector) {
            return Ok(());
        }
        self.flush()?;
        self.card.read_sector(sector, &mut self.buffer)?;
        self.buffer_sector = Some(sector);
        Ok(())
    }

    fn read_byte(&mut self, byte_off: usize) -> Result<u8, Error> {
        let sector = self.fat_start_sector + (byte_off / BLOCK_SIZE) as u32;
        self.ensure_loaded(sector)?;
        Ok(self.buffer[byte_off % BLOCK_SIZE])
    }

    fn write_byte(&mut self, byte_off: usize, val: u8) -> Result<(), Error> {
        let sector = self.fat_start_sector + (byte_off / BLOCK_SIZE) as u32;
        self.ensure_loaded(sector)?;
        self.buffer[byte_off % BLOCK_SIZE] = val;
        self.dirty = true;
        Ok(())
    }

    /// Read a little-endian `u16` at `byte_off` into the FAT. FAT12's
    /// 1.5-byte entries mean `byte_off` is not always even, so the two
    /// bytes can straddle a sector boundary (this only ever happens when
    /// `byte_off % BLOCK_SIZE == BLOCK_SIZE - 1`): load the low byte from
    /// the current sector and the high byte from the next one.
    fn read_u16(&mut self, byte_off: usize) -> Result<u16, Error> {
        let sector = self.fat_start_sector + (byte_off / BLOCK_SIZE) as u32;
        let off_in_sector = byte_off % BLOCK_SIZE;
        if off_in_sector == BLOCK_SIZE - 1 {
            self.ensure_loaded(sector)?;
            let low = self.buffer[off_in_sector];
            self.ensure_loaded(sector + 1)?;
            let high = self.buffer[0];
            return Ok(u16::from_le_bytes([low, high]));
        }
        self.ensure_loaded(sector)?;
        Ok(u16_le(&self.buffer, off_in_sector))
    }

    /// Write a little-endian `u16` at `byte_off`, splitting across the
    /// sector boundary the same way [`Self::read_u16`] does.
    fn write_u16(&mut self, byte_off: usize, val: u16) -> Result<(), Error> {
        let sector = self.fat_start_sector + (byte_off / BLOCK_SIZE) as u32;
        let off_in_sector = byte_off % BLOCK_SIZE;
        if off_in_sector == BLOCK_SIZE - 1 {
            let [low, high] = val.to_le_bytes();
            self.ensure_loaded(sector)?;
            self.buffer[off_in_sector] = low;
            self.dirty = true;
            self.ensure_loaded(sector + 1)?;
            self.buffer[0] = high;
            self.dirty = true;
            return Ok(());
        }
        self.ensure_loaded(sector)?;
        put_u16_le(&mut self.buffer, off_in_sector, val);
        self.dirty = true;
        Ok(())
    }

    fn read_u32(&mut self, byte_off: usize) -> Result<u32, Error> {
        let sector = self.fat_start_sector + (byte_off / BLOCK_SIZE) as u32;
        self.ensure_loaded(sector)?;
        Ok(u32_le(&self.buffer, byte_off % BLOCK_SIZE))
    }

    fn write_u32(&mut self, byte_off: usize, val: u32) -> Result<(), Error> {
        let sector = self.fat_start_sector + (byte_off / BLOCK_SIZE) as u32;
        self.ensure_loaded(sector)?;
        put_u32_le(&mut self.buffer, byte_off % BLOCK_SIZE, val);
        self.dirty = true;
        Ok(())
    }

    pub fn read_entry(&mut self, cluster: u32) -> Result<u32, Error> {
        match self.fat_type {
            FatType::Fat12 => {
                let off = (cluster as usize * 3) / 2;
                let word = self.read_u16(off)?;
                Ok(if cluster & 1 == 0 {
                    (word & 0x0FFF) as u32
                } else {
                    (word >> 4) as u32
                })
            }
            FatType::Fat16 => Ok(self.read_u16(cluster as usize * 2)? as u32),
            FatType::Fat32 => Ok(self.read_u32(cluster as usize * 4)? & 0x0FFF_FFFF),
        }
    }

    /// `value` is the logical entry value (end-of-chain marker, next
    /// cluster, or 0). For FAT32, the stored high 4 bits are preserved.
    pub fn write_entry(&mut self, cluster: u32, value: u32) -> Result<(), Error> {
        match self.fat_type {
            FatType::Fat12 => {
                let off = (cluster as usize * 3) / 2;
                let word = self.read_u16(off)?;
                let new_word = if cluster & 1 == 0 {
                    (word & 0xF000) | (value as u16 & 0x0FFF)
                } else {
                    (word & 0x000F) | ((value as u16 & 0x0FFF) << 4)
                };
                self.write_u16(off, new_word)
            }
            FatType::Fat16 => self.write_u16(cluster as usize * 2, value as u16),
            FatType::Fat32 => {
                let off = cluster as usize * 4;
                let old = self.read_u32(off)?;
                let new_val = (old & 0xF000_0000) | (value & 0x0FFF_FFFF);
                self.write_u32(off, new_val)
            }
        }
    }

    fn eoc_value(&self) -> u32 {
        match self.fat_type {
            FatType::Fat12 => 0x0FFF,
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFF_FFFF,
        }
    }

    pub fn is_eoc(&self, value: u32) -> bool {
        match self.fat_type {
            FatType::Fat12 => value >= 0x0FF8,
            FatType::Fat16 => value >= 0xFFF8,
            FatType::Fat32 => (value & 0x0FFF_FFFF) >= 0x0FFF_FFF8,
        }
    }

    /// Allocate a free cluster, scanning from just past the last
    /// allocation and wrapping at `cluster_count + 2` back to 2. Links
    /// `prev`'s entry to the new cluster when supplied.
    pub fn allocate(&mut self, prev: Option<u32>) -> Result<u32, Error> {
        let total = self.cluster_count;
        let mut cluster = if self.last_alloc_cluster + 1 >= 2 + total {
            2
        } else {
            self.last_alloc_cluster + 1
        };
        if cluster < 2 {
            cluster = 2;
        }

        let mut found = None;
        for _ in 0..total {
            if self.read_entry(cluster)? == 0 {
                found = Some(cluster);
                break;
            }
            cluster += 1;
            if cluster >= 2 + total {
                cluster = 2;
            }
        }

        let cluster = match found {
            Some(c) => c,
            None => {
                warn!("fat: allocate failed, volume full");
                return Err(Error::Full);
            }
        };

        self.write_entry(cluster, self.eoc_value())?;
        if let Some(p) = prev {
            self.write_entry(p, cluster)?;
        }
        self.last_alloc_cluster = cluster;
        if self.free_clusters != FREE_UNKNOWN {
            self.free_clusters = self.free_clusters.saturating_sub(1);
        }
        debug!("fat: allocated cluster {}", cluster);
        Ok(cluster)
    }

    /// Free every cluster in the chain starting at `head`, bounded by
    /// `cluster_count` steps.
    pub fn free_chain(&mut self, head: u32) -> Result<(), Error> {
        if head < 2 {
            return Ok(());
        }
        let mut cur = head;
        let mut steps = 0u32;
        loop {
            if steps > self.cluster_count {
                return Err(Error::FatCorrupt);
            }
            let next = self.read_entry(cur)?;
            self.write_entry(cur, 0)?;
            if self.free_clusters != FREE_UNKNOWN {
                self.free_clusters += 1;
            }
            if self.is_eoc(next) || next < 2 {
                break;
            }
            cur = next;
            steps += 1;
        }
        debug!("fat: freed chain starting at {}", head);
        Ok(())
    }

    /// Step `count` clusters forward in a chain from `start`, bounded by
    /// `cluster_count` steps. Returns `Filesystem::FatCorrupt` if the
    /// chain ends early or cycles.
    pub fn walk(&mut self, start: u32, count: u32) -> Result<u32, Error> {
        let mut cur = start;
        for _ in 0..count {
            let next = self.read_entry(cur)?;
            if self.is_eoc(next) || next < 2 {
                return Err(Error::FatCorrupt);
            }
            cur = next;
        }
        Ok(cur)
    }

    pub fn get_free_count(&mut self) -> Result<u32, Error> {
        if self.free_clusters == FREE_UNKNOWN {
            let mut count = 0u32;
            for c in 2..self.cluster_count + 2 {
                if self.read_entry(c)? == 0 {
                    count += 1;
                }
            }
            self.free_clusters = count;
        }
        Ok(self.free_clusters)
    }

    /// Flush the shared FAT buffer to disk and mirror it into every
    /// additional FAT copy.
    pub fn flush(&mut self) -> Result<(), Error> {
        if !self.dirty {
            return Ok(());
        }
        let sector = self.buffer_sector.expect("dirty buffer always has a sector");
        self.card.write_sector(sector, &self.buffer)?;
        let offset_in_fat = sector - self.fat_start_sector;
        for i in 1..self.num_fats as u32 {
            let mirror = self.fat_start_sector + i * self.sectors_per_fat + offset_in_fat;
            self.card.write_sector(mirror, &self.buffer)?;
        }
        self.dirty = false;
        Ok(())
    }
}
