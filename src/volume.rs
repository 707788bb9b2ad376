//! Volume mount/unmount and top-level filesystem metadata.
//!
//! Grounded on the teacher's `fs.rs` `FileSystem::open` — read the boot
//! sector through the cache, read FSInfo, build the FAT manager — but
//! generalized from "assume a bare FAT32 card at sector 0" to: detect an
//! MBR partition table first, fall back to a superfloppy layout (no MBR,
//! boot sector at sector 0) when none is found, support FAT12/16/32
//! (the teacher only ever mounted FAT32), and turn the teacher's
//! `assert!`/`.unwrap()` mount-time checks into `Result` so a missing or
//! corrupt filesystem is a reported `Error`, not a panic.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, warn};
use spin::Mutex;

use crate::bpb::{Bpb, FatType, FsInfo};
use crate::card::Card;
use crate::dir::DirInfo;
use crate::error::Error;
use crate::fat::FatTable;
use crate::path;

const MBR_PARTITION_TABLE_OFFSET: usize = 446;
const MBR_BOOT_SIG_OFFSET: usize = 510;
const MBR_BOOT_SIG: u16 = 0xAA55;

const RECOGNIZED_PARTITION_TYPES: &[u8] = &[0x01, 0x04, 0x06, 0x0B, 0x0C, 0x0E];

/// Look for a recognized primary partition in a freshly read sector 0.
/// Returns the partition's starting LBA, or `None` if this card has no
/// MBR (i.e. the boot sector itself lives at sector 0).
fn detect_partition_start(mbr: &[u8]) -> Option<u32> {
    if crate::endian::u16_le(mbr, MBR_BOOT_SIG_OFFSET) != MBR_BOOT_SIG {
        return None;
    }
    for i in 0..4 {
        let entry = MBR_PARTITION_TABLE_OFFSET + i * 16;
        let part_type = mbr[entry + 4];
        if RECOGNIZED_PARTITION_TYPES.contains(&part_type) {
            let lba = crate::endian::u32_le(mbr, entry + 8);
            if lba != 0 {
                return Some(lba);
            }
        }
    }
    None
}

pub struct VolumeInfo {
    pub fat_type: FatType,
    pub total_sectors: u32,
    pub bytes_per_cluster: u32,
    pub free_clusters: u32,
    pub volume_label: String,
}

/// Current-working-directory state: the first cluster `chdir`/relative
/// lookups resolve against (`0` meaning the FAT12/16 fixed root) and the
/// printable path `getcwd` reports for it.
struct Cwd {
    cluster: u32,
    path: String,
}

pub struct Volume {
    card: Arc<Card>,
    bpb: Bpb,
    fat: Arc<Mutex<FatTable>>,
    cwd: Mutex<Cwd>,
}

impl Volume {
    /// Mount the filesystem on an already-initialized card. Fails with
    /// `Error::AlreadyMounted` if another `Volume` already has this card
    /// mounted.
    pub fn mount(card: Arc<Card>) -> Result<Volume, Error> {
        card.mark_mounted()?;
        match Self::mount_locked(Arc::clone(&card)) {
            Ok(volume) => Ok(volume),
            Err(e) => {
                card.mark_unmounted();
                Err(e)
            }
        }
    }

    /// The actual mount sequence, run only once [`Card::mark_mounted`]
    /// has claimed the card.
    fn mount_locked(card: Arc<Card>) -> Result<Volume, Error> {
        card.require_ready()?;

        let mut sector0 = [0u8; crate::card::BLOCK_SIZE];
        card.read_sector(0, &mut sector0)?;

        let partition_start = detect_partition_start(&sector0);

        let mut bpb_sector = sector0;
        if let Some(start) = partition_start {
            card.read_sector(start, &mut bpb_sector)?;
        }

        let mut bpb = Bpb::parse(&bpb_sector)?;
        bpb.partition_start_sector = partition_start.unwrap_or(0);

        let fat_type = bpb.fat_type();
        debug!("volume: mounted {:?}, {} total sectors", fat_type, bpb.total_sectors);

        let mut fat = FatTable::new(
            Arc::clone(&card),
            fat_type,
            bpb.fat_start_sector(0),
            bpb.sectors_per_fat,
            bpb.num_fats,
            bpb.data_cluster_count(),
        );

        if fat_type == FatType::Fat32 {
            if let Some(fsinfo_sector) = bpb.fs_info_sector() {
                let mut buf = [0u8; crate::card::BLOCK_SIZE];
                card.read_sector(fsinfo_sector, &mut buf)?;
                match FsInfo::parse(&buf) {
                    Ok(info) => {
                        let free = if info.free_count == 0xFFFF_FFFF {
                            None
                        } else {
                            Some(info.free_count)
                        };
                        let next = if info.next_free == 0xFFFF_FFFF {
                            None
                        } else {
                            Some(info.next_free)
                        };
                        fat.set_free_hint(free, next);
                    }
                    Err(_) => warn!("volume: FSInfo signature mismatch, ignoring hint"),
                }
            }
        }

        let root_cluster = bpb.root_cluster();
        Ok(Volume {
            card,
            bpb,
            fat: Arc::new(Mutex::new(fat)),
            cwd: Mutex::new(Cwd {
                cluster: root_cluster,
                path: String::from("/"),
            }),
        })
    }

    /// Error if no `Volume` has claimed this card via [`Volume::mount`].
    fn require_mounted(&self) -> Result<(), Error> {
        if self.card.is_mounted() {
            Ok(())
        } else {
            Err(Error::NotMounted)
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.card.is_mounted()
    }

    /// Flush the FAT and write the FSInfo hint cache back, then drop
    /// the sector cache belonging to this card.
    pub fn unmount(&self) -> Result<(), Error> {
        self.require_mounted()?;
        self.fat.lock().flush()?;
        if self.bpb.fat32.is_some() {
            if let Some(fsinfo_sector) = self.bpb.fs_info_sector() {
                let mut buf = [0u8; crate::card::BLOCK_SIZE];
                self.card.read_sector(fsinfo_sector, &mut buf)?;
                if let Ok(mut info) = FsInfo::parse(&buf) {
                    info.free_count = self.fat.lock().free_clusters_raw();
                    info.next_free = self.fat.lock().next_free_hint();
                    info.encode(&mut buf);
                    self.card.write_sector(fsinfo_sector, &buf)?;
                }
            }
        }
        crate::cache::invalidate_all();
        self.card.mark_unmounted();
        Ok(())
    }

    pub fn sync(&self) -> Result<(), Error> {
        self.require_mounted()?;
        self.fat.lock().flush()?;
        crate::cache::sync_all()
    }

    /// The first cluster relative paths currently resolve against (`0`
    /// meaning the FAT12/16 fixed root).
    pub(crate) fn cwd_cluster(&self) -> u32 {
        self.cwd.lock().cluster
    }

    /// The printable path of the current working directory.
    pub fn getcwd(&self) -> String {
        self.cwd.lock().path.clone()
    }

    /// Change the current working directory. `path` is resolved the same
    /// way any other path is: relative to the existing cwd unless it
    /// starts with `/`.
    pub fn chdir(&self, path: &str) -> Result<(), Error> {
        self.require_mounted()?;
        let mut fat = self.fat.lock();
        let cwd_cluster = self.cwd.lock().cluster;
        if path.trim_matches('/').is_empty() {
            let root = self.bpb.root_cluster();
            let mut cwd = self.cwd.lock();
            cwd.cluster = root;
            cwd.path = String::from("/");
            return Ok(());
        }
        let resolved = path::resolve(Arc::clone(&self.card), &self.bpb, &mut fat, path, cwd_cluster)?;
        let cluster = match resolved.entry {
            Some(info) if info.is_dir => {
                if info.first_cluster == 0 {
                    self.bpb.root_cluster()
                } else {
                    info.first_cluster
                }
            }
            Some(_) => return Err(Error::NotDir),
            None => self.bpb.root_cluster(),
        };

        let mut owned_segments: Vec<alloc::string::String> = if path.starts_with('/') {
            Vec::new()
        } else {
            let cwd_path = self.cwd.lock().path.clone();
            path::split_path(&cwd_path)?
                .into_iter()
                .map(alloc::string::String::from)
                .collect()
        };
        for comp in path::split_path(path)? {
            if comp == ".." {
                owned_segments.pop();
            } else {
                owned_segments.push(alloc::string::String::from(comp));
            }
        }
        let mut new_path = String::from("/");
        new_path.push_str(&owned_segments.join("/"));

        let mut cwd = self.cwd.lock();
        cwd.cluster = cluster;
        cwd.path = new_path;
        Ok(())
    }

    pub fn card(&self) -> Arc<Card> {
        Arc::clone(&self.card)
    }

    pub fn bpb(&self) -> &Bpb {
        &self.bpb
    }

    pub fn fat(&self) -> Arc<Mutex<FatTable>> {
        Arc::clone(&self.fat)
    }

    pub fn bpb_owned(&self) -> Bpb {
        self.bpb.clone()
    }

    pub fn info(&self) -> Result<VolumeInfo, Error> {
        self.require_mounted()?;
        let free = self.fat.lock().get_free_count()?;
        Ok(VolumeInfo {
            fat_type: self.bpb.fat_type(),
            total_sectors: self.bpb.total_sectors,
            bytes_per_cluster: self.bpb.cluster_size(),
            free_clusters: free,
            volume_label: self.bpb.volume_label_string(),
        })
    }

    /// Free space in bytes, derived from [`Volume::info`]'s free cluster
    /// count.
    pub fn free_bytes(&self) -> Result<u64, Error> {
        let info = self.info()?;
        Ok(info.free_clusters as u64 * info.bytes_per_cluster as u64)
    }

    pub fn label(&self) -> String {
        self.bpb.volume_label_string()
    }

    pub fn exists(&self, path: &str) -> Result<bool, Error> {
        self.require_mounted()?;
        let mut fat = self.fat.lock();
        let cwd_cluster = self.cwd_cluster();
        match path::resolve(Arc::clone(&self.card), &self.bpb, &mut fat, path, cwd_cluster) {
            Ok(_) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn stat(&self, path: &str) -> Result<DirInfo, Error> {
        self.require_mounted()?;
        let mut fat = self.fat.lock();
        let cwd_cluster = self.cwd_cluster();
        let resolved = path::resolve(Arc::clone(&self.card), &self.bpb, &mut fat, path, cwd_cluster)?;
        resolved.entry.ok_or(Error::InvalidParam)
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<DirInfo>, Error> {
        self.require_mounted()?;
        let mut fat = self.fat.lock();
        let cwd_cluster = self.cwd_cluster();
        let cluster = if path.trim_matches('/').is_empty() {
            cwd_cluster
        } else {
            let resolved = path::resolve(Arc::clone(&self.card), &self.bpb, &mut fat, path, cwd_cluster)?;
            match resolved.entry {
                Some(info) if info.is_dir => {
                    if info.first_cluster == 0 {
                        self.bpb.root_cluster()
                    } else {
                        info.first_cluster
                    }
                }
                Some(_) => return Err(Error::NotDir),
                None => self.bpb.root_cluster(),
            }
        };
        path::list_dir(Arc::clone(&self.card), &self.bpb, &mut fat, cluster)
    }
}
