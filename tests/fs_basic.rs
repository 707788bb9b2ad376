//! End-to-end tests against a virtual SD card: init the command layer,
//! mount a hand-built FAT12 image, and drive the file/directory API.

mod common;

use std::sync::Arc;

use common::disk;
use common::RamLink;

use sdfat_rs::bpb::FatType;
use sdfat_rs::file::{Dir, File, OpenMode};
use sdfat_rs::{Card, Volume};

fn mounted_volume(image: Vec<u8>) -> Volume {
    let link = RamLink::new(disk::TOTAL_SECTORS);
    link.install_image(&image);
    let card = Arc::new(Card::new(link));
    card.init(1_000_000).expect("card init");
    Volume::mount(card).expect("mount")
}

#[test]
fn mounts_blank_fat12_image() {
    let volume = mounted_volume(disk::blank_image());
    let info = volume.info().expect("info");
    assert_eq!(info.fat_type, FatType::Fat12);
    assert_eq!(info.total_sectors, disk::TOTAL_SECTORS);
    assert_eq!(info.bytes_per_cluster, disk::SECTOR_SIZE as u32);
}

#[test]
fn reads_a_preexisting_file() {
    let mut image = disk::blank_image();
    disk::set_fat12_entry(&mut image, 2, 0x0FFF); // single-cluster EOC
    let cluster_sector = disk::cluster_sector(2) as usize;
    image[cluster_sector * disk::SECTOR_SIZE..cluster_sector * disk::SECTOR_SIZE + 5]
        .copy_from_slice(b"hello");
    disk::write_root_entry(&mut image, 0, b"HELLO   ", b"TXT", 0x20, 2, 5);

    let volume = mounted_volume(image);
    assert!(volume.exists("/HELLO.TXT").unwrap());

    let mut file = File::open(&volume, "/hello.txt", OpenMode::READ).expect("open");
    assert_eq!(file.size(), 5);
    let mut buf = [0u8; 16];
    let n = file.read(&mut buf).expect("read");
    assert_eq!(&buf[..n], b"hello");
}

#[test]
fn create_write_and_reread_a_file() {
    let volume = mounted_volume(disk::blank_image());

    {
        let mut file = File::open(&volume, "/new.txt", OpenMode::CREATE | OpenMode::WRITE)
            .expect("create");
        let written = file.write(b"abcdef").expect("write");
        assert_eq!(written, 6);
        file.close().expect("close");
    }

    let mut file = File::open(&volume, "/NEW.TXT", OpenMode::READ).expect("reopen");
    assert_eq!(file.size(), 6);
    let mut buf = [0u8; 8];
    let n = file.read(&mut buf).expect("read back");
    assert_eq!(&buf[..n], b"abcdef");
}

#[test]
fn write_past_a_cluster_boundary_allocates_more_clusters() {
    let volume = mounted_volume(disk::blank_image());
    let payload: Vec<u8> = (0u8..=255).cycle().take(1200).collect();

    {
        let mut file = File::open(&volume, "/big.bin", OpenMode::CREATE | OpenMode::WRITE)
            .expect("create");
        file.write(&payload).expect("write");
        file.close().expect("close");
    }

    let mut file = File::open(&volume, "/BIG.BIN", OpenMode::READ).expect("reopen");
    assert_eq!(file.size() as usize, payload.len());
    let mut buf = vec![0u8; payload.len()];
    let mut done = 0;
    while done < buf.len() {
        let n = file.read(&mut buf[done..]).expect("read chunk");
        assert!(n > 0, "read stalled before reaching end of file");
        done += n;
    }
    assert_eq!(buf, payload);
}

#[test]
fn mkdir_then_list_shows_the_new_entry() {
    let volume = mounted_volume(disk::blank_image());
    sdfat_rs::file::mkdir(&volume, "/sub").expect("mkdir");

    let entries = volume.list_dir("/").expect("list root");
    assert!(entries.iter().any(|e| e.name == "sub" && e.is_dir));

    let dir = Dir::open(&volume, "/sub").expect("open subdir");
    let sub_entries = dir.read_all().expect("list subdir");
    let names: Vec<&str> = sub_entries.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"."));
    assert!(names.contains(&".."));
}

#[test]
fn unlink_removes_a_file() {
    let volume = mounted_volume(disk::blank_image());
    {
        let mut file = File::open(&volume, "/gone.txt", OpenMode::CREATE | OpenMode::WRITE)
            .expect("create");
        file.write(b"bye").expect("write");
        file.close().expect("close");
    }
    assert!(volume.exists("/gone.txt").unwrap());

    sdfat_rs::file::unlink(&volume, "/gone.txt").expect("unlink");
    assert!(!volume.exists("/gone.txt").unwrap());
}

#[test]
fn rename_within_the_same_directory() {
    let volume = mounted_volume(disk::blank_image());
    {
        let mut file = File::open(&volume, "/old.txt", OpenMode::CREATE | OpenMode::WRITE)
            .expect("create");
        file.write(b"data").expect("write");
        file.close().expect("close");
    }

    sdfat_rs::file::rename(&volume, "/old.txt", "/renamed.txt").expect("rename");
    assert!(!volume.exists("/old.txt").unwrap());
    assert!(volume.exists("/renamed.txt").unwrap());

    let mut file = File::open(&volume, "/renamed.txt", OpenMode::READ).expect("open renamed");
    let mut buf = [0u8; 8];
    let n = file.read(&mut buf).expect("read");
    assert_eq!(&buf[..n], b"data");
}

#[test]
fn rmdir_rejects_a_non_empty_directory() {
    let volume = mounted_volume(disk::blank_image());
    sdfat_rs::file::mkdir(&volume, "/sub").expect("mkdir");
    {
        let mut file = File::open(&volume, "/sub/inner.txt", OpenMode::CREATE | OpenMode::WRITE)
            .expect("create nested file");
        file.write(b"x").expect("write");
        file.close().expect("close");
    }

    assert!(sdfat_rs::file::rmdir(&volume, "/sub").is_err());

    sdfat_rs::file::unlink(&volume, "/sub/inner.txt").expect("unlink nested file");
    sdfat_rs::file::rmdir(&volume, "/sub").expect("rmdir now that it is empty");
}

#[test]
fn open_without_create_on_a_missing_file_fails() {
    let volume = mounted_volume(disk::blank_image());
    assert!(File::open(&volume, "/missing.txt", OpenMode::READ).is_err());
}

#[test]
fn fat12_entry_straddling_a_sector_boundary_round_trips() {
    // cluster 341: (341 * 3) / 2 == 511, the last byte of the FAT's
    // first sector — its high byte lives at offset 0 of the next sector.
    let volume = mounted_volume(disk::large_image());
    assert_eq!(volume.info().unwrap().fat_type, FatType::Fat12);

    let fat = volume.fat();
    {
        let mut fat = fat.lock();
        fat.write_entry(341, 0x0ABC).expect("write straddling entry");
        fat.flush().expect("flush straddling write");
    }
    {
        let mut fat = fat.lock();
        assert_eq!(fat.read_entry(341).expect("read straddling entry"), 0x0ABC);
    }

    // A neighboring non-straddling entry must be unaffected.
    {
        let mut fat = fat.lock();
        fat.write_entry(340, 0x0123).expect("write neighbor entry");
        assert_eq!(fat.read_entry(340).expect("read neighbor entry"), 0x0123);
        assert_eq!(fat.read_entry(341).expect("re-read straddling entry"), 0x0ABC);
    }
}
