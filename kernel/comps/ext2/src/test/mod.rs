// SPDX-License-Identifier: MPL-2.0

//! Scenario tests that run against freshly formatted in-memory disks.

use core::ops::ControlFlow;

use ember_block::{FaultKind, MemDisk};
use zerocopy::IntoBytes;

use crate::{
    bitmap::Bitmap,
    block_group::descriptor_for,
    block_ptr::BlockPtrs,
    config::{CheckMode, Clock, CtxPolicy, MountOptions},
    dir,
    distribution::distribute,
    fs::Ext2,
    inode::{FilePerm, FileType, ROOT_INO, read_inode, update_inode},
    mkfs::{FormatOptions, format},
    ops::{NewInodeAttr, SetInodeAttr},
    prelude::*,
    super_block::{FsState, SUPER_BLOCK_OFFSET, SUPER_BLOCK_SIZE, SuperBlock},
};

/// 2048 blocks of 1 KiB in one group.
const NR_SECTORS: usize = 4096;

fn new_disk(nr_sectors: usize) -> Result<Arc<MemDisk>> {
    new_disk_with(nr_sectors, &FormatOptions::default())
}

fn new_disk_with(nr_sectors: usize, options: &FormatOptions) -> Result<Arc<MemDisk>> {
    let disk = Arc::new(MemDisk::create(nr_sectors));
    let device: Arc<dyn BlockDevice> = disk.clone();
    format(&device, options)?;
    Ok(disk)
}

fn mount(disk: &Arc<MemDisk>, options: MountOptions) -> Result<Arc<Ext2>> {
    let device: Arc<dyn BlockDevice> = disk.clone();
    Ext2::open(device, options)
}

fn new_fs() -> Result<(Arc<MemDisk>, Arc<Ext2>)> {
    let disk = new_disk(NR_SECTORS)?;
    let fs = mount(&disk, MountOptions::default())?;
    Ok((disk, fs))
}

fn create_file(fs: &Ext2, parent: u32, name: &str) -> Result<u32> {
    let attr = NewInodeAttr::new(FileType::File, FilePerm::from_bits_truncate(0o644));
    Ok(fs.create(parent, name, attr)?.ino)
}

fn mkdir(fs: &Ext2, parent: u32, name: &str) -> Result<u32> {
    Ok(fs
        .mkdir(parent, name, FilePerm::from_bits_truncate(0o755), 0, 0)?
        .ino)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn list_dir(fs: &Ext2, ino: u32) -> Result<Vec<String>> {
    let mut names = Vec::new();
    fs.readdir_at(ino, 0, |name, _, _, _| {
        names.push(name.to_string());
        ControlFlow::Continue(())
    })?;
    Ok(names)
}

fn read_all(fs: &Ext2, ino: u32) -> Result<Vec<u8>> {
    let size = fs.getattr(ino)?.size as usize;
    let mut buf = vec![0u8; size];
    let len = fs.read_at(ino, 0, &mut buf)?;
    assert_eq!(len, size);
    Ok(buf)
}

fn block_bitmap(fs: &Ext2) -> Result<Vec<u8>> {
    fs.transaction(|ctx| {
        let desc = descriptor_for(ctx, 0)?;
        Ok(ctx.read_block(desc.block_bitmap_bid)?.to_vec())
    })
}

fn on_disk_super_block(disk: &MemDisk) -> Result<SuperBlock> {
    let image = disk.snapshot();
    SuperBlock::decode(&image[SUPER_BLOCK_OFFSET..SUPER_BLOCK_OFFSET + SUPER_BLOCK_SIZE])
}

fn group_free_blocks(fs: &Ext2) -> Result<Vec<u16>> {
    fs.transaction(|ctx| {
        (0..ctx.geo().groups_count)
            .map(|idx| Ok(descriptor_for(ctx, idx)?.free_blocks_count))
            .collect()
    })
}

/// Checks that the superblock, the descriptors and the bitmaps agree on the
/// free counts, group by group.
fn assert_counts_consistent(fs: &Ext2) -> Result<()> {
    let stat = fs.stat();
    assert_eq!(fs.group_free_counts()?, (stat.free_blocks, stat.free_inodes));

    let in_bitmaps = fs.transaction(|ctx| {
        let geo = *ctx.geo();
        let (mut free_blocks, mut free_inodes) = (0u32, 0u32);
        for idx in 0..geo.groups_count {
            let desc = descriptor_for(ctx, idx)?;
            let bitmap = ctx.read_block(desc.block_bitmap_bid)?;
            let blocks = Bitmap::from_slice(bitmap)[..geo.blocks_in_group(idx) as usize].count_zeros();
            let bitmap = ctx.read_block(desc.inode_bitmap_bid)?;
            let inodes = Bitmap::from_slice(bitmap)[..geo.inodes_per_group as usize].count_zeros();
            assert_eq!(
                (desc.free_blocks_count as usize, desc.free_inodes_count as usize),
                (blocks, inodes),
                "group {}",
                idx
            );
            free_blocks += blocks as u32;
            free_inodes += inodes as u32;
        }
        Ok((free_blocks, free_inodes))
    })?;
    assert_eq!(in_bitmaps, (stat.free_blocks, stat.free_inodes));
    Ok(())
}

#[test]
fn root_inode() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    let root = fs.getattr(fs.root_ino())?;
    assert_eq!(root.ino, ROOT_INO);
    assert_eq!(root.type_, FileType::Dir);
    assert_eq!(root.nlinks, 2);
    assert_eq!(root.size, 1024);
    assert_eq!(list_dir(&fs, ROOT_INO)?, [".", ".."]);
    assert_eq!(fs.lookup(ROOT_INO, "..")?.ino, ROOT_INO);
    assert_counts_consistent(&fs)
}

#[test]
fn write_then_read_across_remount() -> Result<()> {
    let (disk, fs) = new_fs()?;
    let ino = create_file(&fs, ROOT_INO, "file")?;
    let data = pattern(5000);
    assert_eq!(fs.write_at(ino, 0, &data)?, data.len());
    assert_eq!(read_all(&fs, ino)?, data);

    let attr = fs.getattr(ino)?;
    assert_eq!(attr.size, 5000);
    assert_eq!(attr.sectors, 5 * 2);

    fs.unmount()?;
    let fs = mount(&disk, MountOptions::default())?;
    let attr = fs.lookup(ROOT_INO, "file")?;
    assert_eq!(attr.ino, ino);
    assert_eq!(read_all(&fs, ino)?, data);
    assert_counts_consistent(&fs)
}

#[test]
fn write_at_offset_in_empty_file() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    let ino = create_file(&fs, ROOT_INO, "file")?;
    let data = pattern(2000);
    fs.write_at(ino, 500, &data)?;

    let attr = fs.getattr(ino)?;
    assert_eq!(attr.size, 2500);
    assert_eq!(attr.sectors, 3 * 2);

    let content = read_all(&fs, ino)?;
    assert!(content[..500].iter().all(|byte| *byte == 0));
    assert_eq!(content[500..], data[..]);

    let mut tail = [0u8; 200];
    assert_eq!(fs.read_at(ino, 2400, &mut tail)?, 100);
    assert_eq!(tail[..100], data[1900..]);
    assert_eq!(fs.read_at(ino, 2500, &mut tail)?, 0);
    Ok(())
}

#[test]
fn large_file_uses_index_blocks() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    let ino = create_file(&fs, ROOT_INO, "big")?;
    // 12 direct, 256 through the singly indirect block, 1 through the doubly one.
    let nr_data_blocks = 12 + 256 + 1;
    let data = pattern(nr_data_blocks * 1024);
    fs.write_at(ino, 0, &data)?;

    let expected = distribute(1024, nr_data_blocks as u32, false);
    assert_eq!(expected.index_total, 3);
    assert_eq!(fs.getattr(ino)?.sectors, expected.blocks_total() * 2);
    assert_eq!(read_all(&fs, ino)?, data);
    assert_counts_consistent(&fs)
}

#[test]
fn truncate_restores_the_bitmap() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    let bitmap_before = block_bitmap(&fs)?;
    let free_before = fs.stat().free_blocks;

    let ino = create_file(&fs, ROOT_INO, "file")?;
    fs.write_at(ino, 0, &pattern(300 * 1024))?;
    assert_eq!(fs.stat().free_blocks, free_before - 303);

    let attr = SetInodeAttr {
        size: Some(0),
        ..Default::default()
    };
    let attr = fs.setattr(ino, &attr)?;
    assert_eq!(attr.size, 0);
    assert_eq!(attr.sectors, 0);
    assert_eq!(block_bitmap(&fs)?, bitmap_before);
    assert_eq!(fs.stat().free_blocks, free_before);
    assert_counts_consistent(&fs)
}

#[test]
fn shrink_then_grow_reads_zeros() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    let ino = create_file(&fs, ROOT_INO, "file")?;
    let data = pattern(3000);
    fs.write_at(ino, 0, &data)?;

    let shrink = SetInodeAttr {
        size: Some(100),
        ..Default::default()
    };
    let attr = fs.setattr(ino, &shrink)?;
    assert_eq!(attr.size, 100);
    assert_eq!(attr.sectors, 3 * 2);

    let grow = SetInodeAttr {
        size: Some(3000),
        ..Default::default()
    };
    fs.setattr(ino, &grow)?;
    let content = read_all(&fs, ino)?;
    assert_eq!(content[..100], data[..100]);
    assert!(content[100..].iter().all(|byte| *byte == 0));
    Ok(())
}

#[test]
fn setattr_changes_owner_and_mode() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    let ino = create_file(&fs, ROOT_INO, "file")?;
    let attr = SetInodeAttr {
        perm: Some(FilePerm::from_bits_truncate(0o600)),
        uid: Some(1000),
        gid: Some(100_000),
        ..Default::default()
    };
    fs.setattr(ino, &attr)?;

    let attr = fs.getattr(ino)?;
    assert_eq!(attr.perm.bits(), 0o600);
    assert_eq!(attr.uid, 1000);
    assert_eq!(attr.gid, 100_000);

    let resize_dir = SetInodeAttr {
        size: Some(0),
        ..Default::default()
    };
    let err = fs.setattr(ROOT_INO, &resize_dir).unwrap_err();
    assert_eq!(err.error(), Errno::EISDIR);
    Ok(())
}

#[test]
fn file_size_limit() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    let ino = create_file(&fs, ROOT_INO, "file")?;
    let err = fs.write_at(ino, i32::MAX as u64, b"x").unwrap_err();
    assert_eq!(err.error(), Errno::EFBIG);
    assert_eq!(fs.getattr(ino)?.size, 0);
    Ok(())
}

#[test]
fn full_volume_discards_the_write() -> Result<()> {
    // 256 blocks, of which 242 are free after formatting.
    let disk = new_disk(512)?;
    let fs = mount(&disk, MountOptions::default())?;
    let ino = create_file(&fs, ROOT_INO, "file")?;
    let before = fs.stat();

    let err = fs.write_at(ino, 0, &pattern(300 * 1024)).unwrap_err();
    assert_eq!(err.error(), Errno::ENOSPC);
    assert_eq!(fs.stat(), before);
    assert_eq!(fs.getattr(ino)?.size, 0);
    assert_counts_consistent(&fs)?;

    fs.write_at(ino, 0, &pattern(100 * 1024))?;
    assert_eq!(fs.getattr(ino)?.size, 100 * 1024);
    assert_counts_consistent(&fs)
}

#[test]
fn names_are_unique() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    let ino = create_file(&fs, ROOT_INO, "name")?;
    for err in [
        create_file(&fs, ROOT_INO, "name").unwrap_err(),
        mkdir(&fs, ROOT_INO, "name").unwrap_err(),
        fs.link(ROOT_INO, "name", ino).unwrap_err(),
        create_file(&fs, ROOT_INO, ".").unwrap_err(),
    ] {
        assert_eq!(err.error(), Errno::EEXIST);
    }
    Ok(())
}

#[test]
fn invalid_names() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    let long_name = "x".repeat(256);
    let err = create_file(&fs, ROOT_INO, &long_name).unwrap_err();
    assert_eq!(err.error(), Errno::ENAMETOOLONG);
    let err = fs.lookup(ROOT_INO, &long_name).unwrap_err();
    assert_eq!(err.error(), Errno::ENAMETOOLONG);

    for name in ["", "a/b", "nul\0"] {
        let err = create_file(&fs, ROOT_INO, name).unwrap_err();
        assert_eq!(err.error(), Errno::EINVAL);
    }
    create_file(&fs, ROOT_INO, &"x".repeat(255))?;
    Ok(())
}

#[test]
fn lookup_in_a_file_fails() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    let ino = create_file(&fs, ROOT_INO, "file")?;
    let err = fs.lookup(ino, "x").unwrap_err();
    assert_eq!(err.error(), Errno::ENOTDIR);
    let err = create_file(&fs, ino, "x").unwrap_err();
    assert_eq!(err.error(), Errno::ENOTDIR);
    let err = fs.lookup(ROOT_INO, "missing").unwrap_err();
    assert_eq!(err.error(), Errno::ENOENT);
    Ok(())
}

#[test]
fn freed_record_space_is_reused() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    for name in ["a", "b", "c"] {
        create_file(&fs, ROOT_INO, name)?;
    }
    fs.unlink(ROOT_INO, "b")?;
    create_file(&fs, ROOT_INO, "bb")?;

    assert_eq!(fs.getattr(ROOT_INO)?.size, 1024);
    assert_eq!(list_dir(&fs, ROOT_INO)?, [".", "..", "a", "bb", "c"]);
    Ok(())
}

#[test]
fn create_unlink_cycles_leave_the_directory_intact() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    let before = fs.stat();
    for _ in 0..50 {
        create_file(&fs, ROOT_INO, "temporary")?;
        fs.unlink(ROOT_INO, "temporary")?;
    }
    assert_eq!(fs.getattr(ROOT_INO)?.size, 1024);
    assert_eq!(list_dir(&fs, ROOT_INO)?, [".", ".."]);
    assert_eq!(fs.stat(), before);
    assert_counts_consistent(&fs)
}

#[test]
fn directory_grows_and_readdir_resumes() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    let names: Vec<String> = (0..100)
        .map(|i| format!("file-with-a-long-name-{:03}", i))
        .collect();
    for name in &names {
        create_file(&fs, ROOT_INO, name)?;
    }
    let root = fs.getattr(ROOT_INO)?;
    assert_eq!(root.size, 4 * 1024);
    for name in &names {
        fs.lookup(ROOT_INO, name)?;
    }

    let mut seen = Vec::new();
    let mut pos = 0;
    loop {
        let mut batch = 0;
        let next = fs.readdir_at(ROOT_INO, pos, |name, _, _, _| {
            if batch == 10 {
                return ControlFlow::Break(());
            }
            seen.push(name.to_string());
            batch += 1;
            ControlFlow::Continue(())
        })?;
        if batch == 0 {
            break;
        }
        pos = next;
    }
    assert_eq!(seen.len(), names.len() + 2);
    assert_eq!(seen[2..], names[..]);
    Ok(())
}

#[test]
fn readdir_reports_types() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    mkdir(&fs, ROOT_INO, "dir")?;
    let fifo = NewInodeAttr::new(FileType::Fifo, FilePerm::from_bits_truncate(0o644));
    fs.create(ROOT_INO, "fifo", fifo)?;

    let mut types = Vec::new();
    fs.readdir_at(ROOT_INO, 0, |name, _, type_, _| {
        types.push((name.to_string(), type_));
        ControlFlow::Continue(())
    })?;
    assert_eq!(types[2], ("dir".to_string(), FileType::Dir));
    assert_eq!(types[3], ("fifo".to_string(), FileType::Fifo));
    Ok(())
}

#[test]
fn mkdir_and_rmdir() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    let before = fs.stat();
    let dir = mkdir(&fs, ROOT_INO, "dir")?;
    assert_eq!(fs.getattr(ROOT_INO)?.nlinks, 3);
    let attr = fs.getattr(dir)?;
    assert_eq!(attr.nlinks, 2);
    assert_eq!(attr.size, 1024);
    assert_eq!(fs.lookup(dir, "..")?.ino, ROOT_INO);
    let dirs_count = fs.transaction(|ctx| Ok(descriptor_for(ctx, 0)?.dirs_count))?;
    assert_eq!(dirs_count, 2);

    create_file(&fs, dir, "file")?;
    let err = fs.rmdir(ROOT_INO, "dir").unwrap_err();
    assert_eq!(err.error(), Errno::ENOTEMPTY);

    fs.unlink(dir, "file")?;
    fs.rmdir(ROOT_INO, "dir")?;
    assert_eq!(fs.getattr(ROOT_INO)?.nlinks, 2);
    assert_eq!(fs.lookup(ROOT_INO, "dir").unwrap_err().error(), Errno::ENOENT);
    assert_eq!(fs.getattr(dir).unwrap_err().error(), Errno::ENOENT);
    let dirs_count = fs.transaction(|ctx| Ok(descriptor_for(ctx, 0)?.dirs_count))?;
    assert_eq!(dirs_count, 1);
    assert_eq!(fs.stat(), before);
    assert_counts_consistent(&fs)
}

#[test]
fn removal_type_rules() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    mkdir(&fs, ROOT_INO, "dir")?;
    create_file(&fs, ROOT_INO, "file")?;

    assert_eq!(fs.unlink(ROOT_INO, "dir").unwrap_err().error(), Errno::EISDIR);
    assert_eq!(fs.rmdir(ROOT_INO, "file").unwrap_err().error(), Errno::ENOTDIR);
    assert_eq!(fs.rmdir(ROOT_INO, ".").unwrap_err().error(), Errno::EINVAL);
    assert_eq!(fs.unlink(ROOT_INO, "missing").unwrap_err().error(), Errno::ENOENT);
    Ok(())
}

#[test]
fn hard_links_share_the_inode() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    let before = fs.stat();
    let ino = create_file(&fs, ROOT_INO, "a")?;
    fs.write_at(ino, 0, b"shared")?;
    assert_eq!(fs.link(ROOT_INO, "b", ino)?.nlinks, 2);

    fs.unlink(ROOT_INO, "a")?;
    let attr = fs.lookup(ROOT_INO, "b")?;
    assert_eq!(attr.ino, ino);
    assert_eq!(attr.nlinks, 1);
    assert_eq!(read_all(&fs, ino)?, b"shared");

    fs.unlink(ROOT_INO, "b")?;
    assert_eq!(fs.getattr(ino).unwrap_err().error(), Errno::ENOENT);
    assert_eq!(fs.stat(), before);

    let dir = mkdir(&fs, ROOT_INO, "dir")?;
    assert_eq!(fs.link(ROOT_INO, "alias", dir).unwrap_err().error(), Errno::EISDIR);
    assert_counts_consistent(&fs)
}

#[test]
fn rename_over_a_file_frees_its_blocks() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    let src = create_file(&fs, ROOT_INO, "src")?;
    fs.write_at(src, 0, &pattern(1024))?;
    let dst = create_file(&fs, ROOT_INO, "dst")?;
    fs.write_at(dst, 0, &pattern(10 * 1024))?;
    let before = fs.stat();

    fs.rename(ROOT_INO, "src", ROOT_INO, "dst")?;
    let after = fs.stat();
    assert_eq!(after.free_blocks, before.free_blocks + 10);
    assert_eq!(after.free_inodes, before.free_inodes + 1);

    assert_eq!(fs.lookup(ROOT_INO, "dst")?.ino, src);
    assert_eq!(fs.lookup(ROOT_INO, "src").unwrap_err().error(), Errno::ENOENT);
    assert_eq!(fs.getattr(dst).unwrap_err().error(), Errno::ENOENT);
    assert_eq!(list_dir(&fs, ROOT_INO)?, [".", "..", "dst"]);
    assert_eq!(read_all(&fs, src)?, pattern(1024));
    assert_counts_consistent(&fs)
}

#[test]
fn rename_directory_to_another_parent() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    let a = mkdir(&fs, ROOT_INO, "a")?;
    let b = mkdir(&fs, ROOT_INO, "b")?;
    let d = mkdir(&fs, a, "d")?;
    assert_eq!(fs.getattr(a)?.nlinks, 3);

    fs.rename(a, "d", b, "e")?;
    assert_eq!(fs.getattr(a)?.nlinks, 2);
    assert_eq!(fs.getattr(b)?.nlinks, 3);
    assert_eq!(fs.lookup(b, "e")?.ino, d);
    assert_eq!(fs.lookup(d, "..")?.ino, b);
    assert_eq!(fs.lookup(a, "d").unwrap_err().error(), Errno::ENOENT);

    // "b" cannot move below its own child.
    let err = fs.rename(ROOT_INO, "b", d, "x").unwrap_err();
    assert_eq!(err.error(), Errno::EINVAL);
    let err = fs.rename(ROOT_INO, "b", b, "x").unwrap_err();
    assert_eq!(err.error(), Errno::EINVAL);
    assert_counts_consistent(&fs)
}

#[test]
fn rename_type_rules() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    mkdir(&fs, ROOT_INO, "dir")?;
    let full = mkdir(&fs, ROOT_INO, "full")?;
    create_file(&fs, full, "file")?;
    let empty = mkdir(&fs, ROOT_INO, "empty")?;
    create_file(&fs, ROOT_INO, "file")?;

    let err = fs.rename(ROOT_INO, "dir", ROOT_INO, "file").unwrap_err();
    assert_eq!(err.error(), Errno::ENOTDIR);
    let err = fs.rename(ROOT_INO, "file", ROOT_INO, "dir").unwrap_err();
    assert_eq!(err.error(), Errno::EISDIR);
    let err = fs.rename(ROOT_INO, "dir", ROOT_INO, "full").unwrap_err();
    assert_eq!(err.error(), Errno::ENOTEMPTY);

    let root_links = fs.getattr(ROOT_INO)?.nlinks;
    fs.rename(ROOT_INO, "dir", ROOT_INO, "empty")?;
    assert_eq!(fs.getattr(ROOT_INO)?.nlinks, root_links - 1);
    assert_eq!(fs.getattr(empty).unwrap_err().error(), Errno::ENOENT);

    // Renaming to the same name changes nothing.
    fs.rename(ROOT_INO, "file", ROOT_INO, "file")?;
    assert_eq!(list_dir(&fs, ROOT_INO)?, [".", "..", "full", "empty", "file"]);
    assert_counts_consistent(&fs)
}

#[test]
fn failed_write_leaves_the_device_untouched() -> Result<()> {
    let (disk, fs) = new_fs()?;
    let ino = create_file(&fs, ROOT_INO, "file")?;
    let before = fs.stat();
    let image = disk.snapshot();

    disk.inject_fault(FaultKind::Write);
    let err = fs.write_at(ino, 0, &pattern(4096)).unwrap_err();
    assert_eq!(err.error(), Errno::EIO);
    disk.clear_faults();

    assert!(disk.snapshot() == image);
    assert_eq!(fs.stat(), before);
    assert_eq!(fs.getattr(ino)?.size, 0);
    assert_counts_consistent(&fs)?;

    assert_eq!(fs.write_at(ino, 0, b"ok")?, 2);
    assert_eq!(read_all(&fs, ino)?, b"ok");
    Ok(())
}

#[test]
fn failed_read_is_reported() -> Result<()> {
    let (disk, fs) = new_fs()?;
    disk.inject_fault(FaultKind::Read);
    let err = fs.getattr(ROOT_INO).unwrap_err();
    assert_eq!(err.error(), Errno::EIO);
    disk.clear_faults();
    fs.getattr(ROOT_INO)?;
    Ok(())
}

#[test]
fn read_only_mount() -> Result<()> {
    let disk = new_disk(NR_SECTORS)?;
    let image = disk.snapshot();
    let options = MountOptions {
        read_only: true,
        ..Default::default()
    };
    let fs = mount(&disk, options)?;

    let err = create_file(&fs, ROOT_INO, "file").unwrap_err();
    assert_eq!(err.error(), Errno::EROFS);
    let err = fs.rmdir(ROOT_INO, "missing").unwrap_err();
    assert_eq!(err.error(), Errno::EROFS);
    assert_eq!(list_dir(&fs, ROOT_INO)?, [".", ".."]);
    assert!(fs.stat().read_only);

    fs.unmount()?;
    assert!(disk.snapshot() == image);
    Ok(())
}

#[test]
fn mount_marks_the_volume_in_use() -> Result<()> {
    let disk = new_disk(NR_SECTORS)?;
    let fs = mount(&disk, MountOptions::default())?;
    let sb = on_disk_super_block(&disk)?;
    assert!(!sb.state().contains(FsState::VALID));
    assert_eq!(sb.mnt_count(), 1);

    fs.unmount()?;
    let sb = on_disk_super_block(&disk)?;
    assert!(sb.state().contains(FsState::VALID));

    mount(&disk, MountOptions::default())?;
    assert_eq!(on_disk_super_block(&disk)?.mnt_count(), 2);
    Ok(())
}

#[test]
fn free_count_checks_at_mount() -> Result<()> {
    let disk = new_disk(NR_SECTORS)?;
    let mut image = disk.snapshot();
    let range = SUPER_BLOCK_OFFSET..SUPER_BLOCK_OFFSET + SUPER_BLOCK_SIZE;
    let mut sb = SuperBlock::decode(&image[range.clone()])?;
    let (free_blocks, free_inodes) = (sb.free_blocks_count(), sb.free_inodes_count());
    sb.set_free_counts(1, 1);
    image[range].copy_from_slice(sb.encode().as_bytes());
    let disk = Arc::new(MemDisk::from_image(image));

    let strict = MountOptions {
        check: CheckMode::Strict,
        ..Default::default()
    };
    let err = mount(&disk, strict).unwrap_err();
    assert_eq!(err.error(), Errno::EINVAL);

    let unchecked = MountOptions {
        read_only: true,
        check: CheckMode::None,
        ..Default::default()
    };
    assert_eq!(mount(&disk, unchecked)?.stat().free_blocks, 1);

    let fs = mount(&disk, MountOptions::default())?;
    assert_eq!(fs.stat().free_blocks, free_blocks);
    assert_eq!(fs.stat().free_inodes, free_inodes);
    Ok(())
}

#[test]
fn bad_magic_is_rejected() {
    let disk = Arc::new(MemDisk::create(NR_SECTORS));
    let err = mount(&disk, MountOptions::default()).unwrap_err();
    assert_eq!(err.error(), Errno::EINVAL);
}

#[test]
fn sync_mount_writes_the_super_block() -> Result<()> {
    let disk = new_disk(NR_SECTORS)?;
    let options = MountOptions::parse("sync,ctx=transient")?;
    let fs = mount(&disk, options)?;
    create_file(&fs, ROOT_INO, "file")?;

    let sb = on_disk_super_block(&disk)?;
    assert_eq!(sb.free_inodes_count(), fs.stat().free_inodes);
    assert_eq!(sb.free_blocks_count(), fs.stat().free_blocks);
    Ok(())
}

#[test]
fn transient_contexts() -> Result<()> {
    let disk = new_disk(NR_SECTORS)?;
    let options = MountOptions {
        ctx: CtxPolicy::Transient,
        ..Default::default()
    };
    let fs = mount(&disk, options)?;
    let ino = create_file(&fs, ROOT_INO, "file")?;
    fs.write_at(ino, 0, &pattern(3000))?;
    assert_eq!(read_all(&fs, ino)?, pattern(3000));
    assert_counts_consistent(&fs)
}

#[derive(Debug)]
struct FixedClock(Duration);

impl Clock for FixedClock {
    fn now(&self) -> Duration {
        self.0
    }
}

#[test]
fn timestamps_come_from_the_clock() -> Result<()> {
    let disk = new_disk(NR_SECTORS)?;
    let device: Arc<dyn BlockDevice> = disk.clone();
    let clock = Arc::new(FixedClock(Duration::from_secs(1_700_000_000)));
    let fs = Ext2::open_with_clock(device, MountOptions::default(), clock)?;

    let ino = create_file(&fs, ROOT_INO, "file")?;
    let attr = fs.getattr(ino)?;
    assert_eq!(attr.mtime, Duration::from_secs(1_700_000_000));
    assert_eq!(attr.ctime, attr.mtime);
    assert_eq!(fs.getattr(ROOT_INO)?.mtime, attr.mtime);
    Ok(())
}

#[test]
fn symlinks() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    let attr = NewInodeAttr::new(FileType::Symlink, FilePerm::from_bits_truncate(0o777));
    let slow = fs.create(ROOT_INO, "slow", attr)?.ino;
    fs.write_at(slow, 0, b"/file")?;
    assert_eq!(read_all(&fs, slow)?, b"/file");

    // A short target stored in the block pointers.
    let fast = fs.create(ROOT_INO, "fast", attr)?.ino;
    fs.transaction(|ctx| {
        update_inode(ctx, fast, |inode| {
            let mut ptrs = [0; 15];
            ptrs[0] = u32::from_le_bytes(*b"/tmp");
            ptrs[1] = u32::from_le_bytes([b'/', b'x', 0, 0]);
            inode.block_ptrs = BlockPtrs::from_raw(ptrs);
            inode.size = 6;
            Ok(())
        })
    })?;
    assert_eq!(read_all(&fs, fast)?, b"/tmp/x");
    Ok(())
}

#[test]
fn inline_symlink_refuses_writes() -> Result<()> {
    let (disk, fs) = new_fs()?;
    let attr = NewInodeAttr::new(FileType::Symlink, FilePerm::from_bits_truncate(0o777));
    let fast = fs.create(ROOT_INO, "fast", attr)?.ino;
    fs.transaction(|ctx| {
        update_inode(ctx, fast, |inode| {
            let mut ptrs = [0; 15];
            // Read as a block number, the target names block 97.
            ptrs[0] = u32::from(b'a');
            inode.block_ptrs = BlockPtrs::from_raw(ptrs);
            inode.size = 1;
            Ok(())
        })
    })?;
    let image = disk.snapshot();

    let err = fs.write_at(fast, 0, b"ZZZZ").unwrap_err();
    assert_eq!(err.error(), Errno::EINVAL);
    let grow = SetInodeAttr {
        size: Some(4096),
        ..Default::default()
    };
    assert_eq!(fs.setattr(fast, &grow).unwrap_err().error(), Errno::EINVAL);
    assert!(disk.snapshot() == image);
    assert_eq!(read_all(&fs, fast)?, b"a");

    // Removing it must not free block 97 either.
    fs.unlink(ROOT_INO, "fast")?;
    assert_counts_consistent(&fs)
}

#[test]
fn readdir_skips_names_that_are_not_utf8() -> Result<()> {
    let (_disk, fs) = new_fs()?;
    let sub = mkdir(&fs, ROOT_INO, "dir")?;
    create_file(&fs, sub, "xname")?;
    fs.transaction(|ctx| {
        let desc = read_inode(ctx, sub)?;
        let Some(record) = dir::find(ctx, &desc, "xname")? else {
            return_errno_with_message!(Errno::ENOENT, "the record is gone");
        };
        ctx.modify_block(record.bid)?[record.offset + 8] = 0xff;
        Ok(())
    })?;

    assert_eq!(list_dir(&fs, sub)?, [".", ".."]);
    assert_eq!(fs.lookup(sub, "xname").unwrap_err().error(), Errno::ENOENT);
    let err = fs.rmdir(ROOT_INO, "dir").unwrap_err();
    assert_eq!(err.error(), Errno::ENOTEMPTY);
    Ok(())
}

#[test]
fn accounting_across_groups() -> Result<()> {
    // Four groups of 1024 blocks; groups 1 and 3 carry backup copies.
    let options = FormatOptions {
        blocks_per_group: Some(1024),
        ..FormatOptions::default()
    };
    let disk = new_disk_with(2 * 4096 + 2, &options)?;
    let fs = mount(&disk, MountOptions::default())?;
    assert_eq!(fs.geometry().groups_count, 4);
    let ipg = fs.geometry().inodes_per_group;
    assert_counts_consistent(&fs)?;

    // Group 2 has no backup copies, so it has the most free blocks.
    let dir = mkdir(&fs, ROOT_INO, "dir")?;
    assert_eq!((dir - 1) / ipg, 2);
    assert_counts_consistent(&fs)?;

    // The file fills group 0, then continues in group 2.
    let ino = create_file(&fs, ROOT_INO, "big")?;
    assert_eq!((ino - 1) / ipg, 0);
    let before = group_free_blocks(&fs)?;
    let data = pattern(1500 * 1024);
    fs.write_at(ino, 0, &data)?;
    // 1500 data blocks, the singly and doubly indirect blocks and 5 more below the latter.
    let nr_blocks = 1500 + 7u32;
    assert_eq!(fs.getattr(ino)?.sectors, nr_blocks * 2);
    let after = group_free_blocks(&fs)?;
    assert_eq!(after[0], 0);
    assert_eq!(after[1], before[1]);
    assert_eq!(after[3], before[3]);
    assert_eq!((before[2] - after[2]) as u32, nr_blocks - before[0] as u32);
    assert_eq!(read_all(&fs, ino)?, data);
    assert_counts_consistent(&fs)?;

    fs.unlink(ROOT_INO, "big")?;
    assert_eq!(group_free_blocks(&fs)?, before);
    assert_counts_consistent(&fs)?;

    fs.unmount()?;
    let strict = MountOptions {
        check: CheckMode::Strict,
        ..Default::default()
    };
    let fs = mount(&disk, strict)?;
    assert_eq!(fs.lookup(ROOT_INO, "dir")?.ino, dir);
    assert_eq!(group_free_blocks(&fs)?, before);
    assert_counts_consistent(&fs)
}

#[test]
fn larger_blocks() -> Result<()> {
    let disk = Arc::new(MemDisk::create(NR_SECTORS * 2));
    let device: Arc<dyn BlockDevice> = disk.clone();
    let options = FormatOptions {
        block_size: 4096,
        inode_size: 256,
        ..Default::default()
    };
    format(&device, &options)?;
    let fs = mount(&disk, MountOptions::default())?;
    assert_eq!(fs.geometry().block_size, 4096);

    let ino = create_file(&fs, ROOT_INO, "file")?;
    let data = pattern(13 * 4096 + 7);
    fs.write_at(ino, 0, &data)?;
    // 14 data blocks and the singly indirect block.
    assert_eq!(fs.getattr(ino)?.sectors, 15 * 8);
    assert_eq!(read_all(&fs, ino)?, data);

    fs.unmount()?;
    let fs = mount(&disk, MountOptions::default())?;
    assert_eq!(read_all(&fs, ino)?, data);
    assert_counts_consistent(&fs)
}
