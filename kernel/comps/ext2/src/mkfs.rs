// SPDX-License-Identifier: MPL-2.0

//! Formatting a device with a fresh ext2 volume.
//!
//! The volume is of revision 1 with the `FILETYPE` and `SPARSE_SUPER`
//! features. Every group starts with a copy of the superblock and of the
//! descriptor table if it is group 0, 1 or a power of 3, 5 or 7, followed by
//! its block bitmap, inode bitmap and inode table.

use zerocopy::IntoBytes;

use crate::{
    bitmap::Bitmap,
    block_group::{GroupDescriptor, descriptor_table_blocks, update_descriptor},
    dir::init_dir_block,
    fs::write_super_block,
    inode::{FilePerm, FileType, InodeDesc, ROOT_INO, init_inode},
    op_ctx::OpContext,
    prelude::*,
    super_block::{
        FeatureInCompatSet, FeatureRoCompatSet, FsState, MAGIC_NUM, RawSuperBlock,
        SUPER_BLOCK_SIZE, SuperBlock, is_sparse_backup_group,
    },
    utils::align_up,
};

const FIRST_INO: u32 = 11;
const ERRORS_CONTINUE: u16 = 1;

/// The parameters of a new volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    /// 1024, 2048 or 4096.
    pub block_size: usize,
    /// Defaults to every block of the device.
    pub blocks_count: Option<u32>,
    /// Defaults to the bits of one bitmap block.
    pub blocks_per_group: Option<u32>,
    /// Defaults to one inode per four blocks of a full group, filling whole
    /// inode table blocks.
    pub inodes_per_group: Option<u32>,
    pub inode_size: usize,
    /// The share of blocks reserved for the super user, in percent.
    pub reserved_percent: u32,
    pub volume_label: String,
    pub uuid: [u8; 16],
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            block_size: 1024,
            blocks_count: None,
            blocks_per_group: None,
            inodes_per_group: None,
            inode_size: 128,
            reserved_percent: 5,
            volume_label: String::new(),
            uuid: [0; 16],
        }
    }
}

/// The layout of the volume being formatted.
#[derive(Debug, Clone, Copy)]
struct Layout {
    blocks_count: u32,
    first_data_block: u32,
    blocks_per_group: u32,
    inodes_per_group: u32,
    groups_count: u32,
    gdt_blocks: u32,
    inode_table_blocks: u32,
}

impl Layout {
    fn new(device: &dyn BlockDevice, options: &FormatOptions) -> Result<Self> {
        let block_size = options.block_size;
        if !matches!(block_size, 1024 | 2048 | 4096) {
            return_errno_with_message!(Errno::EINVAL, "invalid block size");
        }
        if !options.inode_size.is_power_of_two()
            || options.inode_size < 128
            || options.inode_size > block_size
        {
            return_errno_with_message!(Errno::EINVAL, "invalid inode size");
        }
        let bits_per_block = (block_size * 8) as u32;

        let device_blocks = device.nr_sectors() / (block_size / SECTOR_SIZE) as u64;
        let device_blocks = device_blocks.min(u32::MAX as u64) as u32;
        let blocks_count = match options.blocks_count {
            Some(count) if count > device_blocks => {
                return_errno_with_message!(Errno::EINVAL, "the volume is larger than the device")
            }
            Some(count) => count,
            None => device_blocks,
        };

        let blocks_per_group = options.blocks_per_group.unwrap_or(bits_per_block);
        if blocks_per_group == 0 || blocks_per_group > bits_per_block || blocks_per_group % 8 != 0 {
            return_errno_with_message!(Errno::EINVAL, "invalid blocks per group");
        }

        let first_data_block = if block_size == 1024 { 1 } else { 0 };
        if blocks_count <= first_data_block {
            return_errno_with_message!(Errno::ENOSPC, "the device is too small");
        }

        let inodes_per_block = (block_size / options.inode_size) as u32;
        let inodes_per_group = match options.inodes_per_group {
            Some(count) => count,
            None => ((blocks_count - first_data_block).min(blocks_per_group) / 4).max(FIRST_INO),
        };
        // Group 0 holds the reserved inodes.
        if inodes_per_group < FIRST_INO {
            return_errno_with_message!(Errno::EINVAL, "too few inodes per group");
        }
        let inodes_per_group = align_up(inodes_per_group as usize, inodes_per_block.max(8) as usize)
            .min(bits_per_block as usize) as u32;

        let mut layout = Self {
            blocks_count,
            first_data_block,
            blocks_per_group,
            inodes_per_group,
            groups_count: (blocks_count - first_data_block).div_ceil(blocks_per_group),
            gdt_blocks: 0,
            inode_table_blocks: inodes_per_group * options.inode_size as u32 / block_size as u32,
        };
        layout.gdt_blocks = layout.gdt_blocks_for(block_size);

        // A last group too short for its metadata and one data block is left out.
        let last = layout.groups_count - 1;
        let last_len = layout.blocks_in_group(last);
        if last > 0 && last_len <= layout.overhead(last) {
            layout.blocks_count -= last_len;
            layout.groups_count -= 1;
            layout.gdt_blocks = layout.gdt_blocks_for(block_size);
        }
        // Group 0 also holds the root directory block.
        if layout.blocks_in_group(0) < layout.overhead(0) + 1 {
            return_errno_with_message!(Errno::ENOSPC, "the device is too small");
        }
        Ok(layout)
    }

    fn gdt_blocks_for(&self, block_size: usize) -> u32 {
        descriptor_table_blocks(self.groups_count, block_size)
    }

    fn group_first_bid(&self, block_group_idx: u32) -> Bid {
        self.first_data_block + block_group_idx * self.blocks_per_group
    }

    fn blocks_in_group(&self, block_group_idx: u32) -> u32 {
        let first = self.group_first_bid(block_group_idx);
        (self.blocks_count - first).min(self.blocks_per_group)
    }

    /// Returns the number of blocks taken by the superblock and descriptor
    /// table copies of the group.
    fn backup_blocks(&self, block_group_idx: u32) -> u32 {
        if is_sparse_backup_group(block_group_idx) {
            1 + self.gdt_blocks
        } else {
            0
        }
    }

    /// Returns the number of metadata blocks at the start of the group.
    fn overhead(&self, block_group_idx: u32) -> u32 {
        self.backup_blocks(block_group_idx) + 2 + self.inode_table_blocks
    }

    fn free_blocks(&self, block_group_idx: u32) -> u32 {
        let root = if block_group_idx == 0 { 1 } else { 0 };
        self.blocks_in_group(block_group_idx) - self.overhead(block_group_idx) - root
    }

    fn free_inodes(&self, block_group_idx: u32) -> u32 {
        if block_group_idx == 0 {
            self.inodes_per_group - (FIRST_INO - 1)
        } else {
            self.inodes_per_group
        }
    }
}

/// Formats `device` with a fresh volume.
pub fn format(device: &Arc<dyn BlockDevice>, options: &FormatOptions) -> Result<()> {
    let layout = Layout::new(device.as_ref(), options)?;
    let block_size = options.block_size;

    let mut raw = RawSuperBlock::zeroed();
    raw.inodes_count = (layout.groups_count * layout.inodes_per_group).into();
    raw.blocks_count = layout.blocks_count.into();
    raw.reserved_blocks_count =
        ((layout.blocks_count as u64 * options.reserved_percent as u64 / 100) as u32).into();
    raw.free_blocks_count = (0..layout.groups_count)
        .map(|idx| layout.free_blocks(idx))
        .sum::<u32>()
        .into();
    raw.free_inodes_count = (0..layout.groups_count)
        .map(|idx| layout.free_inodes(idx))
        .sum::<u32>()
        .into();
    raw.first_data_block = layout.first_data_block.into();
    raw.log_block_size = (block_size >> 10).trailing_zeros().into();
    raw.log_frag_size = raw.log_block_size;
    raw.blocks_per_group = layout.blocks_per_group.into();
    raw.frags_per_group = layout.blocks_per_group.into();
    raw.inodes_per_group = layout.inodes_per_group.into();
    raw.max_mnt_count = u16::MAX.into();
    raw.magic = MAGIC_NUM.into();
    raw.state = FsState::VALID.bits().into();
    raw.errors_behaviour = ERRORS_CONTINUE.into();
    raw.rev_level = 1u32.into();
    raw.first_ino = FIRST_INO.into();
    raw.inode_size = (options.inode_size as u16).into();
    raw.feature_incompat = FeatureInCompatSet::FILETYPE.bits().into();
    raw.feature_ro_compat = FeatureRoCompatSet::SPARSE_SUPER.bits().into();
    raw.uuid = options.uuid;
    let label = options.volume_label.as_bytes();
    let label_len = label.len().min(raw.volume_name.len());
    raw.volume_name[..label_len].copy_from_slice(&label[..label_len]);

    let super_block = SuperBlock::try_from(raw)?;
    let geo = super_block.geometry();
    let mut ctx = OpContext::new(device.clone(), geo);
    let result = write_groups(&mut ctx, &layout, raw);
    ctx.finish(result)?;
    write_super_block(device.as_ref(), &super_block)?;

    info!(
        "[ext2] format: block size {}, {} blocks, {} inodes, {} groups",
        block_size, geo.blocks_count, geo.inodes_count, geo.groups_count
    );
    Ok(())
}

fn write_groups(ctx: &mut OpContext, layout: &Layout, raw: RawSuperBlock) -> Result<()> {
    let geo = *ctx.geo();
    let bits_per_block = geo.block_size * 8;
    for bid in geo.gdt_bid..geo.gdt_bid + layout.gdt_blocks {
        ctx.zero_init(bid)?;
    }

    for idx in 0..layout.groups_count {
        let start = layout.group_first_bid(idx);
        let block_bitmap_bid = start + layout.backup_blocks(idx);
        let inode_bitmap_bid = block_bitmap_bid + 1;
        let inode_table_bid = inode_bitmap_bid + 1;
        let nr_blocks = layout.blocks_in_group(idx) as usize;

        let used = layout.overhead(idx) as usize;
        let block_bits = Bitmap::from_slice_mut(ctx.zero_init(block_bitmap_bid)?);
        block_bits[..used].fill(true);
        block_bits[nr_blocks..bits_per_block].fill(true);

        let inode_bits = Bitmap::from_slice_mut(ctx.zero_init(inode_bitmap_bid)?);
        if idx == 0 {
            inode_bits[..(FIRST_INO - 1) as usize].fill(true);
        }
        inode_bits[layout.inodes_per_group as usize..bits_per_block].fill(true);

        for bid in inode_table_bid..inode_table_bid + layout.inode_table_blocks {
            ctx.zero_init(bid)?;
        }

        let desc = GroupDescriptor {
            block_bitmap_bid,
            inode_bitmap_bid,
            inode_table_bid,
            free_blocks_count: layout.free_blocks(idx) as u16,
            free_inodes_count: layout.free_inodes(idx) as u16,
            dirs_count: if idx == 0 { 1 } else { 0 },
        };
        update_descriptor(ctx, idx, |slot| {
            *slot = desc;
            Ok(())
        })?;
    }

    write_root(ctx, layout)?;

    // Group 0 holds the primary copies, which are written last.
    for idx in 1..layout.groups_count {
        if !is_sparse_backup_group(idx) {
            continue;
        }
        let start = layout.group_first_bid(idx);
        let mut backup = raw;
        backup.block_group_idx = (idx as u16).into();
        ctx.zero_init(start)?[..SUPER_BLOCK_SIZE].copy_from_slice(backup.as_bytes());
        for i in 0..layout.gdt_blocks {
            let table = ctx.read_block(geo.gdt_bid + i)?.to_vec();
            ctx.write_from(start + 1 + i, &table)?;
        }
    }
    Ok(())
}

/// Writes the root directory into the first data block of group 0.
fn write_root(ctx: &mut OpContext, layout: &Layout) -> Result<()> {
    let geo = *ctx.geo();
    let bid = layout.group_first_bid(0) + layout.overhead(0);
    let block_bitmap_bid = layout.group_first_bid(0) + layout.backup_blocks(0);
    let idx_in_group = (bid - layout.group_first_bid(0)) as usize;
    Bitmap::from_slice_mut(ctx.modify_block(block_bitmap_bid)?).set(idx_in_group, true);

    ctx.zero_init(bid)?;
    init_dir_block(ctx, bid, ROOT_INO, ROOT_INO)?;

    let perm = FilePerm::from_bits_truncate(0o755);
    let mut root = InodeDesc::new(FileType::Dir, perm, Duration::ZERO);
    root.links_count = 2;
    root.size = geo.block_size as u64;
    root.sectors = geo.sectors_per_block as u32;
    root.block_ptrs.set(0, bid);
    init_inode(ctx, ROOT_INO, &root)
}
