// SPDX-License-Identifier: MPL-2.0

//! The block group descriptor table.
//!
//! Blocks are clustered into block groups in order to reduce fragmentation and minimise
//! the amount of head seeking when reading a large amount of consecutive data.
//! Each group is described by a descriptor in the table that starts on the block
//! following the superblock.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    little_endian::{U16, U32},
};

use crate::{op_ctx::OpContext, prelude::*, super_block::Geometry};

/// The in-memory rust block group descriptor.
///
/// The block group descriptor contains information regarding where important data
/// structures for that group are located.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupDescriptor {
    /// Blocks usage bitmap block
    pub block_bitmap_bid: Bid,
    /// Inodes usage bitmap block
    pub inode_bitmap_bid: Bid,
    /// Starting block of inode table
    pub inode_table_bid: Bid,
    /// Number of free blocks in group
    pub free_blocks_count: u16,
    /// Number of free inodes in group
    pub free_inodes_count: u16,
    /// Number of directories in group
    pub dirs_count: u16,
}

impl From<RawGroupDescriptor> for GroupDescriptor {
    fn from(desc: RawGroupDescriptor) -> Self {
        Self {
            block_bitmap_bid: desc.block_bitmap.get(),
            inode_bitmap_bid: desc.inode_bitmap.get(),
            inode_table_bid: desc.inode_table.get(),
            free_blocks_count: desc.free_blocks_count.get(),
            free_inodes_count: desc.free_inodes_count.get(),
            dirs_count: desc.dirs_count.get(),
        }
    }
}

const_assert!(core::mem::size_of::<RawGroupDescriptor>() == 32);

/// The size of a descriptor on the device.
pub const DESCRIPTOR_SIZE: usize = core::mem::size_of::<RawGroupDescriptor>();

/// The raw block group descriptor.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RawGroupDescriptor {
    pub block_bitmap: U32,
    pub inode_bitmap: U32,
    pub inode_table: U32,
    pub free_blocks_count: U16,
    pub free_inodes_count: U16,
    pub dirs_count: U16,
    pad: U16,
    reserved: [U32; 3],
}

impl From<&GroupDescriptor> for RawGroupDescriptor {
    fn from(desc: &GroupDescriptor) -> Self {
        Self {
            block_bitmap: desc.block_bitmap_bid.into(),
            inode_bitmap: desc.inode_bitmap_bid.into(),
            inode_table: desc.inode_table_bid.into(),
            free_blocks_count: desc.free_blocks_count.into(),
            free_inodes_count: desc.free_inodes_count.into(),
            dirs_count: desc.dirs_count.into(),
            pad: U16::new(0),
            reserved: [U32::new(0); 3],
        }
    }
}

/// Returns the block holding the descriptor of the group and the offset inside it.
pub fn descriptor_location(geo: &Geometry, block_group_idx: u32) -> (Bid, usize) {
    let offset = block_group_idx as usize * DESCRIPTOR_SIZE;
    let bid = geo.gdt_bid + (offset / geo.block_size) as Bid;
    (bid, offset % geo.block_size)
}

/// Returns the number of blocks taken by a descriptor table of `groups_count` groups.
pub fn descriptor_table_blocks(groups_count: u32, block_size: usize) -> u32 {
    (groups_count as usize * DESCRIPTOR_SIZE).div_ceil(block_size) as u32
}

/// Reads the descriptor of the group.
pub(crate) fn descriptor_for(ctx: &mut OpContext, block_group_idx: u32) -> Result<GroupDescriptor> {
    let (bid, offset) = locate(ctx, block_group_idx)?;
    let bytes = ctx.read_block(bid)?;
    let raw = RawGroupDescriptor::read_from_bytes(&bytes[offset..offset + DESCRIPTOR_SIZE])
        .map_err(|_| Error::with_message(Errno::EIO, "truncated group descriptor"))?;
    Ok(GroupDescriptor::from(raw))
}

/// Applies `f` to the descriptor of the group and stores the result in its dirty block.
pub(crate) fn update_descriptor<F, T>(
    ctx: &mut OpContext,
    block_group_idx: u32,
    f: F,
) -> Result<T>
where
    F: FnOnce(&mut GroupDescriptor) -> Result<T>,
{
    let mut desc = descriptor_for(ctx, block_group_idx)?;
    let ret = f(&mut desc)?;
    let (bid, offset) = locate(ctx, block_group_idx)?;
    let raw = RawGroupDescriptor::from(&desc);
    ctx.modify_block(bid)?[offset..offset + DESCRIPTOR_SIZE].copy_from_slice(raw.as_bytes());
    Ok(ret)
}

/// Returns the group with the most free blocks among the groups that still have
/// free inodes.
///
/// Only descriptors are read; the bitmaps are not.
pub(crate) fn search_most_free(ctx: &mut OpContext) -> Result<u32> {
    search_by_free_blocks(ctx, true)?
        .ok_or_else(|| Error::with_message(Errno::ENOSPC, "no group has free inodes"))
}

/// Returns the group with the most free blocks, whether it has free inodes or not.
pub(crate) fn search_most_free_blocks(ctx: &mut OpContext) -> Result<u32> {
    search_by_free_blocks(ctx, false)?
        .ok_or_else(|| Error::with_message(Errno::ENOSPC, "no free blocks"))
}

fn search_by_free_blocks(ctx: &mut OpContext, need_inode: bool) -> Result<Option<u32>> {
    let mut best: Option<(u32, u16)> = None;
    for block_group_idx in 0..ctx.geo().groups_count {
        let desc = descriptor_for(ctx, block_group_idx)?;
        let qualifies = if need_inode {
            desc.free_inodes_count > 0
        } else {
            desc.free_blocks_count > 0
        };
        if !qualifies {
            continue;
        }
        if best.is_none_or(|(_, most)| desc.free_blocks_count > most) {
            best = Some((block_group_idx, desc.free_blocks_count));
        }
    }
    Ok(best.map(|(block_group_idx, _)| block_group_idx))
}

fn locate(ctx: &OpContext, block_group_idx: u32) -> Result<(Bid, usize)> {
    if block_group_idx >= ctx.geo().groups_count {
        return_errno_with_message!(Errno::EIO, "block group out of range");
    }
    Ok(descriptor_location(ctx.geo(), block_group_idx))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::op_ctx::test::test_geometry;

    #[test]
    fn descriptors_span_blocks() {
        let mut geo = test_geometry();
        geo.groups_count = 40;
        assert_eq!(descriptor_location(&geo, 0), (2, 0));
        assert_eq!(descriptor_location(&geo, 31), (2, 31 * 32));
        assert_eq!(descriptor_location(&geo, 32), (3, 0));
        assert_eq!(descriptor_table_blocks(geo.groups_count, geo.block_size), 2);
    }
}
