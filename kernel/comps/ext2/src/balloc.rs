// SPDX-License-Identifier: MPL-2.0

//! Allocation of blocks and inodes through the bitmaps of the block groups.
//!
//! Every change made here is mirrored in the descriptor of the group and in the
//! counter delta of the operation context, so that the free counts of the groups
//! and of the superblock agree once the operation commits.

use crate::{
    bitmap::{Bitmap, find_best_fit, first_free},
    block_group::{descriptor_for, search_most_free, search_most_free_blocks, update_descriptor},
    inode::{InodeDesc, init_inode, update_inode},
    op_ctx::OpContext,
    prelude::*,
};

/// Allocates a run of at most `count` blocks, preferably in the group `block_group_idx`.
///
/// The run may be shorter than requested; callers loop until they have enough.
pub(crate) fn allocate_blocks(
    ctx: &mut OpContext,
    block_group_idx: u32,
    count: u32,
) -> Result<Range<Bid>> {
    debug_assert!(count > 0);
    let block_group_idx = pick_block_group(ctx, block_group_idx)?;
    let desc = descriptor_for(ctx, block_group_idx)?;
    let nbits = ctx.geo().blocks_in_group(block_group_idx) as usize;

    let bitmap = ctx.read_block(desc.block_bitmap_bid)?;
    let Some(run) = find_best_fit(&Bitmap::from_slice(bitmap)[..nbits], count as usize) else {
        return Err(ctx.record_error(Error::with_message(
            Errno::EIO,
            "the block bitmap has no free bits but the descriptor has free blocks",
        )));
    };
    Bitmap::from_slice_mut(ctx.modify_block(desc.block_bitmap_bid)?)[run.clone()].fill(true);

    let nr_allocated = run.len() as u16;
    update_descriptor(ctx, block_group_idx, |desc| {
        desc.free_blocks_count = desc
            .free_blocks_count
            .checked_sub(nr_allocated)
            .ok_or(Error::with_message(Errno::EIO, "free blocks count underflow"))?;
        Ok(())
    })?;
    ctx.delta_mut().free_blocks -= nr_allocated as i32;

    let first_bid = ctx.geo().group_first_bid(block_group_idx);
    let range = (first_bid + run.start as Bid)..(first_bid + run.end as Bid);
    debug!(
        "[ext2] allocate blocks {:?} in group {} ({} requested)",
        range, block_group_idx, count
    );
    Ok(range)
}

/// Returns the group to allocate blocks from.
///
/// The preferred group is used while it has free blocks. Then the group chosen
/// by `search_most_free`, and at last the group with the most free blocks.
fn pick_block_group(ctx: &mut OpContext, preferred: u32) -> Result<u32> {
    let preferred = preferred.min(ctx.geo().groups_count - 1);
    if descriptor_for(ctx, preferred)?.free_blocks_count > 0 {
        return Ok(preferred);
    }
    match search_most_free(ctx) {
        Ok(block_group_idx) if descriptor_for(ctx, block_group_idx)?.free_blocks_count > 0 => {
            return Ok(block_group_idx);
        }
        Err(err) if err.error() != Errno::ENOSPC => return Err(err),
        _ => {}
    }
    search_most_free_blocks(ctx).map_err(|err| ctx.record_error(err))
}

/// Frees the blocks in `range`, which may span several groups.
pub(crate) fn free_blocks(ctx: &mut OpContext, range: Range<Bid>) -> Result<()> {
    let mut start = range.start;
    while start < range.end {
        let (block_group_idx, idx) = ctx
            .geo()
            .locate_bid(start)
            .map_err(|err| ctx.record_error(err))?;
        let len = (range.end - start).min(ctx.geo().blocks_per_group - idx);
        let desc = descriptor_for(ctx, block_group_idx)?;

        let bits = Bitmap::from_slice_mut(ctx.modify_block(desc.block_bitmap_bid)?);
        let span = (idx as usize)..((idx + len) as usize);
        let all_used = bits[span.clone()].all();
        if all_used {
            bits[span].fill(false);
        } else {
            return Err(ctx.record_error(Error::with_message(
                Errno::EIO,
                "freeing a block that is already free",
            )));
        }

        update_descriptor(ctx, block_group_idx, |desc| {
            desc.free_blocks_count = desc
                .free_blocks_count
                .checked_add(len as u16)
                .ok_or(Error::with_message(Errno::EIO, "free blocks count overflow"))?;
            Ok(())
        })?;
        ctx.delta_mut().free_blocks += len as i32;
        trace!(
            "[ext2] free blocks {}..{} in group {}",
            start,
            start + len,
            block_group_idx
        );
        start += len;
    }
    Ok(())
}

/// Allocates an inode, preferably in the group `block_group_idx`, and initializes
/// its record with `template`.
///
/// Returns the inode number.
pub(crate) fn allocate_inode(
    ctx: &mut OpContext,
    block_group_idx: u32,
    template: &InodeDesc,
) -> Result<u32> {
    let groups_count = ctx.geo().groups_count;
    let inodes_per_group = ctx.geo().inodes_per_group;
    let first_ino = ctx.geo().first_ino;
    for step in 0..groups_count {
        let group = (block_group_idx + step) % groups_count;
        let desc = descriptor_for(ctx, group)?;
        if desc.free_inodes_count == 0 {
            continue;
        }

        // The reserved inodes at the start of group 0 are never handed out.
        let skip = if group == 0 {
            (first_ino - 1).min(inodes_per_group) as usize
        } else {
            0
        };
        let bitmap = ctx.read_block(desc.inode_bitmap_bid)?;
        let Some(idx) = first_free(&Bitmap::from_slice(bitmap)[skip..inodes_per_group as usize])
            .map(|idx| idx + skip)
        else {
            return Err(ctx.record_error(Error::with_message(
                Errno::EIO,
                "the inode bitmap has no free bits but the descriptor has free inodes",
            )));
        };
        Bitmap::from_slice_mut(ctx.modify_block(desc.inode_bitmap_bid)?).set(idx, true);

        let is_dir = template.is_dir();
        update_descriptor(ctx, group, |desc| {
            desc.free_inodes_count -= 1;
            if is_dir {
                desc.dirs_count += 1;
            }
            Ok(())
        })?;
        ctx.delta_mut().free_inodes -= 1;

        let ino = group * inodes_per_group + idx as u32 + 1;
        init_inode(ctx, ino, template)?;
        debug!("[ext2] allocate inode {} in group {}", ino, group);
        return Ok(ino);
    }
    Err(ctx.record_error(Error::with_message(Errno::ENOSPC, "no free inodes")))
}

/// Frees the inode `ino` and stamps its deletion time.
///
/// The blocks of the inode must have been freed before.
pub(crate) fn free_inode(ctx: &mut OpContext, ino: u32, now: Duration) -> Result<()> {
    let (block_group_idx, idx) = ctx
        .geo()
        .locate_ino(ino)
        .map_err(|err| ctx.record_error(err))?;
    let desc = descriptor_for(ctx, block_group_idx)?;

    let bits = Bitmap::from_slice_mut(ctx.modify_block(desc.inode_bitmap_bid)?);
    let was_used = bits.replace(idx as usize, false);
    if !was_used {
        return Err(ctx.record_error(Error::with_message(
            Errno::EIO,
            "freeing an inode that is already free",
        )));
    }

    let is_dir = update_inode(ctx, ino, |inode| {
        inode.dtime = now;
        Ok(inode.is_dir())
    })?;
    update_descriptor(ctx, block_group_idx, |desc| {
        desc.free_inodes_count += 1;
        if is_dir {
            desc.dirs_count = desc.dirs_count.saturating_sub(1);
        }
        Ok(())
    })?;
    ctx.delta_mut().free_inodes += 1;
    ctx.memo().clear();
    debug!("[ext2] free inode {}", ino);
    Ok(())
}

/// Returns whether the inode `ino` is in use.
pub(crate) fn is_inode_allocated(ctx: &mut OpContext, ino: u32) -> Result<bool> {
    let Ok((block_group_idx, idx)) = ctx.geo().locate_ino(ino) else {
        return Ok(false);
    };
    let desc = descriptor_for(ctx, block_group_idx)?;
    let bitmap = ctx.read_block(desc.inode_bitmap_bid)?;
    Ok(Bitmap::from_slice(bitmap)[idx as usize])
}
