// SPDX-License-Identifier: MPL-2.0

//! The mapping from the logical blocks of a file to device blocks.
//!
//! The first 12 logical blocks are pointed to by the direct slots of the inode.
//! The following ones go through the singly, doubly and treble indirect slots,
//! whose index blocks hold `block_size / 4` pointers each.

use crate::{
    balloc::{allocate_blocks, free_blocks},
    block_ptr::{BID_SIZE, BidPath},
    distribution::distribute,
    inode::InodeDesc,
    op_ctx::{MemoKey, OpContext},
    prelude::*,
};

/// The free blocks handed to the mapper while a file grows.
///
/// Index blocks and data blocks are taken from separate runs. The cursor is
/// passed by value into `set_block` and handed back with what remains.
#[derive(Debug, Default)]
pub(crate) struct AllocCursor {
    index: Vec<Range<Bid>>,
    data: Range<Bid>,
}

impl AllocCursor {
    fn take_index(&mut self) -> Result<Bid> {
        while let Some(run) = self.index.last_mut() {
            if let Some(bid) = run.next() {
                return Ok(bid);
            }
            self.index.pop();
        }
        return_errno_with_message!(Errno::ENOSPC, "no index block left in the cursor")
    }

    fn take_data(&mut self) -> Result<Bid> {
        self.data
            .next()
            .ok_or(Error::with_message(Errno::ENOSPC, "no data block left in the cursor"))
    }

    fn has_data(&self) -> bool {
        !self.data.is_empty()
    }

    /// Returns the runs that were not consumed.
    fn into_leftovers(self) -> impl Iterator<Item = Range<Bid>> {
        self.index
            .into_iter()
            .chain(core::iter::once(self.data))
            .filter(|run| !run.is_empty())
    }
}

/// Returns the device block of the logical block `lblock`, or 0 if it is not mapped.
pub(crate) fn get_block(ctx: &mut OpContext, inode: &InodeDesc, lblock: u32) -> Result<Bid> {
    let path = BidPath::new(lblock, ctx.geo().ptrs_per_block)?;
    let root = inode.block_ptrs.get(path.root_slot());
    if matches!(path, BidPath::Direct(_)) || root == 0 {
        return Ok(root);
    }

    let (indices, depth) = path.lvl_indices();
    let key = memo_key(inode, &path);
    let leaf = match ctx.memo().lookup(&key) {
        Some(leaf) => leaf,
        None => {
            let mut bid = root;
            for idx in indices.iter().take(depth - 1) {
                bid = ptr_at(ctx.read_block(bid)?, *idx);
                if bid == 0 {
                    return Ok(0);
                }
            }
            if key.first_ptr != 0 {
                ctx.memo().remember(key, bid);
            }
            bid
        }
    };
    Ok(ptr_at(ctx.read_block(leaf)?, indices[depth - 1]))
}

/// Maps the logical block `lblock`, allocating the data block and the missing
/// index blocks on the way from `cursor`.
///
/// Returns the device block and the rest of the cursor. New blocks are zeroed.
pub(crate) fn set_block(
    ctx: &mut OpContext,
    inode: &mut InodeDesc,
    lblock: u32,
    mut cursor: AllocCursor,
) -> Result<(Bid, AllocCursor)> {
    let path = BidPath::new(lblock, ctx.geo().ptrs_per_block)?;
    let slot = path.root_slot();

    if matches!(path, BidPath::Direct(_)) {
        let existing = inode.block_ptrs.get(slot);
        if existing != 0 {
            return Ok((existing, cursor));
        }
        let bid = cursor.take_data()?;
        ctx.zero_init(bid)?;
        inode.block_ptrs.set(slot, bid);
        return Ok((bid, cursor));
    }

    let (indices, depth) = path.lvl_indices();
    let key = memo_key(inode, &path);
    let mut parent = inode.block_ptrs.get(slot);
    if parent == 0 {
        parent = cursor.take_index()?;
        ctx.zero_init(parent)?;
        inode.block_ptrs.set(slot, parent);
    }

    let leaf = match ctx.memo().lookup(&key) {
        Some(leaf) => leaf,
        None => {
            for idx in indices.iter().take(depth - 1) {
                let child = ptr_at(ctx.read_block(parent)?, *idx);
                parent = if child != 0 {
                    child
                } else {
                    let new_bid = cursor.take_index()?;
                    ctx.zero_init(new_bid)?;
                    set_ptr_at(ctx.modify_block(parent)?, *idx, new_bid);
                    new_bid
                };
            }
            if key.first_ptr != 0 {
                ctx.memo().remember(key, parent);
            }
            parent
        }
    };

    let last_idx = indices[depth - 1];
    let existing = ptr_at(ctx.read_block(leaf)?, last_idx);
    if existing != 0 {
        return Ok((existing, cursor));
    }
    let bid = cursor.take_data()?;
    ctx.zero_init(bid)?;
    set_ptr_at(ctx.modify_block(leaf)?, last_idx, bid);
    Ok((bid, cursor))
}

/// Grows the file `ino` to hold `target` data blocks.
///
/// The index blocks are allocated first, then the data blocks run by run.
/// The sector count is always updated; the size only if `update_size` is set.
pub(crate) fn expand(
    ctx: &mut OpContext,
    ino: u32,
    inode: &mut InodeDesc,
    target: u32,
    update_size: bool,
) -> Result<()> {
    let geo = *ctx.geo();
    if target as u64 > geo.max_file_blocks() {
        return Err(ctx.record_error(Error::with_message(
            Errno::EFBIG,
            "the file would exceed the block map",
        )));
    }
    let before = distribute(
        geo.block_size,
        inode.nr_blocks(geo.sectors_per_block),
        true,
    );
    let after = distribute(geo.block_size, target, false);
    if after.data_total <= before.data_total {
        return Ok(());
    }
    let Ok(sectors) = u32::try_from(after.blocks_total() as u64 * geo.sectors_per_block) else {
        return Err(ctx.record_error(Error::with_message(
            Errno::EFBIG,
            "the sector count would overflow",
        )));
    };

    let block_group_idx = (ino - 1) / geo.inodes_per_group;
    let mut cursor = AllocCursor::default();
    let mut index_needed = after.index_total.saturating_sub(before.index_total);
    while index_needed > 0 {
        let run = allocate_blocks(ctx, block_group_idx, index_needed)?;
        index_needed -= run.len() as u32;
        cursor.index.push(run);
    }

    for lblock in before.data_total..after.data_total {
        if !cursor.has_data() {
            cursor.data = allocate_blocks(ctx, block_group_idx, after.data_total - lblock)?;
        }
        let (_, rest) = set_block(ctx, inode, lblock, cursor)?;
        cursor = rest;
    }
    for run in cursor.into_leftovers() {
        free_blocks(ctx, run)?;
    }

    inode.sectors = sectors;
    if update_size {
        inode.size = after.data_total as u64 * geo.block_size as u64;
    }
    trace!(
        "[ext2] expand inode {} from {} to {} data blocks",
        ino, before.data_total, after.data_total
    );
    Ok(())
}

/// Frees every block of the file and empties it.
///
/// The walk covers both the blocks implied by the sector count and the blocks
/// under the size, so the holes of a sparse file are skipped.
pub(crate) fn truncate(ctx: &mut OpContext, inode: &mut InodeDesc) -> Result<()> {
    let geo = *ctx.geo();
    let dist = distribute(
        geo.block_size,
        inode.nr_blocks(geo.sectors_per_block),
        true,
    );
    // An inline symlink keeps its target, not block numbers, in the pointers.
    let nr_lblocks = if inode.is_fast_symlink() {
        0
    } else {
        let by_size = inode
            .size
            .div_ceil(geo.block_size as u64)
            .min(geo.max_file_blocks()) as u32;
        dist.data_total.max(by_size)
    };

    let mut index_blocks = BTreeSet::new();
    let mut pending: Option<Range<Bid>> = None;
    let mut nr_freed = 0u32;
    let mut lblock = 0;
    while lblock < nr_lblocks {
        let path = BidPath::new(lblock, geo.ptrs_per_block)?;
        // The direct slots or the leaf index block cover the next `cnt` blocks.
        let cnt = path
            .cnt_to_next_indirect(geo.ptrs_per_block)
            .min(nr_lblocks - lblock);
        let first_idx = path.last_lvl_idx();
        let data_bids: Vec<Bid> = if matches!(path, BidPath::Direct(_)) {
            (0..cnt as usize)
                .map(|i| inode.block_ptrs.get(first_idx + i))
                .collect()
        } else {
            let leaf = walk_to_leaf(ctx, inode, &path, &mut index_blocks)?;
            if leaf == 0 {
                Vec::new()
            } else {
                let bytes = ctx.read_block(leaf)?;
                (0..cnt as usize)
                    .map(|i| ptr_at(bytes, first_idx + i))
                    .collect()
            }
        };
        for bid in data_bids.into_iter().filter(|bid| *bid != 0) {
            nr_freed += 1;
            coalesce_free(ctx, &mut pending, bid)?;
        }
        lblock += cnt;
    }
    for bid in index_blocks {
        nr_freed += 1;
        coalesce_free(ctx, &mut pending, bid)?;
    }
    if let Some(run) = pending {
        free_blocks(ctx, run)?;
    }

    if nr_freed != dist.blocks_total() {
        warn!(
            "[ext2] freed {} blocks, but the sector count accounts for {}",
            nr_freed,
            dist.blocks_total()
        );
    }
    inode.block_ptrs.clear();
    inode.size = 0;
    inode.sectors = 0;
    ctx.memo().clear();
    Ok(())
}

/// Changes the size of the file `ino` to `new_size`.
///
/// Growing allocates zeroed blocks. Shrinking to zero frees every block.
/// Shrinking to a non-zero size zeroes the bytes past the new end and keeps
/// the blocks.
pub(crate) fn resize(
    ctx: &mut OpContext,
    ino: u32,
    inode: &mut InodeDesc,
    new_size: u64,
) -> Result<()> {
    let geo = *ctx.geo();
    if new_size > geo.max_file_size() {
        return_errno_with_message!(Errno::EFBIG, "the size exceeds the maximum file size");
    }
    let old_size = inode.size;
    if new_size > old_size {
        let target = new_size.div_ceil(geo.block_size as u64) as u32;
        expand(ctx, ino, inode, target, false)?;
        inode.size = new_size;
    } else if new_size == 0 {
        truncate(ctx, inode)?;
    } else if new_size < old_size {
        zero_range(ctx, inode, new_size..old_size)?;
        inode.size = new_size;
    }
    Ok(())
}

/// Zeroes the mapped bytes of the file in `range`.
fn zero_range(ctx: &mut OpContext, inode: &InodeDesc, range: Range<u64>) -> Result<()> {
    let block_size = ctx.geo().block_size as u64;
    let mut offset = range.start;
    while offset < range.end {
        let lblock = (offset / block_size) as u32;
        let in_block = (offset % block_size) as usize;
        let len = (block_size - in_block as u64).min(range.end - offset) as usize;
        let bid = get_block(ctx, inode, lblock)?;
        if bid != 0 {
            if len == block_size as usize {
                ctx.zero_init(bid)?;
            } else {
                ctx.modify_block(bid)?[in_block..in_block + len].fill(0);
            }
        }
        offset += len as u64;
    }
    Ok(())
}

/// Collects the index blocks from the root slot down to the leaf index block of
/// `path` and returns the leaf, or 0 if the path is not mapped.
fn walk_to_leaf(
    ctx: &mut OpContext,
    inode: &InodeDesc,
    path: &BidPath,
    index_blocks: &mut BTreeSet<Bid>,
) -> Result<Bid> {
    let (indices, depth) = path.lvl_indices();
    let mut bid = inode.block_ptrs.get(path.root_slot());
    for idx in indices.iter().take(depth - 1) {
        if bid == 0 {
            return Ok(0);
        }
        index_blocks.insert(bid);
        bid = ptr_at(ctx.read_block(bid)?, *idx);
    }
    if bid != 0 {
        index_blocks.insert(bid);
    }
    Ok(bid)
}

/// Adds `bid` to the pending run, freeing the run first if `bid` does not extend it.
fn coalesce_free(ctx: &mut OpContext, pending: &mut Option<Range<Bid>>, bid: Bid) -> Result<()> {
    match pending {
        Some(run) if run.end == bid => run.end += 1,
        _ => {
            if let Some(run) = pending.replace(bid..bid + 1) {
                free_blocks(ctx, run)?;
            }
        }
    }
    Ok(())
}

fn memo_key(inode: &InodeDesc, path: &BidPath) -> MemoKey {
    let (indices, depth) = path.lvl_indices();
    let mut upper = [0; 2];
    for (slot, idx) in upper.iter_mut().zip(indices.iter().take(depth - 1)) {
        *slot = *idx;
    }
    MemoKey {
        first_ptr: inode.block_ptrs.first(),
        root_slot: path.root_slot(),
        upper,
    }
}

fn ptr_at(bytes: &[u8], idx: usize) -> Bid {
    let offset = idx * BID_SIZE;
    let mut raw = [0u8; BID_SIZE];
    raw.copy_from_slice(&bytes[offset..offset + BID_SIZE]);
    Bid::from_le_bytes(raw)
}

fn set_ptr_at(bytes: &mut [u8], idx: usize, bid: Bid) {
    let offset = idx * BID_SIZE;
    bytes[offset..offset + BID_SIZE].copy_from_slice(&bid.to_le_bytes());
}
