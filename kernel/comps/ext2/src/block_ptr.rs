// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;

/// The 15 block number slots of an inode.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct BlockPtrs {
    inner: [Bid; MAX_BLOCK_PTRS],
}

impl BlockPtrs {
    pub fn from_raw(inner: [Bid; MAX_BLOCK_PTRS]) -> Self {
        Self { inner }
    }

    pub fn to_raw(&self) -> [Bid; MAX_BLOCK_PTRS] {
        self.inner
    }

    /// Returns the block ID in the pointer slot `slot`.
    ///
    /// # Panics
    ///
    /// If the `slot` is out of bounds, this method will panic.
    pub fn get(&self, slot: usize) -> Bid {
        self.inner[slot]
    }

    /// Sets the block ID in the pointer slot `slot`.
    ///
    /// # Panics
    ///
    /// If the `slot` is out of bounds, this method will panic.
    pub fn set(&mut self, slot: usize, bid: Bid) {
        self.inner[slot] = bid;
    }

    /// Returns the block ID of the first direct block pointer.
    pub fn first(&self) -> Bid {
        self.inner[0]
    }

    /// Zeroes every slot.
    pub fn clear(&mut self) {
        self.inner = [0; MAX_BLOCK_PTRS];
    }
}

/// Where the block number of a logical block is stored.
///
/// The indices are slots inside the index blocks on the way down, from the
/// block named by the inode to the one holding the block number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BidPath {
    /// In the direct slot of the inode.
    Direct(u16),
    /// In the singly indirect block.
    Indirect(u16),
    /// Below the doubly indirect block: (first level, leaf).
    DbIndirect(u16, u16),
    /// Below the triply indirect block: (first level, second level, leaf).
    TbIndirect(u16, u16, u16),
}

impl BidPath {
    /// Routes the logical block `lblock` of a volume whose index blocks hold
    /// `ptrs_per_block` pointers.
    pub fn new(lblock: u32, ptrs_per_block: u32) -> Result<Self> {
        let s = ptrs_per_block as u64;
        let mut bid = lblock as u64;
        if bid < MAX_DIRECT_BLOCKS as u64 {
            return Ok(Self::Direct(bid as u16));
        }
        bid -= MAX_DIRECT_BLOCKS as u64;
        if bid < s {
            return Ok(Self::Indirect(bid as u16));
        }
        bid -= s;
        if bid < s * s {
            return Ok(Self::DbIndirect((bid / s) as u16, (bid % s) as u16));
        }
        bid -= s * s;
        if bid < s * s * s {
            let lvl1_idx = (bid / (s * s)) as u16;
            let lvl2_idx = ((bid / s) % s) as u16;
            let lvl3_idx = (bid % s) as u16;
            return Ok(Self::TbIndirect(lvl1_idx, lvl2_idx, lvl3_idx));
        }
        return_errno_with_message!(Errno::EFBIG, "the logical block is beyond the block map")
    }

    /// Returns the slot in the inode where the path starts.
    pub fn root_slot(&self) -> usize {
        match self {
            Self::Direct(idx) => *idx as usize,
            Self::Indirect(_) => INDIRECT,
            Self::DbIndirect(..) => DB_INDIRECT,
            Self::TbIndirect(..) => TB_INDIRECT,
        }
    }

    /// Returns the indices inside the index blocks along the path, from the
    /// block referenced by the root slot down to the leaf index block.
    pub fn lvl_indices(&self) -> ([usize; 3], usize) {
        match *self {
            Self::Direct(_) => ([0; 3], 0),
            Self::Indirect(a) => ([a as usize, 0, 0], 1),
            Self::DbIndirect(a, b) => ([a as usize, b as usize, 0], 2),
            Self::TbIndirect(a, b, c) => ([a as usize, b as usize, c as usize], 3),
        }
    }

    /// Returns how many consecutive logical blocks, this one included, share
    /// the leaf index block (or the direct slots) of this path.
    pub fn cnt_to_next_indirect(&self, ptrs_per_block: u32) -> u32 {
        match self {
            Self::Direct(idx) => MAX_DIRECT_BLOCKS - (*idx as u32),
            Self::Indirect(idx) | Self::DbIndirect(_, idx) | Self::TbIndirect(_, _, idx) => {
                ptrs_per_block - (*idx as u32)
            }
        }
    }

    /// Returns the slot in the leaf index block, or the direct slot.
    pub fn last_lvl_idx(&self) -> usize {
        match self {
            Self::Direct(idx)
            | Self::Indirect(idx)
            | Self::DbIndirect(_, idx)
            | Self::TbIndirect(_, _, idx) => *idx as _,
        }
    }
}

/// Slots of the direct block numbers.
pub const DIRECT_RANGE: core::ops::Range<usize> = 0..12;
pub const MAX_DIRECT_BLOCKS: u32 = DIRECT_RANGE.end as u32;

/// Slot of the singly indirect block.
pub const INDIRECT: usize = DIRECT_RANGE.end;
/// Slot of the doubly indirect block.
pub const DB_INDIRECT: usize = INDIRECT + 1;
/// Slot of the triply indirect block.
pub const TB_INDIRECT: usize = DB_INDIRECT + 1;

pub const MAX_BLOCK_PTRS: usize = TB_INDIRECT + 1;

/// The size of of the block id.
pub const BID_SIZE: usize = core::mem::size_of::<Bid>();
