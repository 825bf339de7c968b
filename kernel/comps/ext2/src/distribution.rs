// SPDX-License-Identifier: MPL-2.0

//! How the blocks of a file split into data blocks and index blocks.

use crate::{
    block_ptr::{BID_SIZE, MAX_DIRECT_BLOCKS},
    prelude::*,
};

/// The number of index blocks and data blocks of a file.
///
/// For the triply-indirect tree, `triply_second` counts the index blocks
/// referenced by the triply-indirect block (one per S² data blocks) and
/// `triply_third` counts the leaf index blocks (one per S data blocks),
/// where S is the number of pointers in an index block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Distribution {
    pub singly: u32,
    pub doubly: u32,
    pub doubly_second: u32,
    pub triply: u32,
    pub triply_second: u32,
    pub triply_third: u32,
    pub index_total: u32,
    pub data_total: u32,
}

impl Distribution {
    /// Returns the number of blocks occupied on the device.
    pub fn blocks_total(&self) -> u32 {
        self.index_total + self.data_total
    }
}

/// Computes the distribution of `count` blocks.
///
/// If `inclusive` is false, `count` is the number of data blocks to hold.
/// Otherwise `count` is the total number of blocks (index blocks included)
/// that a file occupies, as derived from the sector count of its inode.
pub fn distribute(block_size: usize, count: u32, inclusive: bool) -> Distribution {
    let ptrs = (block_size / BID_SIZE) as u64;
    let data = if inclusive {
        data_blocks_within(count as u64, ptrs)
    } else {
        count as u64
    };
    for_data_blocks(data, ptrs)
}

fn for_data_blocks(data: u64, ptrs: u64) -> Distribution {
    let mut dist = Distribution {
        data_total: data as u32,
        ..Default::default()
    };

    let mut remaining = data.saturating_sub(MAX_DIRECT_BLOCKS as u64);
    if remaining > 0 {
        dist.singly = 1;
        remaining -= remaining.min(ptrs);
    }
    if remaining > 0 {
        let covered = remaining.min(ptrs * ptrs);
        dist.doubly = 1;
        dist.doubly_second = covered.div_ceil(ptrs) as u32;
        remaining -= covered;
    }
    if remaining > 0 {
        let covered = remaining.min(ptrs * ptrs * ptrs);
        dist.triply = 1;
        dist.triply_second = covered.div_ceil(ptrs * ptrs) as u32;
        dist.triply_third = covered.div_ceil(ptrs) as u32;
    }

    dist.index_total = dist.singly
        + dist.doubly
        + dist.doubly_second
        + dist.triply
        + dist.triply_second
        + dist.triply_third;
    dist
}

/// Returns how many of `total` blocks are data blocks, charging every index
/// block against the budget as soon as it is needed.
fn data_blocks_within(total: u64, ptrs: u64) -> u64 {
    let direct = total.min(MAX_DIRECT_BLOCKS as u64);
    let mut budget = total - direct;
    let mut data = direct;
    for depth in 1..=3 {
        if budget == 0 {
            break;
        }
        let (subtree_data, used) = fill_subtree(budget, ptrs, depth);
        data += subtree_data;
        budget -= used;
    }
    data
}

/// Fills an index tree of `depth` levels with at most `budget` blocks.
///
/// Returns the number of data blocks and the number of blocks used in total.
fn fill_subtree(budget: u64, ptrs: u64, depth: u32) -> (u64, u64) {
    if budget == 0 {
        return (0, 0);
    }
    // The cost and the capacity of a full child.
    let child_data = ptrs.pow(depth - 1);
    let child_cost = (0..depth).map(|level| ptrs.pow(level)).sum::<u64>();

    let mut budget = budget - 1;
    let full_children = (budget / child_cost).min(ptrs);
    let mut data = full_children * child_data;
    let mut used = 1 + full_children * child_cost;
    budget -= full_children * child_cost;

    if depth > 1 && full_children < ptrs && budget > 0 {
        let (partial_data, partial_used) = fill_subtree(budget, ptrs, depth - 1);
        data += partial_data;
        used += partial_used;
    }
    (data, used)
}
