// SPDX-License-Identifier: MPL-2.0

//! Searches over the free bitmaps.
//!
//! A set bit marks a used block or inode. Bit `i` lives in byte `i / 8`,
//! at position `i % 8` counting from the least significant bit.

use bitvec::prelude::{BitSlice, Lsb0};

use crate::prelude::*;

/// The view of an on-disk bitmap.
pub type Bitmap = BitSlice<u8, Lsb0>;

/// Finds the free run for an allocation of `count` bits.
///
/// Among the free runs that are at least `count` long, the shortest one wins,
/// and the first of equally short runs is kept. The returned range is the
/// first `count` bits of that run. If no run is long enough, the whole of
/// the longest run is returned instead, which makes a partial allocation.
pub fn find_best_fit(bits: &Bitmap, count: usize) -> Option<Range<usize>> {
    if count == 0 {
        return None;
    }

    let mut fit: Option<Range<usize>> = None;
    let mut longest: Option<Range<usize>> = None;
    let mut pos = 0;
    while pos < bits.len() {
        let Some(offset) = bits[pos..].first_zero() else {
            break;
        };
        let start = pos + offset;
        let len = bits[start..].first_one().unwrap_or(bits.len() - start);
        let run = start..start + len;
        pos = run.end;

        if len >= count {
            if fit.as_ref().is_none_or(|fit| len < fit.len()) {
                fit = Some(run);
            }
            if len == count {
                break;
            }
        } else if longest.as_ref().is_none_or(|longest| len > longest.len()) {
            longest = Some(run);
        }
    }

    match fit {
        Some(fit) => Some(fit.start..fit.start + count),
        None => longest,
    }
}

/// Returns the first free bit.
pub fn first_free(bits: &Bitmap) -> Option<usize> {
    bits.first_zero()
}
