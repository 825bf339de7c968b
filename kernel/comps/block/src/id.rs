// SPDX-License-Identifier: MPL-2.0

use core::ops::{Add, AddAssign};

use crate::SECTOR_SIZE;

/// The ID of a sector on a block device.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Sid(u64);

impl Sid {
    /// Constructs an ID from a raw sector number.
    pub const fn new(raw_id: u64) -> Self {
        Self(raw_id)
    }

    /// Constructs the ID of the sector that contains the byte at `offset`.
    pub const fn from_offset(offset: usize) -> Self {
        Self((offset / SECTOR_SIZE) as u64)
    }

    /// Returns the raw sector number.
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// Returns the byte offset of the first byte of the sector.
    pub const fn to_offset(self) -> usize {
        (self.0 as usize) * SECTOR_SIZE
    }
}

impl Add<u64> for Sid {
    type Output = Self;

    fn add(self, other: u64) -> Self::Output {
        Self(self.0 + other)
    }
}

impl AddAssign<u64> for Sid {
    fn add_assign(&mut self, other: u64) {
        self.0 += other;
    }
}

impl From<Sid> for u64 {
    fn from(sid: Sid) -> u64 {
        sid.0
    }
}
