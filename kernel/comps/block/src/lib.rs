// SPDX-License-Identifier: MPL-2.0

//! The block devices that file systems are mounted on.
//!
//! A block device is addressed in fixed-size sectors of [`SECTOR_SIZE`] bytes.
//! File systems with larger logical blocks scale their block numbers by
//! "sectors per block" before they reach this layer.
//!
//! [`MemDisk`] is a memory-backed device. It can be formatted and mounted
//! like any other device, which makes it the device of choice for tests.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod bio;
pub mod id;
mod mem_disk;

use core::fmt::Debug;

pub use self::{
    bio::BioStatus,
    id::Sid,
    mem_disk::{FaultKind, MemDisk},
};

/// The size of a sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// A device that stores data in sectors.
///
/// All transfers are synchronous: the calling thread blocks until the
/// device has finished with the buffer.
pub trait BlockDevice: Send + Sync + Debug {
    /// Reads `buf.len() / SECTOR_SIZE` contiguous sectors starting at `sid`.
    ///
    /// The length of `buf` must be a multiple of [`SECTOR_SIZE`].
    fn read_sectors(&self, sid: Sid, buf: &mut [u8]) -> BioStatus;

    /// Writes `buf.len() / SECTOR_SIZE` contiguous sectors starting at `sid`.
    ///
    /// The length of `buf` must be a multiple of [`SECTOR_SIZE`].
    fn write_sectors(&self, sid: Sid, buf: &[u8]) -> BioStatus;

    /// Flushes any volatile write cache of the device.
    fn flush(&self) -> BioStatus {
        BioStatus::Complete
    }

    /// Returns the number of sectors of the device.
    fn nr_sectors(&self) -> u64;
}
