// SPDX-License-Identifier: MPL-2.0

use alloc::{vec, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::trace;
use spin::Mutex;

use crate::{BioStatus, BlockDevice, Sid, SECTOR_SIZE};

/// A block device backed by memory.
#[derive(Debug)]
pub struct MemDisk {
    sectors: Mutex<Vec<u8>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    nr_reads: AtomicUsize,
    nr_writes: AtomicUsize,
}

/// The kinds of failures that can be injected into a [`MemDisk`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// Every read request fails with [`BioStatus::IoError`].
    Read,
    /// Every write request fails with [`BioStatus::IoError`].
    Write,
}

impl MemDisk {
    /// Creates a zero-filled disk of `nr_sectors` sectors.
    pub fn create(nr_sectors: usize) -> Self {
        Self::from_image(vec![0u8; nr_sectors * SECTOR_SIZE])
    }

    /// Creates a disk whose content is `image`.
    ///
    /// # Panics
    ///
    /// If the length of `image` is not a multiple of `SECTOR_SIZE`,
    /// this method will panic.
    pub fn from_image(image: Vec<u8>) -> Self {
        assert!(image.len() % SECTOR_SIZE == 0);
        Self {
            sectors: Mutex::new(image),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            nr_reads: AtomicUsize::new(0),
            nr_writes: AtomicUsize::new(0),
        }
    }

    /// Returns a copy of the whole content of the disk.
    pub fn snapshot(&self) -> Vec<u8> {
        self.sectors.lock().clone()
    }

    /// Makes the subsequent requests of `kind` fail.
    pub fn inject_fault(&self, kind: FaultKind) {
        self.fault_flag(kind).store(true, Ordering::Release);
    }

    /// Makes the disk healthy again.
    pub fn clear_faults(&self) {
        self.fail_reads.store(false, Ordering::Release);
        self.fail_writes.store(false, Ordering::Release);
    }

    /// Returns the number of completed read requests.
    pub fn nr_reads(&self) -> usize {
        self.nr_reads.load(Ordering::Acquire)
    }

    /// Returns the number of completed write requests.
    pub fn nr_writes(&self) -> usize {
        self.nr_writes.load(Ordering::Acquire)
    }

    fn fault_flag(&self, kind: FaultKind) -> &AtomicBool {
        match kind {
            FaultKind::Read => &self.fail_reads,
            FaultKind::Write => &self.fail_writes,
        }
    }

    fn byte_range(&self, sid: Sid, len: usize) -> Option<core::ops::Range<usize>> {
        if len % SECTOR_SIZE != 0 {
            return None;
        }
        let start = sid.to_offset();
        let end = start.checked_add(len)?;
        (end <= self.sectors.lock().len()).then_some(start..end)
    }
}

impl BlockDevice for MemDisk {
    fn read_sectors(&self, sid: Sid, buf: &mut [u8]) -> BioStatus {
        if self.fail_reads.load(Ordering::Acquire) {
            return BioStatus::IoError;
        }
        let Some(range) = self.byte_range(sid, buf.len()) else {
            return BioStatus::NotSupported;
        };
        trace!("[MemDisk] read {:?}, {} bytes", sid, buf.len());
        buf.copy_from_slice(&self.sectors.lock()[range]);
        self.nr_reads.fetch_add(1, Ordering::AcqRel);
        BioStatus::Complete
    }

    fn write_sectors(&self, sid: Sid, buf: &[u8]) -> BioStatus {
        if self.fail_writes.load(Ordering::Acquire) {
            return BioStatus::IoError;
        }
        let Some(range) = self.byte_range(sid, buf.len()) else {
            return BioStatus::NoSpace;
        };
        trace!("[MemDisk] write {:?}, {} bytes", sid, buf.len());
        self.sectors.lock()[range].copy_from_slice(buf);
        self.nr_writes.fetch_add(1, Ordering::AcqRel);
        BioStatus::Complete
    }

    fn nr_sectors(&self) -> u64 {
        (self.sectors.lock().len() / SECTOR_SIZE) as u64
    }
}
