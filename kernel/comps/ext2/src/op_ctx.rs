// SPDX-License-Identifier: MPL-2.0

//! The operation context.
//!
//! Every high-level operation runs inside one `OpContext`. The context owns
//! the blocks the operation has touched, the first error it ran into, and the
//! changes to the free counters of the superblock. When the operation ends,
//! the context is either committed, which writes back every dirty block, or
//! discarded, which drops them all.

use crate::{
    block_cache::{BlockCache, CachedBlock},
    prelude::*,
    super_block::{CounterDelta, Geometry},
};

pub(crate) struct OpContext {
    device: Arc<dyn BlockDevice>,
    geo: Geometry,
    cache: BlockCache,
    error: Option<Error>,
    memo: IndirectMemo,
    delta: CounterDelta,
}

impl OpContext {
    pub fn new(device: Arc<dyn BlockDevice>, geo: Geometry) -> Self {
        Self {
            device,
            geo,
            cache: BlockCache::new(),
            error: None,
            memo: IndirectMemo::default(),
            delta: CounterDelta::default(),
        }
    }

    pub fn geo(&self) -> &Geometry {
        &self.geo
    }

    /// Returns the content of the block `bid`.
    pub fn read_block(&mut self, bid: Bid) -> Result<&[u8]> {
        Ok(self.load(bid)?.as_bytes())
    }

    /// Returns the content of the block `bid` for modification and marks it dirty.
    pub fn modify_block(&mut self, bid: Bid) -> Result<&mut [u8]> {
        let block = self.load(bid)?;
        block.mark_dirty();
        Ok(block.as_bytes_mut())
    }

    /// Returns a zero-filled dirty block for `bid` without reading the device.
    ///
    /// It is used for blocks that have just been allocated.
    pub fn zero_init(&mut self, bid: Bid) -> Result<&mut [u8]> {
        self.check_bid(bid)?;
        let block_size = self.geo.block_size;
        match self.cache.get_or_init(bid, block_size, |data| data.fill(0)) {
            Ok(block) => Ok(block.as_bytes_mut()),
            Err(err) => Err(note_error(&mut self.error, err)),
        }
    }

    /// Replaces the whole content of the block `bid` with `src`.
    pub fn write_from(&mut self, bid: Bid, src: &[u8]) -> Result<()> {
        self.check_bid(bid)?;
        let block_size = self.geo.block_size;
        match self
            .cache
            .get_or_init(bid, block_size, |data| data.copy_from_slice(src))
        {
            Ok(_) => Ok(()),
            Err(err) => Err(note_error(&mut self.error, err)),
        }
    }

    /// Copies the whole block `bid` into `dst`.
    ///
    /// A block that is not cached is read from the device straight into `dst`.
    pub fn read_into(&mut self, bid: Bid, dst: &mut [u8]) -> Result<()> {
        self.check_bid(bid)?;
        if let Some(block) = self.cache.get(bid).filter(|block| block.is_ready()) {
            dst.copy_from_slice(block.as_bytes());
            return Ok(());
        }
        read_from_device(&*self.device, &self.geo, bid, dst)
            .map_err(|err| note_error(&mut self.error, err))
    }

    /// Records `err` as an error of the operation and returns it.
    ///
    /// The first error is kept unless a later one is `EIO`.
    pub fn record_error(&mut self, err: Error) -> Error {
        note_error(&mut self.error, err)
    }

    pub fn memo(&mut self) -> &mut IndirectMemo {
        &mut self.memo
    }

    pub fn delta_mut(&mut self) -> &mut CounterDelta {
        &mut self.delta
    }

    /// Closes the operation.
    ///
    /// If both `result` and the context are free of errors, every dirty block is
    /// written back and the staged counter changes are returned. Otherwise all
    /// cached blocks are dropped unwritten. Either way the context is left empty
    /// and ready for the next operation.
    pub fn finish<T>(&mut self, result: Result<T>) -> Result<(T, CounterDelta)> {
        let result = match result {
            Ok(value) => match self.error {
                None => self.flush().map(|_| (value, self.delta)),
                Some(err) => Err(err),
            },
            Err(err) => Err(note_error(&mut self.error, err)),
        };
        if let Err(err) = &result {
            self.discard(*err);
        }
        self.reset();
        result
    }

    fn discard(&mut self, err: Error) {
        let nr_dirty = self.cache.dirty_blocks().count();
        if err.error() == Errno::EIO {
            error!(
                "[ext2] discard an operation with {} dirty blocks: {}",
                nr_dirty, err
            );
        } else {
            debug!(
                "[ext2] discard an operation with {} dirty blocks: {}",
                nr_dirty, err
            );
        }
    }

    fn reset(&mut self) {
        self.cache.clear();
        self.error = None;
        self.memo.clear();
        self.delta = CounterDelta::default();
    }

    /// Writes back the dirty blocks in ascending order, merging the runs of
    /// adjacent blocks into one request.
    fn flush(&mut self) -> Result<()> {
        let block_size = self.geo.block_size;
        let mut blocks = self.cache.dirty_blocks().peekable();
        let mut buf: Vec<u8> = Vec::new();
        while let Some(first) = blocks.next() {
            let start = first.bid();
            let mut end = start + 1;
            buf.clear();
            buf.try_reserve(block_size)?;
            buf.extend_from_slice(first.as_bytes());
            while let Some(next) = blocks.next_if(|block| block.bid() == end) {
                buf.try_reserve(block_size)?;
                buf.extend_from_slice(next.as_bytes());
                end += 1;
            }
            trace!("[ext2] write back blocks {}..{}", start, end);
            write_to_device(&*self.device, &self.geo, start, &buf)?;
        }
        Ok(())
    }

    fn load(&mut self, bid: Bid) -> Result<&mut CachedBlock> {
        self.check_bid(bid)?;
        let device = &*self.device;
        let geo = &self.geo;
        match self.cache.get_or_load(bid, geo.block_size, |data| {
            read_from_device(device, geo, bid, data)
        }) {
            Ok(block) => Ok(block),
            Err(err) => Err(note_error(&mut self.error, err)),
        }
    }

    fn check_bid(&mut self, bid: Bid) -> Result<()> {
        if bid == 0 || bid >= self.geo.blocks_count {
            let err = Error::with_message(Errno::EIO, "block number out of range");
            return Err(note_error(&mut self.error, err));
        }
        Ok(())
    }
}

impl Debug for OpContext {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("OpContext")
            .field("nr_cached", &self.cache.len())
            .field("error", &self.error)
            .field("memo", &self.memo)
            .field("delta", &self.delta)
            .finish()
    }
}

fn note_error(slot: &mut Option<Error>, err: Error) -> Error {
    match slot {
        None => *slot = Some(err),
        Some(prev) if prev.error() != Errno::EIO && err.error() == Errno::EIO => *slot = Some(err),
        Some(_) => {}
    }
    err
}

fn read_from_device(device: &dyn BlockDevice, geo: &Geometry, bid: Bid, buf: &mut [u8]) -> Result<()> {
    trace!("[ext2] read block {}", bid);
    let sid = Sid::new(bid as u64 * geo.sectors_per_block);
    let status = device.read_sectors(sid, buf);
    if !status.is_complete() {
        return Err(Error::from(status));
    }
    Ok(())
}

fn write_to_device(device: &dyn BlockDevice, geo: &Geometry, bid: Bid, buf: &[u8]) -> Result<()> {
    let sid = Sid::new(bid as u64 * geo.sectors_per_block);
    let status = device.write_sectors(sid, buf);
    if !status.is_complete() {
        return Err(Error::from(status));
    }
    Ok(())
}

/// Remembers the leaf index block reached by the last walk of an index tree.
///
/// The memo is valid only while the key matches: a lookup with another key
/// misses, and `remember` replaces the entry.
#[derive(Debug, Default)]
pub(crate) struct IndirectMemo {
    entry: Option<(MemoKey, Bid)>,
}

/// Identifies a leaf index block of a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct MemoKey {
    /// The first block pointer of the inode.
    pub first_ptr: Bid,
    /// The pointer slot of the inode where the walk starts.
    pub root_slot: usize,
    /// The indices taken in the index blocks above the leaf.
    pub upper: [usize; 2],
}

impl IndirectMemo {
    pub fn lookup(&self, key: &MemoKey) -> Option<Bid> {
        match self.entry {
            Some((memo_key, leaf)) if memo_key == *key => Some(leaf),
            _ => None,
        }
    }

    pub fn remember(&mut self, key: MemoKey, leaf: Bid) {
        self.entry = Some((key, leaf));
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }
}

#[cfg(test)]
pub(crate) mod test {
    use ember_block::{FaultKind, MemDisk};

    use super::*;
    use crate::{
        mkfs::{FormatOptions, format},
        super_block::{SUPER_BLOCK_OFFSET, SUPER_BLOCK_SIZE, SuperBlock},
    };

    pub(crate) fn test_geometry() -> Geometry {
        Geometry {
            block_size: 1024,
            sectors_per_block: 2,
            ptrs_per_block: 256,
            blocks_count: 64,
            inodes_count: 16,
            blocks_per_group: 8192,
            inodes_per_group: 16,
            inode_size: 128,
            groups_count: 1,
            first_data_block: 1,
            first_ino: 11,
            gdt_bid: 2,
            has_filetype: true,
            large_file: false,
        }
    }

    /// Formats a disk of `nr_sectors` sectors and opens a context on it.
    pub(crate) fn formatted_ctx(
        nr_sectors: usize,
        options: &FormatOptions,
    ) -> Result<(Arc<MemDisk>, OpContext)> {
        let disk = Arc::new(MemDisk::create(nr_sectors));
        let device: Arc<dyn BlockDevice> = disk.clone();
        format(&device, options)?;
        let image = disk.snapshot();
        let sb = SuperBlock::decode(&image[SUPER_BLOCK_OFFSET..SUPER_BLOCK_OFFSET + SUPER_BLOCK_SIZE])?;
        Ok((disk, OpContext::new(device, sb.geometry())))
    }

    fn new_ctx() -> (Arc<MemDisk>, OpContext) {
        let disk = Arc::new(MemDisk::create(128));
        let ctx = OpContext::new(disk.clone(), test_geometry());
        (disk, ctx)
    }

    #[test]
    fn commit_writes_back_dirty_blocks() -> Result<()> {
        let (disk, mut ctx) = new_ctx();
        ctx.zero_init(5)?.fill(0x55);
        ctx.modify_block(6)?[0] = 0x66;
        ctx.read_block(9)?;
        ctx.delta_mut().free_blocks -= 2;

        let writes_before = disk.nr_writes();
        let ((), delta) = ctx.finish(Ok(()))?;
        assert_eq!(delta.free_blocks, -2);
        // Blocks 5 and 6 are adjacent.
        assert_eq!(disk.nr_writes(), writes_before + 1);
        assert_eq!(ctx.cache.len(), 0);

        let image = disk.snapshot();
        assert!(image[5 * 1024..6 * 1024].iter().all(|&b| b == 0x55));
        assert_eq!(image[6 * 1024], 0x66);
        Ok(())
    }

    #[test]
    fn failed_operation_writes_nothing() -> Result<()> {
        let (disk, mut ctx) = new_ctx();
        ctx.zero_init(5)?.fill(0x55);
        ctx.delta_mut().free_inodes -= 1;

        let writes_before = disk.nr_writes();
        let result = ctx.finish::<()>(Err(Error::new(Errno::ENOSPC)));
        assert_eq!(result.map(|_| ()), Err(Error::new(Errno::ENOSPC)));
        assert_eq!(disk.nr_writes(), writes_before);
        assert_eq!(ctx.cache.len(), 0);
        assert_eq!(ctx.error, None);
        Ok(())
    }

    #[test]
    fn read_error_is_sticky() {
        let (disk, mut ctx) = new_ctx();
        disk.inject_fault(FaultKind::Read);
        assert!(ctx.read_block(7).is_err());
        disk.clear_faults();

        // The operation swallowed the failure, but it still cannot commit.
        let result = ctx.finish(Ok(()));
        assert_eq!(result.map(|_| ()).map_err(|err| err.error()), Err(Errno::EIO));
    }

    #[test]
    fn eio_overrides_earlier_errors() {
        let (_, mut ctx) = new_ctx();
        ctx.record_error(Error::new(Errno::ENOSPC));
        ctx.record_error(Error::new(Errno::ENOENT));
        assert_eq!(ctx.error.map(|err| err.error()), Some(Errno::ENOSPC));
        ctx.record_error(Error::new(Errno::EIO));
        assert_eq!(ctx.error.map(|err| err.error()), Some(Errno::EIO));
    }

    #[test]
    fn out_of_range_block_is_eio() {
        let (_, mut ctx) = new_ctx();
        assert_eq!(
            ctx.read_block(64).map(|_| ()).map_err(|err| err.error()),
            Err(Errno::EIO)
        );
        assert_eq!(
            ctx.read_block(0).map(|_| ()).map_err(|err| err.error()),
            Err(Errno::EIO)
        );
    }

    #[test]
    fn memo_misses_on_other_key() {
        let mut memo = IndirectMemo::default();
        let key = MemoKey {
            first_ptr: 10,
            root_slot: 13,
            upper: [1, 0],
        };
        memo.remember(key, 42);
        assert_eq!(memo.lookup(&key), Some(42));
        let other = MemoKey {
            upper: [2, 0],
            ..key
        };
        assert_eq!(memo.lookup(&other), None);
        memo.clear();
        assert_eq!(memo.lookup(&key), None);
    }
}
