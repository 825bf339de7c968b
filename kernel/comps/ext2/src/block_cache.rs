// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;

/// A device block held in memory by an operation context.
#[derive(Debug)]
pub(crate) struct CachedBlock {
    bid: Bid,
    dirty: bool,
    /// Whether `data` holds the content of the block.
    ready: bool,
    data: Box<[u8]>,
}

impl CachedBlock {
    pub fn bid(&self) -> Bid {
        self.bid
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn mark_dirty(&mut self) {
        debug_assert!(self.ready);
        self.dirty = true;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns the bytes for modification. The caller marks the block dirty.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// The blocks cached by one operation, sorted by block number.
#[derive(Debug, Default)]
pub(crate) struct BlockCache {
    blocks: Vec<CachedBlock>,
}

impl BlockCache {
    pub const fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn get(&self, bid: Bid) -> Option<&CachedBlock> {
        let idx = self.blocks.binary_search_by_key(&bid, |block| block.bid).ok()?;
        Some(&self.blocks[idx])
    }

    /// Returns the block `bid`, calling `load` to fill it if it has not been read yet.
    pub fn get_or_load<F>(&mut self, bid: Bid, block_size: usize, load: F) -> Result<&mut CachedBlock>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        let idx = self.entry(bid, block_size)?;
        let block = &mut self.blocks[idx];
        if !block.ready {
            load(&mut block.data)?;
            block.ready = true;
        }
        Ok(block)
    }

    /// Returns the block `bid` filled by `init` and marked dirty, without reading
    /// the device.
    pub fn get_or_init<F>(&mut self, bid: Bid, block_size: usize, init: F) -> Result<&mut CachedBlock>
    where
        F: FnOnce(&mut [u8]),
    {
        let idx = self.entry(bid, block_size)?;
        let block = &mut self.blocks[idx];
        init(&mut block.data);
        block.ready = true;
        block.dirty = true;
        Ok(block)
    }

    /// Returns the dirty blocks in ascending order of block numbers.
    pub fn dirty_blocks(&self) -> impl Iterator<Item = &CachedBlock> {
        self.blocks.iter().filter(|block| block.dirty)
    }

    /// Drops every cached block, written back or not.
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    /// Returns the position of `bid`, inserting an empty entry if it is absent.
    fn entry(&mut self, bid: Bid, block_size: usize) -> Result<usize> {
        match self.blocks.binary_search_by_key(&bid, |block| block.bid) {
            Ok(idx) => Ok(idx),
            Err(idx) => {
                let mut data = Vec::new();
                data.try_reserve_exact(block_size)?;
                data.resize(block_size, 0u8);
                self.blocks.try_reserve(1)?;
                self.blocks.insert(
                    idx,
                    CachedBlock {
                        bid,
                        dirty: false,
                        ready: false,
                        data: data.into_boxed_slice(),
                    },
                );
                Ok(idx)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn blocks_stay_sorted() -> Result<()> {
        let mut cache = BlockCache::new();
        for bid in [9, 3, 7, 5] {
            cache.get_or_init(bid, 1024, |data| data.fill(bid as u8))?;
        }
        let order: Vec<Bid> = cache.dirty_blocks().map(|block| block.bid()).collect();
        assert_eq!(order, vec![3, 5, 7, 9]);
        assert_eq!(cache.get(7).map(|block| block.as_bytes()[0]), Some(7));
        Ok(())
    }

    #[test]
    fn load_runs_once() -> Result<()> {
        let mut cache = BlockCache::new();
        let mut loads = 0;
        for _ in 0..3 {
            cache.get_or_load(4, 1024, |data| {
                loads += 1;
                data.fill(0xaa);
                Ok(())
            })?;
        }
        assert_eq!(loads, 1);
        assert_eq!(cache.len(), 1);
        assert!(!cache.get(4).is_some_and(|block| block.is_dirty()));
        Ok(())
    }

    #[test]
    fn failed_load_is_retried() {
        let mut cache = BlockCache::new();
        let failed = cache.get_or_load(4, 1024, |_| Err(Error::new(Errno::EIO)));
        assert_eq!(failed.map(|_| ()), Err(Error::new(Errno::EIO)));
        assert!(!cache.get(4).is_some_and(|block| block.is_ready()));

        let loaded = cache.get_or_load(4, 1024, |_| Ok(()));
        assert!(loaded.is_ok_and(|block| block.is_ready()));
    }
}
