// SPDX-License-Identifier: MPL-2.0

use spin::Mutex;
use zerocopy::IntoBytes;

use crate::{
    block_group::descriptor_for,
    config::{CheckMode, Clock, CtxPolicy, EpochClock, MountOptions},
    inode::ROOT_INO,
    op_ctx::OpContext,
    prelude::*,
    super_block::{CounterDelta, Geometry, SUPER_BLOCK_OFFSET, SUPER_BLOCK_SIZE, SuperBlock},
};

/// The Ext2 filesystem.
#[derive(Debug)]
pub struct Ext2 {
    device: Arc<dyn BlockDevice>,
    options: MountOptions,
    geo: Geometry,
    super_block: Mutex<Dirty<SuperBlock>>,
    ctx: Mutex<OpContext>,
    clock: Arc<dyn Clock>,
}

/// The statistics of a mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ext2Stat {
    pub block_size: usize,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub reserved_blocks: u32,
    pub total_inodes: u32,
    pub free_inodes: u32,
    pub read_only: bool,
}

impl Ext2 {
    /// Opens and loads an Ext2 from the `device`.
    pub fn open(device: Arc<dyn BlockDevice>, options: MountOptions) -> Result<Arc<Self>> {
        Self::open_with_clock(device, options, Arc::new(EpochClock))
    }

    /// Opens and loads an Ext2 from the `device`, stamping times from `clock`.
    pub fn open_with_clock(
        device: Arc<dyn BlockDevice>,
        options: MountOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        let mut super_block = {
            let mut buf = vec![0u8; SUPER_BLOCK_SIZE];
            complete(device.read_sectors(Sid::from_offset(SUPER_BLOCK_OFFSET), &mut buf))?;
            SuperBlock::decode(&buf)?
        };
        if !options.read_only && !super_block.is_writable() {
            return_errno_with_message!(
                Errno::EINVAL,
                "the volume has read-only features unknown to this driver"
            );
        }

        let geo = super_block.geometry();
        if geo.blocks_count as u64 * geo.sectors_per_block > device.nr_sectors() {
            return_errno_with_message!(Errno::EINVAL, "the volume is larger than the device");
        }

        Self::check_free_counts(&device, geo, &mut super_block, options.check)?;

        if !options.read_only {
            super_block.mark_mounted(clock.now());
            write_super_block(device.as_ref(), &super_block)?;
        }
        info!(
            "[ext2] mount: block size {}, {} blocks, {} inodes, {} groups, {}",
            geo.block_size,
            geo.blocks_count,
            geo.inodes_count,
            geo.groups_count,
            if options.read_only { "ro" } else { "rw" }
        );

        Ok(Arc::new(Self {
            ctx: Mutex::new(OpContext::new(device.clone(), geo)),
            device,
            options,
            geo,
            super_block: Mutex::new(Dirty::new(super_block)),
            clock,
        }))
    }

    /// Compares the free counts of the superblock with the sums of the groups.
    fn check_free_counts(
        device: &Arc<dyn BlockDevice>,
        geo: Geometry,
        super_block: &mut SuperBlock,
        mode: CheckMode,
    ) -> Result<()> {
        if mode == CheckMode::None {
            return Ok(());
        }
        let mut ctx = OpContext::new(device.clone(), geo);
        let result = sum_group_free_counts(&mut ctx);
        let (free_blocks, free_inodes) = ctx.finish(result)?.0;
        if free_blocks == super_block.free_blocks_count()
            && free_inodes == super_block.free_inodes_count()
        {
            return Ok(());
        }

        warn!(
            "[ext2] the superblock counts {} free blocks and {} free inodes, the groups count {} and {}",
            super_block.free_blocks_count(),
            super_block.free_inodes_count(),
            free_blocks,
            free_inodes
        );
        if mode == CheckMode::Strict {
            return_errno_with_message!(Errno::EINVAL, "the free counts are inconsistent");
        }
        super_block.set_free_counts(free_blocks, free_inodes);
        Ok(())
    }

    /// Runs `f` as one operation and commits or discards what it did.
    pub(crate) fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut OpContext) -> Result<T>,
    {
        let (value, delta) = match self.options.ctx {
            CtxPolicy::Shared => match self.ctx.try_lock() {
                Some(mut ctx) => {
                    let result = f(&mut ctx);
                    ctx.finish(result)?
                }
                None => {
                    debug!("[ext2] the shared context is busy, use a transient one");
                    self.transient_transaction(f)?
                }
            },
            CtxPolicy::Transient => self.transient_transaction(f)?,
        };

        if !delta.is_zero() {
            self.super_block.lock().apply_delta(&delta);
        }
        Ok(value)
    }

    fn transient_transaction<F, T>(&self, f: F) -> Result<(T, CounterDelta)>
    where
        F: FnOnce(&mut OpContext) -> Result<T>,
    {
        let mut ctx = OpContext::new(self.device.clone(), self.geo);
        let result = f(&mut ctx);
        ctx.finish(result)
    }

    /// Runs `f` as one modifying operation.
    pub(crate) fn modify<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut OpContext) -> Result<T>,
    {
        if self.options.read_only {
            return_errno_with_message!(Errno::EROFS, "the volume is mounted read-only");
        }
        let value = self.transaction(f)?;
        if self.options.sync {
            self.sync()?;
        }
        Ok(value)
    }

    /// Writes back the superblock if it changed, and flushes the device.
    pub fn sync(&self) -> Result<()> {
        if self.options.read_only {
            return Ok(());
        }
        let mut super_block = self.super_block.lock();
        if super_block.is_dirty() {
            super_block.set_wtime(self.now());
            write_super_block(self.device.as_ref(), &super_block)?;
            super_block.clear_dirty();
        }
        drop(super_block);
        complete(self.device.flush())
    }

    /// Marks the volume as cleanly unmounted and writes everything back.
    pub fn unmount(&self) -> Result<()> {
        if self.options.read_only {
            return Ok(());
        }
        self.super_block.lock().mark_clean();
        self.sync()?;
        info!("[ext2] unmount");
        Ok(())
    }

    /// Returns the statistics of the volume.
    pub fn stat(&self) -> Ext2Stat {
        let super_block = self.super_block.lock();
        Ext2Stat {
            block_size: super_block.block_size(),
            total_blocks: super_block.total_blocks(),
            free_blocks: super_block.free_blocks_count(),
            reserved_blocks: super_block.reserved_blocks(),
            total_inodes: super_block.total_inodes(),
            free_inodes: super_block.free_inodes_count(),
            read_only: self.options.read_only,
        }
    }

    /// Sums the free counts recorded by the descriptors of all groups.
    pub fn group_free_counts(&self) -> Result<(u32, u32)> {
        self.transaction(sum_group_free_counts)
    }

    /// Returns a copy of the in-memory superblock.
    pub fn super_block(&self) -> SuperBlock {
        (**self.super_block.lock()).clone()
    }

    /// Returns the geometry of the volume.
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    /// Returns the mount options.
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    /// Returns the block device.
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Returns the inode number of the root directory.
    pub fn root_ino(&self) -> u32 {
        ROOT_INO
    }

    pub(crate) fn now(&self) -> Duration {
        self.clock.now()
    }
}

fn sum_group_free_counts(ctx: &mut OpContext) -> Result<(u32, u32)> {
    let mut free_blocks = 0u32;
    let mut free_inodes = 0u32;
    for idx in 0..ctx.geo().groups_count {
        let desc = descriptor_for(ctx, idx)?;
        free_blocks += desc.free_blocks_count as u32;
        free_inodes += desc.free_inodes_count as u32;
    }
    Ok((free_blocks, free_inodes))
}

pub(crate) fn write_super_block(device: &dyn BlockDevice, super_block: &SuperBlock) -> Result<()> {
    let raw = super_block.encode();
    complete(device.write_sectors(Sid::from_offset(SUPER_BLOCK_OFFSET), raw.as_bytes()))
}

fn complete(status: BioStatus) -> Result<()> {
    if !status.is_complete() {
        return Err(Error::from(status));
    }
    Ok(())
}
