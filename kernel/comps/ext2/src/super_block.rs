// SPDX-License-Identifier: MPL-2.0

use zerocopy::{
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned,
    little_endian::{U16, U32},
};

use crate::{block_ptr::BID_SIZE, distribution::distribute, prelude::*};

/// The magic number of Ext2.
pub const MAGIC_NUM: u16 = 0xef53;

/// The main superblock is located at byte 1024 from the beginning of the device.
pub const SUPER_BLOCK_OFFSET: usize = 1024;

/// The size of the superblock on the device.
pub const SUPER_BLOCK_SIZE: usize = 1024;

/// The inode size of revision 0.
const GOOD_OLD_INODE_SIZE: u16 = 128;
/// The first non-reserved inode of revision 0.
const GOOD_OLD_FIRST_INO: u32 = 11;

/// The in-memory superblock.
///
/// It contains all the information about the layout of the volume.
/// Fields that are never changed by this driver are kept in the raw copy,
/// so that they are written back untouched.
#[derive(Clone, Debug)]
pub struct SuperBlock {
    /// Total number of inodes.
    inodes_count: u32,
    /// Total number of blocks.
    blocks_count: u32,
    /// Total number of reserved blocks.
    reserved_blocks_count: u32,
    /// Total number of free blocks.
    free_blocks_count: u32,
    /// Total number of free inodes.
    free_inodes_count: u32,
    /// First data block.
    first_data_block: Bid,
    /// Block size.
    block_size: usize,
    /// Number of blocks in each block group.
    blocks_per_group: u32,
    /// Number of inodes in each block group.
    inodes_per_group: u32,
    /// Mount time.
    mtime: Duration,
    /// Write time.
    wtime: Duration,
    /// Mount count.
    mnt_count: u16,
    /// File system state.
    state: FsState,
    /// Revision level.
    rev_level: RevLevel,
    /// First non-reserved inode number.
    first_ino: u32,
    /// Size of inode structure.
    inode_size: usize,
    /// Compatible feature set.
    feature_compat: FeatureCompatSet,
    /// Incompatible feature set.
    feature_incompat: FeatureInCompatSet,
    /// Readonly-compatible feature set.
    feature_ro_compat: FeatureRoCompatSet,
    /// The raw superblock as it was read.
    raw: RawSuperBlock,
}

impl TryFrom<RawSuperBlock> for SuperBlock {
    type Error = crate::error::Error;

    fn try_from(sb: RawSuperBlock) -> Result<Self> {
        if sb.magic.get() != MAGIC_NUM {
            return_errno_with_message!(Errno::EINVAL, "bad ext2 magic number");
        }
        let rev_level = match sb.rev_level.get() {
            0 => RevLevel::GoodOld,
            1 => RevLevel::Dynamic,
            _ => return_errno_with_message!(Errno::EINVAL, "unsupported ext2 revision"),
        };
        if sb.log_block_size.get() > 2 {
            return_errno_with_message!(Errno::EINVAL, "unsupported block size");
        }
        let block_size = 1024usize << sb.log_block_size.get();

        let (inode_size, first_ino) = match rev_level {
            RevLevel::GoodOld => (GOOD_OLD_INODE_SIZE as usize, GOOD_OLD_FIRST_INO),
            RevLevel::Dynamic => (sb.inode_size.get() as usize, sb.first_ino.get()),
        };
        if !inode_size.is_power_of_two()
            || inode_size < GOOD_OLD_INODE_SIZE as usize
            || inode_size > block_size
        {
            return_errno_with_message!(Errno::EINVAL, "invalid inode size");
        }

        let bits_per_block = (block_size * 8) as u32;
        let blocks_per_group = sb.blocks_per_group.get();
        let inodes_per_group = sb.inodes_per_group.get();
        if blocks_per_group == 0 || blocks_per_group > bits_per_block {
            return_errno_with_message!(Errno::EINVAL, "invalid blocks per group");
        }
        if inodes_per_group == 0 || inodes_per_group > bits_per_block {
            return_errno_with_message!(Errno::EINVAL, "invalid inodes per group");
        }
        if sb.blocks_count.get() <= sb.first_data_block.get() {
            return_errno_with_message!(Errno::EINVAL, "invalid blocks count");
        }

        let (feature_compat, feature_incompat, feature_ro_compat) = match rev_level {
            RevLevel::GoodOld => (
                FeatureCompatSet::empty(),
                FeatureInCompatSet::empty(),
                FeatureRoCompatSet::empty(),
            ),
            RevLevel::Dynamic => (
                FeatureCompatSet::from_bits_truncate(sb.feature_compat.get()),
                FeatureInCompatSet::from_bits(sb.feature_incompat.get()).ok_or(
                    Error::with_message(Errno::EINVAL, "unknown incompatible features"),
                )?,
                FeatureRoCompatSet::from_bits_truncate(sb.feature_ro_compat.get()),
            ),
        };
        if !FeatureInCompatSet::SUPPORTED.contains(feature_incompat) {
            return_errno_with_message!(Errno::EINVAL, "unsupported incompatible features");
        }

        Ok(Self {
            inodes_count: sb.inodes_count.get(),
            blocks_count: sb.blocks_count.get(),
            reserved_blocks_count: sb.reserved_blocks_count.get(),
            free_blocks_count: sb.free_blocks_count.get(),
            free_inodes_count: sb.free_inodes_count.get(),
            first_data_block: sb.first_data_block.get(),
            block_size,
            blocks_per_group,
            inodes_per_group,
            mtime: Duration::from_secs(sb.mtime.get() as u64),
            wtime: Duration::from_secs(sb.wtime.get() as u64),
            mnt_count: sb.mnt_count.get(),
            state: FsState::from_bits_truncate(sb.state.get()),
            rev_level,
            first_ino,
            inode_size,
            feature_compat,
            feature_incompat,
            feature_ro_compat,
            raw: sb,
        })
    }
}

impl SuperBlock {
    /// Decodes the superblock from its on-disk bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (raw, _) = RawSuperBlock::read_from_prefix(bytes)
            .map_err(|_| Error::with_message(Errno::EIO, "short superblock"))?;
        Self::try_from(raw)
    }

    /// Encodes the superblock into its on-disk bytes.
    pub fn encode(&self) -> RawSuperBlock {
        RawSuperBlock::from(self)
    }

    /// Returns the block size.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the size of inode structure.
    pub fn inode_size(&self) -> usize {
        self.inode_size
    }

    /// Returns the number of blocks in each block group.
    pub fn blocks_per_group(&self) -> u32 {
        self.blocks_per_group
    }

    /// Returns the number of inodes in each block group.
    pub fn inodes_per_group(&self) -> u32 {
        self.inodes_per_group
    }

    /// Returns the number of block groups.
    pub fn block_groups_count(&self) -> u32 {
        (self.blocks_count - self.first_data_block).div_ceil(self.blocks_per_group)
    }

    /// Returns the total number of blocks.
    pub fn total_blocks(&self) -> u32 {
        self.blocks_count
    }

    /// Returns the total number of inodes.
    pub fn total_inodes(&self) -> u32 {
        self.inodes_count
    }

    /// Returns the number of blocks reserved for the super user.
    pub fn reserved_blocks(&self) -> u32 {
        self.reserved_blocks_count
    }

    /// Returns the number of free blocks.
    pub fn free_blocks_count(&self) -> u32 {
        self.free_blocks_count
    }

    /// Returns the number of free inodes.
    pub fn free_inodes_count(&self) -> u32 {
        self.free_inodes_count
    }

    /// Overwrites both free counters.
    pub fn set_free_counts(&mut self, free_blocks: u32, free_inodes: u32) {
        self.free_blocks_count = free_blocks;
        self.free_inodes_count = free_inodes;
    }

    /// Applies the changes of the free counters made by one operation.
    pub fn apply_delta(&mut self, delta: &CounterDelta) {
        self.free_blocks_count = self.free_blocks_count.wrapping_add_signed(delta.free_blocks);
        self.free_inodes_count = self.free_inodes_count.wrapping_add_signed(delta.free_inodes);
    }

    /// Returns the first non-reserved inode number.
    pub fn first_ino(&self) -> u32 {
        self.first_ino
    }

    /// Returns the mount count.
    pub fn mnt_count(&self) -> u16 {
        self.mnt_count
    }

    /// Returns the file system state.
    pub fn state(&self) -> FsState {
        self.state
    }

    /// Records a mount at `now`.
    ///
    /// The volume is marked as not cleanly unmounted until `mark_clean` is called.
    pub fn mark_mounted(&mut self, now: Duration) {
        self.mnt_count = self.mnt_count.wrapping_add(1);
        self.mtime = now;
        self.state.remove(FsState::VALID);
    }

    /// Marks the volume as cleanly unmounted.
    pub fn mark_clean(&mut self) {
        self.state.insert(FsState::VALID);
    }

    /// Records a write back at `now`.
    pub fn set_wtime(&mut self, now: Duration) {
        self.wtime = now;
    }

    /// Returns the compatible feature set.
    pub fn feature_compat(&self) -> FeatureCompatSet {
        self.feature_compat
    }

    /// Returns the incompatible feature set.
    pub fn feature_incompat(&self) -> FeatureInCompatSet {
        self.feature_incompat
    }

    /// Returns the readonly-compatible feature set.
    pub fn feature_ro_compat(&self) -> FeatureRoCompatSet {
        self.feature_ro_compat
    }

    /// Returns whether the volume may be written by this driver.
    pub fn is_writable(&self) -> bool {
        FeatureRoCompatSet::SUPPORTED.contains(self.feature_ro_compat)
    }

    /// Returns whether the group keeps a backup of the superblock.
    pub fn is_backup_group(&self, block_group_idx: u32) -> bool {
        if !self
            .feature_ro_compat
            .contains(FeatureRoCompatSet::SPARSE_SUPER)
        {
            return true;
        }
        is_sparse_backup_group(block_group_idx)
    }

    /// Returns the derived geometry of the volume.
    pub fn geometry(&self) -> Geometry {
        let block_size = self.block_size;
        let groups_count = self.block_groups_count();
        Geometry {
            block_size,
            sectors_per_block: (block_size / SECTOR_SIZE) as u64,
            ptrs_per_block: (block_size / BID_SIZE) as u32,
            blocks_count: self.blocks_count,
            inodes_count: self.inodes_count,
            blocks_per_group: self.blocks_per_group,
            inodes_per_group: self.inodes_per_group,
            inode_size: self.inode_size,
            groups_count,
            first_data_block: self.first_data_block,
            first_ino: self.first_ino,
            gdt_bid: self.first_data_block + 1,
            has_filetype: self
                .feature_incompat
                .contains(FeatureInCompatSet::FILETYPE),
            large_file: self
                .feature_ro_compat
                .contains(FeatureRoCompatSet::LARGE_FILE),
        }
    }
}

/// Returns whether the group keeps a backup when `SPARSE_SUPER` is enabled,
/// i.e., it is group 0, 1, or a power of 3, 5 or 7.
pub(crate) fn is_sparse_backup_group(block_group_idx: u32) -> bool {
    let is_power_of = |mut n: u32, base: u32| {
        while n > 1 && n % base == 0 {
            n /= base;
        }
        n == 1
    };
    block_group_idx <= 1
        || is_power_of(block_group_idx, 3)
        || is_power_of(block_group_idx, 5)
        || is_power_of(block_group_idx, 7)
}

/// The changes of the free counters staged by an operation context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub free_blocks: i32,
    pub free_inodes: i32,
}

impl CounterDelta {
    pub fn is_zero(&self) -> bool {
        self.free_blocks == 0 && self.free_inodes == 0
    }
}

/// The immutable layout parameters of a mounted volume.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    /// Block size in bytes.
    pub block_size: usize,
    /// Number of device sectors in one block.
    pub sectors_per_block: u64,
    /// Number of block pointers in one index block.
    pub ptrs_per_block: u32,
    pub blocks_count: u32,
    pub inodes_count: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    /// Size of an inode record in bytes.
    pub inode_size: usize,
    pub groups_count: u32,
    /// The block number of the first block of group 0.
    pub first_data_block: Bid,
    /// The first non-reserved inode number.
    pub first_ino: u32,
    /// The first block of the descriptor table.
    pub gdt_bid: Bid,
    /// Whether directory records carry a type tag.
    pub has_filetype: bool,
    /// Whether regular files may be 2 GiB or larger.
    pub large_file: bool,
}

impl Geometry {
    /// Returns the group of the inode and its index inside the group.
    pub fn locate_ino(&self, ino: u32) -> Result<(u32, u32)> {
        if ino == 0 || ino > self.inodes_count {
            return_errno_with_message!(Errno::EINVAL, "invalid inode number");
        }
        let idx = ino - 1;
        Ok((idx / self.inodes_per_group, idx % self.inodes_per_group))
    }

    /// Returns the group of the block and its index inside the group.
    pub fn locate_bid(&self, bid: Bid) -> Result<(u32, u32)> {
        if bid < self.first_data_block || bid >= self.blocks_count {
            return_errno_with_message!(Errno::EIO, "block number out of range");
        }
        let idx = bid - self.first_data_block;
        Ok((idx / self.blocks_per_group, idx % self.blocks_per_group))
    }

    /// Returns the first block of the group.
    pub fn group_first_bid(&self, block_group_idx: u32) -> Bid {
        self.first_data_block + block_group_idx * self.blocks_per_group
    }

    /// Returns the number of blocks in the group; the last group may be short.
    pub fn blocks_in_group(&self, block_group_idx: u32) -> u32 {
        let first = self.group_first_bid(block_group_idx);
        (self.blocks_count - first).min(self.blocks_per_group)
    }

    /// Returns the number of data blocks the block pointers of an inode can address.
    ///
    /// The 32-bit sector count of an inode covers the index blocks too.
    pub fn max_file_blocks(&self) -> u64 {
        let s = self.ptrs_per_block as u64;
        let max = 12 + s + s * s + s * s * s;
        let countable = (u32::MAX as u64 / self.sectors_per_block) as u32;
        max.min(distribute(self.block_size, countable, true).data_total as u64)
    }

    /// Returns the maximum size of a regular file.
    pub fn max_file_size(&self) -> u64 {
        let by_blocks = self.max_file_blocks() * self.block_size as u64;
        if self.large_file {
            by_blocks
        } else {
            by_blocks.min(i32::MAX as u64)
        }
    }
}

bitflags! {
    /// The state of the file system.
    pub struct FsState: u16 {
        /// Unmounted cleanly.
        const VALID = 1;
        /// Errors detected.
        const ERROR = 2;
    }
}

/// The revision level.
#[derive(Copy, Debug, Clone, Eq, PartialEq)]
pub enum RevLevel {
    /// The good old (original) format.
    GoodOld = 0,
    /// V2 format with dynamic inode size.
    Dynamic = 1,
}

bitflags! {
    /// Compatible feature set.
    pub struct FeatureCompatSet: u32 {
        /// Preallocate some number of blocks to a directory when creating a new one
        const DIR_PREALLOC = 1 << 0;
        /// AFS server inodes exist
        const IMAGIC_INODES = 1 << 1;
        /// File system has a journal
        const HAS_JOURNAL = 1 << 2;
        /// Inodes have extended attributes
        const EXT_ATTR = 1 << 3;
        /// File system can resize itself for larger partitions
        const RESIZE_INO = 1 << 4;
        /// Directories use hash index
        const DIR_INDEX = 1 << 5;
    }
}

bitflags! {
    /// Incompatible feature set.
    pub struct FeatureInCompatSet: u32 {
        /// Compression is used
        const COMPRESSION = 1 << 0;
        /// Directory entries contain a type field
        const FILETYPE = 1 << 1;
        /// File system needs to replay its journal
        const RECOVER = 1 << 2;
        /// File system uses a journal device
        const JOURNAL_DEV = 1 << 3;
        /// Metablock block group
        const META_BG = 1 << 4;
    }
}

impl FeatureInCompatSet {
    /// The incompatible features that this driver understands.
    pub const SUPPORTED: Self = Self::FILETYPE;
}

bitflags! {
    /// Readonly-compatible feature set.
    pub struct FeatureRoCompatSet: u32 {
        /// Sparse superblocks and group descriptor tables
        const SPARSE_SUPER = 1 << 0;
        /// File system uses a 64-bit file size
        const LARGE_FILE = 1 << 1;
        /// Directory contents are stored in the form of a Binary Tree
        const BTREE_DIR = 1 << 2;
    }
}

impl FeatureRoCompatSet {
    /// The readonly-compatible features that this driver can write.
    pub const SUPPORTED: Self = Self::from_bits_truncate(
        Self::SPARSE_SUPER.bits() | Self::LARGE_FILE.bits(),
    );
}

const_assert!(core::mem::size_of::<RawSuperBlock>() == SUPER_BLOCK_SIZE);

/// The raw superblock on device.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RawSuperBlock {
    pub inodes_count: U32,
    pub blocks_count: U32,
    pub reserved_blocks_count: U32,
    pub free_blocks_count: U32,
    pub free_inodes_count: U32,
    pub first_data_block: U32,
    /// The number to left-shift 1024 to obtain the block size.
    pub log_block_size: U32,
    /// The number to left-shift 1024 to obtain the fragment size.
    pub log_frag_size: U32,
    pub blocks_per_group: U32,
    pub frags_per_group: U32,
    pub inodes_per_group: U32,
    /// Mount time.
    pub mtime: U32,
    /// Write time.
    pub wtime: U32,
    pub mnt_count: U16,
    pub max_mnt_count: U16,
    pub magic: U16,
    pub state: U16,
    pub errors_behaviour: U16,
    pub min_rev_level: U16,
    /// Time of last check.
    pub last_check_time: U32,
    pub check_interval: U32,
    pub creator_os: U32,
    pub rev_level: U32,
    pub def_resuid: U16,
    pub def_resgid: U16,
    //
    // These fields are valid for RevLevel::Dynamic only.
    //
    pub first_ino: U32,
    pub inode_size: U16,
    pub block_group_idx: U16,
    pub feature_compat: U32,
    pub feature_incompat: U32,
    pub feature_ro_compat: U32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub last_mounted_dir: [u8; 64],
    pub algorithm_usage_bitmap: U32,
    pub prealloc_file_blocks: u8,
    pub prealloc_dir_blocks: u8,
    padding1: U16,
    pub journal_uuid: [u8; 16],
    pub journal_ino: U32,
    pub journal_dev: U32,
    pub last_orphan: U32,
    pub hash_seed: [U32; 4],
    pub def_hash_version: u8,
    reserved_char_pad: u8,
    reserved_word_pad: U16,
    pub default_mount_opts: U32,
    pub first_meta_bg: U32,
    reserved: [U32; 190],
}

impl RawSuperBlock {
    /// Returns an all-zero raw superblock.
    pub fn zeroed() -> Self {
        Self::new_zeroed()
    }
}

impl From<&SuperBlock> for RawSuperBlock {
    fn from(sb: &SuperBlock) -> Self {
        let mut raw = sb.raw;
        raw.inodes_count = sb.inodes_count.into();
        raw.blocks_count = sb.blocks_count.into();
        raw.reserved_blocks_count = sb.reserved_blocks_count.into();
        raw.free_blocks_count = sb.free_blocks_count.into();
        raw.free_inodes_count = sb.free_inodes_count.into();
        raw.first_data_block = sb.first_data_block.into();
        raw.log_block_size = ((sb.block_size >> 10).trailing_zeros()).into();
        raw.blocks_per_group = sb.blocks_per_group.into();
        raw.inodes_per_group = sb.inodes_per_group.into();
        raw.mtime = (sb.mtime.as_secs() as u32).into();
        raw.wtime = (sb.wtime.as_secs() as u32).into();
        raw.mnt_count = sb.mnt_count.into();
        raw.magic = MAGIC_NUM.into();
        raw.state = sb.state.bits().into();
        raw.rev_level = (sb.rev_level as u32).into();
        if sb.rev_level == RevLevel::Dynamic {
            raw.first_ino = sb.first_ino.into();
            raw.inode_size = (sb.inode_size as u16).into();
            raw.feature_compat = sb.feature_compat.bits().into();
            raw.feature_incompat = sb.feature_incompat.bits().into();
            raw.feature_ro_compat = sb.feature_ro_compat.bits().into();
        }
        raw
    }
}
