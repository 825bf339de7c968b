// SPDX-License-Identifier: MPL-2.0

//! Inode records.

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    little_endian::{U16, U32},
};

use crate::{block_group::descriptor_for, block_ptr::BlockPtrs, op_ctx::OpContext, prelude::*};

/// The inode number of the root directory.
pub const ROOT_INO: u32 = 2;

/// The largest link count of an inode.
pub const MAX_LINKS: u16 = 32000;

/// The in-memory rust inode descriptor.
///
/// It represents a file, directory, symbolic link, etc.
/// It contains pointers to the filesystem blocks which contain the data held in the
/// object and all of the metadata about an object except its name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InodeDesc {
    /// Type.
    pub type_: FileType,
    /// Permission.
    pub perm: FilePerm,
    /// User Id.
    pub uid: u32,
    /// Group Id.
    pub gid: u32,
    /// Size in bytes.
    pub size: u64,
    /// Access time.
    pub atime: Duration,
    /// Creation time.
    pub ctime: Duration,
    /// Modification time.
    pub mtime: Duration,
    /// Deletion time.
    pub dtime: Duration,
    /// Hard links count.
    pub links_count: u16,
    /// Number of 512-byte sectors, index blocks included.
    pub sectors: u32,
    /// File flags.
    pub flags: FileFlags,
    /// File version (for NFS).
    pub generation: u32,
    /// Pointers to blocks.
    pub block_ptrs: BlockPtrs,
}

impl InodeDesc {
    /// Creates the descriptor of a new inode with one link.
    pub fn new(type_: FileType, perm: FilePerm, now: Duration) -> Self {
        Self {
            type_,
            perm,
            uid: 0,
            gid: 0,
            size: 0,
            atime: now,
            ctime: now,
            mtime: now,
            dtime: Duration::ZERO,
            links_count: 1,
            sectors: 0,
            flags: FileFlags::empty(),
            generation: 0,
            block_ptrs: BlockPtrs::default(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.type_ == FileType::Dir
    }

    /// Returns whether the inode is a symlink whose target lives in its block
    /// pointers instead of a data block.
    pub fn is_fast_symlink(&self) -> bool {
        self.type_ == FileType::Symlink && self.sectors == 0 && self.size > 0
    }

    pub fn mode(&self) -> u16 {
        self.type_ as u16 | self.perm.bits()
    }

    /// Returns the number of blocks occupied by the file, index blocks included.
    pub fn nr_blocks(&self, sectors_per_block: u64) -> u32 {
        (self.sectors as u64 / sectors_per_block) as u32
    }

    fn decode(raw: &RawInode) -> Result<Self> {
        let mode = raw.mode.get();
        let type_ = FileType::from_raw_mode(mode)
            .ok_or(Error::with_message(Errno::EIO, "invalid file type"))?;
        let size = if type_ == FileType::File {
            ((raw.size_high.get() as u64) << 32) | raw.size_low.get() as u64
        } else {
            raw.size_low.get() as u64
        };
        let mut block_ptrs = [0; 15];
        for (ptr, raw_ptr) in block_ptrs.iter_mut().zip(raw.block.iter()) {
            *ptr = raw_ptr.get();
        }
        Ok(Self {
            type_,
            perm: FilePerm::from_raw_mode(mode),
            uid: ((raw.osd2.uid_high.get() as u32) << 16) | raw.uid.get() as u32,
            gid: ((raw.osd2.gid_high.get() as u32) << 16) | raw.gid.get() as u32,
            size,
            atime: Duration::from_secs(raw.atime.get() as u64),
            ctime: Duration::from_secs(raw.ctime.get() as u64),
            mtime: Duration::from_secs(raw.mtime.get() as u64),
            dtime: Duration::from_secs(raw.dtime.get() as u64),
            links_count: raw.links_count.get(),
            sectors: raw.blocks_count.get(),
            flags: FileFlags::from_bits_truncate(raw.flags.get()),
            generation: raw.generation.get(),
            block_ptrs: BlockPtrs::from_raw(block_ptrs),
        })
    }

    /// Stores the descriptor into `raw`, keeping the fields it does not describe.
    fn encode_into(&self, raw: &mut RawInode) {
        raw.mode = self.mode().into();
        raw.uid = (self.uid as u16).into();
        raw.gid = (self.gid as u16).into();
        raw.osd2.uid_high = ((self.uid >> 16) as u16).into();
        raw.osd2.gid_high = ((self.gid >> 16) as u16).into();
        raw.size_low = (self.size as u32).into();
        if self.type_ == FileType::File {
            raw.size_high = ((self.size >> 32) as u32).into();
        }
        raw.atime = (self.atime.as_secs() as u32).into();
        raw.ctime = (self.ctime.as_secs() as u32).into();
        raw.mtime = (self.mtime.as_secs() as u32).into();
        raw.dtime = (self.dtime.as_secs() as u32).into();
        raw.links_count = self.links_count.into();
        raw.blocks_count = self.sectors.into();
        raw.flags = self.flags.bits().into();
        raw.generation = self.generation.into();
        for (raw_ptr, ptr) in raw.block.iter_mut().zip(self.block_ptrs.to_raw()) {
            *raw_ptr = ptr.into();
        }
    }
}

/// Returns the block holding the record of `ino` and the offset inside it.
fn locate_inode(ctx: &mut OpContext, ino: u32) -> Result<(Bid, usize)> {
    let (block_group_idx, idx) = ctx.geo().locate_ino(ino)?;
    let inode_table_bid = descriptor_for(ctx, block_group_idx)?.inode_table_bid;
    let geo = ctx.geo();
    let offset = idx as usize * geo.inode_size;
    Ok((
        inode_table_bid + (offset / geo.block_size) as Bid,
        offset % geo.block_size,
    ))
}

/// Reads the inode `ino`.
pub(crate) fn read_inode(ctx: &mut OpContext, ino: u32) -> Result<InodeDesc> {
    let (bid, offset) = locate_inode(ctx, ino)?;
    let bytes = ctx.read_block(bid)?;
    let raw = RawInode::read_from_bytes(&bytes[offset..offset + RAW_INODE_SIZE])
        .map_err(|_| Error::with_message(Errno::EIO, "truncated inode"))?;
    InodeDesc::decode(&raw)
}

/// Writes the inode `ino`.
///
/// Only the first 128 bytes of the record are touched.
pub(crate) fn write_inode(ctx: &mut OpContext, ino: u32, desc: &InodeDesc) -> Result<()> {
    let (bid, offset) = locate_inode(ctx, ino)?;
    let bytes = &mut ctx.modify_block(bid)?[offset..offset + RAW_INODE_SIZE];
    let raw = RawInode::mut_from_bytes(bytes)
        .map_err(|_| Error::with_message(Errno::EIO, "truncated inode"))?;
    desc.encode_into(raw);
    Ok(())
}

/// Zeroes the whole record of the inode `ino` and writes `desc` into it.
pub(crate) fn init_inode(ctx: &mut OpContext, ino: u32, desc: &InodeDesc) -> Result<()> {
    let (bid, offset) = locate_inode(ctx, ino)?;
    let inode_size = ctx.geo().inode_size;
    ctx.modify_block(bid)?[offset..offset + inode_size].fill(0);
    write_inode(ctx, ino, desc)
}

/// Applies `f` to the inode `ino` and writes the result back.
pub(crate) fn update_inode<F, T>(ctx: &mut OpContext, ino: u32, f: F) -> Result<T>
where
    F: FnOnce(&mut InodeDesc) -> Result<T>,
{
    let mut desc = read_inode(ctx, ino)?;
    let ret = f(&mut desc)?;
    write_inode(ctx, ino, &desc)?;
    Ok(ret)
}

const RAW_INODE_SIZE: usize = core::mem::size_of::<RawInode>();

const_assert!(core::mem::size_of::<RawInode>() == 128);

/// The raw inode on device.
///
/// Each block group has an array of inodes (Inode Table) it is responsible for.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RawInode {
    /// File mode (type and permissions).
    pub mode: U16,
    /// Low 16 bits of User Id.
    pub uid: U16,
    /// Lower 32 bits of size in bytes.
    pub size_low: U32,
    /// Access time.
    pub atime: U32,
    /// Creation time.
    pub ctime: U32,
    /// Modification time.
    pub mtime: U32,
    /// Deletion time.
    pub dtime: U32,
    /// Low 16 bits of Group Id.
    pub gid: U16,
    /// Hard links count.
    pub links_count: U16,
    /// Number of 512-byte sectors.
    pub blocks_count: U32,
    /// File Flags.
    pub flags: U32,
    /// OS dependent Value 1.
    reserved1: U32,
    /// Pointers to blocks.
    pub block: [U32; 15],
    /// File version (for NFS).
    pub generation: U32,
    /// In revision 0, this field is reserved.
    /// In revision 1, File ACL.
    pub file_acl: U32,
    /// In revision 0, this field is reserved.
    /// In revision 1, Upper 32 bits of file size (if feature bit set)
    /// if it's a file, Directory ACL if it's a directory.
    pub size_high: U32,
    /// Fragment address.
    pub frag_addr: U32,
    /// OS dependent 2.
    pub osd2: Osd2,
}

/// OS dependent Value 2
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Osd2 {
    /// Fragment number.
    pub frag_num: u8,
    /// Fragment size.
    pub frag_size: u8,
    pad1: U16,
    /// High 16 bits of User Id.
    pub uid_high: U16,
    /// High 16 bits of Group Id.
    pub gid_high: U16,
    reserved2: U32,
}

#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileType {
    /// FIFO special file
    Fifo = 0o010000,
    /// Character device
    Char = 0o020000,
    /// Directory
    Dir = 0o040000,
    /// Block device
    Block = 0o060000,
    /// Regular file
    File = 0o100000,
    /// Symbolic link
    Symlink = 0o120000,
    /// Socket
    Socket = 0o140000,
}

impl FileType {
    pub fn from_raw_mode(mode: u16) -> Option<Self> {
        const TYPE_MASK: u16 = 0o170000;
        let type_ = match mode & TYPE_MASK {
            0o010000 => Self::Fifo,
            0o020000 => Self::Char,
            0o040000 => Self::Dir,
            0o060000 => Self::Block,
            0o100000 => Self::File,
            0o120000 => Self::Symlink,
            0o140000 => Self::Socket,
            _ => return None,
        };
        Some(type_)
    }

    /// Parses the type tag of a directory entry. Tag 0 means unknown.
    pub fn from_dirent_tag(tag: u8) -> Option<Self> {
        let type_ = match tag {
            1 => Self::File,
            2 => Self::Dir,
            3 => Self::Char,
            4 => Self::Block,
            5 => Self::Fifo,
            6 => Self::Socket,
            7 => Self::Symlink,
            _ => return None,
        };
        Some(type_)
    }

    /// Returns the type tag stored in directory entries.
    pub fn dirent_tag(&self) -> u8 {
        match self {
            Self::File => 1,
            Self::Dir => 2,
            Self::Char => 3,
            Self::Block => 4,
            Self::Fifo => 5,
            Self::Socket => 6,
            Self::Symlink => 7,
        }
    }
}

bitflags! {
    pub struct FilePerm: u16 {
        /// set-user-ID
        const S_ISUID = 0o4000;
        /// set-group-ID
        const S_ISGID = 0o2000;
        /// sticky bit
        const S_ISVTX = 0o1000;
        /// read by owner
        const S_IRUSR = 0o0400;
        /// write by owner
        const S_IWUSR = 0o0200;
        /// execute/search by owner
        const S_IXUSR = 0o0100;
        /// read by group
        const S_IRGRP = 0o0040;
        /// write by group
        const S_IWGRP = 0o0020;
        /// execute/search by group
        const S_IXGRP = 0o0010;
        /// read by others
        const S_IROTH = 0o0004;
        /// write by others
        const S_IWOTH = 0o0002;
        /// execute/search by others
        const S_IXOTH = 0o0001;
    }
}

impl FilePerm {
    pub fn from_raw_mode(mode: u16) -> Self {
        const PERM_MASK: u16 = 0o7777;
        Self::from_bits_truncate(mode & PERM_MASK)
    }
}

bitflags! {
    pub struct FileFlags: u32 {
        /// Secure deletion.
        const SECURE_DEL = 1 << 0;
        /// Undelete.
        const UNDELETE = 1 << 1;
        /// Compress file.
        const COMPRESS = 1 << 2;
        /// Synchronous updates.
        const SYNC_UPDATE = 1 << 3;
        /// Immutable file.
        const IMMUTABLE = 1 << 4;
        /// Append only.
        const APPEND_ONLY = 1 << 5;
        /// Do not dump file.
        const NO_DUMP = 1 << 6;
        /// Do not update atime.
        const NO_ATIME = 1 << 7;
        /// Hash-indexed directory.
        const INDEX_DIR = 1 << 12;
        /// Top of directory hierarchies.
        const TOP_DIR = 1 << 17;
    }
}
