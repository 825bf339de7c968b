// SPDX-License-Identifier: MPL-2.0

use crate::prelude::*;

/// The type of an inode, encoded the same way as the type bits of `st_mode`.
#[repr(u16)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InodeType {
    Unknown = 0o000000,
    NamedPipe = 0o010000,
    CharDevice = 0o020000,
    Dir = 0o040000,
    BlockDevice = 0o060000,
    File = 0o100000,
    SymLink = 0o120000,
    Socket = 0o140000,
}

impl InodeType {
    pub fn is_regular_file(&self) -> bool {
        *self == InodeType::File
    }

    pub fn is_directory(&self) -> bool {
        *self == InodeType::Dir
    }

    pub fn is_seekable(&self) -> bool {
        *self != InodeType::NamedPipe && *self != Self::Socket
    }

    /// Parses the inode type in the `mode`.
    pub fn from_raw_mode(mode: u16) -> Result<Self> {
        const TYPE_MASK: u16 = 0o170000;
        let type_ = match mode & TYPE_MASK {
            // Special case
            0 => Self::File,
            0o010000 => Self::NamedPipe,
            0o020000 => Self::CharDevice,
            0o040000 => Self::Dir,
            0o060000 => Self::BlockDevice,
            0o100000 => Self::File,
            0o120000 => Self::SymLink,
            0o140000 => Self::Socket,
            _ => return_errno_with_message!(Errno::EINVAL, "invalid file type"),
        };
        Ok(type_)
    }
}

bitflags! {
    /// The permission bits of `st_mode`.
    pub struct InodeMode: u16 {
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

impl InodeMode {
    pub fn from_raw_mode(mode: u16) -> Self {
        Self::from_bits_truncate(mode)
    }
}

/// File metadata, the type-safe counterpart of `struct stat`.
#[derive(Debug, Clone)]
pub struct Metadata {
    /// The inode number, unique within the file system.
    pub ino: u64,
    /// The size in bytes.
    pub size: usize,
    /// The optimal block size for I/O.
    pub blk_size: usize,
    /// The number of 512-byte sectors allocated for the inode on disk.
    pub nr_sectors_allocated: usize,
    pub atime: Duration,
    pub mtime: Duration,
    pub ctime: Duration,
    pub type_: InodeType,
    pub mode: InodeMode,
    pub nlinks: usize,
    pub uid: u32,
    pub gid: u32,
}

/// The attributes of an inode that is about to be created.
#[derive(Debug, Clone, Copy)]
pub struct NewInode {
    pub type_: InodeType,
    pub mode: InodeMode,
    pub uid: u32,
    pub gid: u32,
}

impl NewInode {
    /// Returns the attributes of an inode owned by root.
    pub fn new(type_: InodeType, mode: InodeMode) -> Self {
        Self {
            type_,
            mode,
            uid: 0,
            gid: 0,
        }
    }
}

/// A set of attribute changes.
///
/// Fields that are `None` are left untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    pub mode: Option<InodeMode>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<usize>,
    pub atime: Option<Duration>,
    pub mtime: Option<Duration>,
}
