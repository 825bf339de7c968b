// SPDX-License-Identifier: MPL-2.0

use ember_vfs::{InodeMode, InodeType, Metadata, NewInode, SetAttr};

use crate::{
    inode::{FilePerm, FileType},
    ops::{InodeAttr, NewInodeAttr, SetInodeAttr},
    prelude::*,
};

impl From<FileType> for InodeType {
    fn from(type_: FileType) -> Self {
        match type_ {
            FileType::Fifo => InodeType::NamedPipe,
            FileType::Char => InodeType::CharDevice,
            FileType::Dir => InodeType::Dir,
            FileType::Block => InodeType::BlockDevice,
            FileType::File => InodeType::File,
            FileType::Symlink => InodeType::SymLink,
            FileType::Socket => InodeType::Socket,
        }
    }
}

impl TryFrom<InodeType> for FileType {
    type Error = Error;

    fn try_from(type_: InodeType) -> Result<Self> {
        FileType::from_raw_mode(type_ as u16)
            .ok_or(Error::with_message(Errno::EINVAL, "unknown inode type"))
    }
}

impl From<InodeMode> for FilePerm {
    fn from(mode: InodeMode) -> Self {
        FilePerm::from_bits_truncate(mode.bits())
    }
}

impl From<FilePerm> for InodeMode {
    fn from(perm: FilePerm) -> Self {
        InodeMode::from_bits_truncate(perm.bits())
    }
}

impl TryFrom<NewInode> for NewInodeAttr {
    type Error = Error;

    fn try_from(new_inode: NewInode) -> Result<Self> {
        Ok(Self {
            type_: FileType::try_from(new_inode.type_)?,
            perm: new_inode.mode.into(),
            uid: new_inode.uid,
            gid: new_inode.gid,
        })
    }
}

impl From<&SetAttr> for SetInodeAttr {
    fn from(attr: &SetAttr) -> Self {
        Self {
            perm: attr.mode.map(FilePerm::from),
            uid: attr.uid,
            gid: attr.gid,
            size: attr.size.map(|size| size as u64),
            atime: attr.atime,
            mtime: attr.mtime,
        }
    }
}

pub(super) fn to_metadata(attr: &InodeAttr, block_size: usize) -> Metadata {
    Metadata {
        ino: attr.ino as u64,
        size: attr.size as usize,
        blk_size: block_size,
        nr_sectors_allocated: attr.sectors as usize,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        type_: attr.type_.into(),
        mode: attr.perm.into(),
        nlinks: attr.nlinks as usize,
        uid: attr.uid,
        gid: attr.gid,
    }
}
