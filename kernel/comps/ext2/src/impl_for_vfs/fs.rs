// SPDX-License-Identifier: MPL-2.0

use core::ops::ControlFlow;

use ember_vfs::{DirentVisitor, FileSystem, FsStat, Metadata, NAME_MAX, NewInode, SetAttr};

use super::inode::to_metadata;
use crate::{
    fs::Ext2,
    ops::{InodeAttr, NewInodeAttr, SetInodeAttr},
    prelude::*,
    super_block::MAGIC_NUM as EXT2_MAGIC,
};

type VfsResult<T> = ember_vfs::Result<T>;

impl FileSystem for Ext2 {
    fn name(&self) -> &'static str {
        "ext2"
    }

    fn root_ino(&self) -> u64 {
        Ext2::root_ino(self) as u64
    }

    fn stat(&self) -> FsStat {
        let stat = Ext2::stat(self);
        FsStat {
            magic: EXT2_MAGIC as _,
            bsize: stat.block_size,
            blocks: stat.total_blocks as _,
            bfree: stat.free_blocks as _,
            bavail: stat.free_blocks.saturating_sub(stat.reserved_blocks) as _,
            files: stat.total_inodes as _,
            ffree: stat.free_inodes as _,
            namelen: NAME_MAX,
            read_only: stat.read_only,
        }
    }

    fn sync(&self) -> VfsResult<()> {
        Ok(Ext2::sync(self)?)
    }

    fn unmount(&self) -> VfsResult<()> {
        Ok(Ext2::unmount(self)?)
    }

    fn lookup(&self, parent: u64, name: &str) -> VfsResult<Metadata> {
        let attr = Ext2::lookup(self, to_ino(parent)?, name)?;
        Ok(self.metadata(&attr))
    }

    fn getattr(&self, ino: u64) -> VfsResult<Metadata> {
        let attr = Ext2::getattr(self, to_ino(ino)?)?;
        Ok(self.metadata(&attr))
    }

    fn setattr(&self, ino: u64, attr: &SetAttr) -> VfsResult<Metadata> {
        let attr = Ext2::setattr(self, to_ino(ino)?, &SetInodeAttr::from(attr))?;
        Ok(self.metadata(&attr))
    }

    fn read_at(&self, ino: u64, offset: usize, buf: &mut [u8]) -> VfsResult<usize> {
        Ok(Ext2::read_at(self, to_ino(ino)?, offset as u64, buf)?)
    }

    fn write_at(&self, ino: u64, offset: usize, buf: &[u8]) -> VfsResult<usize> {
        Ok(Ext2::write_at(self, to_ino(ino)?, offset as u64, buf)?)
    }

    fn readdir_at(
        &self,
        ino: u64,
        offset: usize,
        visitor: &mut dyn DirentVisitor,
    ) -> VfsResult<usize> {
        let mut nr_visited = 0;
        let mut visit_err = None;
        Ext2::readdir_at(self, to_ino(ino)?, offset as u64, |name, ino, type_, next| {
            match visitor.visit(name, ino as u64, type_.into(), next as usize) {
                Ok(()) => {
                    nr_visited += 1;
                    ControlFlow::Continue(())
                }
                Err(err) => {
                    visit_err = Some(err);
                    ControlFlow::Break(())
                }
            }
        })?;
        // The error is only reported if no entry made it to the visitor.
        match visit_err {
            Some(err) if nr_visited == 0 => Err(err),
            _ => Ok(nr_visited),
        }
    }

    fn create(&self, parent: u64, name: &str, attr: NewInode) -> VfsResult<Metadata> {
        let attr = NewInodeAttr::try_from(attr)?;
        let attr = Ext2::create(self, to_ino(parent)?, name, attr)?;
        Ok(self.metadata(&attr))
    }

    fn link(&self, parent: u64, name: &str, ino: u64) -> VfsResult<Metadata> {
        let attr = Ext2::link(self, to_ino(parent)?, name, to_ino(ino)?)?;
        Ok(self.metadata(&attr))
    }

    fn unlink(&self, parent: u64, name: &str) -> VfsResult<()> {
        Ok(Ext2::unlink(self, to_ino(parent)?, name)?)
    }

    fn rmdir(&self, parent: u64, name: &str) -> VfsResult<()> {
        Ok(Ext2::rmdir(self, to_ino(parent)?, name)?)
    }

    fn rename(
        &self,
        old_parent: u64,
        old_name: &str,
        new_parent: u64,
        new_name: &str,
    ) -> VfsResult<()> {
        Ok(Ext2::rename(
            self,
            to_ino(old_parent)?,
            old_name,
            to_ino(new_parent)?,
            new_name,
        )?)
    }
}

impl Ext2 {
    fn metadata(&self, attr: &InodeAttr) -> Metadata {
        to_metadata(attr, self.geometry().block_size)
    }
}

fn to_ino(ino: u64) -> Result<u32> {
    u32::try_from(ino).map_err(|_| Error::with_message(Errno::ENOENT, "invalid inode number"))
}
