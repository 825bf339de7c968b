// SPDX-License-Identifier: MPL-2.0

//! The glue between ext2 and the virtual file system.

mod fs;
mod inode;

use ember_vfs::{FileSystem, FileSystemType};

use crate::{config::MountOptions, fs::Ext2, prelude::*};

/// The ext2 file system type.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ext2Type;

impl FileSystemType for Ext2Type {
    fn name(&self) -> &'static str {
        "ext2"
    }

    fn mount(
        &self,
        args: Option<&str>,
        device: Arc<dyn BlockDevice>,
    ) -> ember_vfs::Result<Arc<dyn FileSystem>> {
        let options = match args {
            Some(args) => MountOptions::parse(args)?,
            None => MountOptions::default(),
        };
        let fs: Arc<dyn FileSystem> = Ext2::open(device, options)?;
        Ok(fs)
    }
}

impl From<Error> for ember_vfs::Error {
    fn from(err: Error) -> Self {
        use ember_vfs::Errno as VfsErrno;

        let errno = match err.error() {
            Errno::ENOENT => VfsErrno::ENOENT,
            Errno::EIO => VfsErrno::EIO,
            Errno::ENOMEM => VfsErrno::ENOMEM,
            Errno::EEXIST => VfsErrno::EEXIST,
            Errno::ENOTDIR => VfsErrno::ENOTDIR,
            Errno::EISDIR => VfsErrno::EISDIR,
            Errno::EINVAL => VfsErrno::EINVAL,
            Errno::EFBIG => VfsErrno::EFBIG,
            Errno::ENOSPC => VfsErrno::ENOSPC,
            Errno::EROFS => VfsErrno::EROFS,
            Errno::EMLINK => VfsErrno::EMLINK,
            Errno::ENAMETOOLONG => VfsErrno::ENAMETOOLONG,
            Errno::ENOTEMPTY => VfsErrno::ENOTEMPTY,
        };
        match err.message() {
            Some(msg) => ember_vfs::Error::with_message(errno, msg),
            None => ember_vfs::Error::new(errno),
        }
    }
}
