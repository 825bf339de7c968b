// SPDX-License-Identifier: MPL-2.0

use ember_block::BlockDevice;

use crate::{
    dirent_visitor::DirentVisitor,
    inode::{Metadata, NewInode, SetAttr},
    prelude::*,
};

/// The statistics of a mounted file system, as reported by `statfs`.
#[derive(Debug, Clone)]
pub struct FsStat {
    pub magic: u64,
    pub bsize: usize,
    pub blocks: usize,
    pub bfree: usize,
    pub bavail: usize,
    pub files: usize,
    pub ffree: usize,
    pub namelen: usize,
    pub read_only: bool,
}

/// A mounted file system.
///
/// Every inode is addressed by its number; the layer above keeps the
/// name-to-number mappings.
pub trait FileSystem: Send + Sync + Debug {
    /// Returns the name of the file system type.
    fn name(&self) -> &'static str;

    /// Returns the inode number of the root directory.
    fn root_ino(&self) -> u64;

    /// Returns the statistics of the file system.
    fn stat(&self) -> FsStat;

    /// Writes back all pending metadata.
    fn sync(&self) -> Result<()>;

    /// Detaches the file system from its device.
    ///
    /// No other method may be called afterwards.
    fn unmount(&self) -> Result<()>;

    /// Finds `name` in the directory `parent`.
    fn lookup(&self, parent: u64, name: &str) -> Result<Metadata>;

    fn getattr(&self, ino: u64) -> Result<Metadata>;

    fn setattr(&self, ino: u64, attr: &SetAttr) -> Result<Metadata>;

    fn read_at(&self, ino: u64, offset: usize, buf: &mut [u8]) -> Result<usize>;

    fn write_at(&self, ino: u64, offset: usize, buf: &[u8]) -> Result<usize>;

    /// Feeds the entries of the directory `ino` at and after `offset` to `visitor`.
    ///
    /// Returns the number of entries visited.
    fn readdir_at(&self, ino: u64, offset: usize, visitor: &mut dyn DirentVisitor)
    -> Result<usize>;

    /// Creates a file or a directory called `name` in `parent`.
    fn create(&self, parent: u64, name: &str, attr: NewInode) -> Result<Metadata>;

    /// Creates a hard link called `name` in `parent` to the inode `ino`.
    fn link(&self, parent: u64, name: &str, ino: u64) -> Result<Metadata>;

    /// Removes the non-directory entry `name` from `parent`.
    fn unlink(&self, parent: u64, name: &str) -> Result<()>;

    /// Removes the empty directory `name` from `parent`.
    fn rmdir(&self, parent: u64, name: &str) -> Result<()>;

    fn rename(&self, old_parent: u64, old_name: &str, new_parent: u64, new_name: &str)
    -> Result<()>;

    /// Returns the metadata of the root directory.
    fn root_metadata(&self) -> Result<Metadata> {
        self.getattr(self.root_ino())
    }
}

/// A kind of file system that can be mounted on a block device.
pub trait FileSystemType: Send + Sync {
    fn name(&self) -> &'static str;

    /// Mounts the file system stored on `device`.
    ///
    /// `args` is the comma-separated option string given to `mount`.
    fn mount(
        &self,
        args: Option<&str>,
        device: Arc<dyn BlockDevice>,
    ) -> Result<Arc<dyn FileSystem>>;
}
