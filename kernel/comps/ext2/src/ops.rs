// SPDX-License-Identifier: MPL-2.0

//! The operations on files and directories.
//!
//! Each public method of [`Ext2`] here runs as one operation: its block
//! changes reach the device together when it succeeds, and none of them do
//! when it fails.

use core::ops::ControlFlow;

use ember_vfs::is_dot_or_dotdot;

use crate::{
    balloc::{allocate_inode, free_inode, is_inode_allocated},
    block_group::search_most_free,
    dir::{self, MAX_FNAME_LEN, init_dir_block},
    fs::Ext2,
    inode::{
        FilePerm, FileType, InodeDesc, MAX_LINKS, ROOT_INO, read_inode, update_inode, write_inode,
    },
    mapper::{expand, get_block, resize, truncate},
    op_ctx::OpContext,
    prelude::*,
};

/// The attributes of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeAttr {
    pub ino: u32,
    pub type_: FileType,
    pub perm: FilePerm,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlinks: u16,
    /// Number of 512-byte sectors, index blocks included.
    pub sectors: u32,
    pub atime: Duration,
    pub mtime: Duration,
    pub ctime: Duration,
}

impl InodeAttr {
    fn new(ino: u32, desc: &InodeDesc) -> Self {
        Self {
            ino,
            type_: desc.type_,
            perm: desc.perm,
            uid: desc.uid,
            gid: desc.gid,
            size: desc.size,
            nlinks: desc.links_count,
            sectors: desc.sectors,
            atime: desc.atime,
            mtime: desc.mtime,
            ctime: desc.ctime,
        }
    }
}

/// The attributes of an inode about to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewInodeAttr {
    pub type_: FileType,
    pub perm: FilePerm,
    pub uid: u32,
    pub gid: u32,
}

impl NewInodeAttr {
    pub fn new(type_: FileType, perm: FilePerm) -> Self {
        Self {
            type_,
            perm,
            uid: 0,
            gid: 0,
        }
    }
}

/// The attributes to change with [`Ext2::setattr`]. `None` keeps the current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetInodeAttr {
    pub perm: Option<FilePerm>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<Duration>,
    pub mtime: Option<Duration>,
}

impl Ext2 {
    /// Looks up `name` in the directory `parent`.
    pub fn lookup(&self, parent: u32, name: &str) -> Result<InodeAttr> {
        if name.len() > MAX_FNAME_LEN {
            return_errno_with_message!(Errno::ENAMETOOLONG, "the name is too long");
        }
        self.transaction(|ctx| {
            let dir = read_dir(ctx, parent)?;
            let ino = dir::lookup(ctx, &dir, name)?;
            let desc = read_inode(ctx, ino)?;
            Ok(InodeAttr::new(ino, &desc))
        })
    }

    /// Returns the attributes of the inode `ino`.
    pub fn getattr(&self, ino: u32) -> Result<InodeAttr> {
        self.transaction(|ctx| {
            let desc = read_live_inode(ctx, ino)?;
            Ok(InodeAttr::new(ino, &desc))
        })
    }

    /// Changes the attributes of the inode `ino`.
    ///
    /// A new size truncates or extends the file; the new bytes read as zeros.
    pub fn setattr(&self, ino: u32, attr: &SetInodeAttr) -> Result<InodeAttr> {
        let now = self.now();
        self.modify(|ctx| {
            let mut desc = read_live_inode(ctx, ino)?;
            if let Some(size) = attr.size {
                if desc.is_dir() {
                    return_errno_with_message!(Errno::EISDIR, "cannot resize a directory");
                }
                if size != desc.size && desc.is_fast_symlink() {
                    return_errno_with_message!(Errno::EINVAL, "cannot resize an inline symlink");
                }
                if size != desc.size {
                    resize(ctx, ino, &mut desc, size)?;
                    desc.mtime = now;
                }
            }
            if let Some(perm) = attr.perm {
                desc.perm = perm;
            }
            if let Some(uid) = attr.uid {
                desc.uid = uid;
            }
            if let Some(gid) = attr.gid {
                desc.gid = gid;
            }
            if let Some(atime) = attr.atime {
                desc.atime = atime;
            }
            if let Some(mtime) = attr.mtime {
                desc.mtime = mtime;
            }
            desc.ctime = now;
            write_inode(ctx, ino, &desc)?;
            Ok(InodeAttr::new(ino, &desc))
        })
    }

    /// Reads the file `ino` from `offset` into `buf`.
    ///
    /// Returns the number of bytes read, which is short at the end of the file.
    pub fn read_at(&self, ino: u32, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.transaction(|ctx| {
            let desc = read_live_inode(ctx, ino)?;
            if desc.is_dir() {
                return_errno_with_message!(Errno::EISDIR, "the inode is a directory");
            }
            read_data(ctx, &desc, offset, buf)
        })
    }

    /// Writes `buf` to the file `ino` at `offset`, growing the file as needed.
    pub fn write_at(&self, ino: u32, offset: u64, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let now = self.now();
        self.modify(|ctx| {
            let mut desc = read_live_inode(ctx, ino)?;
            if desc.is_dir() {
                return_errno_with_message!(Errno::EISDIR, "the inode is a directory");
            }
            if desc.is_fast_symlink() {
                return_errno_with_message!(Errno::EINVAL, "cannot write to an inline symlink");
            }
            let written = write_data(ctx, ino, &mut desc, offset, buf)?;
            desc.mtime = now;
            desc.ctime = now;
            write_inode(ctx, ino, &desc)?;
            Ok(written)
        })
    }

    /// Creates an inode named `name` in the directory `parent`.
    ///
    /// Directories are created as by [`Ext2::mkdir`].
    pub fn create(&self, parent: u32, name: &str, attr: NewInodeAttr) -> Result<InodeAttr> {
        if attr.type_ == FileType::Dir {
            return self.mkdir(parent, name, attr.perm, attr.uid, attr.gid);
        }
        check_name(name)?;
        let now = self.now();
        self.modify(|ctx| {
            let mut dir = read_dir(ctx, parent)?;
            check_absent(ctx, &dir, name)?;

            let mut template = InodeDesc::new(attr.type_, attr.perm, now);
            template.uid = attr.uid;
            template.gid = attr.gid;
            let block_group_idx = group_of(ctx, parent);
            let ino = allocate_inode(ctx, block_group_idx, &template)?;

            dir::link(ctx, parent, &mut dir, name, ino, attr.type_)?;
            dir.mtime = now;
            dir.ctime = now;
            write_inode(ctx, parent, &dir)?;
            debug!("[ext2] create inode {} as {:?} in {}", ino, name, parent);
            Ok(InodeAttr::new(ino, &template))
        })
    }

    /// Creates the directory `name` in the directory `parent`.
    ///
    /// Directories under the root are spread to the group with the most free
    /// space; the others stay in the group of their parent.
    pub fn mkdir(
        &self,
        parent: u32,
        name: &str,
        perm: FilePerm,
        uid: u32,
        gid: u32,
    ) -> Result<InodeAttr> {
        check_name(name)?;
        let now = self.now();
        self.modify(|ctx| {
            let mut dir = read_dir(ctx, parent)?;
            check_absent(ctx, &dir, name)?;
            if dir.links_count >= MAX_LINKS {
                return_errno_with_message!(Errno::EMLINK, "too many links to the parent");
            }

            let mut desc = InodeDesc::new(FileType::Dir, perm, now);
            desc.uid = uid;
            desc.gid = gid;
            desc.links_count = 2;
            let block_group_idx = if parent == ROOT_INO {
                search_most_free(ctx)?
            } else {
                group_of(ctx, parent)
            };
            let ino = allocate_inode(ctx, block_group_idx, &desc)?;

            expand(ctx, ino, &mut desc, 1, true)?;
            let bid = get_block(ctx, &desc, 0)?;
            init_dir_block(ctx, bid, ino, parent)?;
            write_inode(ctx, ino, &desc)?;

            dir::link(ctx, parent, &mut dir, name, ino, FileType::Dir)?;
            dir.links_count += 1;
            dir.mtime = now;
            dir.ctime = now;
            write_inode(ctx, parent, &dir)?;
            debug!("[ext2] mkdir inode {} as {:?} in {}", ino, name, parent);
            Ok(InodeAttr::new(ino, &desc))
        })
    }

    /// Adds a hard link named `name` in the directory `parent` to the inode `ino`.
    pub fn link(&self, parent: u32, name: &str, ino: u32) -> Result<InodeAttr> {
        check_name(name)?;
        let now = self.now();
        self.modify(|ctx| {
            let mut desc = read_live_inode(ctx, ino)?;
            if desc.is_dir() {
                return_errno_with_message!(Errno::EISDIR, "cannot link a directory");
            }
            if desc.links_count >= MAX_LINKS {
                return_errno_with_message!(Errno::EMLINK, "too many links");
            }
            let mut dir = read_dir(ctx, parent)?;
            check_absent(ctx, &dir, name)?;

            dir::link(ctx, parent, &mut dir, name, ino, desc.type_)?;
            dir.mtime = now;
            dir.ctime = now;
            write_inode(ctx, parent, &dir)?;

            desc.links_count += 1;
            desc.ctime = now;
            write_inode(ctx, ino, &desc)?;
            Ok(InodeAttr::new(ino, &desc))
        })
    }

    /// Removes the name `name` of a non-directory from the directory `parent`.
    ///
    /// The inode and its blocks are freed with its last link.
    pub fn unlink(&self, parent: u32, name: &str) -> Result<()> {
        if is_dot_or_dotdot(name) {
            return_errno_with_message!(Errno::EISDIR, "cannot unlink a directory");
        }
        let now = self.now();
        self.modify(|ctx| {
            let dir = read_dir(ctx, parent)?;
            let ino = dir::lookup(ctx, &dir, name)?;
            let desc = read_inode(ctx, ino)?;
            if desc.is_dir() {
                return_errno_with_message!(Errno::EISDIR, "cannot unlink a directory");
            }
            dir::unlink(ctx, &dir, name)?;
            touch_dir(ctx, parent, now, 0)?;
            drop_link(ctx, ino, desc, now)
        })
    }

    /// Removes the empty directory `name` from the directory `parent`.
    pub fn rmdir(&self, parent: u32, name: &str) -> Result<()> {
        if name == "." {
            return_errno_with_message!(Errno::EINVAL, "cannot remove the current directory");
        }
        if name == ".." {
            return_errno_with_message!(Errno::ENOTEMPTY, "cannot remove the parent directory");
        }
        let now = self.now();
        self.modify(|ctx| {
            let dir = read_dir(ctx, parent)?;
            let ino = dir::lookup(ctx, &dir, name)?;
            let mut desc = read_inode(ctx, ino)?;
            if !desc.is_dir() {
                return_errno_with_message!(Errno::ENOTDIR, "the inode is not a directory");
            }
            dir::check_empty(ctx, &desc)?;

            dir::unlink(ctx, &dir, name)?;
            touch_dir(ctx, parent, now, -1)?;
            desc.links_count = 0;
            release(ctx, ino, &mut desc, now)
        })
    }

    /// Moves the entry `old_name` of `old_parent` to `new_name` of `new_parent`.
    ///
    /// An existing destination is replaced: a file by anything but a directory,
    /// a directory only by a directory and only if it is empty.
    pub fn rename(
        &self,
        old_parent: u32,
        old_name: &str,
        new_parent: u32,
        new_name: &str,
    ) -> Result<()> {
        if is_dot_or_dotdot(old_name) || is_dot_or_dotdot(new_name) {
            return_errno_with_message!(Errno::EINVAL, "cannot rename . or ..");
        }
        check_name(new_name)?;
        let now = self.now();
        self.modify(|ctx| {
            let old_dir = read_dir(ctx, old_parent)?;
            let new_dir = read_dir(ctx, new_parent)?;
            let src_ino = dir::lookup(ctx, &old_dir, old_name)?;
            let mut src = read_inode(ctx, src_ino)?;
            if old_parent == new_parent && old_name == new_name {
                return Ok(());
            }
            if src.is_dir() {
                check_not_ancestor(ctx, src_ino, new_parent)?;
            }

            let moves_dir = src.is_dir() && old_parent != new_parent;
            if moves_dir && new_dir.links_count >= MAX_LINKS {
                return_errno_with_message!(Errno::EMLINK, "too many links to the new parent");
            }

            match dir::find(ctx, &new_dir, new_name)? {
                // Both names refer to the same inode.
                Some(dst) if dst.ino == src_ino => return Ok(()),
                Some(dst) => {
                    let mut dst_desc = read_inode(ctx, dst.ino)?;
                    match (src.is_dir(), dst_desc.is_dir()) {
                        (true, false) => return_errno_with_message!(
                            Errno::ENOTDIR,
                            "cannot replace a non-directory with a directory"
                        ),
                        (false, true) => return_errno_with_message!(
                            Errno::EISDIR,
                            "cannot replace a directory with a non-directory"
                        ),
                        (true, true) => dir::check_empty(ctx, &dst_desc)?,
                        (false, false) => {}
                    }
                    dir::relink(ctx, &new_dir, new_name, src_ino, src.type_)?;
                    if dst_desc.is_dir() {
                        touch_dir(ctx, new_parent, now, -1)?;
                        dst_desc.links_count = 0;
                        release(ctx, dst.ino, &mut dst_desc, now)?;
                    } else {
                        touch_dir(ctx, new_parent, now, 0)?;
                        drop_link(ctx, dst.ino, dst_desc, now)?;
                    }
                }
                None => {
                    let mut new_dir = new_dir;
                    dir::link(ctx, new_parent, &mut new_dir, new_name, src_ino, src.type_)?;
                    new_dir.mtime = now;
                    new_dir.ctime = now;
                    write_inode(ctx, new_parent, &new_dir)?;
                }
            }

            // The new parent may share its blocks with the old one.
            let old_dir = read_inode(ctx, old_parent)?;
            dir::unlink(ctx, &old_dir, old_name)?;
            touch_dir(ctx, old_parent, now, 0)?;

            if moves_dir {
                dir::relink(ctx, &src, "..", new_parent, FileType::Dir)?;
                touch_dir(ctx, old_parent, now, -1)?;
                touch_dir(ctx, new_parent, now, 1)?;
            }
            src.ctime = now;
            write_inode(ctx, src_ino, &src)?;
            Ok(())
        })
    }

    /// Feeds the entries of the directory `ino` from the position `offset` on
    /// to `visit`, with the position to resume from after each entry.
    ///
    /// The walk stops when `visit` breaks; the position of the entry it
    /// refused is returned.
    ///
    /// Entries whose names are not valid UTF-8 cannot be looked up and are
    /// skipped. They still keep the directory from being empty.
    pub fn readdir_at<F>(&self, ino: u32, offset: u64, mut visit: F) -> Result<u64>
    where
        F: FnMut(&str, u32, FileType, u64) -> ControlFlow<()>,
    {
        self.transaction(|ctx| {
            let dir = read_dir(ctx, ino)?;
            let has_filetype = ctx.geo().has_filetype;
            dir::read_entries(ctx, &dir, offset, |ctx, record, next_pos| {
                let Ok(name) = core::str::from_utf8(&record.name) else {
                    debug!("[ext2] skip a non-UTF-8 entry of inode {}", record.ino);
                    return Ok(ControlFlow::Continue(()));
                };
                let type_ = match FileType::from_dirent_tag(record.file_type) {
                    Some(type_) if has_filetype => type_,
                    _ => read_inode(ctx, record.ino)?.type_,
                };
                Ok(visit(name, record.ino, type_, next_pos))
            })
        })
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\0']) {
        return_errno_with_message!(Errno::EINVAL, "invalid name");
    }
    if name.len() > MAX_FNAME_LEN {
        return_errno_with_message!(Errno::ENAMETOOLONG, "the name is too long");
    }
    if is_dot_or_dotdot(name) {
        return_errno_with_message!(Errno::EEXIST, "the name already exists");
    }
    Ok(())
}

fn check_absent(ctx: &mut OpContext, dir: &InodeDesc, name: &str) -> Result<()> {
    if dir::find(ctx, dir, name)?.is_some() {
        return_errno_with_message!(Errno::EEXIST, "the name already exists");
    }
    Ok(())
}

fn group_of(ctx: &OpContext, ino: u32) -> u32 {
    (ino - 1) / ctx.geo().inodes_per_group
}

fn read_live_inode(ctx: &mut OpContext, ino: u32) -> Result<InodeDesc> {
    if !is_inode_allocated(ctx, ino)? {
        return_errno_with_message!(Errno::ENOENT, "the inode is not in use");
    }
    read_inode(ctx, ino)
}

fn read_dir(ctx: &mut OpContext, ino: u32) -> Result<InodeDesc> {
    let desc = read_live_inode(ctx, ino)?;
    if !desc.is_dir() {
        return_errno_with_message!(Errno::ENOTDIR, "the inode is not a directory");
    }
    Ok(desc)
}

/// Stamps the directory `ino` as modified and adjusts its link count.
fn touch_dir(ctx: &mut OpContext, ino: u32, now: Duration, links: i32) -> Result<()> {
    update_inode(ctx, ino, |dir| {
        dir.links_count = dir.links_count.saturating_add_signed(links as i16);
        dir.mtime = now;
        dir.ctime = now;
        Ok(())
    })
}

/// Fails with `EINVAL` if the directory `ino` is `dir` or one of its ancestors.
fn check_not_ancestor(ctx: &mut OpContext, ino: u32, dir: u32) -> Result<()> {
    let mut cur = dir;
    let mut depth = 0u32;
    loop {
        if cur == ino {
            return_errno_with_message!(Errno::EINVAL, "cannot move a directory into itself");
        }
        if cur == ROOT_INO {
            return Ok(());
        }
        depth += 1;
        if depth > ctx.geo().inodes_count {
            return Err(ctx.record_error(Error::with_message(
                Errno::EIO,
                "the directory tree has a cycle",
            )));
        }
        let desc = read_inode(ctx, cur)?;
        cur = dir::lookup(ctx, &desc, "..")?;
    }
}

/// Drops one link of the non-directory `ino` and frees it with the last one.
fn drop_link(ctx: &mut OpContext, ino: u32, mut desc: InodeDesc, now: Duration) -> Result<()> {
    desc.links_count = desc.links_count.saturating_sub(1);
    if desc.links_count > 0 {
        desc.ctime = now;
        return write_inode(ctx, ino, &desc);
    }
    release(ctx, ino, &mut desc, now)
}

/// Frees the blocks and the inode `ino`, which has no links left.
fn release(ctx: &mut OpContext, ino: u32, desc: &mut InodeDesc, now: Duration) -> Result<()> {
    truncate(ctx, desc)?;
    desc.ctime = now;
    write_inode(ctx, ino, desc)?;
    free_inode(ctx, ino, now)
}

/// Reads the bytes of the file in `offset..offset + buf.len()`.
fn read_data(ctx: &mut OpContext, desc: &InodeDesc, offset: u64, buf: &mut [u8]) -> Result<usize> {
    if offset >= desc.size {
        return Ok(0);
    }
    let len = (desc.size - offset).min(buf.len() as u64) as usize;

    // Short symbolic links keep their target in the block pointers.
    if desc.is_fast_symlink() {
        let inline: Vec<u8> = desc
            .block_ptrs
            .to_raw()
            .iter()
            .flat_map(|ptr| ptr.to_le_bytes())
            .collect();
        let start = offset as usize;
        let end = (start + len).min(inline.len());
        let copied = end.saturating_sub(start);
        buf[..copied].copy_from_slice(&inline[start..end]);
        return Ok(copied);
    }

    let block_size = ctx.geo().block_size as u64;
    let mut done = 0;
    while done < len {
        let pos = offset + done as u64;
        let lblock = (pos / block_size) as u32;
        let in_block = (pos % block_size) as usize;
        let n = (block_size as usize - in_block).min(len - done);
        let dst = &mut buf[done..done + n];

        let bid = get_block(ctx, desc, lblock)?;
        if bid == 0 {
            dst.fill(0);
        } else if n == block_size as usize {
            ctx.read_into(bid, dst)?;
        } else {
            dst.copy_from_slice(&ctx.read_block(bid)?[in_block..in_block + n]);
        }
        done += n;
    }
    Ok(len)
}

/// Writes `buf` to the file at `offset` after mapping every block it touches.
fn write_data(
    ctx: &mut OpContext,
    ino: u32,
    desc: &mut InodeDesc,
    offset: u64,
    buf: &[u8],
) -> Result<usize> {
    let geo = *ctx.geo();
    let end = offset
        .checked_add(buf.len() as u64)
        .filter(|end| *end <= geo.max_file_size())
        .ok_or(Error::with_message(
            Errno::EFBIG,
            "the write exceeds the maximum file size",
        ))?;
    let block_size = geo.block_size as u64;
    let target = end.div_ceil(block_size) as u32;
    expand(ctx, ino, desc, target, false)?;

    let mut done = 0;
    while done < buf.len() {
        let pos = offset + done as u64;
        let lblock = (pos / block_size) as u32;
        let in_block = (pos % block_size) as usize;
        let n = (block_size as usize - in_block).min(buf.len() - done);
        let src = &buf[done..done + n];

        let bid = get_block(ctx, desc, lblock)?;
        if bid == 0 {
            return Err(ctx.record_error(Error::with_message(
                Errno::EIO,
                "writing into a hole of the file",
            )));
        }
        if n == block_size as usize {
            ctx.write_from(bid, src)?;
        } else {
            ctx.modify_block(bid)?[in_block..in_block + n].copy_from_slice(src);
        }
        done += n;
    }

    if end > desc.size {
        desc.size = end;
    }
    Ok(buf.len())
}
