// SPDX-License-Identifier: MPL-2.0

//! Directory entries.
//!
//! The content of a directory is a sequence of variable-length records filling
//! whole blocks. A record never spans two blocks, its length is a multiple of 4
//! and may exceed what its name needs. A record whose inode number is 0 is a
//! tombstone: its space is free but still covered by its length.

use core::ops::ControlFlow;

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    little_endian::{U16, U32},
};

use crate::{
    inode::{FileType, InodeDesc},
    mapper::{expand, get_block},
    op_ctx::OpContext,
    prelude::*,
    utils::align_up,
};

/// Max length of file name.
pub const MAX_FNAME_LEN: usize = 255;

const HEADER_LEN: usize = core::mem::size_of::<RawDirEntryHeader>();

const_assert!(core::mem::size_of::<RawDirEntryHeader>() == 8);

/// The fixed part of a directory record on the device. The name follows it.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct RawDirEntryHeader {
    ino: U32,
    rec_len: U16,
    name_len: u8,
    /// Zero unless the `FILETYPE` feature is enabled.
    file_type: u8,
}

/// Returns the record length needed by a name of `name_len` bytes.
pub(crate) const fn rec_len_for(name_len: usize) -> usize {
    align_up(HEADER_LEN + name_len, 4)
}

/// A directory record and where it was found.
#[derive(Clone, Debug)]
pub(crate) struct DirRecord {
    pub ino: u32,
    pub rec_len: usize,
    pub file_type: u8,
    pub name: Vec<u8>,
    /// The device block holding the record.
    pub bid: Bid,
    /// The offset of the record inside its block.
    pub offset: usize,
    /// The offset of the previous record in the same block.
    pub prev: Option<usize>,
}

impl DirRecord {
    pub fn is_tombstone(&self) -> bool {
        self.ino == 0
    }

    /// Returns the bytes that the record really uses.
    pub fn used_len(&self) -> usize {
        if self.is_tombstone() {
            0
        } else {
            rec_len_for(self.name.len())
        }
    }

    pub fn is_dot_or_dotdot(&self) -> bool {
        self.name == b"." || self.name == b".."
    }
}

/// Walks the records of a directory in file order.
#[derive(Debug)]
pub(crate) struct DirIter {
    nr_blocks: u32,
    lblock: u32,
    /// The device block of `lblock`, or 0 if it has not been mapped yet.
    bid: Bid,
    offset: usize,
    prev: Option<usize>,
}

impl DirIter {
    pub fn new(ctx: &OpContext, dir: &InodeDesc) -> Self {
        Self::at(ctx, dir, 0)
    }

    /// Starts at the byte position `pos`, which must be a record boundary.
    pub fn at(ctx: &OpContext, dir: &InodeDesc, pos: u64) -> Self {
        let block_size = ctx.geo().block_size as u64;
        Self {
            nr_blocks: (dir.size / block_size) as u32,
            lblock: (pos / block_size) as u32,
            bid: 0,
            offset: (pos % block_size) as usize,
            prev: None,
        }
    }

    /// Returns the byte position of the next record.
    pub fn pos(&self, block_size: usize) -> u64 {
        self.lblock as u64 * block_size as u64 + self.offset as u64
    }

    pub fn nr_blocks(&self) -> u32 {
        self.nr_blocks
    }

    pub fn next(&mut self, ctx: &mut OpContext, dir: &InodeDesc) -> Result<Option<DirRecord>> {
        let block_size = ctx.geo().block_size;
        loop {
            if self.lblock >= self.nr_blocks {
                return Ok(None);
            }
            if self.offset >= block_size {
                self.lblock += 1;
                self.bid = 0;
                self.offset = 0;
                self.prev = None;
                continue;
            }
            if self.bid == 0 {
                self.bid = get_block(ctx, dir, self.lblock)?;
                if self.bid == 0 {
                    return Err(ctx.record_error(Error::with_message(
                        Errno::EIO,
                        "a directory block is not mapped",
                    )));
                }
            }

            let decoded = decode_record(ctx.read_block(self.bid)?, self.offset).map(
                |(header, name)| DirRecord {
                    ino: header.ino.get(),
                    rec_len: header.rec_len.get() as usize,
                    file_type: header.file_type,
                    name: name.to_vec(),
                    bid: self.bid,
                    offset: self.offset,
                    prev: self.prev,
                },
            );
            let record = match decoded {
                Ok(record) => record,
                Err(err) => return Err(ctx.record_error(err)),
            };
            self.prev = Some(self.offset);
            self.offset += record.rec_len;
            return Ok(Some(record));
        }
    }
}

/// Decodes and checks the record at `offset` of a directory block.
fn decode_record(bytes: &[u8], offset: usize) -> Result<(RawDirEntryHeader, &[u8])> {
    let corrupted = Error::with_message(Errno::EIO, "corrupted directory record");
    let header = bytes
        .get(offset..offset + HEADER_LEN)
        .and_then(|raw| RawDirEntryHeader::read_from_bytes(raw).ok())
        .ok_or(corrupted)?;
    let rec_len = header.rec_len.get() as usize;
    let name_len = header.name_len as usize;
    if rec_len < HEADER_LEN
        || rec_len % 4 != 0
        || offset + rec_len > bytes.len()
        || HEADER_LEN + name_len > rec_len
    {
        return Err(corrupted);
    }
    let name = &bytes[offset + HEADER_LEN..offset + HEADER_LEN + name_len];
    Ok((header, name))
}

/// Writes a whole record at `offset` of the block `bid`.
fn write_record(
    ctx: &mut OpContext,
    bid: Bid,
    offset: usize,
    rec_len: usize,
    ino: u32,
    name: &[u8],
    type_: FileType,
) -> Result<()> {
    let file_type = if ctx.geo().has_filetype {
        type_.dirent_tag()
    } else {
        0
    };
    let header = RawDirEntryHeader {
        ino: ino.into(),
        rec_len: (rec_len as u16).into(),
        name_len: name.len() as u8,
        file_type,
    };
    let bytes = ctx.modify_block(bid)?;
    bytes[offset..offset + HEADER_LEN].copy_from_slice(header.as_bytes());
    bytes[offset + HEADER_LEN..offset + HEADER_LEN + name.len()].copy_from_slice(name);
    // Clear the rest of the used space.
    let used = rec_len_for(name.len());
    bytes[offset + HEADER_LEN + name.len()..offset + used].fill(0);
    Ok(())
}

fn set_rec_len(bytes: &mut [u8], offset: usize, rec_len: usize) {
    bytes[offset + 4..offset + 6].copy_from_slice(&(rec_len as u16).to_le_bytes());
}

fn set_ino(bytes: &mut [u8], offset: usize, ino: u32) {
    bytes[offset..offset + 4].copy_from_slice(&ino.to_le_bytes());
}

/// Finds the live record named `name`.
pub(crate) fn find(ctx: &mut OpContext, dir: &InodeDesc, name: &str) -> Result<Option<DirRecord>> {
    let mut iter = DirIter::new(ctx, dir);
    while let Some(record) = iter.next(ctx, dir)? {
        if !record.is_tombstone() && record.name == name.as_bytes() {
            return Ok(Some(record));
        }
    }
    Ok(None)
}

/// Returns the inode number that `name` refers to.
pub(crate) fn lookup(ctx: &mut OpContext, dir: &InodeDesc, name: &str) -> Result<u32> {
    find(ctx, dir, name)?
        .map(|record| record.ino)
        .ok_or(Error::with_message(Errno::ENOENT, "the name does not exist"))
}

/// Adds a record named `name` for the inode `ino` to the directory `dir_ino`.
///
/// The first record with enough unused space is split, or overwritten if it is
/// a tombstone. Otherwise the directory grows by one block.
pub(crate) fn link(
    ctx: &mut OpContext,
    dir_ino: u32,
    dir: &mut InodeDesc,
    name: &str,
    ino: u32,
    type_: FileType,
) -> Result<()> {
    let name = name.as_bytes();
    if name.len() > MAX_FNAME_LEN {
        return_errno_with_message!(Errno::ENAMETOOLONG, "the name is too long");
    }
    let needed = rec_len_for(name.len());

    let mut iter = DirIter::new(ctx, dir);
    while let Some(record) = iter.next(ctx, dir)? {
        let used = record.used_len();
        if record.rec_len < used + needed {
            continue;
        }
        if used == 0 {
            write_record(ctx, record.bid, record.offset, record.rec_len, ino, name, type_)?;
        } else {
            set_rec_len(ctx.modify_block(record.bid)?, record.offset, used);
            write_record(
                ctx,
                record.bid,
                record.offset + used,
                record.rec_len - used,
                ino,
                name,
                type_,
            )?;
        }
        return Ok(());
    }

    let nr_blocks = iter.nr_blocks();
    let block_size = ctx.geo().block_size;
    expand(ctx, dir_ino, dir, nr_blocks + 1, true)?;
    let bid = get_block(ctx, dir, nr_blocks)?;
    debug!("[ext2] directory {} grows to {} blocks", dir_ino, nr_blocks + 1);
    write_record(ctx, bid, 0, block_size, ino, name, type_)
}

/// Removes the record named `name` and returns the inode number it referred to.
///
/// The space is merged into the previous record of the same block. If the record
/// is the first of its block, it becomes a tombstone, which also absorbs the
/// following record if that one is a tombstone as well.
pub(crate) fn unlink(ctx: &mut OpContext, dir: &InodeDesc, name: &str) -> Result<u32> {
    let record = find(ctx, dir, name)?
        .ok_or(Error::with_message(Errno::ENOENT, "the name does not exist"))?;
    let bytes = ctx.modify_block(record.bid)?;

    if let Some(prev) = record.prev {
        let prev_len = u16::from_le_bytes([bytes[prev + 4], bytes[prev + 5]]) as usize;
        set_rec_len(bytes, prev, prev_len + record.rec_len);
        return Ok(record.ino);
    }

    set_ino(bytes, record.offset, 0);
    let next = record.offset + record.rec_len;
    let absorbed = match decode_record(bytes, next) {
        Ok((header, _)) if header.ino.get() == 0 => header.rec_len.get() as usize,
        _ => 0,
    };
    if absorbed > 0 {
        set_rec_len(bytes, record.offset, record.rec_len + absorbed);
    }
    Ok(record.ino)
}

/// Points the record named `name` to the inode `ino` and returns the inode
/// number it referred to before.
pub(crate) fn relink(
    ctx: &mut OpContext,
    dir: &InodeDesc,
    name: &str,
    ino: u32,
    type_: FileType,
) -> Result<u32> {
    let record = find(ctx, dir, name)?
        .ok_or(Error::with_message(Errno::ENOENT, "the name does not exist"))?;
    let has_filetype = ctx.geo().has_filetype;
    let bytes = ctx.modify_block(record.bid)?;
    set_ino(bytes, record.offset, ino);
    if has_filetype {
        bytes[record.offset + 7] = type_.dirent_tag();
    }
    Ok(record.ino)
}

/// Fails with `ENOTEMPTY` unless the directory only holds `.` and `..`.
pub(crate) fn check_empty(ctx: &mut OpContext, dir: &InodeDesc) -> Result<()> {
    // Every subdirectory holds a link to its parent.
    if dir.links_count > 2 {
        return_errno_with_message!(Errno::ENOTEMPTY, "the directory has subdirectories");
    }
    let mut iter = DirIter::new(ctx, dir);
    while let Some(record) = iter.next(ctx, dir)? {
        if !record.is_tombstone() && !record.is_dot_or_dotdot() {
            return_errno_with_message!(Errno::ENOTEMPTY, "the directory is not empty");
        }
    }
    Ok(())
}

/// Writes the first block of a new directory, holding `.` and `..`.
pub(crate) fn init_dir_block(
    ctx: &mut OpContext,
    bid: Bid,
    self_ino: u32,
    parent_ino: u32,
) -> Result<()> {
    let block_size = ctx.geo().block_size;
    let dot_len = rec_len_for(1);
    write_record(ctx, bid, 0, dot_len, self_ino, b".", FileType::Dir)?;
    write_record(
        ctx,
        bid,
        dot_len,
        block_size - dot_len,
        parent_ino,
        b"..",
        FileType::Dir,
    )
}

/// Feeds the live records from the byte position `pos` on to `visit`, with the
/// position of the record that follows each one.
///
/// Returns the position where the walk stopped.
pub(crate) fn read_entries<F>(
    ctx: &mut OpContext,
    dir: &InodeDesc,
    pos: u64,
    mut visit: F,
) -> Result<u64>
where
    F: FnMut(&mut OpContext, &DirRecord, u64) -> Result<ControlFlow<()>>,
{
    let block_size = ctx.geo().block_size;
    let mut iter = DirIter::at(ctx, dir, pos);
    let mut cur_pos = pos;
    while let Some(record) = iter.next(ctx, dir)? {
        let next_pos = iter.pos(block_size);
        if !record.is_tombstone() && visit(ctx, &record, next_pos)?.is_break() {
            return Ok(cur_pos);
        }
        cur_pos = next_pos;
    }
    Ok(cur_pos)
}
