// SPDX-License-Identifier: MPL-2.0

//! A safe Rust Ext2 filesystem.
//!
//! Every operation runs inside an operation context that caches the blocks it
//! touches. A successful operation writes all of its dirty blocks back at once;
//! a failed one leaves the device as it was.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub use self::{
    config::{CheckMode, Clock, CtxPolicy, EpochClock, MountOptions},
    error::{Errno, Error},
    fs::{Ext2, Ext2Stat},
    impl_for_vfs::Ext2Type,
    inode::{FilePerm, FileType, ROOT_INO},
    mkfs::{FormatOptions, format},
    ops::{InodeAttr, NewInodeAttr, SetInodeAttr},
    super_block::{MAGIC_NUM, SuperBlock},
};

pub mod config;
pub mod distribution;
pub mod error;
pub mod mkfs;

mod balloc;
mod bitmap;
mod block_cache;
mod block_group;
mod block_ptr;
mod dir;
mod fs;
mod impl_for_vfs;
mod inode;
mod mapper;
mod op_ctx;
mod ops;
mod prelude;
mod super_block;
mod utils;

#[cfg(test)]
mod test;
