// SPDX-License-Identifier: MPL-2.0

//! The contract between the virtual file system layer and concrete file systems.
//!
//! The path-walking layer above resolves names to `(file system, inode number)`
//! pairs and then talks to a [`FileSystem`] purely in terms of inode numbers.
//! A [`FileSystemType`] turns a block device into a mounted [`FileSystem`].

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod dirent_visitor;
pub mod error;
pub mod file;
pub mod fs;
pub mod inode;
mod prelude;

pub use self::{
    dirent_visitor::{DirentCounter, DirentVisitor},
    error::{Errno, Error, Result},
    file::{OpenFile, SeekFrom},
    fs::{FileSystem, FileSystemType, FsStat},
    inode::{InodeMode, InodeType, Metadata, NewInode, SetAttr},
};

/// Maximum bytes in a file name.
pub const NAME_MAX: usize = 255;

/// Returns whether `name` is `.` or `..`.
pub fn is_dot_or_dotdot(name: &str) -> bool {
    name == "." || name == ".."
}
