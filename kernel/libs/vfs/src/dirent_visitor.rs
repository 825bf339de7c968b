// SPDX-License-Identifier: MPL-2.0

use crate::{inode::InodeType, is_dot_or_dotdot, prelude::*};

/// Receives the entries of a directory from `FileSystem::readdir_at`.
pub trait DirentVisitor {
    /// Takes one entry. `offset` is where a later `readdir_at` resumes after it.
    ///
    /// Returning an error stops the walk. The file system reports the error
    /// only if this was the first entry of the call.
    fn visit(&mut self, name: &str, ino: u64, type_: InodeType, offset: usize) -> Result<()>;
}

impl DirentVisitor for Vec<String> {
    fn visit(&mut self, name: &str, _ino: u64, _type: InodeType, _offset: usize) -> Result<()> {
        self.push(name.into());
        Ok(())
    }
}

/// Counts the entries other than `.` and `..`.
#[derive(Default)]
pub struct DirentCounter(usize);

impl DirentCounter {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn count(&self) -> usize {
        self.0
    }
}

impl DirentVisitor for DirentCounter {
    fn visit(&mut self, name: &str, _ino: u64, _type: InodeType, _offset: usize) -> Result<()> {
        if !is_dot_or_dotdot(name) {
            self.0 += 1;
        }
        Ok(())
    }
}
