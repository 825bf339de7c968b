// SPDX-License-Identifier: MPL-2.0

use core::{
    fmt::Debug,
    ops::{Deref, DerefMut},
};

/// A wrapper that remembers whether the inner value has been modified.
#[derive(Debug)]
pub(crate) struct Dirty<T: Debug> {
    value: T,
    dirty: bool,
}

impl<T: Debug> Dirty<T> {
    /// Creates a new `Dirty` in the clean state.
    pub fn new(val: T) -> Dirty<T> {
        Dirty {
            value: val,
            dirty: false,
        }
    }

    /// Returns whether the value has been modified since the last clear.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Marks the value as written back.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

impl<T: Debug> Deref for Dirty<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Debug> DerefMut for Dirty<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.dirty = true;
        &mut self.value
    }
}

/// Rounds `value` up to a multiple of `align`, which must be a power of two.
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
