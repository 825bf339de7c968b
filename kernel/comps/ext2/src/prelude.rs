// SPDX-License-Identifier: MPL-2.0

pub(crate) use alloc::{
    boxed::Box,
    collections::BTreeSet,
    string::{String, ToString},
    sync::Arc,
    vec,
    vec::Vec,
};
pub(crate) use core::{
    fmt::Debug,
    ops::Range,
    time::Duration,
};

pub(crate) use bitflags::bitflags;
pub(crate) use ember_block::{BioStatus, BlockDevice, SECTOR_SIZE, Sid};
pub(crate) use log::{debug, error, info, trace, warn};
pub(crate) use static_assertions::const_assert;

pub(crate) use crate::{
    error::{Errno, Error},
    return_errno_with_message,
    utils::Dirty,
};

pub(crate) type Result<T> = core::result::Result<T, Error>;

/// The block number type of ext2.
pub type Bid = u32;
