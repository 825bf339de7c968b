// SPDX-License-Identifier: MPL-2.0

pub(crate) use alloc::{string::String, sync::Arc, vec::Vec};
pub(crate) use core::{fmt::Debug, time::Duration};

pub(crate) use bitflags::bitflags;

pub(crate) use crate::{
    error::{Errno, Error, Result},
    return_errno, return_errno_with_message,
};
