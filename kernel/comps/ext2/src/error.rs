// SPDX-License-Identifier: MPL-2.0

use ember_block::BioStatus;

/// Error number.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Errno {
    ENOENT = 2,        /* No such file or directory */
    EIO = 5,           /* I/O error */
    ENOMEM = 12,       /* Out of memory */
    EEXIST = 17,       /* File exists */
    ENOTDIR = 20,      /* Not a directory */
    EISDIR = 21,       /* Is a directory */
    EINVAL = 22,       /* Invalid argument */
    EFBIG = 27,        /* File too large */
    ENOSPC = 28,       /* No space left on device */
    EROFS = 30,        /* Read-only file system */
    EMLINK = 31,       /* Too many links */
    ENAMETOOLONG = 36, /* File name too long */
    ENOTEMPTY = 39,    /* Directory not empty */
}

/// The error type of the ext2 file system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    pub const fn with_message(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    pub const fn error(&self) -> Errno {
        self.errno
    }

    pub const fn message(&self) -> Option<&'static str> {
        self.msg
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl From<BioStatus> for Error {
    fn from(err_status: BioStatus) -> Self {
        match err_status {
            BioStatus::NotSupported => {
                Error::with_message(Errno::EIO, "I/O operation is not supported")
            }
            BioStatus::NoSpace => {
                Error::with_message(Errno::ENOSPC, "Insufficient space on device")
            }
            BioStatus::IoError => Error::with_message(Errno::EIO, "I/O operation fails"),
            BioStatus::Complete => {
                Error::with_message(Errno::EINVAL, "a completed request is not an error")
            }
        }
    }
}

impl From<alloc::collections::TryReserveError> for Error {
    fn from(_: alloc::collections::TryReserveError) -> Self {
        Error::with_message(Errno::ENOMEM, "cannot allocate memory for cached blocks")
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{:?}: {}", self.errno, msg),
            None => write!(f, "{:?}", self.errno),
        }
    }
}

#[macro_export]
macro_rules! return_errno {
    ($errno: expr) => {
        return Err($crate::error::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_message {
    ($errno: expr, $message: expr) => {
        return Err($crate::error::Error::with_message($errno, $message))
    };
}
