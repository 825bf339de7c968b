// SPDX-License-Identifier: MPL-2.0

/// The status of a block I/O request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum BioStatus {
    /// The I/O operation has been successfully completed.
    Complete = 2,
    /// The I/O operation is not supported.
    NotSupported = 3,
    /// Insufficient space is available to perform the I/O operation.
    NoSpace = 4,
    /// An error occurred while doing I/O.
    IoError = 5,
}

impl BioStatus {
    /// Returns whether the request has completed successfully.
    pub fn is_complete(&self) -> bool {
        *self == Self::Complete
    }
}
