//! Measured Boot Error Definitions
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use r_efi::efi;

/// A specialized [`Result`](core::result::Result) type for measured boot operations.
pub type Result<T> = core::result::Result<T, MeasureBootError>;

/// Errors reported while validating untrusted input and building measurement events.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MeasureBootError {
    /// A required input is missing.
    InvalidParameter,
    /// The partition table read from the device is malformed.
    DeviceError,
    /// A size computed from untrusted input does not fit in 32 bits.
    BadBufferSize,
    /// The image type cannot be measured.
    Unsupported,
    /// A buffer sized from untrusted input could not be allocated.
    OutOfResources,
    /// Block I/O or the TCG service failed with the given status.
    Status(efi::Status),
}

impl From<MeasureBootError> for efi::Status {
    fn from(e: MeasureBootError) -> efi::Status {
        match e {
            MeasureBootError::InvalidParameter => efi::Status::INVALID_PARAMETER,
            MeasureBootError::DeviceError => efi::Status::DEVICE_ERROR,
            MeasureBootError::BadBufferSize => efi::Status::BAD_BUFFER_SIZE,
            MeasureBootError::Unsupported => efi::Status::UNSUPPORTED,
            MeasureBootError::OutOfResources => efi::Status::OUT_OF_RESOURCES,
            MeasureBootError::Status(status) => status,
        }
    }
}
