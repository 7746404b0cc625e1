//! MMU error definitions.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use r_efi::efi;

/// A specialized [`Result`](core::result::Result) type for MMU operations.
pub type Result<T> = core::result::Result<T, MmuError>;

/// Errors reported by the translation table walker, the attribute translator and the GCD synchronization.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MmuError {
    /// The parameter was incorrect.
    InvalidParameter,
    /// The descriptor encoding or the requested attributes cannot be expressed.
    Unsupported,
    /// The address is not mapped by the translation tables.
    NoMapping,
    /// The range is not described by the GCD memory space map.
    NotFound,
    /// A second-level page table could not be allocated.
    OutOfResources,
    /// The memory space authority (GCD) reported an error.
    Gcd(efi::Status),
}

impl From<MmuError> for efi::Status {
    fn from(e: MmuError) -> efi::Status {
        match e {
            MmuError::InvalidParameter => efi::Status::INVALID_PARAMETER,
            MmuError::Unsupported => efi::Status::UNSUPPORTED,
            MmuError::NoMapping => efi::Status::NO_MAPPING,
            MmuError::NotFound => efi::Status::NOT_FOUND,
            MmuError::OutOfResources => efi::Status::OUT_OF_RESOURCES,
            MmuError::Gcd(status) => status,
        }
    }
}
