//! Block I/O Service Trait
//!
//! The narrow view of a block device that GPT measurement needs.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use r_efi::efi;

/// Subset of `EFI_BLOCK_IO_MEDIA` describing the medium currently in the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockIoMedia {
    pub media_id: u32,
    pub removable_media: bool,
    pub read_only: bool,
    pub block_size: u32,
    pub last_block: u64,
}

/// Block device access.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait BlockIo {
    /// Returns the current media, or `None` if the device has no media description.
    fn media(&self) -> Option<BlockIoMedia>;

    /// Reads `buffer.len()` bytes starting at `lba`. The length must be a multiple of the block size.
    fn read_blocks(&self, media_id: u32, lba: u64, buffer: &mut [u8]) -> Result<(), efi::Status>;
}
