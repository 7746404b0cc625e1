//! GUID Partition Table Structures
//!
//! On-disk layouts of the GPT header and partition entries. Both are read straight out of untrusted device blocks,
//! so every multi-byte field is an explicitly little-endian, unaligned integer.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use zerocopy::{
    byteorder::{LittleEndian, U16, U32, U64},
    FromBytes,
};
use zerocopy_derive::*;

use crate::error::{MeasureBootError, Result};

/// "EFI PART"
pub const EFI_PTAB_HEADER_ID: [u8; 8] = *b"EFI PART";
/// GPT header revision 1.0.
pub const GPT_HEADER_REVISION_V1: u32 = 0x0001_0000;
/// LBA of the primary partition table header.
pub const PRIMARY_PART_HEADER_LBA: u64 = 1;
/// Smallest partition entry size a GPT may declare.
pub const MIN_PARTITION_ENTRY_SIZE: u32 = 128;

/// `EFI_PARTITION_TABLE_HEADER`
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct PartitionTableHeader {
    pub signature: [u8; 8],
    pub revision: U32<LittleEndian>,
    pub header_size: U32<LittleEndian>,
    pub header_crc32: U32<LittleEndian>,
    pub reserved: U32<LittleEndian>,
    pub my_lba: U64<LittleEndian>,
    pub alternate_lba: U64<LittleEndian>,
    pub first_usable_lba: U64<LittleEndian>,
    pub last_usable_lba: U64<LittleEndian>,
    pub disk_guid: [u8; 16],
    pub partition_entry_lba: U64<LittleEndian>,
    pub number_of_partition_entries: U32<LittleEndian>,
    pub size_of_partition_entry: U32<LittleEndian>,
    pub partition_entry_array_crc32: U32<LittleEndian>,
}

/// Size of [`PartitionTableHeader`], the smallest header size a GPT may declare.
pub const PARTITION_TABLE_HEADER_SIZE: usize = core::mem::size_of::<PartitionTableHeader>();

const _: () = assert!(PARTITION_TABLE_HEADER_SIZE == 92);

impl PartitionTableHeader {
    /// Reads a header from the start of `bytes`. Bytes past the header are ignored.
    pub fn read_from_bytes(bytes: &[u8]) -> Result<Self> {
        <Self as FromBytes>::read_from_prefix(bytes).map(|(header, _)| header).map_err(|_| {
            log::error!("Buffer of {} bytes is too small for a partition table header.", bytes.len());
            MeasureBootError::InvalidParameter
        })
    }
}

/// `EFI_PARTITION_ENTRY`
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct PartitionEntry {
    pub partition_type_guid: [u8; 16],
    pub unique_partition_guid: [u8; 16],
    pub starting_lba: U64<LittleEndian>,
    pub ending_lba: U64<LittleEndian>,
    pub attributes: U64<LittleEndian>,
    pub partition_name: [U16<LittleEndian>; 36],
}

const _: () = assert!(core::mem::size_of::<PartitionEntry>() == MIN_PARTITION_ENTRY_SIZE as usize);

impl PartitionEntry {
    /// Reads an entry from the start of `bytes`, `None` if `bytes` is too short.
    pub fn read_from_bytes(bytes: &[u8]) -> Option<Self> {
        <Self as FromBytes>::read_from_prefix(bytes).ok().map(|(entry, _)| entry)
    }

    /// An entry is in use when its partition type GUID is not the zero GUID.
    pub fn is_used(&self) -> bool {
        self.partition_type_guid != [0u8; 16]
    }
}
