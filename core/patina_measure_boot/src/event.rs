//! TCG Event Structures
//!
//! Layouts of the event log records produced for GPT and PE image measurements. Sizes and field offsets here are
//! part of the TCG event log format and feed directly into the overflow-checked size calculations in
//! [`sanitize`](crate::sanitize).
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy_derive::*;

use crate::gpt::PARTITION_TABLE_HEADER_SIZE;

/// PCR holding boot driver and runtime driver measurements.
pub const PCR_DRIVER_CONFIG: u32 = 2;
/// PCR holding boot application measurements.
pub const PCR_BOOT_APPLICATION: u32 = 4;
/// PCR holding the GPT measurement.
pub const PCR_GPT: u32 = 5;

pub const EV_EFI_BOOT_SERVICES_APPLICATION: u32 = 0x8000_0003;
pub const EV_EFI_BOOT_SERVICES_DRIVER: u32 = 0x8000_0004;
pub const EV_EFI_RUNTIME_SERVICES_DRIVER: u32 = 0x8000_0005;
pub const EV_EFI_GPT_EVENT: u32 = 0x8000_0006;

/// Length of a SHA-1 digest.
pub const SHA1_DIGEST_SIZE: usize = 20;

/// `TCG_PCR_EVENT_HDR`
///
/// The digest is filled in by the TCG service when the event is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct TcgPcrEventHeader {
    pub pcr_index: U32<LittleEndian>,
    pub event_type: U32<LittleEndian>,
    pub digest: [u8; SHA1_DIGEST_SIZE],
    pub event_size: U32<LittleEndian>,
}

/// Size of [`TcgPcrEventHeader`].
pub const TCG_PCR_EVENT_HEADER_SIZE: usize = core::mem::size_of::<TcgPcrEventHeader>();

const _: () = assert!(TCG_PCR_EVENT_HEADER_SIZE == 32);

impl TcgPcrEventHeader {
    pub fn new(pcr_index: u32, event_type: u32, event_size: u32) -> Self {
        TcgPcrEventHeader {
            pcr_index: U32::new(pcr_index),
            event_type: U32::new(event_type),
            digest: [0; SHA1_DIGEST_SIZE],
            event_size: U32::new(event_size),
        }
    }
}

/// Fixed part of `EFI_GPT_DATA`. The used partition entries follow it directly.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct GptDataHeader {
    pub efi_partition_header: [u8; PARTITION_TABLE_HEADER_SIZE],
    pub number_of_partitions: U64<LittleEndian>,
}

/// Offset of the partition array within `EFI_GPT_DATA`.
pub const GPT_DATA_PARTITIONS_OFFSET: usize = core::mem::size_of::<GptDataHeader>();

const _: () = assert!(GPT_DATA_PARTITIONS_OFFSET == 100);

/// Fixed part of `EFI_IMAGE_LOAD_EVENT`. The device path bytes follow it directly.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct ImageLoadEventHeader {
    pub image_location_in_memory: U64<LittleEndian>,
    pub image_length_in_memory: U64<LittleEndian>,
    pub image_link_time_address: U64<LittleEndian>,
    pub length_of_device_path: U64<LittleEndian>,
}

/// Offset of the device path within `EFI_IMAGE_LOAD_EVENT`.
pub const IMAGE_LOAD_EVENT_DEVICE_PATH_OFFSET: usize = core::mem::size_of::<ImageLoadEventHeader>();

const _: () = assert!(IMAGE_LOAD_EVENT_DEVICE_PATH_OFFSET == 32);
