//! GPT and PE Image Measurement
//!
//! Builds TCG events for the GUID partition table of a boot device and for loaded PE images, and hands them to the
//! platform TCG service for hashing, PCR extension and logging. Every size taken from the device or the image passes
//! through [`sanitize`](crate::sanitize) first.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;

#[cfg(any(test, feature = "mockall"))]
use mockall::automock;
use r_efi::efi;
use zerocopy::{byteorder::U64, IntoBytes};

use crate::{
    block_io::BlockIo,
    error::{MeasureBootError, Result},
    event::{
        GptDataHeader, ImageLoadEventHeader, TcgPcrEventHeader, EV_EFI_BOOT_SERVICES_APPLICATION,
        EV_EFI_BOOT_SERVICES_DRIVER, EV_EFI_GPT_EVENT, EV_EFI_RUNTIME_SERVICES_DRIVER, PCR_BOOT_APPLICATION,
        PCR_DRIVER_CONFIG, PCR_GPT, TCG_PCR_EVENT_HEADER_SIZE,
    },
    gpt::{
        PartitionEntry, PartitionTableHeader, MIN_PARTITION_ENTRY_SIZE, PARTITION_TABLE_HEADER_SIZE,
        PRIMARY_PART_HEADER_LBA,
    },
    sanitize::{
        pe_image_event_size, primary_header_allocation_size, primary_header_gpt_event_size,
        sanitize_partition_table_header,
    },
};

/// The platform TCG service.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait TcgMeasurement {
    /// Hashes `hash_data`, extends the PCR named in `event_header` and appends the event to the log.
    fn hash_log_extend_event(
        &self,
        event_header: &TcgPcrEventHeader,
        event_data: &[u8],
        hash_data: &[u8],
    ) -> core::result::Result<(), efi::Status>;
}

// Buffer sizes come from the device, so an allocation failure is reported instead of aborting.
fn allocate_buffer(capacity: usize) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(capacity).map_err(|_| {
        log::error!("Failed to allocate a {capacity:#x} byte buffer.");
        MeasureBootError::OutOfResources
    })?;
    Ok(buffer)
}

fn zeroed_buffer(size: usize) -> Result<Vec<u8>> {
    let mut buffer = allocate_buffer(size)?;
    buffer.resize(size, 0);
    Ok(buffer)
}

/// Builds the `EFI_GPT_DATA` event for `header` from the raw partition entry array.
///
/// Only used entries are carried in the event. `header` must already have been sanitized so that
/// `entry_array` holds `number_of_partition_entries` entries of `size_of_partition_entry` bytes.
pub fn build_gpt_event(header: &PartitionTableHeader, entry_array: &[u8]) -> Result<(TcgPcrEventHeader, Vec<u8>)> {
    let entry_size = header.size_of_partition_entry.get() as usize;
    if entry_size < MIN_PARTITION_ENTRY_SIZE as usize {
        log::error!("Partition entry size {entry_size} is too small to measure.");
        return Err(MeasureBootError::InvalidParameter);
    }
    let used_entries: Vec<&[u8]> = entry_array
        .chunks_exact(entry_size)
        .take(header.number_of_partition_entries.get() as usize)
        .filter(|entry| PartitionEntry::read_from_bytes(entry).is_some_and(|entry| entry.is_used()))
        .collect();

    let event_size = primary_header_gpt_event_size(header, used_entries.len())? as usize - TCG_PCR_EVENT_HEADER_SIZE;
    let event_header = TcgPcrEventHeader::new(PCR_GPT, EV_EFI_GPT_EVENT, event_size as u32);

    let mut efi_partition_header = [0u8; PARTITION_TABLE_HEADER_SIZE];
    efi_partition_header.copy_from_slice(header.as_bytes());
    let gpt_data = GptDataHeader { efi_partition_header, number_of_partitions: U64::new(used_entries.len() as u64) };

    let mut event_data = allocate_buffer(event_size)?;
    event_data.extend_from_slice(gpt_data.as_bytes());
    for entry in used_entries {
        event_data.extend_from_slice(entry);
    }
    debug_assert_eq!(event_data.len(), event_size);

    Ok((event_header, event_data))
}

/// Measures the GUID partition table of the boot device, once per boot.
#[derive(Debug, Default)]
pub struct GptMeasurement {
    measured_count: usize,
}

impl GptMeasurement {
    pub const fn new() -> Self {
        GptMeasurement { measured_count: 0 }
    }

    /// Number of partition tables measured so far.
    pub fn measured_count(&self) -> usize {
        self.measured_count
    }

    /// Reads, validates and measures the primary GPT of `block_io`.
    ///
    /// Returns `Ok(false)` without touching the device if a GPT was already measured.
    pub fn measure(&mut self, block_io: &dyn BlockIo, tcg: &dyn TcgMeasurement) -> Result<bool> {
        if self.measured_count > 0 {
            log::debug!("GPT already measured, skipping.");
            return Ok(false);
        }

        let media = block_io.media().ok_or_else(|| {
            log::error!("Block I/O device does not describe its media.");
            MeasureBootError::InvalidParameter
        })?;
        if (media.block_size as usize) < PARTITION_TABLE_HEADER_SIZE {
            log::error!("Block size {} cannot hold a partition table header.", media.block_size);
            return Err(MeasureBootError::DeviceError);
        }

        let mut block = zeroed_buffer(media.block_size as usize)?;
        block_io.read_blocks(media.media_id, PRIMARY_PART_HEADER_LBA, &mut block).map_err(|status| {
            log::error!("Failed to read the primary partition table header: {status:?}");
            MeasureBootError::Status(status)
        })?;

        let header = PartitionTableHeader::read_from_bytes(&block)?;
        if sanitize_partition_table_header(&header, block_io).is_err() {
            log::error!("Primary partition table header failed validation, not measuring.");
            return Err(MeasureBootError::DeviceError);
        }

        let block_size = media.block_size as u64;
        let array_size = (primary_header_allocation_size(&header)? as u64).div_ceil(block_size) * block_size;
        let array_len = usize::try_from(array_size).map_err(|_| MeasureBootError::BadBufferSize)?;
        let mut entry_array = zeroed_buffer(array_len)?;
        block_io.read_blocks(media.media_id, header.partition_entry_lba.get(), &mut entry_array).map_err(|status| {
            log::error!("Failed to read the partition entry array: {status:?}");
            MeasureBootError::Status(status)
        })?;

        let (event_header, event_data) = build_gpt_event(&header, &entry_array)?;
        tcg.hash_log_extend_event(&event_header, &event_data, &event_data).map_err(|status| {
            log::error!("Failed to measure the GPT: {status:?}");
            MeasureBootError::Status(status)
        })?;

        self.measured_count += 1;
        log::info!("Measured GPT with {} bytes of event data.", event_data.len());
        Ok(true)
    }
}

/// PE subsystems that can be measured, with the PCR and event type each is logged under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Application,
    BootServicesDriver,
    RuntimeServicesDriver,
}

impl ImageType {
    pub fn pcr_index(self) -> u32 {
        match self {
            ImageType::Application => PCR_BOOT_APPLICATION,
            ImageType::BootServicesDriver | ImageType::RuntimeServicesDriver => PCR_DRIVER_CONFIG,
        }
    }

    pub fn event_type(self) -> u32 {
        match self {
            ImageType::Application => EV_EFI_BOOT_SERVICES_APPLICATION,
            ImageType::BootServicesDriver => EV_EFI_BOOT_SERVICES_DRIVER,
            ImageType::RuntimeServicesDriver => EV_EFI_RUNTIME_SERVICES_DRIVER,
        }
    }
}

impl TryFrom<u16> for ImageType {
    type Error = MeasureBootError;

    fn try_from(subsystem: u16) -> Result<Self> {
        match subsystem {
            10 => Ok(ImageType::Application),
            11 => Ok(ImageType::BootServicesDriver),
            12 => Ok(ImageType::RuntimeServicesDriver),
            _ => {
                log::error!("Unsupported image subsystem {subsystem}.");
                Err(MeasureBootError::Unsupported)
            }
        }
    }
}

/// Measures a loaded PE image of PE `subsystem` into the PCR selected by its type.
///
/// `image` is the loaded image as it sits in memory at `image_address`, and is what gets hashed. `device_path` is the
/// raw device path the image was loaded from.
pub fn measure_pe_image(
    tcg: &dyn TcgMeasurement,
    subsystem: u16,
    image_address: u64,
    image: &[u8],
    link_time_address: u64,
    device_path: &[u8],
) -> Result<()> {
    let image_type = ImageType::try_from(subsystem)?;
    let device_path_size = u32::try_from(device_path.len()).map_err(|_| MeasureBootError::BadBufferSize)?;
    let event_size = pe_image_event_size(device_path_size)? as usize - TCG_PCR_EVENT_HEADER_SIZE;

    let event_header = TcgPcrEventHeader::new(image_type.pcr_index(), image_type.event_type(), event_size as u32);
    let load_event = ImageLoadEventHeader {
        image_location_in_memory: U64::new(image_address),
        image_length_in_memory: U64::new(image.len() as u64),
        image_link_time_address: U64::new(link_time_address),
        length_of_device_path: U64::new(device_path_size as u64),
    };

    let mut event_data = allocate_buffer(event_size)?;
    event_data.extend_from_slice(load_event.as_bytes());
    event_data.extend_from_slice(device_path);

    tcg.hash_log_extend_event(&event_header, &event_data, image).map_err(|status| {
        log::error!("Failed to measure image at {image_address:#x}: {status:?}");
        MeasureBootError::Status(status)
    })
}
