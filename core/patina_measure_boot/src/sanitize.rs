//! Untrusted Input Sanitization
//!
//! Validation of GPT headers read from a block device and overflow-checked computation of every size derived from
//! them. Nothing here allocates or touches the device beyond querying its media; a failure is always reported before
//! any derived value escapes.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use crate::{
    block_io::BlockIo,
    error::{MeasureBootError, Result},
    event::{GPT_DATA_PARTITIONS_OFFSET, IMAGE_LOAD_EVENT_DEVICE_PATH_OFFSET, TCG_PCR_EVENT_HEADER_SIZE},
    gpt::{
        PartitionTableHeader, EFI_PTAB_HEADER_ID, GPT_HEADER_REVISION_V1, MIN_PARTITION_ENTRY_SIZE,
        PARTITION_TABLE_HEADER_SIZE,
    },
};

/// Validates a GPT header read from `block_io` before any of its fields are used for I/O or arithmetic.
///
/// Checks run in a fixed order and stop at the first failure:
///
/// 1. the device describes its media, else [`MeasureBootError::InvalidParameter`];
/// 2. the signature is `"EFI PART"`;
/// 3. the revision is 1.0;
/// 4. the header size is at least the known header size and fits in one block;
/// 5. the partition entry LBA can be multiplied by the block size without overflow;
/// 6. there is at least one partition entry;
/// 7. the entry size is a power of two and at least 128 bytes;
/// 8. the entry array size fits in 32 bits.
///
/// Checks 2 through 8 fail with [`MeasureBootError::DeviceError`].
pub fn sanitize_partition_table_header(header: &PartitionTableHeader, block_io: &dyn BlockIo) -> Result<()> {
    let Some(media) = block_io.media() else {
        log::error!("Block I/O device does not describe its media.");
        return Err(MeasureBootError::InvalidParameter);
    };

    if header.signature != EFI_PTAB_HEADER_ID {
        log::error!("Partition table header signature {:x?} is not \"EFI PART\".", header.signature);
        return Err(MeasureBootError::DeviceError);
    }

    let revision = header.revision.get();
    if revision != GPT_HEADER_REVISION_V1 {
        log::error!("Partition table header revision {revision:#x} is not supported.");
        return Err(MeasureBootError::DeviceError);
    }

    let header_size = header.header_size.get();
    if (header_size as usize) < PARTITION_TABLE_HEADER_SIZE || header_size > media.block_size {
        log::error!(
            "Partition table header size {header_size} is outside [{PARTITION_TABLE_HEADER_SIZE}, {}].",
            media.block_size
        );
        return Err(MeasureBootError::DeviceError);
    }

    let partition_entry_lba = header.partition_entry_lba.get();
    match u64::MAX.checked_div(media.block_size as u64) {
        Some(max_lba) if partition_entry_lba <= max_lba => {}
        _ => {
            log::error!(
                "Partition entry LBA {partition_entry_lba:#x} overflows a byte offset with block size {}.",
                media.block_size
            );
            return Err(MeasureBootError::DeviceError);
        }
    }

    let number_of_entries = header.number_of_partition_entries.get();
    if number_of_entries == 0 {
        log::error!("Partition table header declares no partition entries.");
        return Err(MeasureBootError::DeviceError);
    }

    let entry_size = header.size_of_partition_entry.get();
    if entry_size < MIN_PARTITION_ENTRY_SIZE || !entry_size.is_power_of_two() {
        log::error!("Partition entry size {entry_size} is not a power of two of at least {MIN_PARTITION_ENTRY_SIZE}.");
        return Err(MeasureBootError::DeviceError);
    }

    if number_of_entries > u32::MAX / entry_size {
        log::error!("Partition entry array of {number_of_entries} entries of {entry_size} bytes overflows.");
        return Err(MeasureBootError::DeviceError);
    }

    Ok(())
}

/// Size in bytes of the partition entry array described by `header`.
pub fn primary_header_allocation_size(header: &PartitionTableHeader) -> Result<u32> {
    let number_of_entries = header.number_of_partition_entries.get();
    let entry_size = header.size_of_partition_entry.get();
    number_of_entries.checked_mul(entry_size).ok_or_else(|| {
        log::error!("Partition entry array size {number_of_entries} * {entry_size} overflows.");
        MeasureBootError::BadBufferSize
    })
}

/// Total size of a GPT measurement event carrying `number_of_partitions` entries.
///
/// The result counts the [`TcgPcrEventHeader`](crate::event::TcgPcrEventHeader) as well as the `EFI_GPT_DATA`
/// payload. Subtract [`TCG_PCR_EVENT_HEADER_SIZE`] to get the length of the event data.
pub fn primary_header_gpt_event_size(header: &PartitionTableHeader, number_of_partitions: usize) -> Result<u32> {
    let overflow = || {
        log::error!("GPT event size for {number_of_partitions} partitions overflows.");
        MeasureBootError::BadBufferSize
    };
    let number_of_partitions = u32::try_from(number_of_partitions).map_err(|_| overflow())?;
    number_of_partitions
        .checked_mul(header.size_of_partition_entry.get())
        .and_then(|size| size.checked_add((TCG_PCR_EVENT_HEADER_SIZE + GPT_DATA_PARTITIONS_OFFSET) as u32))
        .ok_or_else(overflow)
}

/// Total size of a PE image load event whose device path is `file_path_size` bytes.
///
/// As with [`primary_header_gpt_event_size`], the result includes the event header.
pub fn pe_image_event_size(file_path_size: u32) -> Result<u32> {
    file_path_size
        .checked_add(IMAGE_LOAD_EVENT_DEVICE_PATH_OFFSET as u32)
        .and_then(|size| size.checked_add(TCG_PCR_EVENT_HEADER_SIZE as u32))
        .ok_or_else(|| {
            log::error!("Image load event size for a {file_path_size} byte device path overflows.");
            MeasureBootError::BadBufferSize
        })
}
