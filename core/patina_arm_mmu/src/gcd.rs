//! GCD Memory Space Interface
//!
//! The subset of the DXE Global Coherency Domain services needed to keep its memory space map consistent with the
//! translation tables, and the helper that applies a region's attributes to every GCD descriptor it overlaps.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;
use r_efi::efi;

use crate::{
    attributes::MemoryAttributes,
    error::{MmuError, Result},
};

/// GCD memory space types, numbered as in the PI specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum GcdMemoryType {
    #[default]
    NonExistent = 0,
    Reserved,
    SystemMemory,
    MemoryMappedIo,
    Persistent,
    MoreReliable,
    Unaccepted,
}

/// One entry of the GCD memory space map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemorySpaceDescriptor {
    pub base_address: efi::PhysicalAddress,
    pub length: u64,
    pub capabilities: u64,
    pub attributes: u64,
    pub memory_type: GcdMemoryType,
}

impl MemorySpaceDescriptor {
    fn contains(&self, address: u64) -> bool {
        address >= self.base_address && address - self.base_address < self.length
    }
}

/// The memory space authority the MMU driver keeps in sync.
///
/// `set_memory_space_attributes` may call back into [`ArmMmu::set_memory_attributes`](crate::ArmMmu) on the same
/// translation tables before it returns.
pub trait MemorySpaceAuthority {
    /// Returns a snapshot of the memory space map, ordered by address.
    fn get_memory_space_map(&self) -> core::result::Result<Vec<MemorySpaceDescriptor>, efi::Status>;

    /// Sets the attributes of `length` bytes at `base_address`.
    fn set_memory_space_attributes(
        &self,
        base_address: efi::PhysicalAddress,
        length: u64,
        attributes: u64,
    ) -> core::result::Result<(), efi::Status>;
}

fn find_descriptor(map: &[MemorySpaceDescriptor], address: u64) -> Option<usize> {
    map.iter().position(|descriptor| descriptor.contains(address))
}

/// Applies `attributes` to every existent GCD descriptor overlapping `[base_address, base_address + length)`.
///
/// Each descriptor keeps its non-cache attributes and gains the requested attributes it is capable of. Fails with
/// [`MmuError::NotFound`] when the first or last byte of the range is not described by `map`. A failing descriptor
/// does not stop the others; the first failure is returned once all were visited.
pub fn set_gcd_memory_space_attributes(
    gcd: &dyn MemorySpaceAuthority,
    map: &[MemorySpaceDescriptor],
    base_address: u64,
    length: u64,
    attributes: MemoryAttributes,
) -> Result<()> {
    if length == 0 {
        return Err(MmuError::InvalidParameter);
    }
    let end = base_address.checked_add(length).ok_or(MmuError::InvalidParameter)?;

    let (Some(start_index), Some(end_index)) = (find_descriptor(map, base_address), find_descriptor(map, end - 1))
    else {
        log::error!("Range {base_address:#x}-{end:#x} is not described by the GCD memory space map.");
        return Err(MmuError::NotFound);
    };

    let mut status = Ok(());
    for descriptor in map.iter().take(end_index + 1).skip(start_index) {
        if descriptor.memory_type == GcdMemoryType::NonExistent {
            continue;
        }

        let region_start = base_address.max(descriptor.base_address);
        let region_end = end.min(descriptor.base_address.saturating_add(descriptor.length));
        let region_attributes = (descriptor.attributes & !MemoryAttributes::CacheAttributesMask.bits())
            | (descriptor.capabilities & attributes.bits());

        if let Err(err) = gcd.set_memory_space_attributes(region_start, region_end - region_start, region_attributes) {
            log::warn!(
                "Failed to set GCD attributes {region_attributes:#x} on {region_start:#x}-{region_end:#x}: {err:?}"
            );
            if status.is_ok() {
                status = Err(MmuError::Gcd(err));
            }
        }
    }

    status
}
