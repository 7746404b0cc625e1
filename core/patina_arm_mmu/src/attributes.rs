//! Memory Attribute Translation
//!
//! Converts between the hardware cache policy and permission fields of section and page descriptors and the
//! abstract UEFI memory attributes tracked by the GCD.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use r_efi::efi;

use crate::{
    descriptor::{AccessPermission, CachePolicy, LeafDescriptor, PageDescriptor, SectionDescriptor},
    error::{MmuError, Result},
};

bitflags::bitflags! {
    /// Abstract memory attributes, bit-compatible with the UEFI `EFI_MEMORY_*` values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemoryAttributes: u64 {
        const Uncacheable = efi::MEMORY_UC;
        const WriteCombining = efi::MEMORY_WC;
        const WriteThrough = efi::MEMORY_WT;
        const Writeback = efi::MEMORY_WB;
        const UncacheableExport = efi::MEMORY_UCE;
        const WriteProtect = efi::MEMORY_WP;
        /// Read protect. A mapping without the access flag set reports this bit.
        const ReadProtect = efi::MEMORY_RP;
        const ExecuteProtect = efi::MEMORY_XP;
        const ReadOnly = efi::MEMORY_RO;

        const CacheAttributesMask = Self::Uncacheable.bits()
            | Self::WriteCombining.bits()
            | Self::WriteThrough.bits()
            | Self::Writeback.bits()
            | Self::UncacheableExport.bits()
            | Self::WriteProtect.bits();

        /// `EFI_MEMORY_CACHETYPE_MASK`: the mutually exclusive cache types, without write protection.
        const CacheTypeMask = Self::Uncacheable.bits()
            | Self::WriteCombining.bits()
            | Self::WriteThrough.bits()
            | Self::Writeback.bits()
            | Self::UncacheableExport.bits();

        const AccessAttributesMask = Self::ReadProtect.bits() | Self::ExecuteProtect.bits() | Self::ReadOnly.bits();
    }
}

/// Translates the cache policy and permission fields of a leaf descriptor into abstract memory attributes.
///
/// Exactly one cache attribute is reported for a recognized policy. `ReadOnly`, `ExecuteProtect` and `ReadProtect`
/// are added from AP[2], XN and a clear access flag. Returns [`MmuError::Unsupported`] when the cache policy field
/// holds an encoding with no abstract equivalent.
pub fn to_memory_attributes<D: LeafDescriptor>(descriptor: D) -> Result<MemoryAttributes> {
    let mut attributes = match descriptor.cache_policy() {
        Some(CachePolicy::StronglyOrdered | CachePolicy::ShareableDevice | CachePolicy::NonShareableDevice) => {
            MemoryAttributes::Uncacheable
        }
        Some(CachePolicy::WriteThroughNoAllocate) => MemoryAttributes::WriteThrough,
        Some(CachePolicy::WriteBackNoAllocate | CachePolicy::WriteBackAllocate) => MemoryAttributes::Writeback,
        Some(CachePolicy::NonCacheable) => MemoryAttributes::WriteCombining,
        None => return Err(MmuError::Unsupported),
    };

    if descriptor.access_permission().is_read_only() {
        attributes |= MemoryAttributes::ReadOnly;
    }
    if descriptor.execute_never() {
        attributes |= MemoryAttributes::ExecuteProtect;
    }
    if !descriptor.access_flag() {
        attributes |= MemoryAttributes::ReadProtect;
    }

    Ok(attributes)
}

pub fn section_to_memory_attributes(descriptor: SectionDescriptor) -> Result<MemoryAttributes> {
    to_memory_attributes(descriptor)
}

pub fn page_to_memory_attributes(descriptor: PageDescriptor) -> Result<MemoryAttributes> {
    to_memory_attributes(descriptor)
}

/// Translates abstract memory attributes into a section descriptor carrying only type and attribute fields.
///
/// The cache class must be exactly one of UC, WC, WT or WB. Anything else, including `UncacheableExport` or no cache
/// attribute at all, produces [`SectionDescriptor::FAULT`] so the caller refuses to map the range. `WriteProtect` has
/// no short-descriptor encoding and is ignored.
pub fn memory_attributes_to_section(attributes: MemoryAttributes) -> SectionDescriptor {
    let cache = attributes & MemoryAttributes::CacheTypeMask;
    let policy = if cache == MemoryAttributes::Uncacheable {
        CachePolicy::StronglyOrdered
    } else if cache == MemoryAttributes::WriteCombining {
        CachePolicy::NonCacheable
    } else if cache == MemoryAttributes::WriteThrough {
        CachePolicy::WriteThroughNoAllocate
    } else if cache == MemoryAttributes::Writeback {
        CachePolicy::WriteBackAllocate
    } else {
        return SectionDescriptor::FAULT;
    };

    let permission = if attributes.contains(MemoryAttributes::ReadOnly) {
        AccessPermission::ReadOnly
    } else {
        AccessPermission::ReadWrite
    };

    SectionDescriptor::with_attributes(
        policy,
        permission,
        attributes.contains(MemoryAttributes::ExecuteProtect),
        !attributes.contains(MemoryAttributes::ReadProtect),
    )
}

/// The attributes a mapping created from `attributes` reports when read back, or `None` if no mapping can be created.
pub fn normalize(attributes: MemoryAttributes) -> Option<MemoryAttributes> {
    let section = memory_attributes_to_section(attributes);
    if section.is_fault() {
        return None;
    }
    to_memory_attributes(section).ok()
}
