//! ARM Short-Descriptor Translation Table Entries
//!
//! Bit-exact definitions of the first-level (section) and second-level (page) descriptors of the ARMv7
//! short-descriptor translation table format. Sections map 1MB, small pages map 4KB. Both levels carry the same
//! seven cache policies and the same four access permissions, placed at different bit offsets.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::fmt;

/// Number of entries in the first-level (section) table.
pub const TRANSLATION_TABLE_SECTION_COUNT: usize = 4096;
/// Number of entries in a second-level (page) table.
pub const TRANSLATION_TABLE_PAGE_COUNT: usize = 256;
/// Size of a second-level table in bytes. Tables must be aligned to this size.
pub const TRANSLATION_TABLE_PAGE_SIZE: usize = TRANSLATION_TABLE_PAGE_COUNT * core::mem::size_of::<u32>();

/// Size of the memory mapped by a section descriptor.
pub const SECTION_SIZE: u64 = 0x0010_0000;
/// Size of the memory mapped by a small page descriptor.
pub const PAGE_SIZE: u64 = 0x1000;
/// Size of the address space covered by the first-level table.
pub const ADDRESS_SPACE_SIZE: u64 = TRANSLATION_TABLE_SECTION_COUNT as u64 * SECTION_SIZE;

pub const SECTION_BASE_SHIFT: u32 = 20;
pub const PAGE_BASE_SHIFT: u32 = 12;

pub const SECTION_BASE_ADDRESS_MASK: u32 = 0xFFF0_0000;
pub const SECTION_PAGE_TABLE_ADDRESS_MASK: u32 = 0xFFFF_FC00;
pub const PAGE_BASE_ADDRESS_MASK: u32 = 0xFFFF_F000;
pub const PAGE_INDEX_MASK: u32 = 0x000F_F000;

// First-level descriptor types.
const SECTION_TYPE_MASK: u32 = (1 << 18) | (3 << 0);
const SECTION_TYPE_FAULT: u32 = 0;
const SECTION_TYPE_PAGE_TABLE: u32 = 1 << 0;
const SECTION_TYPE_SECTION: u32 = 2 << 0;
const SECTION_TYPE_SUPERSECTION: u32 = (1 << 18) | (2 << 0);
const SECTION_TYPE_LOW_BITS_MASK: u32 = 3 << 0;

// Section attribute fields.
pub const SECTION_XN_MASK: u32 = 1 << 4;
pub const SECTION_AP_MASK: u32 = (1 << 15) | (3 << 10);
pub const SECTION_AP_NO_RW: u32 = 1 << 10;
pub const SECTION_AP_RW_RW: u32 = 3 << 10;
pub const SECTION_AP_NO_RO: u32 = (1 << 15) | (1 << 10);
pub const SECTION_AP_RO_RO: u32 = (1 << 15) | (3 << 10);
pub const SECTION_AF: u32 = 1 << 10;
pub const SECTION_S_MASK: u32 = 1 << 16;
pub const SECTION_NG_MASK: u32 = 1 << 17;

pub const SECTION_CACHE_POLICY_MASK: u32 = (3 << 12) | (1 << 3) | (1 << 2);
pub const SECTION_STRONGLY_ORDERED: u32 = 0;
pub const SECTION_SHAREABLE_DEVICE: u32 = 1 << 2;
pub const SECTION_WRITE_THROUGH_NO_ALLOC: u32 = 1 << 3;
pub const SECTION_WRITE_BACK_NO_ALLOC: u32 = (1 << 3) | (1 << 2);
pub const SECTION_NON_CACHEABLE: u32 = 1 << 12;
pub const SECTION_WRITE_BACK_ALLOC: u32 = (1 << 12) | (1 << 3) | (1 << 2);
pub const SECTION_NON_SHAREABLE_DEVICE: u32 = 2 << 12;

/// Bits compared when deciding whether two sections belong to the same region.
pub const SECTION_ATTRIBUTE_MASK: u32 = SECTION_CACHE_POLICY_MASK | SECTION_AP_MASK | SECTION_XN_MASK;

// Second-level descriptor types.
const PAGE_TYPE_MASK: u32 = 3 << 0;
const PAGE_TYPE_FAULT: u32 = 0;
const PAGE_TYPE_LARGE_PAGE: u32 = 1 << 0;
const PAGE_TYPE_PAGE: u32 = 2 << 0;

// Small page attribute fields.
pub const PAGE_XN_MASK: u32 = 1 << 0;
pub const PAGE_AP_MASK: u32 = (1 << 9) | (3 << 4);
pub const PAGE_AP_NO_RW: u32 = 1 << 4;
pub const PAGE_AP_RW_RW: u32 = 3 << 4;
pub const PAGE_AP_NO_RO: u32 = (1 << 9) | (1 << 4);
pub const PAGE_AP_RO_RO: u32 = (1 << 9) | (3 << 4);
pub const PAGE_AF: u32 = 1 << 4;
pub const PAGE_S_MASK: u32 = 1 << 10;
pub const PAGE_NG_MASK: u32 = 1 << 11;

pub const PAGE_CACHE_POLICY_MASK: u32 = (3 << 6) | (1 << 3) | (1 << 2);

/// Bits compared when deciding whether two pages belong to the same region.
pub const PAGE_ATTRIBUTE_MASK: u32 = PAGE_CACHE_POLICY_MASK | PAGE_AP_MASK | PAGE_XN_MASK;

// TEX[1:0] sits at bits [13:12] in a section and at bits [7:6] in a small page.
const TEX_SECTION_TO_PAGE_SHIFT: u32 = 6;
const CB_MASK: u32 = 3 << 2;

/// The seven memory region types the short-descriptor format encodes through TEX[1:0], C and B.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    StronglyOrdered,
    ShareableDevice,
    WriteThroughNoAllocate,
    WriteBackNoAllocate,
    NonCacheable,
    WriteBackAllocate,
    NonShareableDevice,
}

impl CachePolicy {
    /// All recognized policies.
    pub const ALL: [CachePolicy; 7] = [
        CachePolicy::StronglyOrdered,
        CachePolicy::ShareableDevice,
        CachePolicy::WriteThroughNoAllocate,
        CachePolicy::WriteBackNoAllocate,
        CachePolicy::NonCacheable,
        CachePolicy::WriteBackAllocate,
        CachePolicy::NonShareableDevice,
    ];

    /// Decodes the cache policy field of a section descriptor. Returns `None` for encodings this driver does not
    /// recognize.
    pub fn from_section_bits(bits: u32) -> Option<Self> {
        match bits & SECTION_CACHE_POLICY_MASK {
            SECTION_STRONGLY_ORDERED => Some(CachePolicy::StronglyOrdered),
            SECTION_SHAREABLE_DEVICE => Some(CachePolicy::ShareableDevice),
            SECTION_WRITE_THROUGH_NO_ALLOC => Some(CachePolicy::WriteThroughNoAllocate),
            SECTION_WRITE_BACK_NO_ALLOC => Some(CachePolicy::WriteBackNoAllocate),
            SECTION_NON_CACHEABLE => Some(CachePolicy::NonCacheable),
            SECTION_WRITE_BACK_ALLOC => Some(CachePolicy::WriteBackAllocate),
            SECTION_NON_SHAREABLE_DEVICE => Some(CachePolicy::NonShareableDevice),
            _ => None,
        }
    }

    /// Decodes the cache policy field of a small page descriptor.
    pub fn from_page_bits(bits: u32) -> Option<Self> {
        Self::from_section_bits(page_cache_policy_to_section(bits))
    }

    /// The section encoding of this policy.
    pub const fn section_bits(self) -> u32 {
        match self {
            CachePolicy::StronglyOrdered => SECTION_STRONGLY_ORDERED,
            CachePolicy::ShareableDevice => SECTION_SHAREABLE_DEVICE,
            CachePolicy::WriteThroughNoAllocate => SECTION_WRITE_THROUGH_NO_ALLOC,
            CachePolicy::WriteBackNoAllocate => SECTION_WRITE_BACK_NO_ALLOC,
            CachePolicy::NonCacheable => SECTION_NON_CACHEABLE,
            CachePolicy::WriteBackAllocate => SECTION_WRITE_BACK_ALLOC,
            CachePolicy::NonShareableDevice => SECTION_NON_SHAREABLE_DEVICE,
        }
    }

    /// The small page encoding of this policy.
    pub const fn page_bits(self) -> u32 {
        section_cache_policy_to_page(self.section_bits())
    }
}

/// Access permissions as encoded by AP[2] and AP[1]. AP[0] is used as the access flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPermission {
    /// Privileged read/write, no user access.
    PrivilegedReadWrite,
    /// Read/write at every privilege level.
    ReadWrite,
    /// Privileged read-only, no user access.
    PrivilegedReadOnly,
    /// Read-only at every privilege level.
    ReadOnly,
}

impl AccessPermission {
    fn from_fields(read_only: bool, unprivileged: bool) -> Self {
        match (read_only, unprivileged) {
            (false, false) => AccessPermission::PrivilegedReadWrite,
            (false, true) => AccessPermission::ReadWrite,
            (true, false) => AccessPermission::PrivilegedReadOnly,
            (true, true) => AccessPermission::ReadOnly,
        }
    }

    /// Whether writes are forbidden at every privilege level.
    pub fn is_read_only(self) -> bool {
        matches!(self, AccessPermission::PrivilegedReadOnly | AccessPermission::ReadOnly)
    }
}

const fn section_cache_policy_to_page(bits: u32) -> u32 {
    ((bits & (3 << 12)) >> TEX_SECTION_TO_PAGE_SHIFT) | (bits & CB_MASK)
}

const fn page_cache_policy_to_section(bits: u32) -> u32 {
    ((bits & (3 << 6)) << TEX_SECTION_TO_PAGE_SHIFT) | (bits & CB_MASK)
}

/// Capabilities shared by the two leaf descriptor formats.
///
/// Sections and small pages carry identical fields at different offsets. The region coalescer and the attribute
/// translator operate on either through this trait.
pub trait LeafDescriptor: Copy + Eq + fmt::Debug {
    /// Number of bytes mapped by one descriptor of this kind.
    const GRANULE: u64;

    /// The raw descriptor word.
    fn raw(self) -> u32;

    /// The descriptor reduced to the fields that define a region's attributes.
    fn attributes(self) -> Self;

    /// The raw cache policy field.
    fn cache_policy_bits(self) -> u32;

    /// The decoded cache policy, `None` when the encoding is not recognized.
    fn cache_policy(self) -> Option<CachePolicy>;

    fn access_permission(self) -> AccessPermission;

    fn execute_never(self) -> bool;

    /// The access flag. A clear flag means the first access faults.
    fn access_flag(self) -> bool;
}

/// A first-level descriptor mapping a 1MB section.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SectionDescriptor(u32);

impl SectionDescriptor {
    /// The fault encoding. Used by the reverse translation to refuse a mapping.
    pub const FAULT: SectionDescriptor = SectionDescriptor(SECTION_TYPE_FAULT);

    /// Wraps a raw value without checking its type bits.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Builds a section descriptor mapping `base` with the attribute fields of `attributes`.
    pub fn new(base: u32, attributes: SectionDescriptor) -> Self {
        Self(
            (base & SECTION_BASE_ADDRESS_MASK)
                | (attributes.0 & !SECTION_TYPE_MASK & !SECTION_BASE_ADDRESS_MASK)
                | SECTION_TYPE_SECTION,
        )
    }

    /// Builds a descriptor carrying only attribute fields, typed as a section.
    pub fn with_attributes(
        cache_policy: CachePolicy,
        permission: AccessPermission,
        execute_never: bool,
        access_flag: bool,
    ) -> Self {
        let mut raw = SECTION_TYPE_SECTION | cache_policy.section_bits();
        raw |= match permission {
            AccessPermission::PrivilegedReadWrite => SECTION_AP_NO_RW,
            AccessPermission::ReadWrite => SECTION_AP_RW_RW,
            AccessPermission::PrivilegedReadOnly => SECTION_AP_NO_RO,
            AccessPermission::ReadOnly => SECTION_AP_RO_RO,
        } & !SECTION_AF;
        if execute_never {
            raw |= SECTION_XN_MASK;
        }
        if access_flag {
            raw |= SECTION_AF;
        }
        Self(raw)
    }

    pub fn is_fault(self) -> bool {
        self.0 & SECTION_TYPE_LOW_BITS_MASK == SECTION_TYPE_FAULT
    }

    pub fn base_address(self) -> u32 {
        self.0 & SECTION_BASE_ADDRESS_MASK
    }

    /// Moves the cache policy, access permission, execute-never, shareable and not-global fields into their small
    /// page positions. Address and type bits are dropped.
    pub fn to_page_attributes(self) -> PageDescriptor {
        let d = self.0;
        PageDescriptor(
            section_cache_policy_to_page(d & SECTION_CACHE_POLICY_MASK)
                | (((d & SECTION_AP_MASK) >> 6) & PAGE_AP_MASK)
                | (((d & SECTION_XN_MASK) >> 4) & PAGE_XN_MASK)
                | (((d & SECTION_S_MASK) >> 6) & PAGE_S_MASK)
                | (((d & SECTION_NG_MASK) >> 6) & PAGE_NG_MASK),
        )
    }
}

impl LeafDescriptor for SectionDescriptor {
    const GRANULE: u64 = SECTION_SIZE;

    fn raw(self) -> u32 {
        self.0
    }

    fn attributes(self) -> Self {
        Self(self.0 & SECTION_ATTRIBUTE_MASK)
    }

    fn cache_policy_bits(self) -> u32 {
        self.0 & SECTION_CACHE_POLICY_MASK
    }

    fn cache_policy(self) -> Option<CachePolicy> {
        CachePolicy::from_section_bits(self.0)
    }

    fn access_permission(self) -> AccessPermission {
        AccessPermission::from_fields(self.0 & (1 << 15) != 0, self.0 & (1 << 11) != 0)
    }

    fn execute_never(self) -> bool {
        self.0 & SECTION_XN_MASK != 0
    }

    fn access_flag(self) -> bool {
        self.0 & SECTION_AF != 0
    }
}

impl fmt::Debug for SectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectionDescriptor({:#010x})", self.0)
    }
}

/// A second-level descriptor mapping a 4KB small page.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageDescriptor(u32);

impl PageDescriptor {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Builds a small page descriptor mapping `base` with the attribute fields of `attributes`. The execute-never bit
    /// shares the low type bits, so it is carried over from `attributes`.
    pub fn new(base: u32, attributes: PageDescriptor) -> Self {
        Self((base & PAGE_BASE_ADDRESS_MASK) | (attributes.0 & !PAGE_BASE_ADDRESS_MASK) | PAGE_TYPE_PAGE)
    }

    pub fn base_address(self) -> u32 {
        self.0 & PAGE_BASE_ADDRESS_MASK
    }

    /// Moves the small page attribute fields back into their section positions. Address and type bits are dropped.
    pub fn to_section_attributes(self) -> SectionDescriptor {
        let d = self.0;
        SectionDescriptor(
            page_cache_policy_to_section(d & PAGE_CACHE_POLICY_MASK)
                | (((d & PAGE_AP_MASK) << 6) & SECTION_AP_MASK)
                | (((d & PAGE_XN_MASK) << 4) & SECTION_XN_MASK)
                | (((d & PAGE_S_MASK) << 6) & SECTION_S_MASK)
                | (((d & PAGE_NG_MASK) << 6) & SECTION_NG_MASK),
        )
    }
}

impl LeafDescriptor for PageDescriptor {
    const GRANULE: u64 = PAGE_SIZE;

    fn raw(self) -> u32 {
        self.0
    }

    fn attributes(self) -> Self {
        Self(self.0 & PAGE_ATTRIBUTE_MASK)
    }

    fn cache_policy_bits(self) -> u32 {
        self.0 & PAGE_CACHE_POLICY_MASK
    }

    fn cache_policy(self) -> Option<CachePolicy> {
        CachePolicy::from_page_bits(self.0)
    }

    fn access_permission(self) -> AccessPermission {
        AccessPermission::from_fields(self.0 & (1 << 9) != 0, self.0 & (1 << 5) != 0)
    }

    fn execute_never(self) -> bool {
        self.0 & PAGE_XN_MASK != 0
    }

    fn access_flag(self) -> bool {
        self.0 & PAGE_AF != 0
    }
}

impl fmt::Debug for PageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageDescriptor({:#010x})", self.0)
    }
}

/// Classification of a first-level entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstLevelEntry {
    Fault,
    /// Points to a second-level table at the given physical address.
    PageTable(u32),
    Section(SectionDescriptor),
    /// 16MB mapping. Never produced by the firmware table builder.
    Supersection,
    /// Type bits `0b11`.
    Reserved,
}

/// A raw first-level translation table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FirstLevelDescriptor(u32);

impl FirstLevelDescriptor {
    pub const FAULT: FirstLevelDescriptor = FirstLevelDescriptor(SECTION_TYPE_FAULT);

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// A descriptor pointing to the second-level table at `table`.
    pub fn page_table(table: u32) -> Self {
        Self((table & SECTION_PAGE_TABLE_ADDRESS_MASK) | SECTION_TYPE_PAGE_TABLE)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn entry(self) -> FirstLevelEntry {
        if self.0 & SECTION_TYPE_LOW_BITS_MASK == SECTION_TYPE_PAGE_TABLE {
            return FirstLevelEntry::PageTable(self.0 & SECTION_PAGE_TABLE_ADDRESS_MASK);
        }
        match self.0 & SECTION_TYPE_MASK {
            SECTION_TYPE_SECTION => FirstLevelEntry::Section(SectionDescriptor(self.0)),
            SECTION_TYPE_SUPERSECTION => FirstLevelEntry::Supersection,
            _ if self.0 & SECTION_TYPE_LOW_BITS_MASK == SECTION_TYPE_FAULT => FirstLevelEntry::Fault,
            _ => FirstLevelEntry::Reserved,
        }
    }
}

impl fmt::Debug for FirstLevelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FirstLevelDescriptor({:#010x})", self.0)
    }
}

impl From<SectionDescriptor> for FirstLevelDescriptor {
    fn from(section: SectionDescriptor) -> Self {
        Self(section.0)
    }
}

/// Classification of a second-level entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondLevelEntry {
    Fault,
    /// 64KB mapping. Never produced by the firmware table builder.
    LargePage,
    Page(PageDescriptor),
}

/// A raw second-level translation table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SecondLevelDescriptor(u32);

impl SecondLevelDescriptor {
    pub const FAULT: SecondLevelDescriptor = SecondLevelDescriptor(PAGE_TYPE_FAULT);

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn entry(self) -> SecondLevelEntry {
        match self.0 & PAGE_TYPE_MASK {
            PAGE_TYPE_FAULT => SecondLevelEntry::Fault,
            PAGE_TYPE_LARGE_PAGE => SecondLevelEntry::LargePage,
            _ => SecondLevelEntry::Page(PageDescriptor(self.0)),
        }
    }
}

impl fmt::Debug for SecondLevelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecondLevelDescriptor({:#010x})", self.0)
    }
}

impl From<PageDescriptor> for SecondLevelDescriptor {
    fn from(page: PageDescriptor) -> Self {
        Self(page.0)
    }
}
