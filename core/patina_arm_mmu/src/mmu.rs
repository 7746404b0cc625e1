//! ARM Short-Descriptor MMU Driver
//!
//! Owns a translation table store and keeps the GCD memory space map consistent with it. Also implements the
//! attribute setter the GCD calls to program the MMU, which makes synchronization re-entrant: while
//! [`ArmMmu::sync_cache_config`] walks the tables, every region it reports may come back through
//! [`ArmMmu::set_memory_attributes`] and rewrite entries of the same tables. This is tolerated rather than locked.
//! Regions already consistent with the tables are no-ops, so the recursion terminates.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;
use core::{
    ops::ControlFlow,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    attributes::{memory_attributes_to_section, to_memory_attributes, MemoryAttributes},
    config::MmuConfig,
    descriptor::{
        FirstLevelDescriptor, FirstLevelEntry, LeafDescriptor, PageDescriptor, SecondLevelEntry, SectionDescriptor,
        ADDRESS_SPACE_SIZE, PAGE_ATTRIBUTE_MASK, PAGE_BASE_ADDRESS_MASK, PAGE_BASE_SHIFT, PAGE_INDEX_MASK, PAGE_SIZE,
        SECTION_ATTRIBUTE_MASK, SECTION_BASE_SHIFT, SECTION_SIZE, TRANSLATION_TABLE_PAGE_COUNT,
    },
    error::{MmuError, Result},
    gcd::{set_gcd_memory_space_attributes, MemorySpaceAuthority},
    table::TranslationTableStore,
    walker::{MemoryRegion, TableWalker},
};

/// Tracks how deeply the driver is nested inside itself through the GCD.
struct ReentrancyGuard<'a> {
    depth: &'a AtomicUsize,
}

impl<'a> ReentrancyGuard<'a> {
    fn enter(depth: &'a AtomicUsize, limit: usize) -> Self {
        let current = depth.fetch_add(1, Ordering::SeqCst) + 1;
        assert!(current <= limit, "MMU driver re-entered {current} times, the limit is {limit}");
        Self { depth }
    }
}

impl Drop for ReentrancyGuard<'_> {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The MMU driver for ARM short-descriptor translation tables.
pub struct ArmMmu<S: TranslationTableStore> {
    store: S,
    config: MmuConfig,
    depth: AtomicUsize,
}

impl<S: TranslationTableStore> ArmMmu<S> {
    pub fn new(store: S, config: MmuConfig) -> Self {
        Self { store, config, depth: AtomicUsize::new(0) }
    }

    /// The translation table store this driver operates on.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Every region of uniform attributes currently mapped, in address order.
    pub fn regions(&self) -> Vec<MemoryRegion> {
        TableWalker::new(&self.store).regions()
    }

    /// Returns the maximal region of uniform attributes that starts at the granule containing `address`.
    ///
    /// ## Errors
    ///
    /// - [`MmuError::InvalidParameter`] if `address` is beyond 4GB.
    /// - [`MmuError::NoMapping`] if the granule containing `address` is not mapped.
    /// - [`MmuError::Unsupported`] if it is mapped by a supersection or a large page.
    pub fn get_memory_region(&self, address: u64) -> Result<MemoryRegion> {
        if address >= ADDRESS_SPACE_SIZE {
            return Err(MmuError::InvalidParameter);
        }

        match self.store.read_first_level((address >> SECTION_BASE_SHIFT) as usize).entry() {
            FirstLevelEntry::Section(_) => {}
            FirstLevelEntry::PageTable(table) => {
                match self.store.read_second_level(table, page_index(address)).entry() {
                    SecondLevelEntry::Page(_) => {}
                    SecondLevelEntry::Fault => return Err(MmuError::NoMapping),
                    SecondLevelEntry::LargePage => return Err(MmuError::Unsupported),
                }
            }
            FirstLevelEntry::Fault | FirstLevelEntry::Reserved => return Err(MmuError::NoMapping),
            FirstLevelEntry::Supersection => return Err(MmuError::Unsupported),
        }

        let mut found = None;
        let _ = TableWalker::new(&self.store).walk_from(address, |region| {
            found = Some(region);
            ControlFlow::Break(())
        });
        found.ok_or(MmuError::NoMapping)
    }

    /// Pushes the attributes of every mapped region into the GCD.
    ///
    /// The GCD memory space map is read once up front; failing to read it aborts the synchronization. A region the
    /// GCD refuses is logged and skipped. The GCD may call [`ArmMmu::set_memory_attributes`] while this runs.
    pub fn sync_cache_config(&self, gcd: &dyn MemorySpaceAuthority) -> Result<()> {
        let _guard = self.enter();

        let map = gcd.get_memory_space_map().map_err(|status| {
            log::error!("Failed to get the GCD memory space map: {status:?}");
            MmuError::Gcd(status)
        })?;

        let mut failures = 0usize;
        let _ = TableWalker::new(&self.store).walk(|region| {
            log::debug!(
                "Syncing {:#x}-{:#x} {:?}",
                region.base_address,
                region.base_address + region.length,
                region.attributes
            );
            if let Err(err) =
                set_gcd_memory_space_attributes(gcd, &map, region.base_address, region.length, region.attributes)
            {
                log::warn!(
                    "Failed to sync GCD attributes for {:#x}-{:#x}: {err:?}",
                    region.base_address,
                    region.base_address + region.length
                );
                failures += 1;
            }
            ControlFlow::Continue(())
        });

        if failures > 0 {
            log::warn!("{failures} regions could not be synchronized with the GCD.");
        }
        Ok(())
    }

    /// Maps `[base_address, base_address + length)` with `attributes`.
    ///
    /// Does nothing when the range is already mapped by a single region carrying the attributes the new mapping would
    /// report. Otherwise sections wholly inside the range are rewritten in place and partially covered sections are
    /// split into page tables. Mapped entries keep their output address; unmapped ones are identity mapped.
    ///
    /// ## Errors
    ///
    /// - [`MmuError::InvalidParameter`] for an empty range or a range extending beyond 4GB.
    /// - [`MmuError::Unsupported`] for a range not aligned to 4KB, for attributes without exactly one of the UC, WC,
    ///   WT or WB cache types, or when the range touches a supersection or a large page.
    /// - [`MmuError::OutOfResources`] if a page table could not be allocated.
    pub fn set_memory_attributes(&self, base_address: u64, length: u64, attributes: MemoryAttributes) -> Result<()> {
        let _guard = self.enter();

        if length == 0 {
            return Err(MmuError::InvalidParameter);
        }
        let end = base_address
            .checked_add(length)
            .filter(|end| *end <= ADDRESS_SPACE_SIZE)
            .ok_or(MmuError::InvalidParameter)?;
        if base_address % PAGE_SIZE != 0 || length % PAGE_SIZE != 0 {
            log::error!("Range {base_address:#x}+{length:#x} is not page aligned.");
            return Err(MmuError::Unsupported);
        }

        let section = memory_attributes_to_section(attributes);
        if section.is_fault() {
            log::error!("Memory attributes {attributes:?} cannot be mapped.");
            return Err(MmuError::Unsupported);
        }
        let requested = to_memory_attributes(section)?;

        if let Ok(region) = self.get_memory_region(base_address) {
            if region.attributes == requested && region.base_address + region.length >= end {
                log::trace!("{base_address:#x}-{end:#x} already mapped {requested:?}.");
                return Ok(());
            }
        }

        let status = self.update_entries(base_address, end, section);
        self.store.invalidate_tlb();
        status
    }

    fn enter(&self) -> ReentrancyGuard<'_> {
        ReentrancyGuard::enter(&self.depth, self.config.max_reentrancy_depth)
    }

    fn update_entries(&self, base_address: u64, end: u64, section: SectionDescriptor) -> Result<()> {
        let mut address = base_address;
        while address < end {
            let index = (address >> SECTION_BASE_SHIFT) as usize;
            let section_base = (index as u64) << SECTION_BASE_SHIFT;
            let chunk_end = end.min(section_base + SECTION_SIZE);
            let whole = address == section_base && chunk_end == section_base + SECTION_SIZE;

            match self.store.read_first_level(index).entry() {
                FirstLevelEntry::PageTable(table) => {
                    self.update_page_entries(table, address, chunk_end, section.to_page_attributes())?
                }
                FirstLevelEntry::Supersection => {
                    log::error!("Cannot update {address:#x}, it is mapped by a supersection.");
                    return Err(MmuError::Unsupported);
                }
                FirstLevelEntry::Section(existing) if whole => {
                    let preserved = existing.raw() & !SECTION_ATTRIBUTE_MASK;
                    let attributes = SectionDescriptor::from_raw(preserved | section.attributes().raw());
                    let descriptor = SectionDescriptor::new(existing.base_address(), attributes);
                    self.store.write_first_level(index, descriptor.into());
                }
                FirstLevelEntry::Fault | FirstLevelEntry::Reserved if whole => {
                    self.store.write_first_level(index, SectionDescriptor::new(section_base as u32, section).into());
                }
                FirstLevelEntry::Section(existing) => {
                    let table = self.split_section(index, Some(existing))?;
                    self.update_page_entries(table, address, chunk_end, section.to_page_attributes())?;
                }
                FirstLevelEntry::Fault | FirstLevelEntry::Reserved => {
                    let table = self.split_section(index, None)?;
                    self.update_page_entries(table, address, chunk_end, section.to_page_attributes())?;
                }
            }

            address = chunk_end;
        }
        Ok(())
    }

    // Replaces section `index` with a page table mapping the same memory, or nothing for an unmapped section.
    fn split_section(&self, index: usize, existing: Option<SectionDescriptor>) -> Result<u32> {
        let table = self.store.allocate_second_level()?;

        if let Some(existing) = existing {
            let attributes = existing.to_page_attributes();
            for page in 0..TRANSLATION_TABLE_PAGE_COUNT {
                let base = existing.base_address() + ((page as u32) << PAGE_BASE_SHIFT);
                self.store.write_second_level(table, page, PageDescriptor::new(base, attributes).into());
            }
        }

        log::debug!("Split section {:#x} into page table {table:#x}.", (index as u64) << SECTION_BASE_SHIFT);
        self.store.write_first_level(index, FirstLevelDescriptor::page_table(table));
        Ok(table)
    }

    fn update_page_entries(&self, table: u32, start: u64, end: u64, attributes: PageDescriptor) -> Result<()> {
        let section_base = start & !(SECTION_SIZE - 1);
        for index in page_index(start)..=page_index(end - 1) {
            // Mapped pages keep their output address, unmapped ones are identity mapped.
            let (base, preserved) = match self.store.read_second_level(table, index).entry() {
                SecondLevelEntry::Page(existing) => {
                    (existing.base_address(), existing.raw() & !(PAGE_ATTRIBUTE_MASK | PAGE_BASE_ADDRESS_MASK))
                }
                SecondLevelEntry::Fault => ((section_base + ((index as u64) << PAGE_BASE_SHIFT)) as u32, 0),
                SecondLevelEntry::LargePage => {
                    log::error!("Cannot update page {index} of table {table:#x}, it is part of a large page.");
                    return Err(MmuError::Unsupported);
                }
            };
            let page = PageDescriptor::new(base, PageDescriptor::from_raw(preserved | attributes.attributes().raw()));
            self.store.write_second_level(table, index, page.into());
        }
        Ok(())
    }
}

fn page_index(address: u64) -> usize {
    ((address as u32 & PAGE_INDEX_MASK) >> PAGE_BASE_SHIFT) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        descriptor::{SecondLevelDescriptor, PAGE_NG_MASK, PAGE_S_MASK, SECTION_NG_MASK, SECTION_S_MASK},
        gcd::{GcdMemoryType, MemorySpaceDescriptor},
        test_support::InMemoryTables,
    };
    use core::cell::RefCell;
    use mockall::mock;
    use r_efi::efi;

    mock! {
        Gcd {}
        impl MemorySpaceAuthority for Gcd {
            fn get_memory_space_map(&self) -> core::result::Result<Vec<MemorySpaceDescriptor>, efi::Status>;
            fn set_memory_space_attributes(
                &self,
                base_address: efi::PhysicalAddress,
                length: u64,
                attributes: u64,
            ) -> core::result::Result<(), efi::Status>;
        }
    }

    const WB: MemoryAttributes = MemoryAttributes::Writeback;
    const WB_XP: MemoryAttributes = MemoryAttributes::Writeback.union(MemoryAttributes::ExecuteProtect);
    const UC: MemoryAttributes = MemoryAttributes::Uncacheable;
    const UC_XP: MemoryAttributes = MemoryAttributes::Uncacheable.union(MemoryAttributes::ExecuteProtect);

    fn region(base_address: u64, length: u64, attributes: MemoryAttributes) -> MemoryRegion {
        MemoryRegion { base_address, length, attributes }
    }

    fn whole_address_space(capabilities: u64) -> Vec<MemorySpaceDescriptor> {
        vec![MemorySpaceDescriptor {
            base_address: 0,
            length: ADDRESS_SPACE_SIZE,
            capabilities,
            attributes: 0,
            memory_type: GcdMemoryType::SystemMemory,
        }]
    }

    /// Records calls and, like the DXE GCD, programs the MMU with every attribute change it accepts.
    struct ProgrammingGcd<'a> {
        mmu: &'a ArmMmu<InMemoryTables>,
        map: Vec<MemorySpaceDescriptor>,
        calls: RefCell<Vec<(u64, u64, u64)>>,
    }

    impl<'a> ProgrammingGcd<'a> {
        fn new(mmu: &'a ArmMmu<InMemoryTables>, capabilities: u64) -> Self {
            Self { mmu, map: whole_address_space(capabilities), calls: RefCell::new(Vec::new()) }
        }

        fn take_calls(&self) -> Vec<(u64, u64, u64)> {
            core::mem::take(&mut *self.calls.borrow_mut())
        }
    }

    impl MemorySpaceAuthority for ProgrammingGcd<'_> {
        fn get_memory_space_map(&self) -> core::result::Result<Vec<MemorySpaceDescriptor>, efi::Status> {
            Ok(self.map.clone())
        }

        fn set_memory_space_attributes(
            &self,
            base_address: efi::PhysicalAddress,
            length: u64,
            attributes: u64,
        ) -> core::result::Result<(), efi::Status> {
            self.calls.borrow_mut().push((base_address, length, attributes));
            self.mmu
                .set_memory_attributes(base_address, length, MemoryAttributes::from_bits_truncate(attributes))
                .map_err(efi::Status::from)
        }
    }

    /// A GCD that synchronizes again from inside every attribute change.
    struct RecursingGcd<'a> {
        mmu: &'a ArmMmu<InMemoryTables>,
    }

    impl MemorySpaceAuthority for RecursingGcd<'_> {
        fn get_memory_space_map(&self) -> core::result::Result<Vec<MemorySpaceDescriptor>, efi::Status> {
            Ok(whole_address_space(efi::MEMORY_WB))
        }

        fn set_memory_space_attributes(
            &self,
            _: efi::PhysicalAddress,
            _: u64,
            _: u64,
        ) -> core::result::Result<(), efi::Status> {
            self.mmu.sync_cache_config(self).map_err(efi::Status::from)
        }
    }

    fn mmu() -> ArmMmu<InMemoryTables> {
        ArmMmu::new(InMemoryTables::new(), MmuConfig::default())
    }

    #[test]
    fn test_get_memory_region_stops_at_the_boundary() {
        let mmu = mmu();
        mmu.store().map_sections(0, 4, WB);
        mmu.store().map_sections(4, 2, UC);

        assert_eq!(Ok(region(0, 4 * SECTION_SIZE, WB)), mmu.get_memory_region(0));
        assert_eq!(Ok(region(SECTION_SIZE, 3 * SECTION_SIZE, WB)), mmu.get_memory_region(SECTION_SIZE + 0x123));
        assert_eq!(Ok(region(4 * SECTION_SIZE, 2 * SECTION_SIZE, UC)), mmu.get_memory_region(4 * SECTION_SIZE));
    }

    #[test]
    fn test_get_memory_region_reports_unmapped_granules() {
        let mmu = mmu();
        mmu.store().map_sections(0, 1, WB);
        mmu.store().map_page_table(1, |page| if page == 3 { None } else { Some(WB) });

        assert_eq!(Err(MmuError::NoMapping), mmu.get_memory_region(2 * SECTION_SIZE));
        assert_eq!(Err(MmuError::NoMapping), mmu.get_memory_region(SECTION_SIZE + 3 * PAGE_SIZE));
        assert_eq!(Ok(region(0, SECTION_SIZE + 3 * PAGE_SIZE, WB)), mmu.get_memory_region(0));
        assert_eq!(Err(MmuError::InvalidParameter), mmu.get_memory_region(ADDRESS_SPACE_SIZE));
    }

    #[test]
    fn test_get_memory_region_rejects_supersections() {
        let mmu = mmu();
        mmu.store().set_first_level(0, (1 << 18) | 2);
        assert_eq!(Err(MmuError::Unsupported), mmu.get_memory_region(0));
    }

    #[test]
    fn test_set_memory_attributes_validates_the_range() {
        let mmu = mmu();
        assert_eq!(Err(MmuError::InvalidParameter), mmu.set_memory_attributes(0, 0, WB));
        assert_eq!(
            Err(MmuError::InvalidParameter),
            mmu.set_memory_attributes(ADDRESS_SPACE_SIZE - PAGE_SIZE, 2 * PAGE_SIZE, WB)
        );
        assert_eq!(Err(MmuError::Unsupported), mmu.set_memory_attributes(0x800, PAGE_SIZE, WB));
        assert_eq!(Err(MmuError::Unsupported), mmu.set_memory_attributes(0, 0x800, WB));
        assert_eq!(
            Err(MmuError::Unsupported),
            mmu.set_memory_attributes(0, PAGE_SIZE, MemoryAttributes::UncacheableExport)
        );
        assert_eq!(Err(MmuError::Unsupported), mmu.set_memory_attributes(0, PAGE_SIZE, MemoryAttributes::ReadOnly));
        assert_eq!(0, mmu.store().writes());
    }

    #[test]
    fn test_set_memory_attributes_is_a_no_op_when_consistent() {
        let mmu = mmu();
        mmu.store().map_sections(0, 8, WB_XP);

        assert_eq!(Ok(()), mmu.set_memory_attributes(SECTION_SIZE, 4 * SECTION_SIZE, WB_XP));
        assert_eq!(Ok(()), mmu.set_memory_attributes(0x3000, PAGE_SIZE, WB_XP));
        assert_eq!(0, mmu.store().writes());
        assert_eq!(0, mmu.store().tlb_invalidations());
    }

    #[test]
    fn test_whole_sections_are_rewritten_in_place() {
        let mmu = mmu();
        mmu.store().map_sections(0, 4, WB);

        assert_eq!(Ok(()), mmu.set_memory_attributes(SECTION_SIZE, 2 * SECTION_SIZE, UC_XP));
        assert_eq!(
            vec![
                region(0, SECTION_SIZE, WB),
                region(SECTION_SIZE, 2 * SECTION_SIZE, UC_XP),
                region(3 * SECTION_SIZE, SECTION_SIZE, WB),
            ],
            mmu.regions()
        );
        assert_eq!(0, mmu.store().page_table_count());
        assert_eq!(1, mmu.store().tlb_invalidations());
    }

    #[test]
    fn test_write_protect_request_maps_the_cache_type() {
        let mmu = mmu();
        mmu.store().map_sections(0, 2, UC);

        assert_eq!(Ok(()), mmu.set_memory_attributes(0, SECTION_SIZE, WB | MemoryAttributes::WriteProtect));
        assert_eq!(vec![region(0, SECTION_SIZE, WB), region(SECTION_SIZE, SECTION_SIZE, UC)], mmu.regions());

        let writes = mmu.store().writes();
        assert_eq!(Ok(()), mmu.set_memory_attributes(0, SECTION_SIZE, WB | MemoryAttributes::WriteProtect));
        assert_eq!(writes, mmu.store().writes());
    }

    #[test]
    fn test_unmapped_sections_are_mapped() {
        let mmu = mmu();
        assert_eq!(Ok(()), mmu.set_memory_attributes(2 * SECTION_SIZE, SECTION_SIZE, WB));
        assert_eq!(vec![region(2 * SECTION_SIZE, SECTION_SIZE, WB)], mmu.regions());
        assert!(matches!(mmu.store().first_level(2).entry(), FirstLevelEntry::Section(_)));
    }

    #[test]
    fn test_partial_section_is_split_into_pages() {
        let mmu = mmu();
        mmu.store().map_sections(0, 2, WB);

        assert_eq!(Ok(()), mmu.set_memory_attributes(0x4000, 2 * PAGE_SIZE, UC_XP));
        assert_eq!(
            vec![region(0, 0x4000, WB), region(0x4000, 0x2000, UC_XP), region(0x6000, 2 * SECTION_SIZE - 0x6000, WB)],
            mmu.regions()
        );
        assert_eq!(1, mmu.store().page_table_count());
        assert!(matches!(mmu.store().first_level(0).entry(), FirstLevelEntry::PageTable(_)));
    }

    #[test]
    fn test_split_preserves_shareability_and_global_bits() {
        let mmu = mmu();
        let attributes = memory_attributes_to_section(WB);
        mmu.store().map_sections_raw(
            0,
            1,
            SectionDescriptor::from_raw(attributes.raw() | SECTION_S_MASK | SECTION_NG_MASK),
        );

        assert_eq!(Ok(()), mmu.set_memory_attributes(0, PAGE_SIZE, UC));
        let FirstLevelEntry::PageTable(table) = mmu.store().first_level(0).entry() else {
            panic!("section was not split");
        };
        for page in [0, 1, 255] {
            let raw = mmu.store().second_level(table, page).raw();
            assert_eq!(PAGE_S_MASK | PAGE_NG_MASK, raw & (PAGE_S_MASK | PAGE_NG_MASK), "page {page}");
            assert_eq!((page as u32) << PAGE_BASE_SHIFT, raw & PAGE_BASE_ADDRESS_MASK);
        }
    }

    #[test]
    fn test_rewrites_keep_the_output_address() {
        let mmu = mmu();
        let wb = memory_attributes_to_section(WB);
        mmu.store().set_first_level(0, SectionDescriptor::new(0x4000_0000, wb).raw());
        mmu.store().set_first_level(1, SectionDescriptor::new(0x5000_0000, wb).raw());

        assert_eq!(Ok(()), mmu.set_memory_attributes(0, SECTION_SIZE, UC));
        let FirstLevelEntry::Section(section) = mmu.store().first_level(0).entry() else {
            panic!("section 0 is no longer a section");
        };
        assert_eq!(0x4000_0000, section.base_address());
        assert_eq!(Ok(UC), to_memory_attributes(section));

        assert_eq!(Ok(()), mmu.set_memory_attributes(SECTION_SIZE, PAGE_SIZE, UC));
        assert_eq!(Ok(()), mmu.set_memory_attributes(SECTION_SIZE + 2 * PAGE_SIZE, PAGE_SIZE, UC_XP));
        let FirstLevelEntry::PageTable(table) = mmu.store().first_level(1).entry() else {
            panic!("section 1 was not split");
        };
        for page in [0, 1, 2, 255] {
            let SecondLevelEntry::Page(descriptor) = mmu.store().second_level(table, page).entry() else {
                panic!("page {page} is not mapped");
            };
            assert_eq!(0x5000_0000 + ((page as u32) << PAGE_BASE_SHIFT), descriptor.base_address(), "page {page}");
        }
    }

    #[test]
    fn test_split_of_unmapped_section_maps_only_the_range() {
        let mmu = mmu();
        assert_eq!(Ok(()), mmu.set_memory_attributes(SECTION_SIZE + PAGE_SIZE, PAGE_SIZE, WB));
        assert_eq!(vec![region(SECTION_SIZE + PAGE_SIZE, PAGE_SIZE, WB)], mmu.regions());
    }

    #[test]
    fn test_range_spanning_sections_and_pages() {
        let mmu = mmu();
        mmu.store().map_sections(0, 3, WB);

        assert_eq!(Ok(()), mmu.set_memory_attributes(SECTION_SIZE - PAGE_SIZE, SECTION_SIZE + 2 * PAGE_SIZE, UC));
        assert_eq!(
            vec![
                region(0, SECTION_SIZE - PAGE_SIZE, WB),
                region(SECTION_SIZE - PAGE_SIZE, SECTION_SIZE + 2 * PAGE_SIZE, UC),
                region(2 * SECTION_SIZE + PAGE_SIZE, SECTION_SIZE - PAGE_SIZE, WB),
            ],
            mmu.regions()
        );
        assert_eq!(2, mmu.store().page_table_count());
        assert!(matches!(mmu.store().first_level(1).entry(), FirstLevelEntry::Section(_)));
    }

    #[test]
    fn test_existing_page_table_is_updated() {
        let mmu = mmu();
        let table = mmu.store().map_page_table(0, |_| Some(WB));

        assert_eq!(Ok(()), mmu.set_memory_attributes(0, SECTION_SIZE, UC));
        assert_eq!(vec![region(0, SECTION_SIZE, UC)], mmu.regions());
        assert_eq!(FirstLevelEntry::PageTable(table), mmu.store().first_level(0).entry());
    }

    #[test]
    fn test_split_allocation_failure() {
        let mmu = mmu();
        mmu.store().map_sections(0, 1, WB);
        mmu.store().fail_allocations();

        assert_eq!(Err(MmuError::OutOfResources), mmu.set_memory_attributes(0, PAGE_SIZE, UC));
        assert_eq!(vec![region(0, SECTION_SIZE, WB)], mmu.regions());
    }

    #[test]
    fn test_supersection_cannot_be_updated() {
        let mmu = mmu();
        mmu.store().set_first_level(0, (1 << 18) | 2);
        assert_eq!(Err(MmuError::Unsupported), mmu.set_memory_attributes(0, SECTION_SIZE, WB));
    }

    #[test]
    fn test_large_page_cannot_be_updated() {
        let mmu = mmu();
        let table = mmu.store().map_page_table(0, |_| Some(WB));
        mmu.store().write_second_level(table, 0, SecondLevelDescriptor::from_raw(1));
        assert_eq!(Err(MmuError::Unsupported), mmu.get_memory_region(0));
        assert_eq!(Err(MmuError::Unsupported), mmu.set_memory_attributes(0, SECTION_SIZE, UC));
    }

    #[test]
    fn test_sync_reports_every_region() {
        let mmu = mmu();
        mmu.store().map_sections(0, 10, WB);
        mmu.store().map_sections(10, 10, UC | MemoryAttributes::ReadOnly);

        let mut gcd = MockGcd::new();
        gcd.expect_get_memory_space_map().times(1).returning(|| Ok(whole_address_space(u64::MAX)));
        gcd.expect_set_memory_space_attributes()
            .with(
                mockall::predicate::eq(0),
                mockall::predicate::eq(10 * SECTION_SIZE),
                mockall::predicate::eq(efi::MEMORY_WB),
            )
            .times(1)
            .returning(|_, _, _| Ok(()));
        gcd.expect_set_memory_space_attributes()
            .with(
                mockall::predicate::eq(10 * SECTION_SIZE),
                mockall::predicate::eq(10 * SECTION_SIZE),
                mockall::predicate::eq(efi::MEMORY_UC | efi::MEMORY_RO),
            )
            .times(1)
            .returning(|_, _, _| Ok(()));

        assert_eq!(Ok(()), mmu.sync_cache_config(&gcd));
    }

    #[test]
    fn test_sync_aborts_without_a_memory_space_map() {
        let mmu = mmu();
        mmu.store().map_sections(0, 10, WB);

        let mut gcd = MockGcd::new();
        gcd.expect_get_memory_space_map().times(1).returning(|| Err(efi::Status::OUT_OF_RESOURCES));
        gcd.expect_set_memory_space_attributes().never();

        assert_eq!(Err(MmuError::Gcd(efi::Status::OUT_OF_RESOURCES)), mmu.sync_cache_config(&gcd));
    }

    #[test]
    fn test_sync_continues_past_rejected_regions() {
        let mmu = mmu();
        mmu.store().map_sections(0, 1, WB);
        mmu.store().map_sections(1, 1, UC);

        let mut gcd = MockGcd::new();
        gcd.expect_get_memory_space_map().times(1).returning(|| Ok(whole_address_space(u64::MAX)));
        gcd.expect_set_memory_space_attributes().times(2).returning(|base, _, _| {
            if base == 0 {
                Err(efi::Status::ACCESS_DENIED)
            } else {
                Ok(())
            }
        });

        assert_eq!(Ok(()), mmu.sync_cache_config(&gcd));
    }

    #[test]
    fn test_sync_is_idempotent() {
        let mmu = mmu();
        mmu.store().map_sections(0, 16, WB_XP);
        mmu.store().map_page_table(16, |page| if page < 64 { Some(UC_XP) } else { Some(WB) });
        mmu.store().map_sections(17, 8, MemoryAttributes::WriteCombining);

        let gcd = ProgrammingGcd::new(&mmu, u64::MAX);
        assert_eq!(Ok(()), mmu.sync_cache_config(&gcd));
        let first = gcd.take_calls();
        let regions = mmu.regions();

        assert_eq!(Ok(()), mmu.sync_cache_config(&gcd));
        assert_eq!(first, gcd.take_calls());
        assert_eq!(regions, mmu.regions());
        assert_eq!(0, mmu.store().writes());
        assert_eq!(4, first.len());
    }

    #[test]
    fn test_reentrant_sync_converges() {
        let mmu = mmu();
        mmu.store().map_sections(0, 4, WB_XP);
        mmu.store().map_sections(4, 4, UC);

        // The GCD cannot track execute protection, so pushing WB|XP to it reprograms the MMU to plain WB.
        let gcd = ProgrammingGcd::new(&mmu, efi::MEMORY_UC | efi::MEMORY_WB);
        assert_eq!(Ok(()), mmu.sync_cache_config(&gcd));
        assert_eq!(
            vec![region(0, 4 * SECTION_SIZE, WB), region(4 * SECTION_SIZE, 4 * SECTION_SIZE, UC)],
            mmu.regions()
        );
        let writes = mmu.store().writes();
        assert!(writes > 0);

        gcd.take_calls();
        assert_eq!(Ok(()), mmu.sync_cache_config(&gcd));
        assert_eq!(
            vec![(0, 4 * SECTION_SIZE, efi::MEMORY_WB), (4 * SECTION_SIZE, 4 * SECTION_SIZE, efi::MEMORY_UC)],
            gcd.take_calls()
        );
        assert_eq!(writes, mmu.store().writes());
    }

    #[test]
    #[should_panic(expected = "re-entered")]
    fn test_runaway_recursion_asserts() {
        let mmu = mmu();
        mmu.store().map_sections(0, 1, WB);
        let gcd = RecursingGcd { mmu: &mmu };
        let _ = mmu.sync_cache_config(&gcd);
    }

    #[test]
    fn test_depth_is_released_after_each_call() {
        let mmu = ArmMmu::new(InMemoryTables::new(), MmuConfig { max_reentrancy_depth: 1 });
        for _ in 0..3 {
            assert_eq!(Ok(()), mmu.set_memory_attributes(0, PAGE_SIZE, WB));
        }
        assert_eq!(0, mmu.depth.load(Ordering::SeqCst));
    }
}
