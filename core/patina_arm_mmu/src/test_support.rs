//! ARM MMU Test Support
//!
//! An in-memory translation table store used by the walker and MMU unit tests.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use crate::{
    attributes::{memory_attributes_to_section, MemoryAttributes},
    descriptor::{
        FirstLevelDescriptor, LeafDescriptor, PageDescriptor, SecondLevelDescriptor, SectionDescriptor,
        SECTION_BASE_SHIFT, TRANSLATION_TABLE_PAGE_COUNT, TRANSLATION_TABLE_PAGE_SIZE,
        TRANSLATION_TABLE_SECTION_COUNT,
    },
    error::{MmuError, Result},
    table::TranslationTableStore,
};

// Second-level tables handed out by the in-memory store live at fake physical addresses starting here.
const FIRST_TABLE_ADDRESS: u32 = 0xC000_0000;

/// A [`TranslationTableStore`] backed by host memory. Second-level tables are keyed by their fake physical address.
pub(crate) struct InMemoryTables {
    first_level: RefCell<Vec<u32>>,
    second_level: RefCell<BTreeMap<u32, Vec<u32>>>,
    next_table: Cell<u32>,
    fail_allocation: Cell<bool>,
    writes: Cell<usize>,
    tlb_invalidations: Cell<usize>,
}

impl InMemoryTables {
    /// A table where every section faults.
    pub(crate) fn new() -> Self {
        Self {
            first_level: RefCell::new(vec![0; TRANSLATION_TABLE_SECTION_COUNT]),
            second_level: RefCell::new(BTreeMap::new()),
            next_table: Cell::new(FIRST_TABLE_ADDRESS),
            fail_allocation: Cell::new(false),
            writes: Cell::new(0),
            tlb_invalidations: Cell::new(0),
        }
    }

    /// Identity maps sections `first..first + count` with `attributes`.
    pub(crate) fn map_sections(&self, first: usize, count: usize, attributes: MemoryAttributes) {
        self.map_sections_raw(first, count, memory_attributes_to_section(attributes));
    }

    /// Identity maps sections `first..first + count` with the attribute fields of `descriptor`.
    pub(crate) fn map_sections_raw(&self, first: usize, count: usize, descriptor: SectionDescriptor) {
        let mut first_level = self.first_level.borrow_mut();
        for index in first..first + count {
            let base = (index as u32) << SECTION_BASE_SHIFT;
            first_level[index] = SectionDescriptor::new(base, descriptor).raw();
        }
    }

    /// Replaces section `index` with a page table. `page` returns the attributes of each page, `None` for a fault.
    pub(crate) fn map_page_table(&self, index: usize, page: impl Fn(usize) -> Option<MemoryAttributes>) -> u32 {
        self.map_page_table_raw(index, |page_index| {
            page(page_index).map(|attributes| memory_attributes_to_section(attributes).to_page_attributes())
        })
    }

    /// Replaces section `index` with a page table built from raw page attribute fields.
    pub(crate) fn map_page_table_raw(&self, index: usize, page: impl Fn(usize) -> Option<PageDescriptor>) -> u32 {
        let table = self.next_address();
        let section_base = (index as u32) << SECTION_BASE_SHIFT;
        let entries = (0..TRANSLATION_TABLE_PAGE_COUNT)
            .map(|page_index| match page(page_index) {
                Some(attributes) => PageDescriptor::new(section_base + ((page_index as u32) << 12), attributes).raw(),
                None => 0,
            })
            .collect();
        self.second_level.borrow_mut().insert(table, entries);
        self.first_level.borrow_mut()[index] = FirstLevelDescriptor::page_table(table).raw();
        table
    }

    /// Writes a raw first-level entry.
    pub(crate) fn set_first_level(&self, index: usize, raw: u32) {
        self.first_level.borrow_mut()[index] = raw;
    }

    pub(crate) fn first_level(&self, index: usize) -> FirstLevelDescriptor {
        FirstLevelDescriptor::from_raw(self.first_level.borrow()[index])
    }

    pub(crate) fn second_level(&self, table: u32, index: usize) -> SecondLevelDescriptor {
        SecondLevelDescriptor::from_raw(self.second_level.borrow()[&table][index])
    }

    /// Number of page tables allocated or mapped so far.
    pub(crate) fn page_table_count(&self) -> usize {
        self.second_level.borrow().len()
    }

    /// Makes every later allocation fail.
    pub(crate) fn fail_allocations(&self) {
        self.fail_allocation.set(true);
    }

    /// Number of entry writes made through the store interface.
    pub(crate) fn writes(&self) -> usize {
        self.writes.get()
    }

    pub(crate) fn tlb_invalidations(&self) -> usize {
        self.tlb_invalidations.get()
    }

    fn next_address(&self) -> u32 {
        let table = self.next_table.get();
        self.next_table.set(table + TRANSLATION_TABLE_PAGE_SIZE as u32);
        table
    }
}

impl TranslationTableStore for InMemoryTables {
    fn read_first_level(&self, index: usize) -> FirstLevelDescriptor {
        self.first_level(index)
    }

    fn write_first_level(&self, index: usize, descriptor: FirstLevelDescriptor) {
        self.writes.set(self.writes.get() + 1);
        self.first_level.borrow_mut()[index] = descriptor.raw();
    }

    fn read_second_level(&self, table: u32, index: usize) -> SecondLevelDescriptor {
        self.second_level(table, index)
    }

    fn write_second_level(&self, table: u32, index: usize, descriptor: SecondLevelDescriptor) {
        self.writes.set(self.writes.get() + 1);
        if let Some(entries) = self.second_level.borrow_mut().get_mut(&table) {
            entries[index] = descriptor.raw();
        }
    }

    fn allocate_second_level(&self) -> Result<u32> {
        if self.fail_allocation.get() {
            return Err(MmuError::OutOfResources);
        }
        let table = self.next_address();
        self.second_level.borrow_mut().insert(table, vec![0; TRANSLATION_TABLE_PAGE_COUNT]);
        Ok(table)
    }

    fn invalidate_tlb(&self) {
        self.tlb_invalidations.set(self.tlb_invalidations.get() + 1);
    }
}
