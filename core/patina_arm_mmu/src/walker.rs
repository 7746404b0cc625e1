//! Translation Table Walker
//!
//! Partitions the 4GB address space described by a short-descriptor translation table into maximal regions of
//! uniform memory attributes. The first-level loop runs in the section encoding. When it reaches a page table the open
//! region is carried into the page encoding, the 256 pages are scanned, and the still open region is carried back, so
//! a region may span any mix of sections and page tables.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;
use core::ops::ControlFlow;

use crate::{
    attributes::{to_memory_attributes, MemoryAttributes},
    descriptor::{
        FirstLevelEntry, LeafDescriptor, PageDescriptor, SecondLevelEntry, SectionDescriptor, PAGE_BASE_SHIFT,
        PAGE_INDEX_MASK, SECTION_BASE_SHIFT, TRANSLATION_TABLE_PAGE_COUNT, TRANSLATION_TABLE_SECTION_COUNT,
    },
    table::TranslationTableStore,
};

/// A contiguous range of memory mapped with the same attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base_address: u64,
    pub length: u64,
    pub attributes: MemoryAttributes,
}

#[derive(Debug, Clone, Copy)]
struct OpenRegion<D> {
    // attribute fields of the entry that opened the region, in the current granule's encoding
    encoding: D,
    attributes: MemoryAttributes,
}

/// The region being accumulated by a walk.
///
/// Lives on the stack of a single walk. Entries are compared by their masked encoding first and by their translated
/// attributes second, so encodings that translate identically still coalesce.
#[derive(Debug)]
pub(crate) struct PendingRegion<D: LeafDescriptor> {
    base: u64,
    length: u64,
    open: Option<OpenRegion<D>>,
}

impl<D: LeafDescriptor> PendingRegion<D> {
    pub(crate) fn new() -> Self {
        Self { base: 0, length: 0, open: None }
    }

    /// Adds the granule at `base` mapped by `descriptor`, emitting the previous region if the attributes changed.
    pub(crate) fn extend<F>(&mut self, base: u64, descriptor: D, sink: &mut F) -> ControlFlow<()>
    where
        F: FnMut(MemoryRegion) -> ControlFlow<()>,
    {
        let encoding = descriptor.attributes();
        let translated = to_memory_attributes(encoding);

        if let Some(open) = &self.open {
            debug_assert_eq!(self.base + self.length, base, "walk is not contiguous");
            if open.encoding == encoding || open.attributes == translated.unwrap_or(MemoryAttributes::empty()) {
                self.length += D::GRANULE;
                return ControlFlow::Continue(());
            }
            self.close(sink)?;
        }

        let attributes = match translated {
            Ok(attributes) => attributes,
            Err(_) => {
                log::warn!(
                    "Unrecognized cache policy {:#x} at {:#x}, reporting the region without attributes.",
                    encoding.cache_policy_bits(),
                    base
                );
                MemoryAttributes::empty()
            }
        };
        self.base = base;
        self.length = D::GRANULE;
        self.open = Some(OpenRegion { encoding, attributes });
        ControlFlow::Continue(())
    }

    /// Emits the open region, if any.
    pub(crate) fn close<F>(&mut self, sink: &mut F) -> ControlFlow<()>
    where
        F: FnMut(MemoryRegion) -> ControlFlow<()>,
    {
        match self.open.take() {
            Some(open) => {
                let region = MemoryRegion { base_address: self.base, length: self.length, attributes: open.attributes };
                self.base = 0;
                self.length = 0;
                log::trace!(
                    "Closing region {:#x}-{:#x} {:?}",
                    region.base_address,
                    region.base_address + region.length,
                    region.attributes
                );
                sink(region)
            }
            None => ControlFlow::Continue(()),
        }
    }

    fn map_encoding<E: LeafDescriptor>(self, convert: impl FnOnce(D) -> E) -> PendingRegion<E> {
        PendingRegion {
            base: self.base,
            length: self.length,
            open: self.open.map(|open| OpenRegion { encoding: convert(open.encoding), attributes: open.attributes }),
        }
    }
}

impl PendingRegion<SectionDescriptor> {
    fn into_page_domain(self) -> PendingRegion<PageDescriptor> {
        self.map_encoding(SectionDescriptor::to_page_attributes)
    }
}

impl PendingRegion<PageDescriptor> {
    fn into_section_domain(self) -> PendingRegion<SectionDescriptor> {
        self.map_encoding(PageDescriptor::to_section_attributes)
    }
}

/// Walks a translation table through a [`TranslationTableStore`].
pub struct TableWalker<'a, S: TranslationTableStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: TranslationTableStore + ?Sized> TableWalker<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Walks the whole table, handing every region to `sink` in address order.
    ///
    /// Returns [`ControlFlow::Break`] if the sink stopped the walk.
    pub fn walk<F>(&self, sink: F) -> ControlFlow<()>
    where
        F: FnMut(MemoryRegion) -> ControlFlow<()>,
    {
        self.walk_from(0, sink)
    }

    /// Walks the table starting at the granule that contains `address`.
    ///
    /// The first region reported starts at that granule. Addresses beyond 4GB produce no regions.
    pub fn walk_from<F>(&self, address: u64, mut sink: F) -> ControlFlow<()>
    where
        F: FnMut(MemoryRegion) -> ControlFlow<()>,
    {
        let first = (address >> SECTION_BASE_SHIFT) as usize;
        let first_page = ((address as u32 & PAGE_INDEX_MASK) >> PAGE_BASE_SHIFT) as usize;
        let mut pending = PendingRegion::<SectionDescriptor>::new();

        for index in first..TRANSLATION_TABLE_SECTION_COUNT {
            let base = (index as u64) << SECTION_BASE_SHIFT;
            match self.store.read_first_level(index).entry() {
                FirstLevelEntry::Section(section) => pending.extend(base, section, &mut sink)?,
                FirstLevelEntry::PageTable(table) => {
                    let start = if index == first { first_page } else { 0 };
                    let mut pages = pending.into_page_domain();
                    let flow = self.scan_page_table(table, base, start, &mut pages, &mut sink);
                    pending = pages.into_section_domain();
                    flow?;
                }
                FirstLevelEntry::Fault => pending.close(&mut sink)?,
                FirstLevelEntry::Reserved => {
                    log::warn!("Reserved first-level descriptor at {:#x}, treating it as unmapped.", base);
                    pending.close(&mut sink)?;
                }
                FirstLevelEntry::Supersection => {
                    log::error!("Supersection at {:#x} is not supported, no region is reported for it.", base);
                    debug_assert!(false, "unexpected supersection at {base:#x}");
                    pending.close(&mut sink)?;
                }
            }
        }

        pending.close(&mut sink)
    }

    /// Collects every region of the table.
    pub fn regions(&self) -> Vec<MemoryRegion> {
        let mut regions = Vec::new();
        let _ = self.walk(|region| {
            regions.push(region);
            ControlFlow::Continue(())
        });
        regions
    }

    // Leaves a region that is still open at the end of the table in `pending` for the first-level loop.
    fn scan_page_table<F>(
        &self,
        table: u32,
        section_base: u64,
        start: usize,
        pending: &mut PendingRegion<PageDescriptor>,
        sink: &mut F,
    ) -> ControlFlow<()>
    where
        F: FnMut(MemoryRegion) -> ControlFlow<()>,
    {
        for index in start..TRANSLATION_TABLE_PAGE_COUNT {
            let base = section_base + ((index as u64) << PAGE_BASE_SHIFT);
            match self.store.read_second_level(table, index).entry() {
                SecondLevelEntry::Page(page) => pending.extend(base, page, sink)?,
                SecondLevelEntry::Fault => pending.close(sink)?,
                SecondLevelEntry::LargePage => {
                    log::error!("Large page at {:#x} is not supported, no region is reported for it.", base);
                    debug_assert!(false, "unexpected large page at {base:#x}");
                    pending.close(sink)?;
                }
            }
        }
        ControlFlow::Continue(())
    }
}
