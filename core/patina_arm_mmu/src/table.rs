//! Translation Table Storage
//!
//! Access to the live first-level and second-level translation tables. The walker and the attribute setter never
//! dereference table memory directly; every read and write goes through a [`TranslationTableStore`], one 32-bit
//! entry at a time.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use crate::{
    descriptor::{
        FirstLevelDescriptor, SecondLevelDescriptor, TRANSLATION_TABLE_PAGE_COUNT, TRANSLATION_TABLE_PAGE_SIZE,
        TRANSLATION_TABLE_SECTION_COUNT,
    },
    error::{MmuError, Result},
};

/// Entry-granular access to a two-level short-descriptor translation table.
///
/// Methods take `&self`. The GCD calls back into the attribute setter while a synchronization walk is reading the
/// same tables, so implementations provide their own interior mutability and must not hold a lock across calls.
pub trait TranslationTableStore {
    /// Reads entry `index` of the first-level table.
    fn read_first_level(&self, index: usize) -> FirstLevelDescriptor;

    /// Writes entry `index` of the first-level table.
    fn write_first_level(&self, index: usize, descriptor: FirstLevelDescriptor);

    /// Reads entry `index` of the second-level table at physical address `table`.
    fn read_second_level(&self, table: u32, index: usize) -> SecondLevelDescriptor;

    /// Writes entry `index` of the second-level table at physical address `table`.
    fn write_second_level(&self, table: u32, index: usize, descriptor: SecondLevelDescriptor);

    /// Allocates a fault-filled second-level table and returns its physical address.
    fn allocate_second_level(&self) -> Result<u32>;

    /// Invalidates the TLB after table updates.
    fn invalidate_tlb(&self) {}
}

/// Provides memory for second-level tables.
pub trait PageTableAllocator {
    /// Returns the physical address of [`TRANSLATION_TABLE_PAGE_SIZE`] bytes aligned to the same size, below 4GB.
    fn allocate_page_table(&mut self) -> Result<u32>;
}

/// A [`TranslationTableStore`] over identity-mapped physical memory.
pub struct RawTranslationTable<A: PageTableAllocator> {
    first_level: *mut u32,
    allocator: spin::Mutex<A>,
}

impl<A: PageTableAllocator> RawTranslationTable<A> {
    /// Creates a store over the first-level table at `first_level`.
    ///
    /// # Safety
    ///
    /// `first_level` must point to a 16KB first-level table of [`TRANSLATION_TABLE_SECTION_COUNT`] entries that stays
    /// valid for the lifetime of the store. Every second-level table referenced from it must be identity mapped.
    pub unsafe fn new(first_level: *mut u32, allocator: A) -> Self {
        Self { first_level, allocator: spin::Mutex::new(allocator) }
    }

    /// Creates a store over the table currently installed in TTBR0.
    ///
    /// # Safety
    ///
    /// The MMU must be configured with an identity-mapped short-descriptor table in TTBR0.
    #[cfg(target_arch = "arm")]
    pub unsafe fn from_ttbr0(allocator: A) -> Self {
        let ttbr0: u32;
        unsafe {
            core::arch::asm!("mrc p15, 0, {}, c2, c0, 0", out(reg) ttbr0, options(nomem, nostack));
        }
        unsafe { Self::new((ttbr0 & TTBR_BASE_ADDRESS_MASK) as usize as *mut u32, allocator) }
    }

    fn second_level_ptr(table: u32, index: usize) -> *mut u32 {
        assert!(index < TRANSLATION_TABLE_PAGE_COUNT, "second-level index {index} out of range");
        (table as usize as *mut u32).wrapping_add(index)
    }
}

#[cfg(target_arch = "arm")]
const TTBR_BASE_ADDRESS_MASK: u32 = 0xFFFF_C000;

impl<A: PageTableAllocator> TranslationTableStore for RawTranslationTable<A> {
    fn read_first_level(&self, index: usize) -> FirstLevelDescriptor {
        assert!(index < TRANSLATION_TABLE_SECTION_COUNT, "first-level index {index} out of range");
        // SAFETY: the constructor guarantees a full first-level table and the index is in range.
        FirstLevelDescriptor::from_raw(unsafe { self.first_level.add(index).read_volatile() })
    }

    fn write_first_level(&self, index: usize, descriptor: FirstLevelDescriptor) {
        assert!(index < TRANSLATION_TABLE_SECTION_COUNT, "first-level index {index} out of range");
        // SAFETY: see read_first_level.
        unsafe { self.first_level.add(index).write_volatile(descriptor.raw()) }
    }

    fn read_second_level(&self, table: u32, index: usize) -> SecondLevelDescriptor {
        // SAFETY: `table` comes from a page table descriptor of the identity-mapped table.
        SecondLevelDescriptor::from_raw(unsafe { Self::second_level_ptr(table, index).read_volatile() })
    }

    fn write_second_level(&self, table: u32, index: usize, descriptor: SecondLevelDescriptor) {
        // SAFETY: see read_second_level.
        unsafe { Self::second_level_ptr(table, index).write_volatile(descriptor.raw()) }
    }

    fn allocate_second_level(&self) -> Result<u32> {
        let table = self.allocator.lock().allocate_page_table()?;
        if table as usize % TRANSLATION_TABLE_PAGE_SIZE != 0 {
            log::error!("Page table allocation at {table:#x} is not {TRANSLATION_TABLE_PAGE_SIZE:#x} aligned.");
            return Err(MmuError::OutOfResources);
        }
        for index in 0..TRANSLATION_TABLE_PAGE_COUNT {
            self.write_second_level(table, index, SecondLevelDescriptor::FAULT);
        }
        Ok(table)
    }

    fn invalidate_tlb(&self) {
        cfg_if::cfg_if! {
            if #[cfg(all(not(test), target_arch = "arm"))] {
                // SAFETY: TLBIALL followed by barriers has no memory side effects beyond the TLB.
                unsafe {
                    core::arch::asm!(
                        "mcr p15, 0, {zero}, c8, c7, 0",
                        "dsb",
                        "isb",
                        zero = in(reg) 0u32,
                        options(nostack, preserves_flags),
                    );
                }
            } else {
                core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
            }
        }
    }
}
