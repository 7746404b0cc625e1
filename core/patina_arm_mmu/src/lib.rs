//! ARM Short-Descriptor MMU Crate
//!
//! Support for ARMv7 short-descriptor translation tables (4096 1MB sections, optionally split into 256 4KB pages) and
//! for keeping the DXE GCD memory space map consistent with them.
//!
//! - [`descriptor`]: bit-exact section and page descriptor encodings.
//! - [`attributes`]: translation between descriptor fields and UEFI memory attributes.
//! - [`walker`]: partitions the address space into maximal regions of uniform attributes.
//! - [`ArmMmu`]: region queries, the attribute setter and GCD synchronization.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]
extern crate alloc;

pub mod attributes;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod gcd;
mod mmu;
pub mod table;
pub mod walker;

#[cfg(test)]
mod test_support;

pub use attributes::MemoryAttributes;
pub use config::MmuConfig;
pub use error::{MmuError, Result};
pub use gcd::{GcdMemoryType, MemorySpaceAuthority, MemorySpaceDescriptor};
pub use mmu::ArmMmu;
pub use table::{PageTableAllocator, RawTranslationTable, TranslationTableStore};
pub use walker::{MemoryRegion, TableWalker};
