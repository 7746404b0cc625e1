//! ARM MMU Configuration
//!
//! Platform-tunable limits for the MMU driver.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

/// Configuration for [`ArmMmu`](crate::ArmMmu).
#[derive(Debug, Clone)]
pub struct MmuConfig {
    /// How deep the GCD may nest calls back into the MMU driver before the driver asserts.
    ///
    /// A synchronization calls the GCD, which calls the attribute setter, which may call the GCD again. One level per
    /// translation table level plus the synchronization itself covers every legitimate chain.
    pub max_reentrancy_depth: usize,
}

impl Default for MmuConfig {
    fn default() -> Self {
        MmuConfig { max_reentrancy_depth: 4 }
    }
}
