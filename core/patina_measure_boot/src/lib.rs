//! Measured Boot Sanitization Crate
//!
//! Defensive handling of the untrusted structures that get measured into a TPM during boot: GUID partition table
//! headers read from a block device and PE image load events.
//!
//! - [`sanitize`]: header validation and the overflow-checked size calculations that every buffer is sized by.
//! - [`measure`]: construction of the TCG events and hand-off to the platform [`TcgMeasurement`] service.
//! - [`gpt`] and [`event`]: the on-disk and event log layouts.
//!
//! ## Example
//!
//! ```
//! use patina_measure_boot::sanitize::pe_image_event_size;
//!
//! // 32 byte event header + 32 byte image load event + 10 byte device path.
//! assert_eq!(Ok(74), pe_image_event_size(10));
//! assert!(pe_image_event_size(u32::MAX).is_err());
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation. All rights reserved.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test), not(feature = "mockall")), no_std)]
extern crate alloc;

pub mod block_io;
pub mod error;
pub mod event;
pub mod gpt;
pub mod measure;
pub mod sanitize;

pub use block_io::{BlockIo, BlockIoMedia};
pub use error::{MeasureBootError, Result};
pub use measure::{measure_pe_image, GptMeasurement, ImageType, TcgMeasurement};
