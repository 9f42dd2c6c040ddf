// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The port layer that turns an RP2350-class chip into a stable substrate for a
//! high-level-language runtime.
//!
//! [`Port::boot`] runs once per reset: it relocates the fast-memory images, sets up the
//! background-callback queue, resets every peripheral, claims the tick alarm, brings up the
//! optional external PSRAM and builds the dual-pool [`Heap`] before deciding whether the
//! runtime starts normally or in safe mode. Afterwards the [`Port`] exposes the allocator,
//! tick, idle and reset surfaces.
//!
//! All memory-mapped I/O goes through the [`arch`] traits. The `emulate` feature provides a
//! host-side [`arch::emulate::Machine`] so the whole layer can be exercised in tests.

#![cfg_attr(not(any(test, feature = "emulate")), no_std)]

pub mod arch;
pub mod background;
mod error;
pub mod heap;
pub mod idle;
pub mod kconfig;
pub mod logger;
pub mod peripherals;
pub mod pins;
mod port;
pub mod psram;
pub mod relocate;
pub mod safe_mode;
pub mod sync;
pub mod tick;

pub use error::Error;
pub use heap::Heap;
pub use port::{BootConfig, Port, PsramConfig, RadioPins, Transport};
pub use safe_mode::SafeModeReason;

pub type Result<T> = core::result::Result<T, Error>;
