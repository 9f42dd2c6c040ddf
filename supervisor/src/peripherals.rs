// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Registry of peripherals that are returned to their power-on state before every runtime
//! (re)start.

use core::fmt;

use arrayvec::ArrayVec;

use crate::arch::Pins;
use crate::kconfig::MAX_PERIPHERALS;
use crate::pins::PinClaims;
use crate::{Error, Result};

/// Peripheral classes, in the order they are reset.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeripheralKind {
    Spi,
    Uart,
    Counter,
    StateMachine,
    Rtc,
    AudioDma,
    SecureTransport,
    Watchdog,
    Wireless,
}

pub trait Peripheral: Sync {
    fn kind(&self) -> PeripheralKind;
    fn reset_to_default(&self);
}

#[derive(Default)]
pub struct Peripherals {
    entries: ArrayVec<&'static dyn Peripheral, MAX_PERIPHERALS>,
}

impl fmt::Debug for Peripherals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|p| p.kind()))
            .finish()
    }
}

impl Peripherals {
    pub const fn new() -> Self {
        Self {
            entries: ArrayVec::new_const(),
        }
    }

    /// Adds `peripheral`, keeping the registry in reset order. Peripherals of the same kind
    /// reset in registration order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooManyPeripherals`] when the registry is full.
    pub fn register(&mut self, peripheral: &'static dyn Peripheral) -> Result<()> {
        let at = self
            .entries
            .partition_point(|existing| existing.kind() <= peripheral.kind());
        self.entries
            .try_insert(at, peripheral)
            .map_err(|_| Error::TooManyPeripherals)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resets every registered peripheral, then every pin that is not permanently claimed.
    pub fn reset_all_to_default(&self, claims: &PinClaims, pins: &impl Pins) {
        for peripheral in &self.entries {
            log::trace!("resetting {:?}", peripheral.kind());
            peripheral.reset_to_default();
        }

        claims.reset_unclaimed(pins);
    }
}
