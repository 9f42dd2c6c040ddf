// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use static_assertions::const_assert;

use crate::arch::Pins;
use crate::kconfig::NUM_PINS;
use crate::{Error, Result};

const_assert!(NUM_PINS as u32 <= u64::BITS);

/// The outcome of a bring-up routine for the pin it borrowed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PinReservation {
    /// The pin stays with its device for the rest of the runtime and is never reset.
    Claimed(u8),
    /// The device was not usable, the pin goes back to general use.
    Released(u8),
}

impl PinReservation {
    pub const fn pin(self) -> u8 {
        match self {
            PinReservation::Claimed(pin) | PinReservation::Released(pin) => pin,
        }
    }
}

/// Pins that survive [`PinClaims::reset_unclaimed`].
#[derive(Debug, Default, Clone)]
pub struct PinClaims {
    never_reset: u64,
}

impl PinClaims {
    pub const fn new() -> Self {
        Self { never_reset: 0 }
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidPin`] for pins beyond [`NUM_PINS`].
    pub fn never_reset(&mut self, pin: u8) -> Result<()> {
        self.never_reset |= mask(pin)?;
        Ok(())
    }

    pub fn is_claimed(&self, pin: u8) -> bool {
        mask(pin).is_ok_and(|mask| self.never_reset & mask != 0)
    }

    /// Records a bring-up outcome. Released pins are reset to their default function right
    /// away.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPin`] for pins beyond [`NUM_PINS`].
    pub fn apply(&mut self, reservation: PinReservation, pins: &impl Pins) -> Result<()> {
        match reservation {
            PinReservation::Claimed(pin) => self.never_reset(pin),
            PinReservation::Released(pin) => {
                self.never_reset &= !mask(pin)?;
                pins.reset_pin(pin);
                Ok(())
            }
        }
    }

    /// Resets every pin that is not permanently claimed.
    pub fn reset_unclaimed(&self, pins: &impl Pins) {
        for pin in (0..NUM_PINS).filter(|pin| !self.is_claimed(*pin)) {
            pins.reset_pin(pin);
        }
    }
}

fn mask(pin: u8) -> Result<u64> {
    if pin < NUM_PINS {
        Ok(1 << pin)
    } else {
        Err(Error::InvalidPin(pin))
    }
}
