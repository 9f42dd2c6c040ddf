// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt::{Display, Formatter};

/// Contract violations detected while setting up the port.
///
/// Runtime failures (allocation failure, a missing PSRAM device, faults) are not errors, they
/// are reported through `Option`s, zero capacities and the [`SafeModeReason`].
///
/// [`SafeModeReason`]: crate::SafeModeReason
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// A relocation descriptor address is not word aligned.
    MisalignedDescriptor { addr: usize },
    /// Two relocation destinations (or a destination and the BSS region) overlap.
    OverlappingDescriptors,
    /// The dynamic memory region is smaller than the reserved stacks.
    StackReserveTooLarge { available: usize, reserve: usize },
    /// The external pool does not lie entirely below the on-die pool.
    OverlappingPools,
    /// A pool was rejected by the allocator.
    Pool(tlsf::Error),
    /// The background-callback queue has no free slot.
    QueueFull,
    /// The peripheral registry has no free slot.
    TooManyPeripherals,
    /// The pin number is beyond the chip's GPIO count.
    InvalidPin(u8),
}

impl From<tlsf::Error> for Error {
    fn from(err: tlsf::Error) -> Self {
        Self::Pool(err)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::MisalignedDescriptor { addr } => {
                write!(f, "Relocation descriptor address {addr:#x} is not word aligned")
            }
            Error::OverlappingDescriptors => write!(f, "Relocation destinations overlap"),
            Error::StackReserveTooLarge { available, reserve } => write!(
                f,
                "Dynamic memory of {available} bytes cannot hold the {reserve} byte stack reserve"
            ),
            Error::OverlappingPools => {
                write!(f, "The external pool must lie entirely below the on-die pool")
            }
            Error::Pool(err) => write!(f, "Failed to create heap pool: {err}"),
            Error::QueueFull => write!(f, "The background-callback queue is full"),
            Error::TooManyPeripherals => write!(f, "The peripheral registry is full"),
            Error::InvalidPin(pin) => write!(f, "GPIO {pin} does not exist"),
        }
    }
}

impl core::error::Error for Error {}

#[macro_export]
macro_rules! ensure {
    ($cond:expr, $error:expr, $msg:expr) => {
        if !$cond {
            log::error!($msg);
            return Err($error);
        }
    };
    ($cond:expr, $error:expr) => {
        if !$cond {
            return Err($error);
        }
    };
}
