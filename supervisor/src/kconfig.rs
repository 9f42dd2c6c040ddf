// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/// The log level for the port layer
pub const LOG_LEVEL: log::Level = log::Level::Debug;

/// Size of the interpreter's main stack in bytes
pub const DEFAULT_STACK_SIZE: usize = 24 * 1024;
/// Size of the stack reserved for exception handling in bytes
pub const EXCEPTION_STACK_SIZE: usize = 1024;

/// Number of ticks per second
pub const TICKS_PER_SECOND: u64 = 1024;
/// Length of one tick in microseconds, an approximation of 1/1024 s
pub const TICK_PERIOD_US: u64 = 977;
/// Microseconds per sub-tick, dividing one tick period into 32 steps
pub const SUBTICK_US: u64 = 31;

/// Number of user-visible GPIO pins (RP2350B)
pub const NUM_PINS: u8 = 48;
/// Capacity of the background-callback queue
pub const BACKGROUND_QUEUE_CAPACITY: usize = 16;
/// Maximum number of peripherals in the reset registry
pub const MAX_PERIPHERALS: usize = 16;

/// End of on-die SRAM, used as the stack pointer for watchdog reboots
pub const SRAM_END: usize = 0x2008_2000;
/// Cached window of the second XIP chip select
pub const PSRAM_BASE: usize = 0x1100_0000;
/// Offset from a cached XIP address to its uncached, non-allocating alias
pub const XIP_NOCACHE_OFFSET: usize = 0x0400_0000;

/// Clock divider for direct-mode PSRAM transactions during bring-up
pub const PSRAM_DIRECT_CLKDIV: u32 = 30;
/// Watchdog tick generator divider (12 MHz reference / 12 = 1 µs ticks)
pub const WATCHDOG_TICK_CYCLES: u32 = 12;
