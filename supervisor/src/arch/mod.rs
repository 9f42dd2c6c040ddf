// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Narrow hardware interfaces.
//!
//! Every piece of the port layer that touches memory-mapped registers does so through one of
//! the traits below, so the rest of the crate stays free of raw MMIO and can be exercised
//! against the [`emulate::Machine`] on the host.

#[cfg(feature = "emulate")]
pub mod emulate;
pub mod interrupt;
#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod rp2350;

/// Which of the two cores is executing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecutionContext {
    /// Core 0, which runs the interpreter.
    Primary,
    /// Core 1, which may run user code concurrently but never owns runtime state.
    Secondary,
}

/// How the idle routine keeps its wake check atomic with the wait instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IdleMasking {
    /// Mask all interrupts globally around the check and the wait.
    GlobalMask,
    /// Mask globally, but additionally drop the interrupt priority floor to zero so that
    /// priority-masked interrupts can still wake the core from the wait.
    PriorityFloor,
}

/// The interrupt state captured by [`Cpu::save_and_disable_interrupts`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[must_use]
pub struct InterruptState {
    pub(crate) enabled: bool,
}

impl InterruptState {
    pub const fn were_enabled(self) -> bool {
        self.enabled
    }
}

pub trait Cpu {
    fn execution_context(&self) -> ExecutionContext;
    fn idle_masking(&self) -> IdleMasking;

    fn save_and_disable_interrupts(&self) -> InterruptState;
    /// # Safety
    ///
    /// `state` must come from the matching [`Cpu::save_and_disable_interrupts`] call on
    /// this core.
    unsafe fn restore_interrupts(&self, state: InterruptState);

    fn priority_floor(&self) -> u8;
    /// # Safety
    ///
    /// Lowering the floor may immediately run pending interrupt handlers.
    unsafe fn set_priority_floor(&self, floor: u8);

    fn data_sync_barrier(&self);
    fn instruction_sync_barrier(&self);
    fn wait_for_interrupt(&self);
    fn nop(&self);
}

/// The hardware alarm driving the tick engine, compared against a monotonic microsecond
/// counter.
pub trait Alarm {
    fn claim_alarm(&self);
    fn now_us(&self) -> u64;
    /// Arms the alarm to fire once the counter reaches `target_us`.
    fn set_alarm(&self, target_us: u64);
    fn acknowledge_alarm(&self);
}

/// Registers of the QSPI memory interface used by PSRAM bring-up.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QmiReg {
    DirectCsr,
    DirectTx,
    DirectRx,
    M1Timing,
    M1Rfmt,
    M1Rcmd,
    M1Wfmt,
    M1Wcmd,
}

impl QmiReg {
    pub const fn offset(self) -> usize {
        match self {
            QmiReg::DirectCsr => 0x00,
            QmiReg::DirectTx => 0x04,
            QmiReg::DirectRx => 0x08,
            QmiReg::M1Timing => 0x20,
            QmiReg::M1Rfmt => 0x24,
            QmiReg::M1Rcmd => 0x28,
            QmiReg::M1Wfmt => 0x2c,
            QmiReg::M1Wcmd => 0x30,
        }
    }
}

pub trait Qmi {
    fn read_reg(&self, reg: QmiReg) -> u32;
    fn write_reg(&self, reg: QmiReg, value: u32);
    /// Allows writes through the second chip select's memory window.
    fn set_window_writable(&self);
    /// Writes a word through the uncached alias of the second chip select's window.
    ///
    /// # Safety
    ///
    /// The window must be configured and `offset` must lie inside the device.
    unsafe fn write_uncached(&self, offset: usize, value: u32);
    /// # Safety
    ///
    /// See [`Qmi::write_uncached`].
    unsafe fn read_uncached(&self, offset: usize) -> u32;
}

/// GPIO functions the port layer routes pins to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PinFunction {
    /// Chip select of the second XIP device.
    XipCs1,
    /// Disconnected, the power-on default.
    Null,
}

pub trait Pins {
    fn set_function(&self, pin: u8, function: PinFunction);
    /// Returns the pin to its power-on default function and pad configuration.
    fn reset_pin(&self, pin: u8);
}

pub trait Watchdog {
    /// Arms a watchdog reboot after `delay_ms`. A `pc` of zero boots normally, otherwise the
    /// bootrom jumps to `pc` with the stack pointer set to `sp`.
    fn reboot(&self, pc: u32, sp: u32, delay_ms: u32);
    fn start_tick(&self, cycles: u32);
}

pub trait Bootrom {
    /// Reboots into the USB mass-storage bootloader. Only returns if the bootrom call fails.
    fn reboot_to_usb_boot(&self);
}

/// Time given to outstanding XIP accesses to drain before and after the flash chip select is
/// taken away from the memory interface.
pub const FLASH_QUIESCE_US: u32 = 5_000;
/// Settling time of the floated flash chip select before it is sampled.
pub const BOOT_BUTTON_SETTLE_US: u32 = 100;
pub const BOOT_BUTTON_DEBOUNCE_US: u32 = 50_000;

/// The BOOTSEL button, which shares its line with the flash chip select.
pub trait BootButton {
    /// Floats the flash chip select with interrupts masked and samples the line. A pressed
    /// button pulls it low; the call then waits for the release plus
    /// [`BOOT_BUTTON_DEBOUNCE_US`] before handing the line back to the flash.
    ///
    /// Flash is unreachable for the whole call, so it must only be used before the second
    /// core is started.
    fn boot_button_pressed(&self) -> bool;
}

/// A word of RAM that survives a CPU reset but not a power cycle.
pub trait ScratchWord {
    fn saved_word(&self) -> u32;
    fn set_saved_word(&self, value: u32);
}

pub trait Arch:
    Cpu + Alarm + Qmi + Pins + Watchdog + Bootrom + BootButton + ScratchWord + Clone
{
}

impl<T> Arch for T where
    T: Cpu + Alarm + Qmi + Pins + Watchdog + Bootrom + BootButton + ScratchWord + Clone
{
}

/// The index of the core executing this code, used to tag log output.
pub fn core_id() -> u32 {
    cfg_if::cfg_if! {
        if #[cfg(all(target_arch = "arm", target_os = "none"))] {
            rp2350::core_id()
        } else {
            0
        }
    }
}
