// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ops::Range;
use core::ptr::NonNull;

use crate::arch::Arch;
use crate::background::BackgroundQueue;
use crate::heap::{self, Heap};
use crate::kconfig::{LOG_LEVEL, NUM_PINS};
use crate::peripherals::Peripherals;
use crate::pins::PinClaims;
use crate::psram::{self, BringUp};
use crate::relocate::RelocationPlan;
use crate::safe_mode::SafeMode;
use crate::tick::{RawTicks, TickEngine, TickHook};
use crate::{Error, Result, SafeModeReason, ensure, idle, logger};

/// Where the external PSRAM is wired up.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PsramConfig {
    /// GPIO routed to the second XIP chip select.
    pub chip_select: u8,
    /// Start of the cached memory-mapped window, the external heap pool starts here.
    pub window_base: usize,
}

/// GPIOs wired to an on-board CYW43 radio. They belong to the radio driver and survive every
/// peripheral reset.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RadioPins {
    pub reg_on: u8,
    pub data: u8,
    pub chip_select: u8,
    pub clock: u8,
}

impl RadioPins {
    /// The Pico 2 W wiring.
    pub const PICO_2_W: Self = Self {
        reg_on: 23,
        data: 24,
        chip_select: 25,
        clock: 29,
    };

    pub const fn pins(self) -> [u8; 4] {
        [self.reg_on, self.data, self.chip_select, self.clock]
    }
}

/// Board description consumed by [`Port::boot`].
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// Images to move into tightly-coupled memory, if the board has any.
    pub relocation: Option<RelocationPlan>,
    /// The linker's dynamic memory region, the on-die heap and the stacks live here.
    pub dynamic_memory: Range<usize>,
    pub psram: Option<PsramConfig>,
    pub radio: Option<RadioPins>,
    /// Holding BOOTSEL during boot requests safe mode.
    pub sense_boot_button: bool,
    /// Samples any other board-specific safe-mode request (a user button, a double reset).
    pub requests_safe_mode: fn() -> bool,
}

impl BootConfig {
    pub const fn new(dynamic_memory: Range<usize>) -> Self {
        Self {
            relocation: None,
            dynamic_memory,
            psram: None,
            radio: None,
            sense_boot_button: false,
            requests_safe_mode: never,
        }
    }

    #[must_use]
    pub const fn with_relocation(mut self, plan: RelocationPlan) -> Self {
        self.relocation = Some(plan);
        self
    }

    #[must_use]
    pub const fn with_psram(mut self, psram: PsramConfig) -> Self {
        self.psram = Some(psram);
        self
    }

    #[must_use]
    pub const fn with_radio(mut self, radio: RadioPins) -> Self {
        self.radio = Some(radio);
        self
    }

    #[must_use]
    pub const fn with_boot_button(mut self) -> Self {
        self.sense_boot_button = true;
        self
    }

    #[must_use]
    pub const fn with_safe_mode_request(mut self, requests_safe_mode: fn() -> bool) -> Self {
        self.requests_safe_mode = requests_safe_mode;
        self
    }

    /// # Errors
    ///
    /// Returns an error if the relocation plan is malformed, the dynamic memory cannot hold
    /// the stacks or a configured pin does not exist.
    pub fn validate(&self) -> Result<()> {
        if let Some(plan) = &self.relocation {
            plan.validate()?;
        }
        heap::on_die_region(self.dynamic_memory.clone())?;
        if let Some(psram) = &self.psram {
            ensure!(
                psram.chip_select < NUM_PINS,
                Error::InvalidPin(psram.chip_select)
            );
        }
        if let Some(radio) = &self.radio
            && let Some(pin) = radio.pins().into_iter().find(|pin| *pin >= NUM_PINS)
        {
            return Err(Error::InvalidPin(pin));
        }
        Ok(())
    }
}

fn never() -> bool {
    false
}

/// Pending work reported by the host-communication layer.
pub trait Transport {
    fn has_pending_work(&self) -> bool;

    /// Services links that need polling, such as an on-board radio. Called from
    /// [`Port::yield_now`].
    fn poll(&self) {}
}

impl<F> Transport for F
where
    F: Fn() -> bool,
{
    fn has_pending_work(&self) -> bool {
        self()
    }
}

/// The booted port layer.
pub struct Port<A, H, T> {
    arch: A,
    background: BackgroundQueue,
    claims: PinClaims,
    peripherals: Peripherals,
    tick: TickEngine<A>,
    heap: Heap,
    safe_mode: SafeMode<A>,
    psram: Option<BringUp>,
    hook: H,
    transport: T,
}

impl<A, H, T> fmt::Debug for Port<A, H, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("background", &self.background)
            .field("claims", &self.claims)
            .field("peripherals", &self.peripherals)
            .field("heap", &self.heap)
            .field("safe_mode", &self.safe_mode)
            .field("psram", &self.psram)
            .finish_non_exhaustive()
    }
}

impl<A, H, T> Port<A, H, T>
where
    A: Arch,
    H: TickHook,
    T: Transport,
{
    /// Brings the chip up and decides how the runtime starts.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` violates its contract, see [`BootConfig::validate`].
    /// Hardware that fails to come up (a missing PSRAM) is not an error.
    ///
    /// # Safety
    ///
    /// Must be called once per reset, before anything touches relocated memory. The relocation
    /// plan, the dynamic memory region and the PSRAM window must describe real, otherwise
    /// unused memory.
    pub unsafe fn boot(
        arch: A,
        config: BootConfig,
        peripherals: Peripherals,
        hook: H,
        transport: T,
    ) -> Result<(Self, SafeModeReason)> {
        logger::init(LOG_LEVEL.to_level_filter());
        config.validate()?;

        if let Some(plan) = &config.relocation {
            // Safety: ensured by caller, the plan was validated above
            unsafe { plan.relocate() };
        }

        let background = BackgroundQueue::new();

        let mut claims = PinClaims::new();
        if let Some(radio) = config.radio {
            for pin in radio.pins() {
                claims.never_reset(pin)?;
            }
        }
        peripherals.reset_all_to_default(&claims, &arch);

        let tick = TickEngine::claim(arch.clone());

        let psram = match config.psram {
            Some(psram) => {
                let report = psram::bring_up(&arch, psram.chip_select);
                claims.apply(report.reservation, &arch)?;
                Some((psram, report))
            }
            None => None,
        };

        let on_die = heap::on_die_region(config.dynamic_memory)?;
        let external = psram
            .as_ref()
            .filter(|(_, report)| report.is_ready())
            .map(|(psram, report)| psram.window_base..psram.window_base + report.capacity);
        // Safety: ensured by caller
        let heap = unsafe { Heap::new(on_die, external)? };

        let safe_mode = SafeMode::new(arch.clone());
        // the second core is not running yet, so the flash may go away while BOOTSEL is sensed
        let requested = (config.sense_boot_button && arch.boot_button_pressed())
            || (config.requests_safe_mode)();
        let reason = safe_mode.decide_boot_reason(requested);
        log::info!("boot complete, safe mode reason {reason:?}");

        let port = Self {
            arch,
            background,
            claims,
            peripherals,
            tick,
            heap,
            safe_mode,
            psram: psram.map(|(_, report)| report),
            hook,
            transport,
        };

        Ok((port, reason))
    }

    pub fn background(&self) -> &BackgroundQueue {
        &self.background
    }

    pub fn tick(&self) -> &TickEngine<A> {
        &self.tick
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn safe_mode(&self) -> &SafeMode<A> {
        &self.safe_mode
    }

    pub fn pin_claims(&self) -> &PinClaims {
        &self.claims
    }

    /// Usable PSRAM bytes, zero when there is no working device.
    pub fn psram_capacity(&self) -> usize {
        self.psram.as_ref().map_or(0, |report| report.capacity)
    }

    pub fn allocate(&mut self, size: usize, dma_capable: bool) -> Option<NonNull<u8>> {
        self.heap.allocate(size, dma_capable)
    }

    /// # Safety
    ///
    /// See [`Heap::free`].
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        // Safety: ensured by caller
        unsafe { self.heap.free(ptr) }
    }

    /// # Safety
    ///
    /// See [`Heap::resize`].
    pub unsafe fn resize(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        dma_capable: bool,
    ) -> Option<NonNull<u8>> {
        // Safety: ensured by caller
        unsafe { self.heap.resize(ptr, size, dma_capable) }
    }

    pub fn largest_free_block(&self) -> usize {
        self.heap.largest_free_block()
    }

    pub fn enable_tick(&self) {
        self.tick.enable();
    }

    pub fn disable_tick(&self) {
        self.tick.disable();
    }

    pub fn schedule_wake_after(&self, ticks: u32) {
        self.tick.schedule_wake_after(ticks);
    }

    pub fn current_raw_ticks(&self) -> RawTicks {
        self.tick.current_raw_ticks()
    }

    /// The tick alarm interrupt handler.
    pub fn on_alarm_fire(&self) {
        self.tick.on_alarm_fire(&self.hook);
    }

    /// Sleeps until an interrupt arrives, unless background callbacks, transport work or a
    /// tick wakeup are already pending.
    pub fn idle_until_interrupt(&self) {
        idle::idle_until_interrupt(&self.arch, || {
            self.background.pending()
                || self.transport.has_pending_work()
                || self.tick.woken()
        });
    }

    /// Yield point of the runtime, gives polled transports a chance to run.
    pub fn yield_now(&self) {
        self.transport.poll();
    }

    /// Returns every peripheral and every unclaimed pin to its power-on state and drops all
    /// queued background work.
    pub fn reset_all_peripherals_to_default(&self) {
        self.background.reset();
        self.peripherals
            .reset_all_to_default(&self.claims, &self.arch);
    }

    pub fn reset_to_bootloader(&self) -> ! {
        self.safe_mode.reset_to_bootloader()
    }

    pub fn reset_cpu(&self) -> ! {
        self.safe_mode.reset_cpu()
    }

    /// The hard-fault trap.
    pub fn hard_fault(&self) -> ! {
        self.safe_mode.hard_fault()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rejects_unknown_chip_select() {
        let config = BootConfig::new(0x2000_0000..0x2008_0000).with_psram(PsramConfig {
            chip_select: NUM_PINS,
            window_base: 0x1100_0000,
        });
        assert_eq!(config.validate(), Err(Error::InvalidPin(NUM_PINS)));
    }

    #[test]
    fn validation_rejects_tiny_dynamic_memory() {
        let config = BootConfig::new(0x2000_0000..0x2000_0100);
        assert!(matches!(
            config.validate(),
            Err(Error::StackReserveTooLarge { .. })
        ));
    }

    #[test]
    fn validation_rejects_unknown_radio_pin() {
        let config = BootConfig::new(0x2000_0000..0x2008_0000).with_radio(RadioPins {
            clock: NUM_PINS + 1,
            ..RadioPins::PICO_2_W
        });
        assert_eq!(config.validate(), Err(Error::InvalidPin(NUM_PINS + 1)));
    }

    #[test]
    fn closures_are_transports() {
        let busy = || true;
        assert!(busy.has_pending_work());
        // closures have nothing to poll
        busy.poll();
    }
}
