// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The boot-outcome and reset state machine.
//!
//! Every boot attempt starts out [`RuntimeState::Normal`] and ends in at most one of the
//! terminal states. A hard fault on the primary core persists its reason in a word that
//! survives the CPU reset, so the following boot can come up in safe mode instead of running
//! into the same fault again.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::arch::{Bootrom, Cpu, ExecutionContext, ScratchWord, Watchdog};
use crate::kconfig::{SRAM_END, WATCHDOG_TICK_CYCLES};

const SAFE_MODE_DATA_GUARD: u32 = 0xad00_00af;

/// Why the runtime came up in reduced-functionality mode.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SafeModeReason {
    None = 0,
    HardFault = 1,
    UserRequested = 2,
}

impl SafeModeReason {
    const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::HardFault),
            2 => Some(Self::UserRequested),
            _ => None,
        }
    }

    /// The reset-surviving encoding of this reason.
    pub const fn encode(self) -> u32 {
        SAFE_MODE_DATA_GUARD | ((self as u32) << 8)
    }

    /// Decodes a word written by [`SafeModeReason::encode`]. Anything else, including the
    /// garbage found after a power cycle, yields `None`.
    pub const fn decode(word: u32) -> Option<Self> {
        #[expect(clippy::cast_possible_truncation, reason = "masked to 8 bits")]
        let raw = ((word >> 8) & 0xff) as u8;
        match Self::from_u8(raw) {
            Some(reason) if reason.encode() == word => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RuntimeState {
    Normal,
    SafeMode(SafeModeReason),
    BootloaderReset,
    CpuReset,
}

impl RuntimeState {
    const NORMAL: u8 = 0;
    const BOOTLOADER_RESET: u8 = 1;
    const CPU_RESET: u8 = 2;
    const SAFE_MODE: u8 = 0x10;

    const fn pack(self) -> u8 {
        match self {
            RuntimeState::Normal => Self::NORMAL,
            RuntimeState::BootloaderReset => Self::BOOTLOADER_RESET,
            RuntimeState::CpuReset => Self::CPU_RESET,
            RuntimeState::SafeMode(reason) => Self::SAFE_MODE | reason as u8,
        }
    }

    const fn unpack(raw: u8) -> Self {
        match raw {
            Self::BOOTLOADER_RESET => RuntimeState::BootloaderReset,
            Self::CPU_RESET => RuntimeState::CpuReset,
            raw if raw & Self::SAFE_MODE != 0 => match SafeModeReason::from_u8(raw & 0xf) {
                Some(reason) => RuntimeState::SafeMode(reason),
                None => RuntimeState::Normal,
            },
            _ => RuntimeState::Normal,
        }
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, RuntimeState::Normal)
    }
}

/// What the fault trap must do after [`SafeMode::handle_hard_fault`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultDisposition {
    /// The watchdog is armed to reboot into safe mode, wait for it.
    ResetIntoSafeMode,
    /// The fault happened on the secondary core, park that core and leave the runtime alone.
    HaltContext,
}

pub struct SafeMode<A> {
    arch: A,
    state: AtomicU8,
}

impl<A> core::fmt::Debug for SafeMode<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SafeMode")
            .field("state", &RuntimeState::unpack(self.state.load(Ordering::Relaxed)))
            .finish_non_exhaustive()
    }
}

impl<A> SafeMode<A>
where
    A: Cpu + Watchdog + Bootrom + ScratchWord,
{
    pub const fn new(arch: A) -> Self {
        Self {
            arch,
            state: AtomicU8::new(RuntimeState::NORMAL),
        }
    }

    pub fn state(&self) -> RuntimeState {
        RuntimeState::unpack(self.state.load(Ordering::Acquire))
    }

    /// Decides how this boot attempt comes up. Reads and clears the persisted reason, which
    /// takes precedence over `user_requested`.
    pub fn decide_boot_reason(&self, user_requested: bool) -> SafeModeReason {
        let persisted = SafeModeReason::decode(self.arch.saved_word());
        self.arch.set_saved_word(0);

        let reason = match persisted {
            Some(reason) if reason != SafeModeReason::None => reason,
            _ if user_requested => SafeModeReason::UserRequested,
            _ => SafeModeReason::None,
        };

        if reason != SafeModeReason::None {
            let _ = self.state.compare_exchange(
                RuntimeState::NORMAL,
                RuntimeState::SafeMode(reason).pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }

        reason
    }

    /// Handles a fatal fault trap.
    ///
    /// On the primary core this persists [`SafeModeReason::HardFault`], enters safe mode and
    /// arms an immediate watchdog reboot. On the secondary core nothing changes. Runs in
    /// fault context, so it neither logs nor allocates.
    pub fn handle_hard_fault(&self) -> FaultDisposition {
        match self.arch.execution_context() {
            ExecutionContext::Primary => {
                self.state.store(
                    RuntimeState::SafeMode(SafeModeReason::HardFault).pack(),
                    Ordering::Release,
                );
                self.arch.set_saved_word(SafeModeReason::HardFault.encode());
                self.arm_watchdog_reboot();
                FaultDisposition::ResetIntoSafeMode
            }
            ExecutionContext::Secondary => FaultDisposition::HaltContext,
        }
    }

    /// The fault trap. Never returns.
    pub fn hard_fault(&self) -> ! {
        match self.handle_hard_fault() {
            FaultDisposition::ResetIntoSafeMode => self.wait_for_reset(),
            FaultDisposition::HaltContext => loop {
                self.arch.nop();
            },
        }
    }

    /// Arms a watchdog reboot and marks the boot attempt as ending in a CPU reset.
    pub fn request_cpu_reset(&self) {
        self.state
            .store(RuntimeState::CpuReset.pack(), Ordering::Release);
        self.arm_watchdog_reboot();
    }

    /// Resets the CPU through the watchdog and waits for it in the low-power state.
    pub fn reset_cpu(&self) -> ! {
        self.request_cpu_reset();
        self.wait_for_reset()
    }

    /// Hands control to the persistent USB bootloader. Returns only if the bootrom does.
    pub fn request_bootloader_reset(&self) {
        self.state
            .store(RuntimeState::BootloaderReset.pack(), Ordering::Release);
        self.arch.reboot_to_usb_boot();
    }

    pub fn reset_to_bootloader(&self) -> ! {
        self.request_bootloader_reset();
        self.wait_for_reset()
    }

    fn arm_watchdog_reboot(&self) {
        #[expect(clippy::cast_possible_truncation, reason = "SRAM lies in the 32-bit address space")]
        let stack_pointer = SRAM_END as u32;
        self.arch.reboot(0, stack_pointer, 0);
        self.arch.start_tick(WATCHDOG_TICK_CYCLES);
    }

    fn wait_for_reset(&self) -> ! {
        loop {
            self.arch.wait_for_interrupt();
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::arch::emulate::{Event, Machine};

    #[test]
    fn encoding_matches_guard() {
        assert_eq!(SafeModeReason::HardFault.encode(), 0xad00_01af);
        assert_eq!(SafeModeReason::UserRequested.encode(), 0xad00_02af);
        assert_eq!(SafeModeReason::decode(0), None);
        assert_eq!(SafeModeReason::decode(0xad00_07af), None);
        assert_eq!(SafeModeReason::decode(0xae00_01af), None);
    }

    #[test]
    fn decode_rejects_stray_bits_between_guards() {
        assert_eq!(SafeModeReason::decode(0xad12_01af), None);
        assert_eq!(SafeModeReason::decode(0xad00_01ae), None);
        assert_eq!(
            SafeModeReason::decode(0xad00_01af),
            Some(SafeModeReason::HardFault)
        );
    }

    #[test]
    fn fault_on_primary_enters_safe_mode_and_reboots() {
        let machine = Machine::new();
        let safe_mode = SafeMode::new(machine.clone());

        assert_eq!(
            safe_mode.handle_hard_fault(),
            FaultDisposition::ResetIntoSafeMode
        );
        assert_eq!(
            safe_mode.state(),
            RuntimeState::SafeMode(SafeModeReason::HardFault)
        );
        assert_eq!(machine.saved_word(), SafeModeReason::HardFault.encode());
        assert_eq!(
            machine.take_events(),
            [
                Event::WatchdogReboot {
                    pc: 0,
                    sp: 0x2008_2000,
                    delay_ms: 0
                },
                Event::WatchdogTick(12),
            ]
        );
    }

    #[test]
    fn fault_on_secondary_leaves_runtime_alone() {
        let machine = Machine::new().with_context(ExecutionContext::Secondary);
        let safe_mode = SafeMode::new(machine.clone());

        assert_eq!(safe_mode.handle_hard_fault(), FaultDisposition::HaltContext);
        assert_eq!(safe_mode.state(), RuntimeState::Normal);
        assert_eq!(machine.saved_word(), 0);
        assert!(machine.take_events().is_empty());
    }

    #[test]
    fn persisted_reason_survives_one_reset() {
        let machine = Machine::new();
        SafeMode::new(machine.clone()).handle_hard_fault();

        // next boot
        let safe_mode = SafeMode::new(machine.clone());
        assert_eq!(safe_mode.decide_boot_reason(false), SafeModeReason::HardFault);
        assert_eq!(
            safe_mode.state(),
            RuntimeState::SafeMode(SafeModeReason::HardFault)
        );

        // and the one after that starts normally again
        let safe_mode = SafeMode::new(machine);
        assert_eq!(safe_mode.decide_boot_reason(false), SafeModeReason::None);
        assert_eq!(safe_mode.state(), RuntimeState::Normal);
    }

    #[test]
    fn persisted_reason_beats_user_request() {
        let machine = Machine::new();
        machine.set_saved_word(SafeModeReason::HardFault.encode());

        let safe_mode = SafeMode::new(machine);
        assert_eq!(safe_mode.decide_boot_reason(true), SafeModeReason::HardFault);
    }

    #[test]
    fn user_request_enters_safe_mode() {
        let safe_mode = SafeMode::new(Machine::new());
        assert_eq!(
            safe_mode.decide_boot_reason(true),
            SafeModeReason::UserRequested
        );
        assert_eq!(
            safe_mode.state(),
            RuntimeState::SafeMode(SafeModeReason::UserRequested)
        );
    }

    #[test]
    fn cpu_reset_arms_watchdog() {
        let machine = Machine::new();
        let safe_mode = SafeMode::new(machine.clone());

        safe_mode.request_cpu_reset();

        assert_eq!(safe_mode.state(), RuntimeState::CpuReset);
        assert!(safe_mode.state().is_terminal());
        assert_eq!(
            machine.take_events(),
            [
                Event::WatchdogReboot {
                    pc: 0,
                    sp: 0x2008_2000,
                    delay_ms: 0
                },
                Event::WatchdogTick(12),
            ]
        );
        // a plain reset does not ask for safe mode
        assert_eq!(machine.saved_word(), 0);
    }

    #[test]
    fn bootloader_reset_calls_bootrom() {
        let machine = Machine::new();
        let safe_mode = SafeMode::new(machine.clone());

        safe_mode.request_bootloader_reset();

        assert_eq!(safe_mode.state(), RuntimeState::BootloaderReset);
        assert_eq!(machine.take_events(), [Event::UsbBoot]);
    }

    proptest! {
        #[test]
        fn arbitrary_words_never_yield_garbage(word in any::<u32>()) {
            let encodings = [
                SafeModeReason::None,
                SafeModeReason::HardFault,
                SafeModeReason::UserRequested,
            ]
            .map(SafeModeReason::encode);

            match SafeModeReason::decode(word) {
                Some(reason) => prop_assert_eq!(reason.encode(), word),
                None => prop_assert!(!encodings.contains(&word)),
            }
        }

        #[test]
        fn guarded_words_with_stray_bits_are_rejected(raw in 0..3u8, stray in 1..=0xffu32) {
            let reason = SafeModeReason::from_u8(raw).unwrap();
            prop_assert_eq!(SafeModeReason::decode(reason.encode()), Some(reason));
            prop_assert_eq!(SafeModeReason::decode(reason.encode() | (stray << 16)), None);
        }

        #[test]
        fn state_packing_roundtrips(raw in 0..3u8, safe in any::<bool>()) {
            let state = if safe {
                RuntimeState::SafeMode(SafeModeReason::from_u8(raw).unwrap())
            } else {
                [RuntimeState::Normal, RuntimeState::BootloaderReset, RuntimeState::CpuReset][usize::from(raw)]
            };
            prop_assert_eq!(RuntimeState::unpack(state.pack()), state);
        }
    }
}
