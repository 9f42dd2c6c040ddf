// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The 1/1024 s tick engine.
//!
//! A single hardware alarm drives both the periodic tick (while [`TickMode::Enabled`]) and
//! one-shot wakeups (while [`TickMode::Disabled`]). The fire handler re-arms the alarm itself
//! as part of the `Enabled` state's transition, so the tick is a self-resubmitting timer
//! without any callback chaining.
//!
//! The tick count is derived from the monotonic microsecond counter using a fixed period of
//! [`TICK_PERIOD_US`], which slightly overestimates 1/1024 s. Whole seconds are converted
//! exactly, so the error never accumulates beyond one second's worth of rounding.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::arch::Alarm;
use crate::kconfig::{SUBTICK_US, TICK_PERIOD_US, TICKS_PER_SECOND};

const US_PER_SECOND: u64 = 1_000_000;

/// Called from the alarm interrupt on every periodic tick.
///
/// Runs in interrupt context: implementations must not block and must not touch the heap.
pub trait TickHook {
    fn on_tick(&self);
}

impl<F> TickHook for F
where
    F: Fn(),
{
    fn on_tick(&self) {
        self();
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TickMode {
    Disabled,
    Enabled,
}

/// A tick count together with its sub-tick fraction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RawTicks {
    pub ticks: u64,
    /// Position inside the current tick, in steps of [`SUBTICK_US`] microseconds.
    ///
    /// Only meaningful relative to the tick it belongs to.
    pub subticks: u8,
}

impl RawTicks {
    /// Converts microseconds since boot into ticks.
    #[must_use]
    pub const fn from_us(us: u64) -> Self {
        let seconds = us / US_PER_SECOND;
        let remainder = us % US_PER_SECOND;

        #[expect(clippy::cast_possible_truncation, reason = "at most 976 / 31")]
        let subticks = ((remainder % TICK_PERIOD_US) / SUBTICK_US) as u8;

        Self {
            ticks: TICKS_PER_SECOND * seconds + remainder / TICK_PERIOD_US,
            subticks,
        }
    }
}

/// A snapshot of the tick engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TickState {
    pub mode: TickMode,
    /// Low 32 bits of the last alarm target, in microseconds.
    pub next_alarm: u32,
    pub raw_ticks: u64,
    pub woken: bool,
}

pub struct TickEngine<A> {
    alarm: A,
    enabled: AtomicBool,
    woken: AtomicBool,
    /// The alarm compares the low 32 bits of the counter, so that is all we keep.
    next_alarm: AtomicU32,
}

impl<A: Alarm> TickEngine<A> {
    /// Claims the hardware alarm. The engine starts out [`TickMode::Disabled`].
    pub fn claim(alarm: A) -> Self {
        alarm.claim_alarm();

        Self {
            alarm,
            enabled: AtomicBool::new(false),
            woken: AtomicBool::new(false),
            next_alarm: AtomicU32::new(0),
        }
    }

    pub fn mode(&self) -> TickMode {
        if self.enabled.load(Ordering::Acquire) {
            TickMode::Enabled
        } else {
            TickMode::Disabled
        }
    }

    /// Starts the periodic tick, first fire one period from now.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
        self.arm(TICK_PERIOD_US);
    }

    /// Stops the periodic tick.
    ///
    /// An alarm that is already armed is left alone, it may carry a wakeup scheduled through
    /// [`TickEngine::schedule_wake_after`]. If it fires it only sets the wake flag.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// The alarm interrupt handler.
    pub fn on_alarm_fire<H>(&self, hook: &H)
    where
        H: TickHook + ?Sized,
    {
        self.alarm.acknowledge_alarm();

        if self.enabled.load(Ordering::Acquire) {
            hook.on_tick();
            self.arm(TICK_PERIOD_US);
        }

        self.woken.store(true, Ordering::Release);
    }

    /// Arms a one-shot wakeup `ticks` periods from now and clears the wake flag.
    ///
    /// While the periodic tick is running, the next fire already bounds any wait, so the alarm
    /// is left untouched to avoid delaying the tick.
    pub fn schedule_wake_after(&self, ticks: u32) {
        // cleared first, a short wakeup may fire before `arm` returns
        self.woken.store(false, Ordering::Release);
        if !self.enabled.load(Ordering::Acquire) {
            self.arm(u64::from(ticks) * TICK_PERIOD_US);
        }
    }

    pub fn current_raw_ticks(&self) -> RawTicks {
        RawTicks::from_us(self.alarm.now_us())
    }

    /// Whether the alarm fired since the last [`TickEngine::schedule_wake_after`].
    pub fn woken(&self) -> bool {
        self.woken.load(Ordering::Acquire)
    }

    pub fn state(&self) -> TickState {
        TickState {
            mode: self.mode(),
            next_alarm: self.next_alarm.load(Ordering::Relaxed),
            raw_ticks: self.current_raw_ticks().ticks,
            woken: self.woken(),
        }
    }

    fn arm(&self, delay_us: u64) {
        let target = self.alarm.now_us() + delay_us;
        #[expect(clippy::cast_possible_truncation, reason = "the alarm compares the low 32 bits")]
        self.next_alarm.store(target as u32, Ordering::Relaxed);
        self.alarm.set_alarm(target);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;
    use std::sync::atomic::AtomicUsize;

    use proptest::prelude::*;

    use super::*;
    use crate::arch::emulate::Machine;

    #[test]
    fn conversion_matches_fixed_period() {
        assert_eq!(RawTicks::from_us(0), RawTicks { ticks: 0, subticks: 0 });
        assert_eq!(RawTicks::from_us(976), RawTicks { ticks: 0, subticks: 31 });
        assert_eq!(RawTicks::from_us(977), RawTicks { ticks: 1, subticks: 0 });
        assert_eq!(RawTicks::from_us(999_999).ticks, 1023);
        // whole seconds are exact
        assert_eq!(RawTicks::from_us(1_000_000), RawTicks { ticks: 1024, subticks: 0 });
        assert_eq!(RawTicks::from_us(5_000_977).ticks, 5 * 1024 + 1);
    }

    #[test]
    fn enable_arms_one_period_out() {
        let machine = Machine::new();
        machine.set_now(10_000);
        let tick = TickEngine::claim(machine.clone());

        assert!(machine.alarm_claimed());
        assert_eq!(tick.mode(), TickMode::Disabled);

        tick.enable();
        assert_eq!(tick.mode(), TickMode::Enabled);
        assert_eq!(machine.alarm_target(), Some(10_977));
        assert_eq!(tick.state().next_alarm, 10_977);
    }

    #[test]
    fn fire_while_enabled_runs_hook_and_rearms() {
        let machine = Machine::new();
        let tick = TickEngine::claim(machine.clone());
        let count = AtomicUsize::new(0);
        let hook = || {
            count.fetch_add(1, Ordering::Relaxed);
        };

        tick.enable();
        for i in 1..=3 {
            assert_eq!(machine.advance_to_alarm(), Some(i * TICK_PERIOD_US));
            tick.on_alarm_fire(&hook);
        }

        assert_eq!(count.load(Ordering::Relaxed), 3);
        assert_eq!(machine.alarm_target(), Some(4 * TICK_PERIOD_US));
        assert_eq!(machine.alarms_acknowledged(), 3);
        assert!(tick.woken());
    }

    #[test]
    fn stray_fire_after_disable_only_wakes() {
        let machine = Machine::new();
        let tick = TickEngine::claim(machine.clone());
        let count = AtomicUsize::new(0);
        let hook = || {
            count.fetch_add(1, Ordering::Relaxed);
        };

        tick.enable();
        tick.disable();
        // the in-flight alarm was not cancelled
        assert_eq!(machine.alarm_target(), Some(TICK_PERIOD_US));

        machine.advance_to_alarm();
        tick.on_alarm_fire(&hook);

        assert_eq!(count.load(Ordering::Relaxed), 0);
        assert_eq!(machine.alarm_target(), None);
        assert!(tick.woken());
    }

    #[test]
    fn schedule_wake_only_arms_while_disabled() {
        let machine = Machine::new();
        let tick = TickEngine::claim(machine.clone());

        tick.schedule_wake_after(10);
        assert_eq!(machine.alarm_target(), Some(10 * TICK_PERIOD_US));
        assert!(!tick.woken());

        machine.advance_to_alarm();
        tick.on_alarm_fire(&|| {});
        assert!(tick.woken());

        tick.enable();
        let periodic = machine.alarm_target();
        tick.schedule_wake_after(50);
        // the periodic alarm stays, but the wake flag is still consumed
        assert_eq!(machine.alarm_target(), periodic);
        assert!(!tick.woken());
    }

    /// Fires synchronously whenever it is armed for a time that has already passed.
    struct ImmediateAlarm;

    static IMMEDIATE: OnceLock<TickEngine<ImmediateAlarm>> = OnceLock::new();

    impl Alarm for ImmediateAlarm {
        fn claim_alarm(&self) {}

        fn now_us(&self) -> u64 {
            0
        }

        fn set_alarm(&self, target_us: u64) {
            if target_us <= self.now_us()
                && let Some(tick) = IMMEDIATE.get()
            {
                tick.on_alarm_fire(&|| {});
            }
        }

        fn acknowledge_alarm(&self) {}
    }

    #[test]
    fn wake_firing_while_being_armed_is_kept() {
        let tick = IMMEDIATE.get_or_init(|| TickEngine::claim(ImmediateAlarm));

        tick.schedule_wake_after(0);
        assert!(tick.woken());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn ticks_never_move_backwards(a in 0..u64::MAX / 2, b in 0..u64::MAX / 2) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(RawTicks::from_us(lo).ticks <= RawTicks::from_us(hi).ticks);
        }

        #[test]
        fn one_second_of_fires_is_one_second_of_ticks(start in 0..10_000_000_000u64, seconds in 1..4u64) {
            let machine = Machine::new();
            machine.set_now(start);
            let tick = TickEngine::claim(machine.clone());
            let fires = AtomicUsize::new(0);
            let hook = || {
                fires.fetch_add(1, Ordering::Relaxed);
            };

            let before = tick.current_raw_ticks().ticks;
            tick.enable();
            for _ in 0..TICKS_PER_SECOND * seconds {
                machine.advance_to_alarm();
                tick.on_alarm_fire(&hook);
            }
            let after = tick.current_raw_ticks().ticks;

            prop_assert_eq!(fires.load(Ordering::Relaxed) as u64, TICKS_PER_SECOND * seconds);

            // 977 µs overshoots 1/1024 s by ~0.46 ticks per second, plus up to one tick of
            // truncation at either end
            let advanced = after - before;
            prop_assert!(advanced + 1 >= TICKS_PER_SECOND * seconds, "advanced {advanced}");
            prop_assert!(advanced <= TICKS_PER_SECOND * seconds + seconds / 2 + 2, "advanced {advanced}");
        }
    }
}
