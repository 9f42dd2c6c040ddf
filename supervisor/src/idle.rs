// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::arch::{Cpu, IdleMasking};

/// Waits for an interrupt unless `should_wake` reports pending work.
///
/// Interrupts are masked while `should_wake` runs and stay masked through the wait
/// instruction, so a wake source that becomes ready after the check still pends an interrupt
/// that ends the wait. The interrupt mask (and priority floor) is restored exactly afterwards.
pub fn idle_until_interrupt<C>(cpu: &C, should_wake: impl FnOnce() -> bool)
where
    C: Cpu + ?Sized,
{
    let state = cpu.save_and_disable_interrupts();

    match cpu.idle_masking() {
        IdleMasking::GlobalMask => {
            wait_unless(cpu, should_wake);
        }
        IdleMasking::PriorityFloor => {
            // interrupts masked by the priority floor would not wake the wait instruction
            let floor = cpu.priority_floor();
            // Safety: interrupts are globally masked, nothing runs when the floor drops
            unsafe { cpu.set_priority_floor(0) };
            cpu.instruction_sync_barrier();

            wait_unless(cpu, should_wake);

            // Safety: restores the floor read above
            unsafe { cpu.set_priority_floor(floor) };
            cpu.instruction_sync_barrier();
        }
    }

    // Safety: pairs with the save above
    unsafe { cpu.restore_interrupts(state) };
}

fn wait_unless<C>(cpu: &C, should_wake: impl FnOnce() -> bool)
where
    C: Cpu + ?Sized,
{
    if !should_wake() {
        cpu.data_sync_barrier();
        cpu.wait_for_interrupt();
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::arch::emulate::{Event, Machine};

    #[test]
    fn global_mask_waits_when_idle() {
        let machine = Machine::new().with_idle_masking(IdleMasking::GlobalMask);

        idle_until_interrupt(&machine, || false);

        assert_eq!(
            machine.take_events(),
            [
                Event::DisableInterrupts,
                Event::DataSyncBarrier,
                Event::WaitForInterrupt,
                Event::RestoreInterrupts { enabled: true },
            ]
        );
        assert!(machine.interrupts_enabled());
    }

    #[test]
    fn priority_floor_is_dropped_and_restored() {
        let machine = Machine::new().with_idle_masking(IdleMasking::PriorityFloor);
        unsafe { machine.set_priority_floor(0x40) };
        machine.take_events();

        idle_until_interrupt(&machine, || false);

        assert_eq!(
            machine.take_events(),
            [
                Event::DisableInterrupts,
                Event::SetPriorityFloor(0),
                Event::InstructionSyncBarrier,
                Event::DataSyncBarrier,
                Event::WaitForInterrupt,
                Event::SetPriorityFloor(0x40),
                Event::InstructionSyncBarrier,
                Event::RestoreInterrupts { enabled: true },
            ]
        );
        assert_eq!(machine.priority_floor(), 0x40);
    }

    #[test]
    fn check_runs_with_interrupts_masked() {
        let machine = Machine::new();

        idle_until_interrupt(&machine, || {
            assert!(!machine.interrupts_enabled());
            true
        });

        assert!(machine.interrupts_enabled());
    }

    #[test]
    fn keeps_outer_mask() {
        let machine = Machine::new();
        let outer = machine.save_and_disable_interrupts();

        idle_until_interrupt(&machine, || false);
        assert!(!machine.interrupts_enabled());

        unsafe { machine.restore_interrupts(outer) };
        assert!(machine.interrupts_enabled());
    }

    proptest! {
        #[test]
        fn never_waits_with_work_pending(
            background in any::<bool>(),
            transport in any::<bool>(),
            woken in any::<bool>(),
            floor in any::<bool>(),
        ) {
            let masking = if floor { IdleMasking::PriorityFloor } else { IdleMasking::GlobalMask };
            let machine = Machine::new().with_idle_masking(masking);

            idle_until_interrupt(&machine, || background || transport || woken);

            let waited = machine.take_events().contains(&Event::WaitForInterrupt);
            prop_assert_eq!(waited, !(background || transport || woken));
            prop_assert!(machine.interrupts_enabled());
        }
    }
}
