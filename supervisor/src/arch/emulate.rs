// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A host-side model of the hardware behind the [`Arch`](super::Arch) traits.
//!
//! The [`Machine`] records every CPU-level operation as an [`Event`], keeps a virtual
//! microsecond clock with a single alarm, tracks pin functions and simulates just enough of
//! the QSPI memory interface and an attached PSRAM for bring-up to run end to end.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    Alarm, BOOT_BUTTON_DEBOUNCE_US, BOOT_BUTTON_SETTLE_US, BootButton, Bootrom, Cpu,
    ExecutionContext, FLASH_QUIESCE_US, IdleMasking, InterruptState, PinFunction, Pins, Qmi,
    QmiReg, ScratchWord, Watchdog,
};
use crate::kconfig::NUM_PINS;

/// An observable side effect of the [`Machine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    DisableInterrupts,
    RestoreInterrupts { enabled: bool },
    SetPriorityFloor(u8),
    DataSyncBarrier,
    InstructionSyncBarrier,
    WaitForInterrupt,
    WatchdogReboot { pc: u32, sp: u32, delay_ms: u32 },
    WatchdogTick(u32),
    UsbBoot,
    /// The flash chip select was taken from the memory interface to sense BOOTSEL.
    FlashSelectFloated,
    FlashSelectRestored,
}

/// A PSRAM device attached to the second chip select.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PsramModel {
    pub kgd: u8,
    pub eid: u8,
    /// Accepts every command but silently drops memory writes.
    pub faulty: bool,
}

impl PsramModel {
    /// An 8 MiB device.
    pub const APS6404: Self = Self {
        kgd: 0x5d,
        eid: 0x26,
        faulty: false,
    };
}

/// Bytes clocked out between a chip-select assert and deassert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub bytes: Vec<u8>,
    /// The first byte went out over four data lines.
    pub quad: bool,
}

const CSR_EN: u32 = 1 << 0;
const CSR_BUSY: u32 = 1 << 1;
const CSR_ASSERT_CS1N: u32 = 1 << 3;
const CSR_TXEMPTY: u32 = 1 << 11;
/// Bits of the direct-mode CSR that only ever reflect hardware state.
const CSR_STATUS: u32 = CSR_BUSY | (0xfff << 10);

const TX_DATA: u32 = 0xffff;
const TX_IWIDTH_SHIFT: u32 = 16;
const TX_IWIDTH_QUAD: u32 = 2;

/// CSR reads that report BUSY after each transmit.
const TRANSFER_BUSY_READS: u32 = 2;

#[derive(Debug)]
struct State {
    context: ExecutionContext,
    idle_masking: IdleMasking,
    interrupts_enabled: bool,
    priority_floor: u8,
    events: Vec<Event>,

    now_us: u64,
    alarm_claimed: bool,
    alarm_target: Option<u64>,
    alarms_acknowledged: usize,

    pin_functions: [PinFunction; NUM_PINS as usize],
    pin_resets: Vec<u8>,

    psram: Option<PsramModel>,
    regs: BTreeMap<usize, u32>,
    busy_reads: u32,
    rx: u32,
    current: Option<Transaction>,
    transactions: Vec<Transaction>,
    window_writable: bool,
    unsafe_qmi_writes: usize,
    memory: BTreeMap<usize, u32>,

    /// How long BOOTSEL stays held once sensed, `None` while released.
    boot_button_hold_us: Option<u64>,
    saved_word: u32,
}

impl Default for State {
    fn default() -> Self {
        Self {
            context: ExecutionContext::Primary,
            idle_masking: IdleMasking::GlobalMask,
            interrupts_enabled: true,
            priority_floor: 0,
            events: Vec::new(),
            now_us: 0,
            alarm_claimed: false,
            alarm_target: None,
            alarms_acknowledged: 0,
            pin_functions: [PinFunction::Null; NUM_PINS as usize],
            pin_resets: Vec::new(),
            psram: None,
            regs: BTreeMap::new(),
            busy_reads: 0,
            rx: 0,
            current: None,
            transactions: Vec::new(),
            window_writable: false,
            unsafe_qmi_writes: 0,
            memory: BTreeMap::new(),
            boot_button_hold_us: None,
            saved_word: 0,
        }
    }
}

impl State {
    fn reg(&self, reg: QmiReg) -> u32 {
        self.regs.get(&reg.offset()).copied().unwrap_or_default()
    }

    fn write_csr(&mut self, value: u32) {
        let was_selected = self.reg(QmiReg::DirectCsr) & CSR_ASSERT_CS1N != 0;
        let value = value & !CSR_STATUS;
        self.regs.insert(QmiReg::DirectCsr.offset(), value);

        if was_selected
            && value & CSR_ASSERT_CS1N == 0
            && let Some(transaction) = self.current.take()
        {
            self.transactions.push(transaction);
        }
    }

    fn transmit(&mut self, tx: u32) {
        let csr = self.reg(QmiReg::DirectCsr);
        if csr & CSR_EN == 0 || csr & CSR_ASSERT_CS1N == 0 {
            return;
        }

        #[expect(clippy::cast_possible_truncation, reason = "8-bit transfers")]
        let byte = (tx & TX_DATA) as u8;
        let quad = (tx >> TX_IWIDTH_SHIFT) & 0b11 == TX_IWIDTH_QUAD;

        let transaction = self.current.get_or_insert_with(|| Transaction {
            bytes: Vec::new(),
            quad,
        });
        let index = transaction.bytes.len();
        transaction.bytes.push(byte);
        let is_read_id = transaction.bytes[0] == 0x9f;

        self.rx = match self.psram {
            None => 0xff,
            Some(device) if is_read_id && index == 5 => u32::from(device.kgd),
            Some(device) if is_read_id && index == 6 => u32::from(device.eid),
            Some(_) => 0,
        };
        self.busy_reads = TRANSFER_BUSY_READS;
    }
}

/// Host stand-in for the chip. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct Machine(Arc<Mutex<State>>);

impl Machine {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_idle_masking(self, masking: IdleMasking) -> Self {
        self.0.lock().idle_masking = masking;
        self
    }

    #[must_use]
    pub fn with_psram(self, device: PsramModel) -> Self {
        self.0.lock().psram = Some(device);
        self
    }

    #[must_use]
    pub fn with_context(self, context: ExecutionContext) -> Self {
        self.set_context(context);
        self
    }

    /// Holds BOOTSEL down until `hold_us` after the next time it is sensed.
    #[must_use]
    pub fn with_boot_button_held(self, hold_us: u64) -> Self {
        self.0.lock().boot_button_hold_us = Some(hold_us);
        self
    }

    pub fn set_context(&self, context: ExecutionContext) {
        self.0.lock().context = context;
    }

    /// Drains the recorded events.
    pub fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut self.0.lock().events)
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.0.lock().interrupts_enabled
    }

    pub fn set_now(&self, now_us: u64) {
        self.0.lock().now_us = now_us;
    }

    pub fn alarm_claimed(&self) -> bool {
        self.0.lock().alarm_claimed
    }

    pub fn alarm_target(&self) -> Option<u64> {
        self.0.lock().alarm_target
    }

    /// Moves the clock forward to the armed alarm and disarms it, returning the time it fired
    /// at. Does nothing if no alarm is armed.
    pub fn advance_to_alarm(&self) -> Option<u64> {
        let mut state = self.0.lock();
        let target = state.alarm_target.take()?;
        state.now_us = state.now_us.max(target);
        Some(target)
    }

    pub fn alarms_acknowledged(&self) -> usize {
        self.0.lock().alarms_acknowledged
    }

    pub fn pin_function(&self, pin: u8) -> PinFunction {
        self.0.lock().pin_functions[usize::from(pin)]
    }

    /// Drains the pins reset since the last call, in reset order.
    pub fn take_pin_resets(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.lock().pin_resets)
    }

    pub fn qmi_transactions(&self) -> Vec<Transaction> {
        self.0.lock().transactions.clone()
    }

    pub fn qmi_reg(&self, reg: QmiReg) -> u32 {
        self.0.lock().reg(reg)
    }

    pub fn window_writable(&self) -> bool {
        self.0.lock().window_writable
    }

    /// Register writes issued while interrupts were enabled.
    pub fn qmi_writes_with_interrupts_enabled(&self) -> usize {
        self.0.lock().unsafe_qmi_writes
    }

    fn record(&self, event: Event) {
        self.0.lock().events.push(event);
    }
}

impl Cpu for Machine {
    fn execution_context(&self) -> ExecutionContext {
        self.0.lock().context
    }

    fn idle_masking(&self) -> IdleMasking {
        self.0.lock().idle_masking
    }

    fn save_and_disable_interrupts(&self) -> InterruptState {
        let mut state = self.0.lock();
        let enabled = state.interrupts_enabled;
        state.interrupts_enabled = false;
        state.events.push(Event::DisableInterrupts);
        InterruptState { enabled }
    }

    unsafe fn restore_interrupts(&self, saved: InterruptState) {
        let mut state = self.0.lock();
        state.interrupts_enabled = saved.enabled;
        state.events.push(Event::RestoreInterrupts {
            enabled: saved.enabled,
        });
    }

    fn priority_floor(&self) -> u8 {
        self.0.lock().priority_floor
    }

    unsafe fn set_priority_floor(&self, floor: u8) {
        let mut state = self.0.lock();
        state.priority_floor = floor;
        state.events.push(Event::SetPriorityFloor(floor));
    }

    fn data_sync_barrier(&self) {
        self.record(Event::DataSyncBarrier);
    }

    fn instruction_sync_barrier(&self) {
        self.record(Event::InstructionSyncBarrier);
    }

    fn wait_for_interrupt(&self) {
        self.record(Event::WaitForInterrupt);
    }

    fn nop(&self) {}
}

impl Alarm for Machine {
    fn claim_alarm(&self) {
        self.0.lock().alarm_claimed = true;
    }

    fn now_us(&self) -> u64 {
        self.0.lock().now_us
    }

    fn set_alarm(&self, target_us: u64) {
        self.0.lock().alarm_target = Some(target_us);
    }

    fn acknowledge_alarm(&self) {
        self.0.lock().alarms_acknowledged += 1;
    }
}

impl Qmi for Machine {
    fn read_reg(&self, reg: QmiReg) -> u32 {
        let mut state = self.0.lock();
        match reg {
            QmiReg::DirectCsr => {
                let mut csr = state.reg(reg) | CSR_TXEMPTY;
                if state.busy_reads > 0 {
                    state.busy_reads -= 1;
                    csr |= CSR_BUSY;
                }
                csr
            }
            QmiReg::DirectRx => state.rx,
            _ => state.reg(reg),
        }
    }

    fn write_reg(&self, reg: QmiReg, value: u32) {
        let mut state = self.0.lock();
        if state.interrupts_enabled {
            state.unsafe_qmi_writes += 1;
        }

        match reg {
            QmiReg::DirectCsr => state.write_csr(value),
            QmiReg::DirectTx => state.transmit(value),
            QmiReg::DirectRx => {}
            _ => {
                state.regs.insert(reg.offset(), value);
            }
        }
    }

    fn set_window_writable(&self) {
        self.0.lock().window_writable = true;
    }

    unsafe fn write_uncached(&self, offset: usize, value: u32) {
        let mut state = self.0.lock();
        let stores = state.window_writable && state.psram.is_some_and(|device| !device.faulty);
        if stores {
            state.memory.insert(offset, value);
        }
    }

    unsafe fn read_uncached(&self, offset: usize) -> u32 {
        self.0.lock().memory.get(&offset).copied().unwrap_or_default()
    }
}

impl Pins for Machine {
    fn set_function(&self, pin: u8, function: PinFunction) {
        self.0.lock().pin_functions[usize::from(pin)] = function;
    }

    fn reset_pin(&self, pin: u8) {
        let mut state = self.0.lock();
        state.pin_functions[usize::from(pin)] = PinFunction::Null;
        state.pin_resets.push(pin);
    }
}

impl Watchdog for Machine {
    fn reboot(&self, pc: u32, sp: u32, delay_ms: u32) {
        self.record(Event::WatchdogReboot { pc, sp, delay_ms });
    }

    fn start_tick(&self, cycles: u32) {
        self.record(Event::WatchdogTick(cycles));
    }
}

impl Bootrom for Machine {
    fn reboot_to_usb_boot(&self) {
        self.record(Event::UsbBoot);
    }
}

impl BootButton for Machine {
    fn boot_button_pressed(&self) -> bool {
        let saved = self.save_and_disable_interrupts();

        let pressed = {
            let mut state = self.0.lock();
            state.now_us += u64::from(FLASH_QUIESCE_US);
            state.events.push(Event::FlashSelectFloated);
            state.now_us += u64::from(BOOT_BUTTON_SETTLE_US);

            let hold = state.boot_button_hold_us.take();
            if let Some(hold_us) = hold {
                state.now_us += hold_us + u64::from(BOOT_BUTTON_DEBOUNCE_US);
            }

            state.events.push(Event::FlashSelectRestored);
            state.now_us += u64::from(FLASH_QUIESCE_US);
            hold.is_some()
        };

        // Safety: `saved` comes from the call above
        unsafe { self.restore_interrupts(saved) };
        pressed
    }
}

impl ScratchWord for Machine {
    fn saved_word(&self) -> u32 {
        self.0.lock().saved_word
    }

    fn set_saved_word(&self, value: u32) {
        self.0.lock().saved_word = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transactions_end_on_deselect() {
        let machine = Machine::new().with_psram(PsramModel::APS6404);

        machine.write_reg(QmiReg::DirectCsr, CSR_EN);
        machine.write_reg(QmiReg::DirectCsr, CSR_EN | CSR_ASSERT_CS1N);
        for byte in [0x9f, 0xff, 0xff, 0xff, 0xff, 0xff] {
            machine.write_reg(QmiReg::DirectTx, byte);
        }
        assert_eq!(machine.read_reg(QmiReg::DirectRx), 0x5d);
        assert!(machine.qmi_transactions().is_empty());

        machine.write_reg(QmiReg::DirectCsr, CSR_EN);
        let transactions = machine.qmi_transactions();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].bytes.len(), 6);
        assert!(!transactions[0].quad);
    }

    #[test]
    fn busy_clears_after_transfer() {
        let machine = Machine::new();

        machine.write_reg(QmiReg::DirectCsr, CSR_EN | CSR_ASSERT_CS1N);
        machine.write_reg(QmiReg::DirectTx, 0xf5);

        let busy = std::iter::repeat_with(|| machine.read_reg(QmiReg::DirectCsr) & CSR_BUSY)
            .take(4)
            .filter(|bit| *bit != 0)
            .count();
        assert_eq!(busy, 2);
        // status bits written back are not latched
        machine.write_reg(QmiReg::DirectCsr, CSR_EN | CSR_BUSY);
        assert_eq!(machine.qmi_reg(QmiReg::DirectCsr), CSR_EN);
    }

    #[test]
    fn boot_button_sensing_masks_interrupts_and_debounces() {
        let machine = Machine::new().with_boot_button_held(20_000);

        assert!(machine.boot_button_pressed());
        assert_eq!(
            machine.take_events(),
            [
                Event::DisableInterrupts,
                Event::FlashSelectFloated,
                Event::FlashSelectRestored,
                Event::RestoreInterrupts { enabled: true },
            ]
        );
        assert_eq!(
            machine.now_us(),
            u64::from(2 * FLASH_QUIESCE_US + BOOT_BUTTON_SETTLE_US + BOOT_BUTTON_DEBOUNCE_US)
                + 20_000
        );

        // released after the first sensing
        assert!(!machine.boot_button_pressed());
    }

    #[test]
    fn clones_share_state() {
        let machine = Machine::new();
        let other = machine.clone();

        other.set_now(42);
        other.set_saved_word(7);
        assert_eq!(machine.now_us(), 42);
        assert_eq!(machine.saved_word(), 7);
    }
}
