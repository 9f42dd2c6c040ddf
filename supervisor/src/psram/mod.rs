// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Detection and setup of an external QSPI PSRAM on the second XIP chip select.
//!
//! [`bring_up`] is the only code that speaks the device's command protocol. It drives the
//! QSPI memory interface in direct mode to identify the device, switches it to quad mode,
//! configures the memory-mapped window for sustained quad reads and writes and finally
//! verifies the window with a test write.

mod regs;

use crate::arch::{Cpu, PinFunction, Pins, Qmi, QmiReg};
use crate::kconfig::PSRAM_DIRECT_CLKDIV;
use crate::pins::PinReservation;

use regs::{Command, DUMMY_LEN_24, DirectCsr, DirectTx, Format, PageBreak, Timing, Width};

/// Known-good-die marker reported by working devices.
pub const KGD_PASS: u8 = 0x5d;

const CMD_EXIT_QPI: u32 = 0xf5;
const CMD_READ_ID: u32 = 0x9f;
const CMD_RESET_ENABLE: u32 = 0x66;
const CMD_RESET: u32 = 0x99;
const CMD_QUAD_ENABLE: u32 = 0x35;
const CMD_QUAD_READ: u32 = 0xeb;
const CMD_QUAD_WRITE: u32 = 0x38;

/// Bytes clocked out during identification, the command plus six fill bytes.
const ID_SEQUENCE_LEN: usize = 7;
const KGD_INDEX: usize = 5;
const EID_INDEX: usize = 6;

/// Nops between quad-enable commands, giving the device time to process a reset.
const COMMAND_GAP_NOPS: usize = 20;

const TEST_PATTERN: u32 = 0x1234_5678;
const BASE_CAPACITY: usize = 1024 * 1024;

/// Identification bytes read from the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceId {
    pub kgd: u8,
    pub eid: u8,
}

impl DeviceId {
    pub const fn is_known_good(self) -> bool {
        self.kgd == KGD_PASS
    }

    /// Device size decoded from the extended-ID byte.
    pub const fn capacity(self) -> usize {
        let size_id = self.eid >> 5;
        let multiplier = if self.eid == 0x26 || size_id == 2 {
            8
        } else if size_id == 0 {
            2
        } else if size_id == 1 {
            4
        } else {
            1
        };
        BASE_CAPACITY * multiplier
    }
}

/// Result of [`bring_up`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BringUp {
    /// Usable bytes in the memory-mapped window, zero if the device is missing or broken.
    pub capacity: usize,
    /// Identification bytes as read from the device.
    pub id: DeviceId,
    /// What should happen to the chip-select pin.
    pub reservation: PinReservation,
}

impl BringUp {
    pub const fn is_ready(&self) -> bool {
        self.capacity > 0
    }
}

/// Probes for a PSRAM device on `chip_select` and prepares its memory-mapped window.
///
/// Runs with interrupts disabled until the window is configured. On failure the capacity is
/// zero and the chip select is handed back as [`PinReservation::Released`].
pub fn bring_up<A>(arch: &A, chip_select: u8) -> BringUp
where
    A: Cpu + Qmi + Pins + ?Sized,
{
    arch.set_function(chip_select, PinFunction::XipCs1);
    let state = arch.save_and_disable_interrupts();

    let direct = DirectMode::enter(arch);
    direct.transfer(
        DirectTx::new()
            .with(DirectTx::OE, true)
            .with(DirectTx::IWIDTH, Width::Quad)
            .with(DirectTx::DATA, CMD_EXIT_QPI),
    );
    let id = direct.read_id();
    direct.exit();

    if !id.is_known_good() {
        // Safety: pairs with the save above
        unsafe { arch.restore_interrupts(state) };

        log::warn!("no PSRAM on GPIO {chip_select} (kgd {:#04x})", id.kgd);
        return BringUp {
            capacity: 0,
            id,
            reservation: PinReservation::Released(chip_select),
        };
    }

    let direct = DirectMode::enter(arch);
    for cmd in [CMD_RESET_ENABLE, CMD_RESET, CMD_QUAD_ENABLE] {
        direct.command(cmd);
        for _ in 0..COMMAND_GAP_NOPS {
            arch.nop();
        }
    }
    direct.exit();

    configure_window(arch);
    arch.set_window_writable();

    // Safety: pairs with the save above
    unsafe { arch.restore_interrupts(state) };

    // Safety: the window was configured above and offset 0 lies within every device
    let readback = unsafe {
        arch.write_uncached(0, TEST_PATTERN);
        arch.read_uncached(0)
    };
    if readback != TEST_PATTERN {
        log::warn!("PSRAM on GPIO {chip_select} failed the test write (read {readback:#010x})");
        return BringUp {
            capacity: 0,
            id,
            reservation: PinReservation::Released(chip_select),
        };
    }

    let capacity = id.capacity();
    log::info!(
        "PSRAM on GPIO {chip_select}: {} KiB (eid {:#04x})",
        capacity / 1024,
        id.eid
    );

    BringUp {
        capacity,
        id,
        reservation: PinReservation::Claimed(chip_select),
    }
}

/// Memory-mapped quad reads and writes with timings for a 150 MHz system clock: 8 µs maximum
/// select time, 50 ns minimum deselect and bursts split at 1 KiB pages.
fn configure_window<A: Qmi + ?Sized>(qmi: &A) {
    let timing = Timing::new()
        .with(Timing::PAGEBREAK, PageBreak::B1024)
        .with(Timing::SELECT_HOLD, 3)
        .with(Timing::COOLDOWN, 1)
        .with(Timing::RXDELAY, 1)
        .with(Timing::MAX_SELECT, 16)
        .with(Timing::MIN_DESELECT, 7)
        .with(Timing::CLKDIV, 2);

    let quad = Format::new()
        .with(Format::PREFIX_WIDTH, Width::Quad)
        .with(Format::ADDR_WIDTH, Width::Quad)
        .with(Format::SUFFIX_WIDTH, Width::Quad)
        .with(Format::DUMMY_WIDTH, Width::Quad)
        .with(Format::DATA_WIDTH, Width::Quad)
        .with(Format::PREFIX_LEN, true);
    let rfmt = quad.with(Format::DUMMY_LEN, DUMMY_LEN_24);

    qmi.write_reg(QmiReg::M1Timing, timing.bits());
    qmi.write_reg(QmiReg::M1Rfmt, rfmt.bits());
    qmi.write_reg(
        QmiReg::M1Rcmd,
        Command::new().with(Command::PREFIX, CMD_QUAD_READ).bits(),
    );
    qmi.write_reg(QmiReg::M1Wfmt, quad.bits());
    qmi.write_reg(
        QmiReg::M1Wcmd,
        Command::new().with(Command::PREFIX, CMD_QUAD_WRITE).bits(),
    );
}

/// The QSPI interface in direct mode, with the bus drained.
struct DirectMode<'a, A: ?Sized> {
    qmi: &'a A,
}

impl<'a, A: Qmi + ?Sized> DirectMode<'a, A> {
    fn enter(qmi: &'a A) -> Self {
        let csr = DirectCsr::new()
            .with(DirectCsr::CLKDIV, PSRAM_DIRECT_CLKDIV)
            .with(DirectCsr::EN, true);
        qmi.write_reg(QmiReg::DirectCsr, csr.bits());

        let this = Self { qmi };
        // the cooldown of the last XIP transfer must expire before the first direct transfer
        this.wait_idle();
        this
    }

    fn csr(&self) -> DirectCsr {
        DirectCsr::from_bits(self.qmi.read_reg(QmiReg::DirectCsr))
    }

    fn set_csr(&self, csr: DirectCsr) {
        self.qmi.write_reg(QmiReg::DirectCsr, csr.bits());
    }

    fn wait_idle(&self) {
        while self.csr().get(DirectCsr::BUSY) {}
    }

    fn select(&self) {
        self.set_csr(self.csr().with(DirectCsr::ASSERT_CS1N, true));
    }

    fn deselect(&self) {
        self.set_csr(self.csr().with(DirectCsr::ASSERT_CS1N, false));
    }

    fn push(&self, tx: DirectTx) {
        self.qmi.write_reg(QmiReg::DirectTx, tx.bits());
    }

    fn pop(&self) -> u8 {
        #[expect(clippy::cast_possible_truncation, reason = "8-bit transfers")]
        let byte = self.qmi.read_reg(QmiReg::DirectRx) as u8;
        byte
    }

    /// Clocks out a single entry as its own transaction.
    fn transfer(&self, tx: DirectTx) {
        self.select();
        self.push(tx);
        self.wait_idle();
        self.pop();
        self.deselect();
    }

    /// Sends a single-width command byte as its own transaction.
    fn command(&self, cmd: u32) {
        self.select();
        self.push(DirectTx::new().with(DirectTx::DATA, cmd));
        self.wait_idle();
        self.deselect();
        self.pop();
    }

    fn read_id(&self) -> DeviceId {
        let mut id = DeviceId { kgd: 0, eid: 0 };

        self.select();
        for i in 0..ID_SEQUENCE_LEN {
            let data = if i == 0 { CMD_READ_ID } else { 0xff };
            self.push(DirectTx::new().with(DirectTx::DATA, data));

            while !self.csr().get(DirectCsr::TXEMPTY) {}
            self.wait_idle();

            let byte = self.pop();
            match i {
                KGD_INDEX => id.kgd = byte,
                EID_INDEX => id.eid = byte,
                _ => {}
            }
        }
        self.deselect();

        id
    }

    fn exit(self) {
        self.set_csr(
            self.csr()
                .with(DirectCsr::ASSERT_CS1N, false)
                .with(DirectCsr::EN, false),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::emulate::{Event, Machine, PsramModel};

    #[test]
    fn capacity_lookup() {
        let cap = |eid| DeviceId { kgd: KGD_PASS, eid }.capacity();

        assert_eq!(cap(0x26), 8 * BASE_CAPACITY);
        assert_eq!(cap(0b010_00000), 8 * BASE_CAPACITY);
        assert_eq!(cap(0b000_00001), 2 * BASE_CAPACITY);
        assert_eq!(cap(0b001_00110), 4 * BASE_CAPACITY);
        assert_eq!(cap(0b111_00000), BASE_CAPACITY);
    }

    #[test_log::test]
    fn detects_and_configures_device() {
        let machine = Machine::new().with_psram(PsramModel::APS6404);

        let report = bring_up(&machine, 47);

        assert_eq!(report.capacity, 8 * 1024 * 1024);
        assert_eq!(report.reservation, PinReservation::Claimed(47));
        assert_eq!(machine.pin_function(47), PinFunction::XipCs1);
        assert!(machine.window_writable());

        let transactions = machine.qmi_transactions();
        let commands: Vec<_> = transactions.iter().map(|t| (t.bytes[0], t.quad)).collect();
        assert_eq!(
            commands,
            [
                (0xf5, true),
                (0x9f, false),
                (0x66, false),
                (0x99, false),
                (0x35, false)
            ]
        );
        assert_eq!(transactions[1].bytes.len(), ID_SEQUENCE_LEN);

        assert_eq!(machine.qmi_reg(QmiReg::M1Rcmd), 0xeb);
        assert_eq!(machine.qmi_reg(QmiReg::M1Wcmd), 0x38);
        assert_eq!(machine.qmi_reg(QmiReg::M1Timing), 0x61a0_7102);
        assert_eq!(machine.qmi_reg(QmiReg::M1Rfmt), 0x0006_12aa);
        assert_eq!(machine.qmi_reg(QmiReg::M1Wfmt), 0x0000_12aa);
        // direct mode is left disabled
        assert_eq!(machine.qmi_reg(QmiReg::DirectCsr) & 1, 0);
    }

    #[test]
    fn protocol_runs_with_interrupts_masked() {
        let machine = Machine::new().with_psram(PsramModel::APS6404);

        bring_up(&machine, 47);

        let events = machine.take_events();
        assert_eq!(events.first(), Some(&Event::DisableInterrupts));
        assert!(events.contains(&Event::RestoreInterrupts { enabled: true }));
        assert!(machine.interrupts_enabled());
        assert_eq!(machine.qmi_writes_with_interrupts_enabled(), 0);
    }

    #[test]
    fn missing_device_releases_chip_select() {
        let machine = Machine::new();

        let report = bring_up(&machine, 47);

        assert_eq!(report.capacity, 0);
        assert!(!report.is_ready());
        assert_eq!(report.reservation, PinReservation::Released(47));
        assert_eq!(report.id.kgd, 0xff);
        // nothing past identification was attempted
        assert_eq!(machine.qmi_transactions().len(), 2);
        assert!(!machine.window_writable());
        assert!(machine.interrupts_enabled());
    }

    #[test]
    fn failed_test_write_reports_zero_capacity() {
        let machine = Machine::new().with_psram(PsramModel {
            faulty: true,
            ..PsramModel::APS6404
        });

        let report = bring_up(&machine, 47);

        assert_eq!(report.capacity, 0);
        assert_eq!(report.reservation, PinReservation::Released(47));
        assert!(report.id.is_known_good());
        assert!(machine.interrupts_enabled());
    }
}
