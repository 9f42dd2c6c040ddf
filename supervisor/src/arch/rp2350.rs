// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! RP2350 (Cortex-M33) implementation of the hardware traits.

use core::arch::asm;
use core::ops::Range;
use core::ptr;
use core::sync::atomic::{AtomicU32, Ordering};

use super::{
    Alarm, BOOT_BUTTON_DEBOUNCE_US, BOOT_BUTTON_SETTLE_US, BootButton, Bootrom, Cpu,
    ExecutionContext, FLASH_QUIESCE_US, IdleMasking, InterruptState, PinFunction, Pins, Qmi,
    QmiReg, ScratchWord, Watchdog, interrupt,
};
use crate::kconfig::{PSRAM_BASE, XIP_NOCACHE_OFFSET};
use crate::relocate::{BootImage, BssRegion, RelocationPlan};

const SIO_CPUID: usize = 0xd000_0000;
const SIO_GPIO_HI_IN: usize = 0xd000_0008;
const SIO_GPIO_HI_IN_QSPI_CSN: u32 = 1 << 27;

const IO_QSPI_SS_CTRL: usize = 0x4003_001c;
const IO_CTRL_OEOVER_MASK: u32 = 0b11 << 14;
const IO_CTRL_OEOVER_DISABLE: u32 = 0b10 << 14;

const QMI_BASE: usize = 0x400d_0000;
const XIP_CTRL_BASE: usize = 0x400c_8000;
const XIP_CTRL_WRITABLE_M1: u32 = 1 << 11;

const TIMER0_BASE: usize = 0x400b_0000;
const TIMER_ALARM0: usize = 0x10;
const TIMER_TIMERAWH: usize = 0x24;
const TIMER_TIMERAWL: usize = 0x28;
const TIMER_INTR: usize = 0x3c;
const TIMER_INTE: usize = 0x40;
const TIMER0_IRQ_0: u32 = 0;
const NVIC_ISER0: usize = 0xe000_e100;

const WATCHDOG_BASE: usize = 0x400d_8000;
const WATCHDOG_CTRL: usize = 0x00;
const WATCHDOG_LOAD: usize = 0x04;
const WATCHDOG_SCRATCH4: usize = 0x1c;
const WATCHDOG_CTRL_ENABLE: u32 = 1 << 30;
const WATCHDOG_CTRL_TRIGGER: u32 = 1 << 31;
const WATCHDOG_BOOT_MAGIC: u32 = 0xb007_c0d3;
/// The load register counts microsecond ticks and is 24 bits wide.
const WATCHDOG_LOAD_MAX: u32 = 0x00ff_ffff;

const PSM_WDSEL: usize = 0x4001_8008;
const PSM_WDSEL_ALL: u32 = 0x01ff_ffff;
const PSM_WDSEL_ROSC: u32 = 1 << 2;
const PSM_WDSEL_XOSC: u32 = 1 << 3;

const TICKS_WATCHDOG_CTRL: usize = 0x4010_8030;
const TICKS_WATCHDOG_CYCLES: usize = 0x4010_8034;
const TICKS_CTRL_ENABLE: u32 = 1;

const IO_BANK0_BASE: usize = 0x4002_8000;
const PADS_BANK0_BASE: usize = 0x4003_8000;
const FUNCSEL_XIP_CS1: u32 = 9;
const FUNCSEL_NULL: u32 = 0x1f;
const PADS_IE: u32 = 1 << 6;
const PADS_OD: u32 = 1 << 7;
const PADS_ISO: u32 = 1 << 8;
/// Power-on pad configuration: isolated, 4 mA, pull-down, schmitt trigger.
const PADS_RESET: u32 = 0x116;

const BOOTROM_TABLE_LOOKUP: usize = 0x16;
const ROM_FUNC_REBOOT: u32 = u32::from_le_bytes([b'R', b'B', 0, 0]);
const RT_FLAG_FUNC_ARM_SEC: u32 = 0x0004;
const REBOOT_TYPE_BOOTSEL: u32 = 0x0002;
const REBOOT_NO_RETURN_ON_SUCCESS: u32 = 0x0100;
const BOOTSEL_DELAY_MS: u32 = 10;

/// Survives a CPU reset because startup code never initializes this section.
#[unsafe(link_section = ".uninitialized_data.saved_word")]
static SAVED_WORD: AtomicU32 = AtomicU32::new(0);

#[inline(always)]
fn read(addr: usize) -> u32 {
    // Safety: callers only pass addresses of memory-mapped registers
    unsafe { ptr::with_exposed_provenance::<u32>(addr).read_volatile() }
}

#[inline(always)]
fn write(addr: usize, value: u32) {
    // Safety: callers only pass addresses of memory-mapped registers
    unsafe { ptr::with_exposed_provenance_mut::<u32>(addr).write_volatile(value) }
}

/// Atomic set-bits alias of a peripheral register.
#[inline]
fn set_bits(addr: usize, bits: u32) {
    write(addr + 0x2000, bits);
}

/// Atomic clear-bits alias of a peripheral register.
#[inline]
fn clear_bits(addr: usize, bits: u32) {
    write(addr + 0x3000, bits);
}

pub fn core_id() -> u32 {
    read(SIO_CPUID)
}

/// The chip. All state lives in hardware, so copies are free.
#[derive(Debug, Default, Copy, Clone)]
pub struct Rp2350;

impl Cpu for Rp2350 {
    fn execution_context(&self) -> ExecutionContext {
        if core_id() == 0 {
            ExecutionContext::Primary
        } else {
            ExecutionContext::Secondary
        }
    }

    fn idle_masking(&self) -> IdleMasking {
        // interrupt priorities are in use, a BASEPRI-masked interrupt would not end the wait
        IdleMasking::PriorityFloor
    }

    fn save_and_disable_interrupts(&self) -> InterruptState {
        interrupt::save_and_disable()
    }

    unsafe fn restore_interrupts(&self, state: InterruptState) {
        // Safety: ensured by caller
        unsafe { interrupt::restore(state) }
    }

    fn priority_floor(&self) -> u8 {
        cortex_m::register::basepri::read()
    }

    unsafe fn set_priority_floor(&self, floor: u8) {
        // Safety: ensured by caller
        unsafe { cortex_m::register::basepri::write(floor) }
    }

    fn data_sync_barrier(&self) {
        cortex_m::asm::dsb();
    }

    fn instruction_sync_barrier(&self) {
        cortex_m::asm::isb();
    }

    fn wait_for_interrupt(&self) {
        cortex_m::asm::wfi();
    }

    fn nop(&self) {
        cortex_m::asm::nop();
    }
}

impl Alarm for Rp2350 {
    fn claim_alarm(&self) {
        set_bits(TIMER0_BASE + TIMER_INTE, 1);
        write(NVIC_ISER0, 1 << TIMER0_IRQ_0);
    }

    fn now_us(&self) -> u64 {
        loop {
            let hi = read(TIMER0_BASE + TIMER_TIMERAWH);
            let lo = read(TIMER0_BASE + TIMER_TIMERAWL);
            if read(TIMER0_BASE + TIMER_TIMERAWH) == hi {
                return (u64::from(hi) << 32) | u64::from(lo);
            }
        }
    }

    fn set_alarm(&self, target_us: u64) {
        #[expect(clippy::cast_possible_truncation, reason = "the alarm compares the low 32 bits")]
        let target = target_us as u32;
        write(TIMER0_BASE + TIMER_ALARM0, target);
    }

    fn acknowledge_alarm(&self) {
        write(TIMER0_BASE + TIMER_INTR, 1);
    }
}

impl Qmi for Rp2350 {
    fn read_reg(&self, reg: QmiReg) -> u32 {
        read(QMI_BASE + reg.offset())
    }

    fn write_reg(&self, reg: QmiReg, value: u32) {
        write(QMI_BASE + reg.offset(), value);
    }

    fn set_window_writable(&self) {
        set_bits(XIP_CTRL_BASE, XIP_CTRL_WRITABLE_M1);
    }

    unsafe fn write_uncached(&self, offset: usize, value: u32) {
        let addr = PSRAM_BASE + XIP_NOCACHE_OFFSET + offset;
        // Safety: ensured by caller
        unsafe { ptr::with_exposed_provenance_mut::<u32>(addr).write_volatile(value) }
    }

    unsafe fn read_uncached(&self, offset: usize) -> u32 {
        let addr = PSRAM_BASE + XIP_NOCACHE_OFFSET + offset;
        // Safety: ensured by caller
        unsafe { ptr::with_exposed_provenance::<u32>(addr).read_volatile() }
    }
}

impl Pins for Rp2350 {
    fn set_function(&self, pin: u8, function: PinFunction) {
        let pad = PADS_BANK0_BASE + 4 + 4 * usize::from(pin);
        let ctrl = IO_BANK0_BASE + 4 + 8 * usize::from(pin);

        let funcsel = match function {
            PinFunction::XipCs1 => FUNCSEL_XIP_CS1,
            PinFunction::Null => FUNCSEL_NULL,
        };

        write(pad, (read(pad) | PADS_IE) & !PADS_OD);
        write(ctrl, funcsel);
        clear_bits(pad, PADS_ISO);
    }

    fn reset_pin(&self, pin: u8) {
        let pad = PADS_BANK0_BASE + 4 + 4 * usize::from(pin);
        let ctrl = IO_BANK0_BASE + 4 + 8 * usize::from(pin);

        write(ctrl, FUNCSEL_NULL);
        write(pad, PADS_RESET);
    }
}

impl Watchdog for Rp2350 {
    fn reboot(&self, pc: u32, sp: u32, delay_ms: u32) {
        let scratch = |i: usize| WATCHDOG_BASE + WATCHDOG_SCRATCH4 + 4 * i;

        clear_bits(WATCHDOG_BASE + WATCHDOG_CTRL, WATCHDOG_CTRL_ENABLE);
        if pc == 0 {
            write(scratch(0), 0);
        } else {
            write(scratch(0), WATCHDOG_BOOT_MAGIC);
            write(scratch(1), pc ^ WATCHDOG_BOOT_MAGIC.wrapping_neg());
            write(scratch(2), sp);
            write(scratch(3), pc);
        }

        // reset everything apart from the oscillators
        write(PSM_WDSEL, PSM_WDSEL_ALL & !(PSM_WDSEL_ROSC | PSM_WDSEL_XOSC));

        if delay_ms == 0 {
            set_bits(WATCHDOG_BASE + WATCHDOG_CTRL, WATCHDOG_CTRL_TRIGGER);
        } else {
            let load = delay_ms.saturating_mul(1000).min(WATCHDOG_LOAD_MAX);
            write(WATCHDOG_BASE + WATCHDOG_LOAD, load);
            set_bits(WATCHDOG_BASE + WATCHDOG_CTRL, WATCHDOG_CTRL_ENABLE);
        }
    }

    fn start_tick(&self, cycles: u32) {
        write(TICKS_WATCHDOG_CTRL, 0);
        write(TICKS_WATCHDOG_CYCLES, cycles);
        write(TICKS_WATCHDOG_CTRL, TICKS_CTRL_ENABLE);
    }
}

impl Bootrom for Rp2350 {
    fn reboot_to_usb_boot(&self) {
        type TableLookup = unsafe extern "C" fn(code: u32, mask: u32) -> *const ();
        type Reboot = unsafe extern "C" fn(flags: u32, delay_ms: u32, p0: u32, p1: u32) -> i32;

        // Safety: the bootrom stores a halfword pointer to its table lookup function at a
        // fixed address, and the looked up function has the documented reboot signature
        unsafe {
            let lookup_addr = ptr::with_exposed_provenance::<u16>(BOOTROM_TABLE_LOOKUP).read_volatile();
            let lookup: TableLookup = core::mem::transmute(ptr::with_exposed_provenance::<()>(
                usize::from(lookup_addr),
            ));

            let func = lookup(ROM_FUNC_REBOOT, RT_FLAG_FUNC_ARM_SEC);
            if func.is_null() {
                return;
            }
            let reboot: Reboot = core::mem::transmute(func);

            reboot(
                REBOOT_TYPE_BOOTSEL | REBOOT_NO_RETURN_ON_SUCCESS,
                BOOTSEL_DELAY_MS,
                0,
                0,
            );
        }
    }
}

impl BootButton for Rp2350 {
    // the flash is unreachable while its chip select floats, nothing in here may live in it
    #[inline(never)]
    #[unsafe(link_section = ".data.ram_func.boot_button")]
    fn boot_button_pressed(&self) -> bool {
        let primask: u32;
        // Safety: only reads PRIMASK and masks interrupts on this core
        unsafe {
            asm!("mrs {}, PRIMASK", "cpsid i", out(reg) primask, options(nostack, preserves_flags));
        }

        busy_wait_us(FLASH_QUIESCE_US);
        // external pull-up keeps the line high unless the button pulls it low
        set_oeover(IO_CTRL_OEOVER_DISABLE);
        busy_wait_us(BOOT_BUTTON_SETTLE_US);

        let pressed = read(SIO_GPIO_HI_IN) & SIO_GPIO_HI_IN_QSPI_CSN == 0;
        if pressed {
            while read(SIO_GPIO_HI_IN) & SIO_GPIO_HI_IN_QSPI_CSN == 0 {}
            busy_wait_us(BOOT_BUTTON_DEBOUNCE_US);
        }

        set_oeover(0);
        busy_wait_us(FLASH_QUIESCE_US);

        if primask & 1 == 0 {
            // Safety: interrupts were enabled on entry
            unsafe { asm!("cpsie i", options(nostack, preserves_flags)) };
        }
        pressed
    }
}

#[inline(always)]
fn set_oeover(value: u32) {
    let ctrl = read(IO_QSPI_SS_CTRL);
    write(IO_QSPI_SS_CTRL, (ctrl & !IO_CTRL_OEOVER_MASK) | value);
}

#[inline(always)]
fn busy_wait_us(us: u32) {
    let start = read(TIMER0_BASE + TIMER_TIMERAWL);
    while read(TIMER0_BASE + TIMER_TIMERAWL).wrapping_sub(start) < us {}
}

impl ScratchWord for Rp2350 {
    fn saved_word(&self) -> u32 {
        SAVED_WORD.load(Ordering::Relaxed)
    }

    fn set_saved_word(&self, value: u32) {
        SAVED_WORD.store(value, Ordering::Relaxed);
    }
}

unsafe extern "C" {
    static _ld_itcm_flash_copy: u32;
    static _ld_itcm_destination: u32;
    static _ld_itcm_size: u32;
    static _ld_dtcm_data_flash_copy: u32;
    static _ld_dtcm_data_destination: u32;
    static _ld_dtcm_data_size: u32;
    static _ld_dtcm_bss_start: u32;
    static _ld_dtcm_bss_size: u32;
    static _ld_cp_dynamic_mem_start: u32;
    static _ld_cp_dynamic_mem_end: u32;
}

macro_rules! symbol {
    ($sym:ident) => {
        (&raw const $sym).expose_provenance()
    };
}

/// The relocation plan described by the linker script. Sizes are in bytes.
pub fn relocation_plan() -> RelocationPlan {
    let words = |bytes: usize| bytes / size_of::<u32>();

    RelocationPlan {
        itcm: BootImage {
            source: symbol!(_ld_itcm_flash_copy),
            destination: symbol!(_ld_itcm_destination),
            words: words(symbol!(_ld_itcm_size)),
        },
        dtcm_data: BootImage {
            source: symbol!(_ld_dtcm_data_flash_copy),
            destination: symbol!(_ld_dtcm_data_destination),
            words: words(symbol!(_ld_dtcm_data_size)),
        },
        dtcm_bss: BssRegion {
            start: symbol!(_ld_dtcm_bss_start),
            words: words(symbol!(_ld_dtcm_bss_size)),
        },
        uncached_offset: XIP_NOCACHE_OFFSET,
    }
}

/// The linker's dynamic memory region.
pub fn dynamic_memory() -> Range<usize> {
    symbol!(_ld_cp_dynamic_mem_start)..symbol!(_ld_cp_dynamic_mem_end)
}
