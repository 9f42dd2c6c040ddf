// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use log::LevelFilter;
use supervisor::arch::emulate::Machine;
use supervisor::kconfig::{DEFAULT_STACK_SIZE, EXCEPTION_STACK_SIZE, LOG_LEVEL};
use supervisor::peripherals::Peripherals;
use supervisor::{BootConfig, Port};

// kept alone in its own binary, the logger is process-global
#[test]
fn boot_installs_the_logger() {
    let mut memory = vec![0u128; (64 * 1024 + DEFAULT_STACK_SIZE + EXCEPTION_STACK_SIZE) / 16];
    let base = memory.as_mut_ptr().expose_provenance();
    let dynamic_memory = base..base + memory.len() * size_of::<u128>();

    assert_eq!(log::max_level(), LevelFilter::Off);

    let (_port, _) = unsafe {
        Port::boot(
            Machine::new(),
            BootConfig::new(dynamic_memory),
            Peripherals::new(),
            || {},
            || false,
        )
    }
    .unwrap();

    assert_eq!(log::max_level(), LOG_LEVEL.to_level_filter());
    log::info!("logging after boot");
}
