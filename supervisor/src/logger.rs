// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt::{self, Write};

use log::{LevelFilter, Metadata, Record};

use crate::arch;

static LOGGER: Logger = Logger;

struct Logger;

/// Installs the debug-channel logger. Does nothing if a logger is already installed.
pub fn init(filter: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(filter);
    }
}

impl log::Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            cfg_if::cfg_if! {
                if #[cfg(all(target_arch = "arm", target_os = "none"))] {
                    if let Ok(mut stdio) = cortex_m_semihosting::hio::hstdout() {
                        let _ = format_record(&mut stdio, arch::core_id(), record);
                    }
                } else if #[cfg(any(test, feature = "emulate"))] {
                    let mut line = String::new();
                    let _ = format_record(&mut line, arch::core_id(), record);
                    eprint!("{line}");
                }
            }
        }
    }

    fn flush(&self) {}
}

fn format_record(out: &mut impl Write, core: u32, record: &Record) -> fmt::Result {
    writeln!(
        out,
        "[{:<5} CORE {} {}] {}",
        record.level(),
        core,
        record.module_path_static().unwrap_or_default(),
        record.args()
    )
}

#[cfg(test)]
mod tests {
    use log::Level;

    use super::*;

    #[test]
    fn formats_level_core_and_module() {
        let mut out = String::new();
        format_record(
            &mut out,
            1,
            &Record::builder()
                .level(Level::Info)
                .module_path_static(Some("supervisor::psram"))
                .args(format_args!("8192 KiB"))
                .build(),
        )
        .unwrap();

        assert_eq!(out, "[INFO  CORE 1 supervisor::psram] 8192 KiB\n");
    }
}
