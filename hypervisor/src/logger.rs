//! Hypervisor Logging
//!
//! Backs the `log` facade with the mini UART console. Every line carries the
//! system timer timestamp:
//!
//! ```text
//! [     1.204311]  INFO raspvisor::sched: task 0.0 'mini-os.bin' created
//! ```
//!
//! Each line is written with IRQs masked so a trap that logs cannot
//! interleave with (or deadlock on) a line the idle loop is printing.

use log::{Level, LevelFilter, Log, Metadata, Record};
use raspvisor_arch_arm64::cpu::IrqGuard;
use raspvisor_arch_arm64::{print, timer};

use crate::config::LOG_LEVEL;

struct UartLogger {
    level: LevelFilter,
}

impl Log for UartLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let us = timer::now_us();
        let _irq = IrqGuard::new();
        print!(
            "[{:>6}.{:06}] {} {}: {}\n",
            us / 1_000_000,
            us % 1_000_000,
            level_tag(record.level()),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "\x1b[31mERROR\x1b[0m",
        Level::Warn => "\x1b[33m WARN\x1b[0m",
        Level::Info => "\x1b[32m INFO\x1b[0m",
        Level::Debug => "\x1b[34mDEBUG\x1b[0m",
        Level::Trace => "\x1b[35mTRACE\x1b[0m",
    }
}

static LOGGER: UartLogger = UartLogger { level: LOG_LEVEL };

/// Install the UART logger. The UART must already be initialized.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LOG_LEVEL))
        .ok();
}
