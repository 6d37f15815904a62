//! x86_64 serial log sink.
//!
//! Uses the `uart_16550` crate to drive COM1 at I/O port 0x3F8 and exposes it
//! as a [`log::Log`] backend, so every `log::info!` in the driver core ends
//! up on the serial console.

use core::fmt::Write;

use lazy_static::lazy_static;
use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;
use uart_16550::SerialPort;
use x86_64::instructions::interrupts;

use crate::error::{KernelError, KernelResult};

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 base. Nothing else in the kernel
        // touches these ports once the logger owns them.
        let mut serial_port = unsafe { SerialPort::new(0x3F8) };
        serial_port.init();
        Mutex::new(serial_port)
    };
}

/// `log` backend writing one line per record to COM1.
pub struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Interrupts are masked while the port lock is held so that the
        // VirtIO interrupt path can log without deadlocking against us.
        interrupts::without_interrupts(|| {
            // A full or absent UART must not take the kernel down.
            let _ = writeln!(SERIAL1.lock(), "[{:<5}] {}", record.level(), record.args());
        });
    }

    fn flush(&self) {}
}

/// Install the serial logger and set the global verbosity.
pub fn init(level: LevelFilter) -> KernelResult<()> {
    log::set_logger(&LOGGER).map_err(|_| KernelError::InvalidState {
        expected: "no logger installed",
        actual: "logger already installed",
    })?;
    log::set_max_level(level);
    Ok(())
}
