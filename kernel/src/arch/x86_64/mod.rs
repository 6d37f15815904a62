//! x86_64 support: port I/O and the COM1 log sink.

pub mod port;

#[cfg(feature = "serial-logger")]
pub mod serial;
