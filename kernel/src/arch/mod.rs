//! Architecture support used by the driver core.
//!
//! Only two things are needed from the CPU: memory barriers (every
//! architecture) and legacy port I/O for PCI configuration mechanism #1
//! (x86_64 only).

pub mod barriers;

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use self::x86_64::port::{inl, outl};
