//! VirtIO PCI driver core
//!
//! Finds a modern VirtIO device on the PCI bus, negotiates it through the
//! VirtIO 1.x PCI transport, drives its split virtqueues, and runs the
//! VirtIO-GPU command script that puts a 640x400 framebuffer on screen.
//!
//! The crate is `no_std` + `alloc`. Page tables, the physical allocator and
//! the interrupt controller belong to the surrounding kernel and are reached
//! through [`platform::Platform`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod drivers;
pub mod error;
pub mod mm;
pub mod platform;

#[cfg(test)]
mod testing;

#[cfg(all(target_arch = "x86_64", feature = "serial-logger"))]
pub use arch::x86_64::serial;
pub use error::{KernelError, KernelResult};
