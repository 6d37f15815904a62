//! Legacy port I/O.
//!
//! Thin wrappers over `x86_64::instructions::port::Port` so that callers in
//! the PCI code keep the familiar `outl`/`inl` shape.

use x86_64::instructions::port::Port;

/// Write a dword to an I/O port.
///
/// # Safety
///
/// Port I/O can have arbitrary side effects on hardware. The caller must own
/// the port (e.g. hold the PCI configuration lock for 0xCF8/0xCFC) and run
/// with I/O privilege.
#[inline]
pub unsafe fn outl(port: u16, value: u32) {
    let mut port = Port::<u32>::new(port);
    // SAFETY: Forwarded from the caller's contract.
    unsafe { port.write(value) }
}

/// Read a dword from an I/O port.
///
/// # Safety
///
/// Same contract as [`outl`].
#[inline]
pub unsafe fn inl(port: u16) -> u32 {
    let mut port = Port::<u32>::new(port);
    // SAFETY: Forwarded from the caller's contract.
    unsafe { port.read() }
}
