//! Hooks the driver core needs from the rest of the kernel
//!
//! The core does not own page tables, the physical allocator, or the
//! interrupt controller. It reaches them through [`Platform`], and touches
//! device registers only through [`Mmio`] windows handed out by
//! [`Platform::map_mmio`].

use alloc::boxed::Box;
use core::ptr::NonNull;

use crate::{drivers::pci::ConfigSpace, error::KernelResult, mm::DmaRegion};

/// A mapped window of device registers.
///
/// Offsets are relative to the start of the window. Implementations must
/// perform every access as a single volatile load or store of the given
/// width.
pub trait Mmio: Send + Sync {
    fn read8(&self, offset: usize) -> u8;
    fn read16(&self, offset: usize) -> u16;
    fn read32(&self, offset: usize) -> u32;
    fn read64(&self, offset: usize) -> u64;
    fn write8(&self, offset: usize, value: u8);
    fn write16(&self, offset: usize, value: u16);
    fn write32(&self, offset: usize, value: u32);
    fn write64(&self, offset: usize, value: u64);

    /// Length of the window in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything the driver core borrows from the surrounding kernel.
pub trait Platform: Send + Sync {
    /// PCI configuration-space accessor.
    fn config_space(&self) -> &dyn ConfigSpace;

    /// Map `len` bytes of device memory at physical address `phys`.
    fn map_mmio(&self, phys: u64, len: usize) -> KernelResult<Box<dyn Mmio>>;

    /// Allocate a zero-filled, physically contiguous block of
    /// `PAGE_SIZE << size_class` bytes.
    fn allocate_contiguous_zeroed(&self, size_class: u8) -> KernelResult<DmaRegion>;

    /// Unmask legacy interrupt line `line` at the interrupt controller.
    fn unmask_interrupt(&self, line: u8);
}

/// [`Mmio`] over an identity- or kernel-mapped register window.
#[derive(Debug)]
pub struct VolatileMmio {
    base: NonNull<u8>,
    len: usize,
}

impl VolatileMmio {
    /// # Safety
    ///
    /// `base..base + len` must be mapped uncached device memory that stays
    /// mapped for the lifetime of the returned value.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len }
    }

    fn ptr<T>(&self, offset: usize) -> *mut T {
        debug_assert!(offset + core::mem::size_of::<T>() <= self.len);
        debug_assert_eq!(offset % core::mem::align_of::<T>(), 0);
        // SAFETY: The offset is within the window (checked above in debug
        // builds, guaranteed by callers in release builds).
        unsafe { self.base.as_ptr().add(offset).cast() }
    }
}

impl Mmio for VolatileMmio {
    fn read8(&self, offset: usize) -> u8 {
        // SAFETY: `ptr` yields an in-bounds, aligned address in mapped device
        // memory per the contract of `VolatileMmio::new`.
        unsafe { core::ptr::read_volatile(self.ptr(offset)) }
    }

    fn read16(&self, offset: usize) -> u16 {
        // SAFETY: See read8.
        unsafe { core::ptr::read_volatile(self.ptr(offset)) }
    }

    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: See read8.
        unsafe { core::ptr::read_volatile(self.ptr(offset)) }
    }

    fn read64(&self, offset: usize) -> u64 {
        // SAFETY: See read8.
        unsafe { core::ptr::read_volatile(self.ptr(offset)) }
    }

    fn write8(&self, offset: usize, value: u8) {
        // SAFETY: See read8.
        unsafe { core::ptr::write_volatile(self.ptr(offset), value) }
    }

    fn write16(&self, offset: usize, value: u16) {
        // SAFETY: See read8.
        unsafe { core::ptr::write_volatile(self.ptr(offset), value) }
    }

    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: See read8.
        unsafe { core::ptr::write_volatile(self.ptr(offset), value) }
    }

    fn write64(&self, offset: usize, value: u64) {
        // SAFETY: See read8.
        unsafe { core::ptr::write_volatile(self.ptr(offset), value) }
    }

    fn len(&self) -> usize {
        self.len
    }
}

// SAFETY: Device registers are accessed only through volatile operations and
// the window itself is never freed.
unsafe impl Send for VolatileMmio {}
// SAFETY: See the Send impl.
unsafe impl Sync for VolatileMmio {}
