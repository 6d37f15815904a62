//! Memory management boundary
//!
//! Physical memory allocation lives outside the driver core. What the core
//! needs from it is captured here: the page size, the fixed set of
//! power-of-two allocation classes the platform allocator hands out, and
//! [`DmaRegion`], the (virtual, physical) pair describing one physically
//! contiguous, zero-filled block.

use core::ptr::NonNull;

use crate::error::{KernelError, KernelResult};

/// Size of a page frame in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Largest allocation class the platform allocator supports
/// (`PAGE_SIZE << 10` = 4 MiB).
pub const MAX_ALLOCATION_CLASS: u8 = 10;

/// Size in bytes of allocation class `class`.
pub const fn class_size(class: u8) -> usize {
    PAGE_SIZE << class
}

/// Smallest allocation class whose size is at least `size` bytes.
pub fn class_for(size: usize) -> KernelResult<u8> {
    (0..=MAX_ALLOCATION_CLASS)
        .find(|&class| class_size(class) >= size)
        .ok_or(KernelError::ResourceExhausted {
            resource: "allocation class",
        })
}

/// Align `value` up to the next multiple of `align` (a power of two).
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// A physically contiguous, zero-filled block shared with a device.
///
/// The driver core never frees these: rings and the GPU control page live
/// until system shutdown.
#[derive(Debug)]
pub struct DmaRegion {
    virt: NonNull<u8>,
    phys: u64,
    size: usize,
}

impl DmaRegion {
    /// Describe an allocation made by the platform.
    ///
    /// # Safety
    ///
    /// `virt` must be valid for reads and writes of `size` bytes for the rest
    /// of the kernel's lifetime, must be the kernel mapping of the physical
    /// range `phys..phys + size`, and must not be handed out to anyone else.
    pub unsafe fn new(virt: NonNull<u8>, phys: u64, size: usize) -> Self {
        Self { virt, phys, size }
    }

    /// Kernel virtual address of the first byte.
    pub fn as_ptr(&self) -> *mut u8 {
        self.virt.as_ptr()
    }

    /// Physical address of the first byte, as programmed into devices.
    pub fn phys(&self) -> u64 {
        self.phys
    }

    /// Size of the block in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Whether the block is empty (never true for platform allocations).
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

// SAFETY: A DmaRegion is an exclusive handle to memory nobody else owns. Any
// sharing with the device is mediated by the ring/control-page code, which
// accesses it only through volatile reads and writes.
unsafe impl Send for DmaRegion {}
// SAFETY: See the Send impl; `&DmaRegion` only exposes addresses.
unsafe impl Sync for DmaRegion {}
