//! Memory barriers for driver/device shared memory.
//!
//! The split virtqueue publish protocol needs a full fence between writing
//! an available-ring slot and bumping `avail.idx`, and another between the
//! bump and the doorbell write. Both go through [`memory_fence`] so the ring
//! code carries no `#[cfg(target_arch)]` blocks.

/// Order every earlier load and store, including device-memory accesses,
/// before every later one.
///
/// * **x86_64**: `fence(SeqCst)` (MFENCE); MMIO stores are not reordered
///   with earlier stores on x86.
/// * **AArch64**: `dmb osh`, outer shareable so a DMA-capable device observes
///   the order.
/// * **RISC-V**: `fence iorw, iorw`, which also covers the I/O space.
#[inline(always)]
pub fn memory_fence() {
    #[cfg(target_arch = "aarch64")]
    {
        // SAFETY: A barrier instruction with no operands; it only constrains
        // ordering.
        unsafe { core::arch::asm!("dmb osh", options(nostack, preserves_flags)) };
    }

    #[cfg(target_arch = "riscv64")]
    {
        // SAFETY: As above.
        unsafe { core::arch::asm!("fence iorw, iorw", options(nostack, preserves_flags)) };
    }

    #[cfg(not(any(target_arch = "aarch64", target_arch = "riscv64")))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}
