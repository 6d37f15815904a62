//! Virtqueue implementation
//!
//! Implements the split virtqueue used by modern virtio PCI devices. A
//! virtqueue consists of three regions carved out of one physically
//! contiguous, zero-filled allocation:
//!
//! 1. **Descriptor table** -- `16 * capacity` bytes at offset 0
//! 2. **Available ring** -- driver-to-device, `6 + 2 * capacity` bytes right
//!    after the table
//! 3. **Used ring** -- device-to-driver, `6 + 8 * capacity` bytes, placed at
//!    the next 4-byte boundary
//!
//! The driver owns the first two regions and the device owns the third; all
//! accesses go through volatile reads and writes on raw pointers into the
//! allocation. Each queue carries at most one request at a time, always a
//! chain of two descriptors: a device-readable request followed by a
//! device-writable response.

use alloc::vec::Vec;
use core::{
    mem::size_of,
    ptr,
    sync::atomic::{self, AtomicBool, AtomicU16, AtomicU64, Ordering},
};

use super::{common_cfg, MAX_VIRTQUEUES, NO_VECTOR};
use crate::{
    arch::barriers::memory_fence,
    error::{KernelError, KernelResult},
    mm::{self, align_up, DmaRegion},
    platform::{Mmio, Platform},
};

/// Largest queue the driver will configure; bigger device queues are
/// clamped.
pub const MAX_QUEUE_SIZE: u16 = 64;

/// Descriptor flag: buffer continues via the `next` field
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
/// Descriptor flag: buffer is device-writable (device writes, driver reads)
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

/// Available ring flag: do not notify
pub const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 1;

/// Virtqueue descriptor table entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtqDesc {
    /// Physical address of the buffer
    pub addr: u64,
    /// Length of the buffer in bytes
    pub len: u32,
    /// Descriptor flags (NEXT, WRITE)
    pub flags: u16,
    /// Index of the next descriptor in the chain (valid if NEXT flag is set)
    pub next: u16,
}

/// Element in the used ring, returned by the device after processing.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtqUsedElem {
    /// Index of the start of the used descriptor chain
    pub id: u32,
    /// Total bytes written into the descriptor chain buffers by the device
    pub len: u32,
}

/// Byte layout of the three rings for one capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub capacity: u16,
    pub desc_offset: usize,
    pub desc_size: usize,
    pub avail_offset: usize,
    pub avail_size: usize,
    pub used_offset: usize,
    pub used_size: usize,
    pub total_size: usize,
    /// Allocation class holding `total_size` bytes.
    pub size_class: u8,
}

impl RingLayout {
    pub fn for_capacity(capacity: u16) -> KernelResult<Self> {
        if capacity == 0 || capacity > MAX_QUEUE_SIZE {
            return Err(KernelError::InvalidState {
                expected: "queue capacity in 1..=MAX_QUEUE_SIZE",
                actual: "capacity out of range",
            });
        }

        let c = capacity as usize;
        let desc_size = size_of::<VirtqDesc>() * c;
        let avail_offset = desc_size;
        let avail_size = 6 + 2 * c;
        let used_offset = align_up(avail_offset + avail_size, 4);
        let used_size = 6 + size_of::<VirtqUsedElem>() * c;
        let total_size = used_offset + used_size;

        Ok(Self {
            capacity,
            desc_offset: 0,
            desc_size,
            avail_offset,
            avail_size,
            used_offset,
            used_size,
            total_size,
            size_class: mm::class_for(total_size)?,
        })
    }
}

/// A split virtqueue over one DMA region.
pub struct Virtqueue {
    index: u16,
    /// Byte offset of this queue's doorbell inside the notify window.
    notify_offset: usize,
    layout: RingLayout,
    region: DmaRegion,
    seen_used_idx: AtomicU16,
    waiting: AtomicBool,
    /// `(id << 32) | len` of the most recent used element.
    last_used: AtomicU64,
}

impl Virtqueue {
    /// Wrap an allocation laid out as `layout`.
    pub fn new(index: u16, notify_offset: usize, layout: RingLayout, region: DmaRegion) -> KernelResult<Self> {
        if region.len() < layout.total_size {
            return Err(KernelError::AllocationFailure {
                requested: layout.total_size,
            });
        }

        Ok(Self {
            index,
            notify_offset,
            layout,
            region,
            seen_used_idx: AtomicU16::new(0),
            waiting: AtomicBool::new(false),
            last_used: AtomicU64::new(u64::MAX),
        })
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn capacity(&self) -> u16 {
        self.layout.capacity
    }

    pub fn layout(&self) -> &RingLayout {
        &self.layout
    }

    pub fn notify_offset(&self) -> usize {
        self.notify_offset
    }

    /// Physical addresses of the descriptor table, available ring and used
    /// ring.
    pub fn phys_desc(&self) -> u64 {
        self.region.phys() + self.layout.desc_offset as u64
    }

    pub fn phys_avail(&self) -> u64 {
        self.region.phys() + self.layout.avail_offset as u64
    }

    pub fn phys_used(&self) -> u64 {
        self.region.phys() + self.layout.used_offset as u64
    }

    /// Whether a request is outstanding.
    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }

    /// The used-ring element of the most recent completion.
    pub fn last_used(&self) -> Option<VirtqUsedElem> {
        let packed = self.last_used.load(Ordering::Acquire);
        (packed != u64::MAX).then(|| VirtqUsedElem {
            id: (packed >> 32) as u32,
            len: packed as u32,
        })
    }

    fn at<T>(&self, offset: usize) -> *mut T {
        debug_assert!(offset + size_of::<T>() <= self.layout.total_size);
        // SAFETY: Every offset passed here lies inside the ring layout, which
        // fits in the region (checked in `new`).
        unsafe { self.region.as_ptr().add(offset).cast() }
    }

    fn desc(&self, i: u16) -> *mut VirtqDesc {
        self.at(self.layout.desc_offset + i as usize * size_of::<VirtqDesc>())
    }

    fn avail_flags(&self) -> *mut u16 {
        self.at(self.layout.avail_offset)
    }

    fn avail_idx(&self) -> *mut u16 {
        self.at(self.layout.avail_offset + 2)
    }

    fn avail_slot(&self, slot: u16) -> *mut u16 {
        self.at(self.layout.avail_offset + 4 + 2 * slot as usize)
    }

    fn used_idx(&self) -> *mut u16 {
        self.at(self.layout.used_offset + 2)
    }

    fn used_slot(&self, slot: u16) -> *mut VirtqUsedElem {
        self.at(self.layout.used_offset + 4 + slot as usize * size_of::<VirtqUsedElem>())
    }

    /// Publish a request/response chain over `buffer` and ring the doorbell.
    ///
    /// The first `response_offset` bytes are the device-readable request, the
    /// remaining `total_size - response_offset` bytes the device-writable
    /// response. Fails with `InvalidState` if a request is already
    /// outstanding on this queue.
    pub fn post(&self, notify: &dyn Mmio, buffer: u64, total_size: u32, response_offset: u32) -> KernelResult<()> {
        if response_offset > total_size {
            return Err(KernelError::InvalidState {
                expected: "response inside buffer",
                actual: "response offset past end of buffer",
            });
        }
        if self
            .waiting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(KernelError::InvalidState {
                expected: "idle virtqueue",
                actual: "request outstanding",
            });
        }

        let request = VirtqDesc {
            addr: buffer,
            len: response_offset,
            flags: VIRTQ_DESC_F_NEXT,
            next: 1,
        };
        let response = VirtqDesc {
            addr: buffer + response_offset as u64,
            len: total_size - response_offset,
            flags: VIRTQ_DESC_F_WRITE,
            next: 0,
        };

        // SAFETY: All pointers come from `at`, so they are in bounds and
        // naturally aligned (the region is page aligned and every ring field
        // sits at a multiple of its own size). The descriptor table and the
        // available ring are driver-owned; the device only reads them after
        // the index update below.
        unsafe {
            ptr::write_volatile(self.desc(0), request);
            ptr::write_volatile(self.desc(1), response);

            let idx = ptr::read_volatile(self.avail_idx());
            ptr::write_volatile(self.avail_slot(idx % self.layout.capacity), 0);
            memory_fence();
            ptr::write_volatile(self.avail_idx(), idx.wrapping_add(1));
            memory_fence();
        }

        // SAFETY: See above; the flags word is in bounds and aligned.
        let flags = unsafe { ptr::read_volatile(self.avail_flags()) };
        if flags & VIRTQ_AVAIL_F_NO_INTERRUPT == 0 {
            notify.write16(self.notify_offset, self.index);
        }
        Ok(())
    }

    /// Spin until the outstanding request (if any) has been reaped.
    pub fn wait_for_completion(&self) {
        while self.waiting.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        atomic::fence(Ordering::Acquire);
    }

    /// [`post`](Self::post) then [`wait_for_completion`](Self::wait_for_completion).
    ///
    /// There is no timeout: a device that never completes hangs the caller.
    pub fn submit(&self, notify: &dyn Mmio, buffer: u64, total_size: u32, response_offset: u32) -> KernelResult<()> {
        self.post(notify, buffer, total_size, response_offset)?;
        self.wait_for_completion();
        Ok(())
    }

    /// Advance the completion cursor if the device has returned the
    /// outstanding chain. Returns whether anything was reaped.
    ///
    /// A used index more than one ahead of the cursor, or any advance while
    /// nothing is outstanding, breaks the one-request-per-queue contract and
    /// is reported as `ProtocolError`.
    pub fn reap_used(&self) -> KernelResult<bool> {
        // SAFETY: The used index is in bounds and aligned; the device writes
        // it, so it is read volatile.
        let used = unsafe { ptr::read_volatile(self.used_idx()) };
        let seen = self.seen_used_idx.load(Ordering::Acquire);
        if used == seen {
            return Ok(false);
        }
        if used != seen.wrapping_add(1) {
            return Err(KernelError::ProtocolError {
                reason: "used ring advanced by more than one",
                offset: self.layout.used_offset as u16,
            });
        }
        if !self.waiting.load(Ordering::Acquire) {
            return Err(KernelError::ProtocolError {
                reason: "used ring advanced with no request outstanding",
                offset: self.layout.used_offset as u16,
            });
        }

        memory_fence();
        // SAFETY: Slot index is reduced modulo capacity; the element was
        // written by the device before it bumped the used index.
        let elem = unsafe { ptr::read_volatile(self.used_slot(seen % self.layout.capacity)) };
        self.last_used
            .store(((elem.id as u64) << 32) | elem.len as u64, Ordering::Release);
        self.seen_used_idx.store(used, Ordering::Release);
        self.waiting.store(false, Ordering::Release);
        Ok(true)
    }
}

// SAFETY: Virtqueue holds raw pointers into a DMA region it owns for the
// rest of the kernel's lifetime. The driver-owned rings are only written by
// `post`, which the `waiting` flag makes exclusive; the cursors are atomics.
unsafe impl Send for Virtqueue {}
// SAFETY: See the Send impl; every `&self` method is either read-only or
// serialized through `waiting`.
unsafe impl Sync for Virtqueue {}

/// Program every queue the device advertises: clamp its size, disable its
/// MSI-X vector, allocate and publish its rings, and enable it.
pub(super) fn configure_queues(
    common: &dyn Mmio,
    notify: &dyn Mmio,
    notify_off_multiplier: u32,
    platform: &dyn Platform,
) -> KernelResult<Vec<Virtqueue>> {
    let count = common.read16(common_cfg::NUM_QUEUES);
    if count > MAX_VIRTQUEUES {
        return Err(KernelError::TooManyQueues {
            requested: count,
            max: MAX_VIRTQUEUES,
        });
    }

    let mut queues = Vec::with_capacity(count as usize);
    for index in 0..count {
        common.write16(common_cfg::QUEUE_SELECT, index);

        let advertised = common.read16(common_cfg::QUEUE_SIZE);
        if advertised == 0 {
            return Err(KernelError::ProtocolError {
                reason: "queue size is zero",
                offset: common_cfg::QUEUE_SIZE as u16,
            });
        }
        let capacity = advertised.min(MAX_QUEUE_SIZE);
        common.write16(common_cfg::QUEUE_SIZE, capacity);
        common.write16(common_cfg::QUEUE_MSIX_VECTOR, NO_VECTOR);

        let layout = RingLayout::for_capacity(capacity)?;
        let region = platform.allocate_contiguous_zeroed(layout.size_class)?;

        let notify_offset = common.read16(common_cfg::QUEUE_NOTIFY_OFF) as usize * notify_off_multiplier as usize;
        if notify_offset + 2 > notify.len() {
            return Err(KernelError::ProtocolError {
                reason: "queue doorbell outside notification window",
                offset: common_cfg::QUEUE_NOTIFY_OFF as u16,
            });
        }

        let queue = Virtqueue::new(index, notify_offset, layout, region)?;
        write_address(common, common_cfg::QUEUE_DESC, queue.phys_desc());
        write_address(common, common_cfg::QUEUE_DRIVER, queue.phys_avail());
        write_address(common, common_cfg::QUEUE_DEVICE, queue.phys_used());
        common.write16(common_cfg::QUEUE_ENABLE, 1);

        log::debug!(
            "[VIRTIO] queue {}: {} entries (device offers {}), {} bytes, doorbell +{:#x}",
            index,
            capacity,
            advertised,
            layout.total_size,
            notify_offset
        );
        queues.push(queue);
    }

    Ok(queues)
}

fn write_address(common: &dyn Mmio, offset: usize, address: u64) {
    common.write32(offset, address as u32);
    common.write32(offset + 4, (address >> 32) as u32);
}
