//! Host-side stand-ins for the hardware the driver core talks to
//!
//! - [`FakePciBus`]: 256-byte configuration images keyed by address
//! - [`MockPlatform`]: identity-mapped DMA allocations and MMIO windows
//!   backed by [`RegisterFile`] implementations
//! - [`MockVirtioGpu`]: a modern virtio-gpu function that services its
//!   control queue synchronously when the doorbell rings
//! - [`RecordingMmio`]: a doorbell window that logs its writes

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};
use core::{
    mem::size_of,
    ptr::{self, NonNull},
    sync::atomic::{self, AtomicUsize, Ordering},
};
use std::alloc::{alloc_zeroed, Layout};

use spin::Mutex;

use crate::{
    drivers::{
        pci::{class_codes, status_flags, ConfigSpace, PciAddress, CONFIG_SPACE_SIZE},
        virtio::{
            gpu::*,
            pci_cap,
            queue::{VirtqDesc, VIRTQ_DESC_F_NEXT},
            DeviceStatus, IsrStatus, VIRTIO_VENDOR_ID,
        },
    },
    error::{KernelError, KernelResult},
    mm::{class_size, DmaRegion, PAGE_SIZE},
    platform::{Mmio, Platform},
};

type ConfigImage = [u8; CONFIG_SPACE_SIZE as usize];

/// Configuration space of a handful of functions. Absent functions read as
/// all ones, like an empty slot on real hardware.
#[derive(Default)]
pub struct FakePciBus {
    functions: Mutex<BTreeMap<PciAddress, ConfigImage>>,
}

impl FakePciBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plant a function with a zeroed header apart from its identity.
    pub fn add_function(&self, address: PciAddress, vendor: u16, device: u16, class: u8, subclass: u8) {
        let mut image = [0u8; CONFIG_SPACE_SIZE as usize];
        image[0x00..0x02].copy_from_slice(&vendor.to_le_bytes());
        image[0x02..0x04].copy_from_slice(&device.to_le_bytes());
        image[0x0A] = subclass;
        image[0x0B] = class;
        self.functions.lock().insert(address, image);
    }

    /// Copy raw capability bytes into the image at `offset`.
    pub fn plant_capability(&self, address: PciAddress, offset: u16, bytes: &[u8]) {
        self.with_image(address, |image| {
            let start = offset as usize;
            image[start..start + bytes.len()].copy_from_slice(bytes);
        });
    }

    /// Set the capabilities-list status bit and point the list at `first`.
    pub fn link_capabilities(&self, address: PciAddress, first: u8) {
        self.with_image(address, |image| {
            image[0x06] |= status_flags::CAPABILITIES_LIST as u8;
            image[0x34] = first;
        });
    }

    fn with_image(&self, address: PciAddress, f: impl FnOnce(&mut ConfigImage)) {
        let mut functions = self.functions.lock();
        let image = functions.get_mut(&address).expect("function not planted");
        f(image);
    }
}

impl ConfigSpace for FakePciBus {
    fn read_dword(&self, address: PciAddress, offset: u16) -> u32 {
        let at = (offset & 0xFC) as usize;
        self.functions.lock().get(&address).map_or(0xFFFF_FFFF, |image| {
            u32::from_le_bytes([image[at], image[at + 1], image[at + 2], image[at + 3]])
        })
    }

    fn write_dword(&self, address: PciAddress, offset: u16, value: u32) {
        let at = (offset & 0xFC) as usize;
        if let Some(image) = self.functions.lock().get_mut(&address) {
            image[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }
    }
}

/// Device registers behind a [`MockPlatform`] MMIO window. `width` is 1, 2,
/// 4 or 8 bytes.
pub trait RegisterFile: Send + Sync {
    fn read(&self, offset: usize, width: usize) -> u64;
    fn write(&self, offset: usize, width: usize, value: u64);
}

struct Window {
    phys: u64,
    len: usize,
    registers: &'static dyn RegisterFile,
}

/// A platform whose "physical" addresses are host virtual addresses.
#[derive(Default)]
pub struct MockPlatform {
    pub bus: FakePciBus,
    windows: Mutex<Vec<Window>>,
    mapped: AtomicUsize,
    unmasked: Mutex<Vec<u8>>,
}

impl MockPlatform {
    /// A fresh platform that lives for the rest of the test binary, so
    /// interrupt closures can hold on to it.
    pub fn leak() -> &'static Self {
        Box::leak(Box::<Self>::default())
    }

    /// Back `phys..phys + len` with `registers`.
    pub fn attach_registers(&self, phys: u64, len: usize, registers: &'static dyn RegisterFile) {
        self.windows.lock().push(Window { phys, len, registers });
    }

    /// Number of successful `map_mmio` calls.
    pub fn mapped_windows(&self) -> usize {
        self.mapped.load(Ordering::SeqCst)
    }

    pub fn unmasked_lines(&self) -> Vec<u8> {
        self.unmasked.lock().clone()
    }
}

impl Platform for MockPlatform {
    fn config_space(&self) -> &dyn ConfigSpace {
        &self.bus
    }

    fn map_mmio(&self, phys: u64, len: usize) -> KernelResult<Box<dyn Mmio>> {
        let windows = self.windows.lock();
        let window = windows
            .iter()
            .find(|w| phys >= w.phys && phys + len as u64 <= w.phys + w.len as u64)
            .ok_or(KernelError::NotFound {
                resource: "mmio window",
                id: phys,
            })?;
        self.mapped.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RegisterWindow {
            registers: window.registers,
            base: (phys - window.phys) as usize,
            len,
        }))
    }

    fn allocate_contiguous_zeroed(&self, size_class: u8) -> KernelResult<DmaRegion> {
        let size = class_size(size_class);
        let layout =
            Layout::from_size_align(size, PAGE_SIZE).map_err(|_| KernelError::AllocationFailure { requested: size })?;
        // SAFETY: `layout` has a non-zero size.
        let virt = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or(KernelError::AllocationFailure { requested: size })?;
        // SAFETY: Fresh allocation that is never freed; the platform is
        // identity mapped so the address doubles as the physical one.
        Ok(unsafe { DmaRegion::new(virt, virt.as_ptr() as u64, size) })
    }

    fn unmask_interrupt(&self, line: u8) {
        self.unmasked.lock().push(line);
    }
}

struct RegisterWindow {
    registers: &'static dyn RegisterFile,
    base: usize,
    len: usize,
}

impl RegisterWindow {
    fn read(&self, offset: usize, width: usize) -> u64 {
        assert!(offset + width <= self.len, "read past window: {:#x}+{}", offset, width);
        self.registers.read(self.base + offset, width)
    }

    fn write(&self, offset: usize, width: usize, value: u64) {
        assert!(offset + width <= self.len, "write past window: {:#x}+{}", offset, width);
        self.registers.write(self.base + offset, width, value);
    }
}

impl Mmio for RegisterWindow {
    fn read8(&self, offset: usize) -> u8 {
        self.read(offset, 1) as u8
    }

    fn read16(&self, offset: usize) -> u16 {
        self.read(offset, 2) as u16
    }

    fn read32(&self, offset: usize) -> u32 {
        self.read(offset, 4) as u32
    }

    fn read64(&self, offset: usize) -> u64 {
        self.read(offset, 8)
    }

    fn write8(&self, offset: usize, value: u8) {
        self.write(offset, 1, value as u64);
    }

    fn write16(&self, offset: usize, value: u16) {
        self.write(offset, 2, value as u64);
    }

    fn write32(&self, offset: usize, value: u32) {
        self.write(offset, 4, value as u64);
    }

    fn write64(&self, offset: usize, value: u64) {
        self.write(offset, 8, value);
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Doorbell window that records 16-bit writes and optionally calls a hook
/// after each one.
pub struct RecordingMmio<'a> {
    len: usize,
    writes: Mutex<Vec<(usize, u16)>>,
    hook: Option<&'a (dyn Fn(usize, u16) + Sync)>,
}

impl RecordingMmio<'static> {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            writes: Mutex::new(Vec::new()),
            hook: None,
        }
    }
}

impl<'a> RecordingMmio<'a> {
    pub fn on_write16<'b>(self, hook: &'b (dyn Fn(usize, u16) + Sync)) -> RecordingMmio<'b> {
        RecordingMmio {
            len: self.len,
            writes: self.writes,
            hook: Some(hook),
        }
    }

    pub fn writes16(&self) -> Vec<(usize, u16)> {
        self.writes.lock().clone()
    }
}

impl Mmio for RecordingMmio<'_> {
    fn read8(&self, _offset: usize) -> u8 {
        0
    }

    fn read16(&self, _offset: usize) -> u16 {
        0
    }

    fn read32(&self, _offset: usize) -> u32 {
        0
    }

    fn read64(&self, _offset: usize) -> u64 {
        0
    }

    fn write8(&self, _offset: usize, _value: u8) {}

    fn write16(&self, offset: usize, value: u16) {
        assert!(offset + 2 <= self.len);
        self.writes.lock().push((offset, value));
        if let Some(hook) = self.hook {
            hook(offset, value);
        }
    }

    fn write32(&self, _offset: usize, _value: u32) {}

    fn write64(&self, _offset: usize, _value: u64) {}

    fn len(&self) -> usize {
        self.len
    }
}

/// One control-queue request as the mock device decoded it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GpuCommand {
    pub hdr_type: u32,
    /// Length of the device-readable descriptor.
    pub request_len: u32,
    pub resource_id: u32,
    pub format: u32,
    pub width: u32,
    pub height: u32,
    pub rect: VirtioGpuRect,
    pub scanout_id: u32,
    pub offset: u64,
    /// ATTACH_BACKING's first memory entry.
    pub backing: Option<(u64, u32)>,
    /// For TRANSFER_TO_HOST_2D: the value of every pixel in the attached
    /// backing, if they were all equal.
    pub uniform_pixel: Option<u32>,
}

// BAR0 layout of the mock device.
const COMMON_AT: usize = 0x0000;
const ISR_AT: usize = 0x1000;
const DEVICE_AT: usize = 0x2000;
const NOTIFY_AT: usize = 0x3000;
const BAR_LEN: usize = 0x4000;

const COMMON_LEN: usize = 0x38;
const ISR_LEN: usize = 0x04;
const DEVICE_LEN: usize = 0x28;
const NOTIFY_LEN: usize = 0x20;

const QUEUE_COUNT: usize = 2;
const ADVERTISED_QUEUE_SIZE: u16 = 256;
/// VIRTIO_F_VERSION_1 in the high word, VIRTIO_GPU_F_EDID in the low one.
const DEVICE_FEATURES: [u32; 2] = [1 << 1, 1];

const NUM_SCANOUTS_AT: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
struct QueueRegs {
    size: u16,
    msix: u16,
    enable: u16,
    desc: u64,
    driver: u64,
    device: u64,
    // Device-side cursors.
    last_avail: u16,
    used_idx: u16,
}

impl QueueRegs {
    fn reset() -> Self {
        Self {
            size: ADVERTISED_QUEUE_SIZE,
            ..Self::default()
        }
    }
}

struct DeviceState {
    status: u8,
    status_writes: Vec<u8>,
    reject_features_ok: bool,
    device_feature_select: u32,
    driver_feature_select: u32,
    driver_features: [u32; 2],
    msix_config: u16,
    queue_select: u16,
    num_queues: u16,
    queues: [QueueRegs; QUEUE_COUNT],
    isr: u8,
    config_generation: u8,
    device_config: [u8; DEVICE_LEN],
    backing: Option<(u64, u32)>,
    commands: Vec<GpuCommand>,
    failures: BTreeMap<u32, u32>,
    deferred: bool,
    pending: Vec<u16>,
    notifies: Vec<(usize, u16)>,
}

impl DeviceState {
    fn new() -> Self {
        let mut device_config = [0u8; DEVICE_LEN];
        device_config[NUM_SCANOUTS_AT..NUM_SCANOUTS_AT + 4].copy_from_slice(&1u32.to_le_bytes());
        Self {
            status: 0,
            status_writes: Vec::new(),
            reject_features_ok: false,
            device_feature_select: 0,
            driver_feature_select: 0,
            driver_features: [0; 2],
            msix_config: 0,
            queue_select: 0,
            num_queues: QUEUE_COUNT as u16,
            queues: [QueueRegs::reset(); QUEUE_COUNT],
            isr: 0,
            config_generation: 0,
            device_config,
            backing: None,
            commands: Vec::new(),
            failures: BTreeMap::new(),
            deferred: false,
            pending: Vec::new(),
            notifies: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.status = 0;
        self.driver_features = [0; 2];
        self.msix_config = 0;
        self.queue_select = 0;
        self.queues = [QueueRegs::reset(); QUEUE_COUNT];
        self.isr = 0;
        self.backing = None;
    }

    fn write_status(&mut self, value: u8) {
        self.status_writes.push(value);
        if value == 0 {
            self.reset();
        } else if self.reject_features_ok && value & DeviceStatus::FEATURES_OK.bits() != 0 {
            self.status = value & !DeviceStatus::FEATURES_OK.bits();
        } else {
            self.status = value;
        }
    }

    fn selected(&mut self) -> Option<&mut QueueRegs> {
        self.queues.get_mut(self.queue_select as usize)
    }

    fn read_common(&mut self, offset: usize, width: usize) -> u64 {
        let select = self.queue_select;
        let device_select = self.device_feature_select as usize;
        let driver_select = self.driver_feature_select as usize;
        let queue = self.selected().copied();
        let q = queue.unwrap_or_default();
        match offset {
            0x00 => self.device_feature_select as u64,
            0x04 => DEVICE_FEATURES.get(device_select).copied().unwrap_or(0) as u64,
            0x08 => self.driver_feature_select as u64,
            0x0C => self.driver_features.get(driver_select).copied().unwrap_or(0) as u64,
            0x10 => self.msix_config as u64,
            0x12 => self.num_queues as u64,
            0x14 => self.status as u64,
            0x15 => self.config_generation as u64,
            0x16 => select as u64,
            0x18 => q.size as u64,
            0x1A => q.msix as u64,
            0x1C => q.enable as u64,
            0x1E => queue.map_or(0, |_| select as u64),
            0x20 | 0x24 => half(q.desc, offset - 0x20, width),
            0x28 | 0x2C => half(q.driver, offset - 0x28, width),
            0x30 | 0x34 => half(q.device, offset - 0x30, width),
            _ => 0,
        }
    }

    fn write_common(&mut self, offset: usize, width: usize, value: u64) {
        match offset {
            0x00 => self.device_feature_select = value as u32,
            0x08 => self.driver_feature_select = value as u32,
            0x0C => {
                if let Some(word) = self.driver_features.get_mut(self.driver_feature_select as usize) {
                    *word = value as u32;
                }
            }
            0x10 => self.msix_config = value as u16,
            0x14 => self.write_status(value as u8),
            0x16 => self.queue_select = value as u16,
            _ => {
                let Some(q) = self.selected() else { return };
                match offset {
                    0x18 => q.size = value as u16,
                    0x1A => q.msix = value as u16,
                    0x1C => q.enable = value as u16,
                    0x20 | 0x24 => set_half(&mut q.desc, offset - 0x20, width, value),
                    0x28 | 0x2C => set_half(&mut q.driver, offset - 0x28, width, value),
                    0x30 | 0x34 => set_half(&mut q.device, offset - 0x30, width, value),
                    _ => {}
                }
            }
        }
    }

    fn read_device_config(&self, offset: usize, width: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw[..width].copy_from_slice(&self.device_config[offset..offset + width]);
        u64::from_le_bytes(raw)
    }

    /// Consume every newly available chain of queue `index`. Returns whether
    /// anything was placed on the used ring.
    fn service(&mut self, index: u16) -> bool {
        let Some(mut q) = self.queues.get(index as usize).copied() else {
            return false;
        };
        if q.enable == 0 || q.size == 0 {
            return false;
        }

        let mut serviced = false;
        // SAFETY: The ring addresses were programmed by the driver from
        // MockPlatform allocations, which are identity mapped and never freed.
        unsafe {
            let avail_idx = ptr::read_volatile((q.driver + 2) as *const u16);
            while q.last_avail != avail_idx {
                let ring = q.driver + 4 + 2 * (q.last_avail % q.size) as u64;
                let head = ptr::read_volatile(ring as *const u16);
                let written = self.execute(q.desc, head);

                let slot = q.device + 4 + 8 * (q.used_idx % q.size) as u64;
                ptr::write_volatile(slot as *mut u32, head as u32);
                ptr::write_volatile((slot + 4) as *mut u32, written);
                atomic::fence(Ordering::SeqCst);
                q.used_idx = q.used_idx.wrapping_add(1);
                ptr::write_volatile((q.device + 2) as *mut u16, q.used_idx);

                q.last_avail = q.last_avail.wrapping_add(1);
                serviced = true;
            }
        }

        self.queues[index as usize] = q;
        if serviced {
            self.isr |= IsrStatus::QUEUE.bits();
        }
        serviced
    }

    /// Decode the chain at `head`, write the response and return the number
    /// of bytes written.
    ///
    /// # Safety
    ///
    /// `desc_table` and every buffer address in the chain must be valid
    /// identity-mapped memory.
    unsafe fn execute(&mut self, desc_table: u64, head: u16) -> u32 {
        // SAFETY: Guaranteed by the caller.
        unsafe {
            let request = ptr::read_volatile((desc_table + 16 * head as u64) as *const VirtqDesc);
            assert_ne!(request.flags & VIRTQ_DESC_F_NEXT, 0, "request without a response descriptor");
            let response = ptr::read_volatile((desc_table + 16 * request.next as u64) as *const VirtqDesc);

            let hdr: VirtioGpuCtrlHdr = ptr::read_unaligned(request.addr as *const _);
            let mut command = GpuCommand {
                hdr_type: hdr.hdr_type,
                request_len: request.len,
                ..GpuCommand::default()
            };

            let known = match hdr.hdr_type {
                VIRTIO_GPU_CMD_GET_DISPLAY_INFO => true,
                VIRTIO_GPU_CMD_RESOURCE_CREATE_2D => {
                    let cmd: VirtioGpuResourceCreate2d = ptr::read_unaligned(request.addr as *const _);
                    command.resource_id = cmd.resource_id;
                    command.format = cmd.format;
                    command.width = cmd.width;
                    command.height = cmd.height;
                    true
                }
                VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING => {
                    let cmd: VirtioGpuResourceAttachBacking = ptr::read_unaligned(request.addr as *const _);
                    command.resource_id = cmd.resource_id;
                    if cmd.nr_entries > 0 && request.len as usize >= size_of::<AttachBackingRequest>() {
                        let entry: VirtioGpuMemEntry = ptr::read_unaligned(
                            (request.addr + size_of::<VirtioGpuResourceAttachBacking>() as u64) as *const _,
                        );
                        command.backing = Some((entry.addr, entry.length));
                        self.backing = command.backing;
                    }
                    true
                }
                VIRTIO_GPU_CMD_SET_SCANOUT => {
                    let cmd: VirtioGpuSetScanout = ptr::read_unaligned(request.addr as *const _);
                    command.rect = cmd.rect;
                    command.scanout_id = cmd.scanout_id;
                    command.resource_id = cmd.resource_id;
                    true
                }
                VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D => {
                    let cmd: VirtioGpuTransferToHost2d = ptr::read_unaligned(request.addr as *const _);
                    command.rect = cmd.rect;
                    command.offset = cmd.offset;
                    command.resource_id = cmd.resource_id;
                    command.uniform_pixel = self.backing.and_then(|(addr, len)| {
                        let pixels = core::slice::from_raw_parts(addr as *const u32, len as usize / 4);
                        let first = *pixels.first()?;
                        pixels.iter().all(|&p| p == first).then_some(first)
                    });
                    true
                }
                VIRTIO_GPU_CMD_RESOURCE_FLUSH => {
                    let cmd: VirtioGpuResourceFlush = ptr::read_unaligned(request.addr as *const _);
                    command.rect = cmd.rect;
                    command.resource_id = cmd.resource_id;
                    true
                }
                _ => false,
            };
            self.commands.push(command);

            let resp_type = match self.failures.get(&hdr.hdr_type) {
                Some(&code) => code,
                None if hdr.hdr_type == VIRTIO_GPU_CMD_GET_DISPLAY_INFO => VIRTIO_GPU_RESP_OK_DISPLAY_INFO,
                None if known => VIRTIO_GPU_RESP_OK_NODATA,
                None => VIRTIO_GPU_RESP_ERR_UNSPEC,
            };

            if resp_type == VIRTIO_GPU_RESP_OK_DISPLAY_INFO
                && response.len as usize >= size_of::<VirtioGpuRespDisplayInfo>()
            {
                let mut info = VirtioGpuRespDisplayInfo {
                    hdr: VirtioGpuCtrlHdr::new(resp_type),
                    pmodes: [VirtioGpuDisplayOne::default(); VIRTIO_GPU_MAX_SCANOUTS],
                };
                info.pmodes[0] = VirtioGpuDisplayOne {
                    rect: VirtioGpuRect::new(0, 0, 1024, 768),
                    enabled: 1,
                    flags: 0,
                };
                ptr::write_unaligned(response.addr as *mut VirtioGpuRespDisplayInfo, info);
                size_of::<VirtioGpuRespDisplayInfo>() as u32
            } else {
                ptr::write_unaligned(response.addr as *mut VirtioGpuCtrlHdr, VirtioGpuCtrlHdr::new(resp_type));
                size_of::<VirtioGpuCtrlHdr>() as u32
            }
        }
    }
}

fn half(value: u64, offset: usize, width: usize) -> u64 {
    match (offset, width) {
        (0, 8) => value,
        (0, _) => value & 0xFFFF_FFFF,
        _ => value >> 32,
    }
}

fn set_half(field: &mut u64, offset: usize, width: usize, value: u64) {
    match (offset, width) {
        (0, 8) => *field = value,
        (0, _) => *field = (*field & !0xFFFF_FFFF) | (value & 0xFFFF_FFFF),
        _ => *field = (*field & 0xFFFF_FFFF) | (value << 32),
    }
}

fn vendor_cap(next: u8, cap_len: u8, cfg_type: u8, offset: usize, length: usize) -> [u8; 16] {
    let mut raw = [0u8; 16];
    raw[..4].copy_from_slice(&[0x09, next, cap_len, cfg_type]);
    raw[8..12].copy_from_slice(&(offset as u32).to_le_bytes());
    raw[12..16].copy_from_slice(&(length as u32).to_le_bytes());
    raw
}

type InterruptHandler = Arc<dyn Fn() + Send + Sync>;

/// A modern virtio-gpu PCI function with two queues.
///
/// Capability chain: MSI-X at 0x40, then common 0x50, notify 0x60 (with its
/// multiplier), ISR 0x74, device 0x84 and PCI_CFG 0x94. All four windows
/// live in a 64-bit BAR0.
pub struct MockVirtioGpu {
    platform: &'static MockPlatform,
    state: Mutex<DeviceState>,
    interrupt: Mutex<Option<InterruptHandler>>,
}

impl MockVirtioGpu {
    pub const ADDRESS: PciAddress = PciAddress::new(0, 4, 0);
    pub const DEVICE_ID: u16 = 0x1050;
    pub const INTERRUPT_LINE: u8 = 11;
    pub const NOTIFY_MULTIPLIER: u32 = 4;
    pub const BAR_BASE: u64 = 0x0000_00FE_0000_0000;

    /// Plant the function on `platform`'s bus and back its BAR.
    pub fn install(platform: &'static MockPlatform) -> &'static Self {
        let gpu: &'static Self = Box::leak(Box::new(Self {
            platform,
            state: Mutex::new(DeviceState::new()),
            interrupt: Mutex::new(None),
        }));

        let bus = &platform.bus;
        let at = Self::ADDRESS;
        bus.add_function(at, VIRTIO_VENDOR_ID, Self::DEVICE_ID, class_codes::DISPLAY, 0x80);
        // 64-bit prefetchable memory BAR.
        bus.write_dword(at, 0x10, Self::BAR_BASE as u32 | 0xC);
        bus.write_dword(at, 0x14, (Self::BAR_BASE >> 32) as u32);
        bus.write_byte(at, 0x3C, Self::INTERRUPT_LINE);

        bus.plant_capability(at, 0x40, &[0x11, 0x50, 0x0C, 0x80]);
        bus.plant_capability(at, 0x50, &vendor_cap(0x60, 16, pci_cap::COMMON_CFG, COMMON_AT, COMMON_LEN));
        bus.plant_capability(at, 0x60, &vendor_cap(0x74, 20, pci_cap::NOTIFY_CFG, NOTIFY_AT, NOTIFY_LEN));
        bus.plant_capability(at, 0x70, &Self::NOTIFY_MULTIPLIER.to_le_bytes());
        bus.plant_capability(at, 0x74, &vendor_cap(0x84, 16, pci_cap::ISR_CFG, ISR_AT, ISR_LEN));
        bus.plant_capability(at, 0x84, &vendor_cap(0x94, 16, pci_cap::DEVICE_CFG, DEVICE_AT, DEVICE_LEN));
        bus.plant_capability(at, 0x94, &vendor_cap(0x00, 20, pci_cap::PCI_CFG, 0, 0));
        bus.link_capabilities(at, 0x40);

        platform.attach_registers(Self::BAR_BASE, BAR_LEN, gpu);
        gpu
    }

    /// Append a second, larger common-configuration capability after
    /// PCI_CFG.
    pub fn add_duplicate_common_capability(&self) {
        let bus = &self.platform.bus;
        bus.plant_capability(Self::ADDRESS, 0xA8, &vendor_cap(0x00, 16, pci_cap::COMMON_CFG, COMMON_AT, 0x40));
        bus.write_byte(Self::ADDRESS, 0x95, 0xA8);
    }

    /// Unlink the first vendor capability of `cfg_type` from the chain.
    pub fn drop_capability(&self, cfg_type: u8) {
        let bus = &self.platform.bus;
        let mut link = 0x34u16;
        loop {
            let at = bus.read_byte(Self::ADDRESS, link) as u16;
            if at == 0 {
                return;
            }
            if bus.read_byte(Self::ADDRESS, at) == 0x09 && bus.read_byte(Self::ADDRESS, at + 3) == cfg_type {
                let next = bus.read_byte(Self::ADDRESS, at + 1);
                bus.write_byte(Self::ADDRESS, link, next);
                return;
            }
            link = at + 1;
        }
    }

    pub fn clear_capability_list(&self) {
        let bus = &self.platform.bus;
        let status = bus.read_word(Self::ADDRESS, 0x06);
        bus.write_word(Self::ADDRESS, 0x06, status & !status_flags::CAPABILITIES_LIST);
    }

    pub fn set_interrupt_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.interrupt.lock() = Some(Arc::new(handler));
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.state.lock().status)
    }

    /// Every value written to device_status, in order.
    pub fn status_writes(&self) -> Vec<u8> {
        self.state.lock().status_writes.clone()
    }

    pub fn driver_features(&self) -> u64 {
        let state = self.state.lock();
        state.driver_features[0] as u64 | (state.driver_features[1] as u64) << 32
    }

    pub fn msix_config(&self) -> u16 {
        self.state.lock().msix_config
    }

    pub fn queue_enable(&self, index: usize) -> u16 {
        self.state.lock().queues[index].enable
    }

    pub fn queue_size(&self, index: usize) -> u16 {
        self.state.lock().queues[index].size
    }

    pub fn queue_msix(&self, index: usize) -> u16 {
        self.state.lock().queues[index].msix
    }

    /// Refuse FEATURES_OK: the bit reads back clear after the driver sets it.
    pub fn reject_features_ok(&self, reject: bool) {
        self.state.lock().reject_features_ok = reject;
    }

    /// Advertise `count` queues in `num_queues`; only the first two exist.
    pub fn set_num_queues(&self, count: u16) {
        self.state.lock().num_queues = count;
    }

    pub fn raise_needs_reset(&self) {
        self.state.lock().status |= DeviceStatus::NEEDS_RESET.bits();
    }

    /// Change num_scanouts in device configuration and bump the generation.
    pub fn set_num_scanouts(&self, count: u32) {
        let mut state = self.state.lock();
        state.device_config[NUM_SCANOUTS_AT..NUM_SCANOUTS_AT + 4].copy_from_slice(&count.to_le_bytes());
        state.config_generation = state.config_generation.wrapping_add(1);
    }

    pub fn raise_isr(&self, bits: IsrStatus) {
        self.state.lock().isr |= bits.bits();
    }

    /// Current ISR bits without acknowledging them.
    pub fn isr(&self) -> IsrStatus {
        IsrStatus::from_bits_retain(self.state.lock().isr)
    }

    /// Answer every future `command` with response type `resp`.
    pub fn fail_command(&self, command: u32, resp: u32) {
        self.state.lock().failures.insert(command, resp);
    }

    pub fn commands(&self) -> Vec<GpuCommand> {
        self.state.lock().commands.clone()
    }

    /// Doorbell writes as (offset in the notify window, value).
    pub fn notifies(&self) -> Vec<(usize, u16)> {
        self.state.lock().notifies.clone()
    }

    /// When set, doorbells are only recorded; [`complete_pending`] services
    /// them later.
    ///
    /// [`complete_pending`]: Self::complete_pending
    pub fn set_deferred(&self, deferred: bool) {
        self.state.lock().deferred = deferred;
    }

    /// Service every doorbell recorded in deferred mode and raise the
    /// interrupt if anything completed.
    pub fn complete_pending(&self) {
        let serviced = {
            let mut state = self.state.lock();
            let pending: Vec<u16> = state.pending.drain(..).collect();
            pending.into_iter().fold(false, |any, queue| state.service(queue) | any)
        };
        if serviced {
            self.fire_interrupt();
        }
    }

    fn notify(&self, offset: usize, value: u16) {
        {
            let mut state = self.state.lock();
            state.notifies.push((offset, value));
            assert_eq!(
                offset,
                value as usize * Self::NOTIFY_MULTIPLIER as usize,
                "doorbell for queue {} at wrong offset",
                value
            );
            if state.deferred {
                state.pending.push(value);
                return;
            }
            if !state.service(value) {
                return;
            }
        }
        self.fire_interrupt();
    }

    fn fire_interrupt(&self) {
        let handler = self.interrupt.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl RegisterFile for MockVirtioGpu {
    fn read(&self, offset: usize, width: usize) -> u64 {
        let mut state = self.state.lock();
        match offset & !0xFFF {
            COMMON_AT => state.read_common(offset - COMMON_AT, width),
            ISR_AT => core::mem::take(&mut state.isr) as u64,
            DEVICE_AT => state.read_device_config(offset - DEVICE_AT, width),
            _ => 0,
        }
    }

    fn write(&self, offset: usize, width: usize, value: u64) {
        match offset & !0xFFF {
            NOTIFY_AT => self.notify(offset - NOTIFY_AT, value as u16),
            COMMON_AT => self.state.lock().write_common(offset - COMMON_AT, width, value),
            _ => {}
        }
    }
}
