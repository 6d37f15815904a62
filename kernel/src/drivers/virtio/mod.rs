//! Virtio subsystem -- PCI transport, split virtqueues and the GPU driver.
//!
//! # Architecture
//!
//! ```text
//!   VirtioRegistry                  -- process-wide device table, interrupt entry
//!     |
//!     +-- VirtioDevice              -- one PCI function (transport.rs negotiates it)
//!           |-- four Mmio windows   -- common / notify / ISR / device config
//!           |-- Vec<Virtqueue>      -- split rings (queue.rs)
//!           +-- CompletionSink      -- whoever owns the device (gpu.rs)
//! ```
//!
//! # Modern PCI common configuration layout
//!
//! | Offset | Size | Name                  |
//! |--------|------|-----------------------|
//! | 0x00   | 4    | device_feature_select |
//! | 0x04   | 4    | device_feature        |
//! | 0x08   | 4    | driver_feature_select |
//! | 0x0C   | 4    | driver_feature        |
//! | 0x10   | 2    | msix_config           |
//! | 0x12   | 2    | num_queues            |
//! | 0x14   | 1    | device_status         |
//! | 0x15   | 1    | config_generation     |
//! | 0x16   | 2    | queue_select          |
//! | 0x18   | 2    | queue_size            |
//! | 0x1A   | 2    | queue_msix_vector     |
//! | 0x1C   | 2    | queue_enable          |
//! | 0x1E   | 2    | queue_notify_off      |
//! | 0x20   | 8    | queue_desc            |
//! | 0x28   | 8    | queue_driver          |
//! | 0x30   | 8    | queue_device          |

pub mod gpu;
pub mod queue;
pub mod transport;

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;

pub use self::{
    queue::{RingLayout, Virtqueue},
    transport::{identify_capabilities, CapabilityWindows},
};
use crate::{
    drivers::pci::{self, PciAddress},
    error::{KernelError, KernelResult},
    platform::{Mmio, Platform},
};

/// Virtio vendor ID (Red Hat, Inc.)
pub const VIRTIO_VENDOR_ID: u16 = 0x1AF4;

/// Modern (non-transitional) PCI device IDs are this base plus the device
/// kind.
pub const VIRTIO_MODERN_DEVICE_BASE: u16 = 0x1040;

/// Maximum number of devices the registry tracks.
pub const MAX_VIRTIO_DEVICES: usize = 4;

/// Maximum number of virtqueues per device.
pub const MAX_VIRTQUEUES: u16 = 4;

/// "No MSI-X vector" marker for msix_config and queue_msix_vector.
pub const NO_VECTOR: u16 = 0xFFFF;

/// Virtio device kinds (added to [`VIRTIO_MODERN_DEVICE_BASE`])
pub mod device_kind {
    pub const NET: u16 = 1;
    pub const BLOCK: u16 = 2;
    pub const CONSOLE: u16 = 3;
    pub const GPU: u16 = 16;
    pub const INPUT: u16 = 18;
}

/// `cfg_type` values of virtio PCI capabilities
pub mod pci_cap {
    pub const COMMON_CFG: u8 = 1;
    pub const NOTIFY_CFG: u8 = 2;
    pub const ISR_CFG: u8 = 3;
    pub const DEVICE_CFG: u8 = 4;
    pub const PCI_CFG: u8 = 5;
}

/// Common configuration register offsets
pub mod common_cfg {
    pub const DEVICE_FEATURE_SELECT: usize = 0x00;
    pub const DEVICE_FEATURE: usize = 0x04;
    pub const DRIVER_FEATURE_SELECT: usize = 0x08;
    pub const DRIVER_FEATURE: usize = 0x0C;
    pub const MSIX_CONFIG: usize = 0x10;
    pub const NUM_QUEUES: usize = 0x12;
    pub const DEVICE_STATUS: usize = 0x14;
    pub const CONFIG_GENERATION: usize = 0x15;
    pub const QUEUE_SELECT: usize = 0x16;
    pub const QUEUE_SIZE: usize = 0x18;
    pub const QUEUE_MSIX_VECTOR: usize = 0x1A;
    pub const QUEUE_ENABLE: usize = 0x1C;
    pub const QUEUE_NOTIFY_OFF: usize = 0x1E;
    pub const QUEUE_DESC: usize = 0x20;
    pub const QUEUE_DRIVER: usize = 0x28;
    pub const QUEUE_DEVICE: usize = 0x30;
    /// Size of the structure
    pub const SIZE: usize = 0x38;
}

bitflags! {
    /// Device status byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        /// Guest OS has found the device and recognized it as a valid virtio
        /// device.
        const ACKNOWLEDGE = 1;
        /// Guest OS knows how to drive the device.
        const DRIVER = 2;
        /// Driver is ready.
        const DRIVER_OK = 4;
        /// Feature negotiation is complete.
        const FEATURES_OK = 8;
        /// Something went wrong; device has given up on the driver.
        const NEEDS_RESET = 64;
        /// Driver has given up on the device.
        const FAILED = 128;
    }
}

bitflags! {
    /// ISR status byte (reading it acknowledges the interrupt)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IsrStatus: u8 {
        /// Used buffers were returned on some queue.
        const QUEUE = 1;
        /// Device-specific configuration changed.
        const CONFIG = 2;
    }
}

/// Where a device is in the driver-side initialization sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NegotiationState {
    Discovered,
    CapabilitiesMapped,
    Acknowledged,
    DriverKnown,
    FeaturesOffered,
    FeaturesOk,
    QueuesConfigured,
    DriverOk,
    Failed,
}

impl NegotiationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::CapabilitiesMapped => "capabilities mapped",
            Self::Acknowledged => "acknowledged",
            Self::DriverKnown => "driver known",
            Self::FeaturesOffered => "features offered",
            Self::FeaturesOk => "features ok",
            Self::QueuesConfigured => "queues configured",
            Self::DriverOk => "driver ok",
            Self::Failed => "failed",
        }
    }
}

/// Receives used-buffer interrupts for a device.
///
/// Chosen when the device slot is created; called from interrupt context, so
/// implementations must not block or allocate.
pub trait CompletionSink: Send + Sync {
    fn on_virtqs_update(&self, device: &VirtioDevice);
}

/// Advances every queue's completion cursor. A used index that jumped by
/// more than one is unrecoverable and faults.
#[derive(Debug, Default)]
pub struct SplitQueueCompletion;

impl SplitQueueCompletion {
    pub fn reap(device: &VirtioDevice) {
        for queue in device.queues() {
            if let Err(err) = queue.reap_used() {
                log::error!("[VIRTIO] {} queue {}: {}", device.address(), queue.index(), err);
                panic!("virtio device {} violated the used ring protocol", device.address());
            }
        }
    }
}

impl CompletionSink for SplitQueueCompletion {
    fn on_virtqs_update(&self, device: &VirtioDevice) {
        Self::reap(device);
    }
}

/// A negotiated (or negotiating) virtio PCI device.
pub struct VirtioDevice {
    address: PciAddress,
    device_id: u16,
    common: Box<dyn Mmio>,
    notify: Box<dyn Mmio>,
    isr: Box<dyn Mmio>,
    device_cfg: Box<dyn Mmio>,
    notify_off_multiplier: u32,
    cfg_generation: AtomicU8,
    queues: Vec<Virtqueue>,
    sink: Arc<dyn CompletionSink>,
    state: spin::Mutex<NegotiationState>,
    interrupt_line: u8,
}

impl VirtioDevice {
    pub fn new(
        address: PciAddress,
        device_id: u16,
        windows: CapabilityWindows,
        sink: Arc<dyn CompletionSink>,
        interrupt_line: u8,
    ) -> Self {
        Self {
            address,
            device_id,
            common: windows.common,
            notify: windows.notify,
            isr: windows.isr,
            device_cfg: windows.device,
            notify_off_multiplier: windows.notify_off_multiplier,
            cfg_generation: AtomicU8::new(0),
            queues: Vec::new(),
            sink,
            state: spin::Mutex::new(NegotiationState::CapabilitiesMapped),
            interrupt_line,
        }
    }

    pub fn address(&self) -> PciAddress {
        self.address
    }

    pub fn device_id(&self) -> u16 {
        self.device_id
    }

    pub fn interrupt_line(&self) -> u8 {
        self.interrupt_line
    }

    pub fn notify_off_multiplier(&self) -> u32 {
        self.notify_off_multiplier
    }

    /// Window lengths as (common, notify, isr, device).
    pub fn window_lengths(&self) -> (usize, usize, usize, usize) {
        (
            self.common.len(),
            self.notify.len(),
            self.isr.len(),
            self.device_cfg.len(),
        )
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.lock()
    }

    fn set_state(&self, state: NegotiationState) {
        *self.state.lock() = state;
    }

    pub fn queues(&self) -> &[Virtqueue] {
        &self.queues
    }

    pub fn queue(&self, index: u16) -> KernelResult<&Virtqueue> {
        self.queues.get(index as usize).ok_or(KernelError::NotFound {
            resource: "virtqueue",
            id: index as u64,
        })
    }

    pub fn sink(&self) -> &dyn CompletionSink {
        &*self.sink
    }

    /// Read (and thereby acknowledge) the ISR status byte.
    pub fn read_isr(&self) -> IsrStatus {
        IsrStatus::from_bits_truncate(self.isr.read8(0))
    }

    /// Publish a two-descriptor request on `queue` and notify the device.
    pub fn post(&self, queue: u16, buffer: u64, total_size: u32, response_offset: u32) -> KernelResult<()> {
        self.queue(queue)?.post(&*self.notify, buffer, total_size, response_offset)
    }

    /// Submit a request on `queue` and busy-wait for the device to complete
    /// it.
    pub fn submit(&self, queue: u16, buffer: u64, total_size: u32, response_offset: u32) -> KernelResult<()> {
        self.queue(queue)?.submit(&*self.notify, buffer, total_size, response_offset)
    }
}

impl core::fmt::Debug for VirtioDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VirtioDevice")
            .field("address", &self.address)
            .field("device_id", &self.device_id)
            .field("state", &self.state())
            .field("queues", &self.queues.len())
            .finish()
    }
}

/// Slot in the registry reserved by [`VirtioRegistry::create_device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceHandle(usize);

impl DeviceHandle {
    pub fn slot(&self) -> usize {
        self.0
    }
}

/// Process-wide virtio device table.
///
/// Slots are reserved at creation time and filled once initialization
/// succeeds; the interrupt entry only ever sees fully negotiated devices.
pub struct VirtioRegistry {
    platform: &'static dyn Platform,
    reserved: AtomicUsize,
    sinks: spin::Mutex<[Option<Arc<dyn CompletionSink>>; MAX_VIRTIO_DEVICES]>,
    devices: spin::RwLock<[Option<Arc<VirtioDevice>>; MAX_VIRTIO_DEVICES]>,
}

impl VirtioRegistry {
    pub fn new(platform: &'static dyn Platform) -> Self {
        Self {
            platform,
            reserved: AtomicUsize::new(0),
            sinks: spin::Mutex::new(core::array::from_fn(|_| None)),
            devices: spin::RwLock::new(core::array::from_fn(|_| None)),
        }
    }

    pub fn platform(&self) -> &'static dyn Platform {
        self.platform
    }

    /// Reserve a device slot whose interrupts go to `sink`. `None` when the
    /// table is full.
    pub fn create_device(&self, sink: Arc<dyn CompletionSink>) -> Option<DeviceHandle> {
        let slot = self
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < MAX_VIRTIO_DEVICES).then_some(n + 1))
            .ok()?;
        self.sinks.lock()[slot] = Some(sink);
        Some(DeviceHandle(slot))
    }

    /// Find the device of kind `device_kind`, map its capabilities and run
    /// the full negotiation. The device is published to the interrupt path
    /// only on success.
    pub fn init_device(&self, handle: DeviceHandle, device_kind: u16) -> KernelResult<Arc<VirtioDevice>> {
        if self.devices.read()[handle.0].is_some() {
            return Err(KernelError::InvalidState {
                expected: "empty device slot",
                actual: "device already initialized",
            });
        }
        let sink = self.sinks.lock()[handle.0].clone().ok_or(KernelError::NotFound {
            resource: "virtio device slot",
            id: handle.0 as u64,
        })?;

        let config = self.platform.config_space();
        let device_id = VIRTIO_MODERN_DEVICE_BASE + device_kind;
        let address = pci::find_device_by_id(config, VIRTIO_VENDOR_ID, device_id)
            .found()
            .ok_or(KernelError::NotFound {
                resource: "virtio pci device",
                id: device_id as u64,
            })?;
        log::info!("[VIRTIO] Found device {:04x}:{:04x} at {}", VIRTIO_VENDOR_ID, device_id, address);

        self.bring_up(handle, address, device_id, sink)
    }

    /// Reset a published device and run the whole initialization sequence
    /// again, as the device asks for when it raises NEEDS_RESET.
    ///
    /// The old device leaves the interrupt path before the reset. Holders of
    /// the old `Arc` must switch to the returned one; the old queues are
    /// never serviced again. On failure the slot is left empty and
    /// [`init_device`](Self::init_device) may retry.
    pub fn restart_device(&self, handle: DeviceHandle) -> KernelResult<Arc<VirtioDevice>> {
        let old = self.devices.write()[handle.0].take().ok_or(KernelError::InvalidState {
            expected: "initialized device",
            actual: "empty device slot",
        })?;
        let sink = old.sink.clone();
        log::warn!("[VIRTIO] {}: restarting (status {:?})", old.address(), old.status());
        old.reset();

        self.bring_up(handle, old.address(), old.device_id(), sink)
    }

    /// Map, negotiate and publish the device at `address` in slot `handle`.
    fn bring_up(
        &self,
        handle: DeviceHandle,
        address: PciAddress,
        device_id: u16,
        sink: Arc<dyn CompletionSink>,
    ) -> KernelResult<Arc<VirtioDevice>> {
        let config = self.platform.config_space();
        pci::enable_device(config, address);
        let windows = identify_capabilities(self.platform, address)?;
        let line = pci::interrupt_line(config, address);

        let mut device = VirtioDevice::new(address, device_id, windows, sink, line);
        device.negotiate(self.platform)?;

        let device = Arc::new(device);
        self.devices.write()[handle.0] = Some(device.clone());

        if line != 0xFF {
            self.platform.unmask_interrupt(line);
        }
        log::info!(
            "[VIRTIO] Device {} live with {} queue(s), irq {}",
            address,
            device.queues().len(),
            line
        );
        Ok(device)
    }

    pub fn device(&self, handle: DeviceHandle) -> Option<Arc<VirtioDevice>> {
        self.devices.read()[handle.0].clone()
    }

    /// Interrupt entry: acknowledge each device's ISR and dispatch used-buffer
    /// notifications. Never blocks; if the table is being written the
    /// interrupt is left for the next poll.
    pub fn handle_interrupt(&self) {
        let Some(devices) = self.devices.try_read() else {
            return;
        };

        for device in devices.iter().flatten() {
            let isr = device.read_isr();
            if isr.contains(IsrStatus::QUEUE) {
                device.sink().on_virtqs_update(device);
            }
            if isr.contains(IsrStatus::CONFIG) {
                log::debug!("[VIRTIO] {}: configuration changed", device.address());
            }
        }
    }
}

static REGISTRY: spin::Once<VirtioRegistry> = spin::Once::new();

/// Create the process-wide registry.
pub fn init(platform: &'static dyn Platform) -> KernelResult<&'static VirtioRegistry> {
    let mut created = false;
    let registry = REGISTRY.call_once(|| {
        created = true;
        VirtioRegistry::new(platform)
    });
    if !created {
        return Err(KernelError::InvalidState {
            expected: "uninitialized virtio registry",
            actual: "already initialized",
        });
    }
    Ok(registry)
}

pub fn registry() -> KernelResult<&'static VirtioRegistry> {
    REGISTRY.get().ok_or(KernelError::InvalidState {
        expected: "initialized virtio registry",
        actual: "uninitialized",
    })
}

pub fn create_device(sink: Arc<dyn CompletionSink>) -> Option<DeviceHandle> {
    registry().ok()?.create_device(sink)
}

pub fn init_device(handle: DeviceHandle, device_kind: u16) -> KernelResult<Arc<VirtioDevice>> {
    registry()?.init_device(handle, device_kind)
}

/// Platform interrupt entry point.
pub fn intr() {
    if let Some(registry) = REGISTRY.get() {
        registry.handle_interrupt();
    }
}
