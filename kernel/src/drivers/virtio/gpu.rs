//! VirtIO GPU Driver
//!
//! Drives a virtio-gpu device through a fixed command script on the control
//! queue (queue 0):
//!
//! - **Setup** ([`GpuSession::init`]): GET_DISPLAY_INFO, RESOURCE_CREATE_2D,
//!   RESOURCE_ATTACH_BACKING, SET_SCANOUT
//! - **Per frame** ([`GpuSession::flush`]): TRANSFER_TO_HOST_2D then
//!   RESOURCE_FLUSH over the whole 640x400 resource
//!
//! Every request and response lives in one control page whose layout is
//! fixed at compile time ([`ControlPage`]); the pixel buffer follows it in
//! the same physically contiguous allocation.

use alloc::{sync::Arc, vec::Vec};
use core::{
    mem::{offset_of, size_of},
    ptr::{self, addr_of, addr_of_mut, NonNull},
    sync::atomic::{AtomicU64, Ordering},
};

use lazy_static::lazy_static;
use spin::Mutex;

use super::{device_kind, CompletionSink, DeviceHandle, SplitQueueCompletion, VirtioDevice, VirtioRegistry};
use crate::{
    error::{KernelError, KernelResult},
    mm::{class_size, DmaRegion, PAGE_SIZE},
};

// --- Command types ---

/// Get display info (returns display modes for all scanouts)
pub const VIRTIO_GPU_CMD_GET_DISPLAY_INFO: u32 = 0x100;
/// Create a 2D resource (host-side texture)
pub const VIRTIO_GPU_CMD_RESOURCE_CREATE_2D: u32 = 0x101;
/// Destroy a 2D resource
pub const VIRTIO_GPU_CMD_RESOURCE_UNREF: u32 = 0x102;
/// Set scanout (bind resource to display output)
pub const VIRTIO_GPU_CMD_SET_SCANOUT: u32 = 0x103;
/// Flush resource to display
pub const VIRTIO_GPU_CMD_RESOURCE_FLUSH: u32 = 0x104;
/// Transfer data from guest to host resource
pub const VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D: u32 = 0x105;
/// Attach backing store pages to a resource
pub const VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING: u32 = 0x106;

// --- Response types ---

/// Success, no data payload
pub const VIRTIO_GPU_RESP_OK_NODATA: u32 = 0x1100;
/// Success, display info payload
pub const VIRTIO_GPU_RESP_OK_DISPLAY_INFO: u32 = 0x1101;
/// Error: unspecified
pub const VIRTIO_GPU_RESP_ERR_UNSPEC: u32 = 0x1200;
/// Error: out of memory on host
pub const VIRTIO_GPU_RESP_ERR_OUT_OF_MEMORY: u32 = 0x1201;
/// Error: invalid scanout ID
pub const VIRTIO_GPU_RESP_ERR_INVALID_SCANOUT_ID: u32 = 0x1202;
/// Error: invalid resource ID
pub const VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID: u32 = 0x1203;
/// Error: invalid context ID
pub const VIRTIO_GPU_RESP_ERR_INVALID_CONTEXT_ID: u32 = 0x1204;
/// Error: invalid parameter
pub const VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER: u32 = 0x1205;

/// R8G8B8A8 (RGBA)
pub const FORMAT_R8G8B8A8_UNORM: u32 = 67;

pub const VIRTIO_GPU_MAX_SCANOUTS: usize = 16;

pub const FRAMEBUFFER_WIDTH: u32 = 640;
pub const FRAMEBUFFER_HEIGHT: u32 = 400;
pub const BYTES_PER_PIXEL: u32 = 4;
pub const FRAMEBUFFER_SIZE: usize = (FRAMEBUFFER_WIDTH * FRAMEBUFFER_HEIGHT * BYTES_PER_PIXEL) as usize;

/// Resource id of the one 2D resource the driver creates.
pub const FRAMEBUFFER_RESOURCE_ID: u32 = 1;
pub const SCANOUT_ID: u32 = 0;

/// Allocation class of the control page plus pixel buffer (1 MiB).
pub const CONTROL_PAGE_CLASS: u8 = 8;

const CONTROL_QUEUE: u16 = 0;

/// VirtIO GPU control header -- common prefix for all commands and responses.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtioGpuCtrlHdr {
    /// Command or response type
    pub hdr_type: u32,
    pub flags: u32,
    pub fence_id: u64,
    pub ctx_id: u32,
    pub padding: u32,
}

impl VirtioGpuCtrlHdr {
    pub fn new(hdr_type: u32) -> Self {
        Self {
            hdr_type,
            ..Self::default()
        }
    }
}

/// Rectangle structure for GPU commands.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtioGpuRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl VirtioGpuRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The whole framebuffer resource.
    pub fn full() -> Self {
        Self::new(0, 0, FRAMEBUFFER_WIDTH, FRAMEBUFFER_HEIGHT)
    }
}

/// Display mode information for one scanout.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtioGpuDisplayOne {
    pub rect: VirtioGpuRect,
    pub enabled: u32,
    pub flags: u32,
}

/// Response to GET_DISPLAY_INFO command.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VirtioGpuRespDisplayInfo {
    pub hdr: VirtioGpuCtrlHdr,
    pub pmodes: [VirtioGpuDisplayOne; VIRTIO_GPU_MAX_SCANOUTS],
}

/// RESOURCE_CREATE_2D command structure.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VirtioGpuResourceCreate2d {
    pub hdr: VirtioGpuCtrlHdr,
    pub resource_id: u32,
    pub format: u32,
    pub width: u32,
    pub height: u32,
}

/// RESOURCE_ATTACH_BACKING command header; `nr_entries` memory entries
/// follow it.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VirtioGpuResourceAttachBacking {
    pub hdr: VirtioGpuCtrlHdr,
    pub resource_id: u32,
    pub nr_entries: u32,
}

/// Guest memory entry for backing storage.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VirtioGpuMemEntry {
    pub addr: u64,
    pub length: u32,
    pub padding: u32,
}

/// ATTACH_BACKING with its single memory entry, as sent on the wire.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AttachBackingRequest {
    pub cmd: VirtioGpuResourceAttachBacking,
    pub entry: VirtioGpuMemEntry,
}

/// SET_SCANOUT command structure.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VirtioGpuSetScanout {
    pub hdr: VirtioGpuCtrlHdr,
    pub rect: VirtioGpuRect,
    pub scanout_id: u32,
    pub resource_id: u32,
}

/// TRANSFER_TO_HOST_2D command structure.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VirtioGpuTransferToHost2d {
    pub hdr: VirtioGpuCtrlHdr,
    pub rect: VirtioGpuRect,
    pub offset: u64,
    pub resource_id: u32,
    pub padding: u32,
}

/// RESOURCE_FLUSH command structure.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VirtioGpuResourceFlush {
    pub hdr: VirtioGpuCtrlHdr,
    pub rect: VirtioGpuRect,
    pub resource_id: u32,
    pub padding: u32,
}

/// A request immediately followed by the space for its response; submitted
/// as one two-descriptor chain.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Exchange<Q, R> {
    pub req: Q,
    pub resp: R,
}

/// Layout of the shared control page.
#[repr(C)]
pub struct ControlPage {
    pub display_info: Exchange<VirtioGpuCtrlHdr, VirtioGpuRespDisplayInfo>,
    pub create: Exchange<VirtioGpuResourceCreate2d, VirtioGpuCtrlHdr>,
    pub attach: Exchange<AttachBackingRequest, VirtioGpuCtrlHdr>,
    pub scanout: Exchange<VirtioGpuSetScanout, VirtioGpuCtrlHdr>,
    pub transfer: Exchange<VirtioGpuTransferToHost2d, VirtioGpuCtrlHdr>,
    pub flush: Exchange<VirtioGpuResourceFlush, VirtioGpuCtrlHdr>,
}

// Wire sizes; every struct is a multiple of 8 bytes, so repr(C) adds no
// padding anywhere in the page.
const _: () = {
    assert!(size_of::<VirtioGpuCtrlHdr>() == 24);
    assert!(size_of::<VirtioGpuRect>() == 16);
    assert!(size_of::<VirtioGpuDisplayOne>() == 24);
    assert!(size_of::<VirtioGpuRespDisplayInfo>() == 408);
    assert!(size_of::<VirtioGpuResourceCreate2d>() == 40);
    assert!(size_of::<VirtioGpuResourceAttachBacking>() == 32);
    assert!(size_of::<VirtioGpuMemEntry>() == 16);
    assert!(size_of::<VirtioGpuSetScanout>() == 48);
    assert!(size_of::<VirtioGpuTransferToHost2d>() == 56);
    assert!(size_of::<VirtioGpuResourceFlush>() == 48);
    assert!(size_of::<ControlPage>() <= PAGE_SIZE);
    assert!(PAGE_SIZE + FRAMEBUFFER_SIZE <= class_size(CONTROL_PAGE_CLASS));
};

/// Convert a VirtIO GPU response type to a KernelError.
pub fn response_to_error(resp_type: u32) -> KernelError {
    match resp_type {
        VIRTIO_GPU_RESP_ERR_UNSPEC
        | VIRTIO_GPU_RESP_ERR_OUT_OF_MEMORY
        | VIRTIO_GPU_RESP_ERR_INVALID_SCANOUT_ID
        | VIRTIO_GPU_RESP_ERR_INVALID_RESOURCE_ID
        | VIRTIO_GPU_RESP_ERR_INVALID_CONTEXT_ID
        | VIRTIO_GPU_RESP_ERR_INVALID_PARAMETER => KernelError::HardwareError {
            device: "virtio-gpu",
            code: resp_type,
        },
        _ => KernelError::ProtocolError {
            reason: "unexpected virtio-gpu response type",
            offset: 0,
        },
    }
}

fn check_response(hdr: &VirtioGpuCtrlHdr, expected: u32) -> KernelResult<()> {
    if hdr.hdr_type == expected {
        Ok(())
    } else {
        Err(response_to_error(hdr.hdr_type))
    }
}

/// The GPU's completion sink: counts used-buffer interrupts and advances
/// the queue cursors.
#[derive(Debug, Default)]
pub struct GpuCompletion {
    completions: AtomicU64,
}

impl GpuCompletion {
    pub fn completions(&self) -> u64 {
        self.completions.load(Ordering::Acquire)
    }
}

impl CompletionSink for GpuCompletion {
    fn on_virtqs_update(&self, device: &VirtioDevice) {
        self.completions.fetch_add(1, Ordering::AcqRel);
        SplitQueueCompletion::reap(device);
    }
}

/// Mutable view of the pixel buffer: row-major, 4 bytes per pixel.
pub struct Framebuffer<'a> {
    pixels: &'a mut [u32],
}

impl Framebuffer<'_> {
    pub fn width(&self) -> u32 {
        FRAMEBUFFER_WIDTH
    }

    pub fn height(&self) -> u32 {
        FRAMEBUFFER_HEIGHT
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        (FRAMEBUFFER_WIDTH * BYTES_PER_PIXEL) as usize
    }

    pub fn as_mut_slice(&mut self) -> &mut [u32] {
        self.pixels
    }

    pub fn fill(&mut self, pixel: u32) {
        self.pixels.fill(pixel);
    }
}

struct Live {
    device: Arc<VirtioDevice>,
    page: DmaRegion,
}

/// Setup commands acknowledged by the device, in script order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Setup {
    Nothing,
    DisplayInfo,
    Resource,
    Backing,
    Scanout,
}

/// One virtio-gpu device driven through the fixed command script.
///
/// The control page is allocated by the first `init` and kept for the life
/// of the session. A failed `init` keeps the steps that succeeded, so a
/// retry resumes at the step that failed.
pub struct GpuSession {
    completion: Arc<GpuCompletion>,
    handle: Option<DeviceHandle>,
    live: Option<Live>,
    setup: Setup,
    scanouts: Vec<VirtioGpuDisplayOne>,
}

impl Default for GpuSession {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuSession {
    pub fn new() -> Self {
        Self {
            completion: Arc::new(GpuCompletion::default()),
            handle: None,
            live: None,
            setup: Setup::Nothing,
            scanouts: Vec::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.setup == Setup::Scanout
    }

    pub fn completion(&self) -> &GpuCompletion {
        &self.completion
    }

    /// Enabled scanouts reported by GET_DISPLAY_INFO.
    pub fn display_info(&self) -> &[VirtioGpuDisplayOne] {
        &self.scanouts
    }

    pub fn device(&self) -> Option<&Arc<VirtioDevice>> {
        self.live.as_ref().map(|live| &live.device)
    }

    /// Registry slot reserved by the first [`init`](Self::init).
    pub fn handle(&self) -> Option<DeviceHandle> {
        self.handle
    }

    /// Physical address of the control page, once allocated.
    pub fn control_page_phys(&self) -> Option<u64> {
        self.live.as_ref().map(|live| live.page.phys())
    }

    fn ready(&self) -> Option<&Live> {
        self.live.as_ref().filter(|_| self.is_initialized())
    }

    /// Bring up the device and run the setup script. A no-op once it has
    /// succeeded, unless the device has been restarted since.
    pub fn init(&mut self, registry: &VirtioRegistry) -> KernelResult<()> {
        let handle = match self.handle {
            Some(handle) => handle,
            None => {
                let handle = registry
                    .create_device(self.completion.clone())
                    .ok_or(KernelError::ResourceExhausted {
                        resource: "virtio device table",
                    })?;
                self.handle = Some(handle);
                handle
            }
        };

        let device = match registry.device(handle) {
            Some(device) => device,
            None => registry.init_device(handle, device_kind::GPU)?,
        };

        let live = match &mut self.live {
            Some(live) => {
                if !Arc::ptr_eq(&live.device, &device) {
                    // A restarted device has forgotten every resource.
                    live.device = device;
                    self.setup = Setup::Nothing;
                }
                live
            }
            slot @ None => {
                let page = registry.platform().allocate_contiguous_zeroed(CONTROL_PAGE_CLASS)?;
                if page.len() < PAGE_SIZE + FRAMEBUFFER_SIZE {
                    return Err(KernelError::AllocationFailure {
                        requested: PAGE_SIZE + FRAMEBUFFER_SIZE,
                    });
                }
                slot.insert(Live { device, page })
            }
        };
        if self.setup == Setup::Scanout {
            return Ok(());
        }

        if self.setup < Setup::DisplayInfo {
            self.scanouts = live.get_display_info()?;
            for (i, mode) in self.scanouts.iter().enumerate() {
                log::info!(
                    "[VIRTIO-GPU] Scanout {}: {}x{} at ({}, {})",
                    i,
                    mode.rect.width,
                    mode.rect.height,
                    mode.rect.x,
                    mode.rect.y
                );
            }
            self.setup = Setup::DisplayInfo;
        }
        if self.setup < Setup::Resource {
            live.create_resource()?;
            self.setup = Setup::Resource;
        }
        if self.setup < Setup::Backing {
            live.attach_backing()?;
            self.setup = Setup::Backing;
        }
        live.set_scanout()?;
        self.setup = Setup::Scanout;

        log::info!(
            "[VIRTIO-GPU] Framebuffer {}x{} ready (resource {})",
            FRAMEBUFFER_WIDTH,
            FRAMEBUFFER_HEIGHT,
            FRAMEBUFFER_RESOURCE_ID
        );
        Ok(())
    }

    /// Push the whole framebuffer to the host and flush it to the display.
    pub fn flush(&self) -> KernelResult<()> {
        let live = self.ready().ok_or(KernelError::InvalidState {
            expected: "virtio_gpu_initialized",
            actual: "uninitialized",
        })?;
        live.transfer_to_host()?;
        live.resource_flush()
    }

    /// Raw pointer to the first pixel, `None` before a successful init.
    pub fn framebuffer_ptr(&self) -> Option<NonNull<u32>> {
        self.ready().and_then(|live| NonNull::new(live.framebuffer()))
    }

    pub fn framebuffer(&mut self) -> Option<Framebuffer<'_>> {
        let live = self.ready()?;
        // SAFETY: The pixel buffer is FRAMEBUFFER_SIZE bytes at PAGE_SIZE into
        // the control allocation (size checked in `init`), u32 aligned, and
        // borrowed mutably through `self` so no other view exists. The device
        // only reads it during TRANSFER_TO_HOST_2D, which needs `&self`.
        let pixels = unsafe {
            core::slice::from_raw_parts_mut(
                live.framebuffer(),
                (FRAMEBUFFER_WIDTH * FRAMEBUFFER_HEIGHT) as usize,
            )
        };
        Some(Framebuffer { pixels })
    }
}

impl Live {
    fn page(&self) -> *mut ControlPage {
        self.page.as_ptr().cast()
    }

    fn framebuffer(&self) -> *mut u32 {
        // SAFETY: PAGE_SIZE is inside the control allocation.
        unsafe { self.page.as_ptr().add(PAGE_SIZE).cast() }
    }

    /// Write `req` into the exchange at `offset` in the control page, submit
    /// it and return the device's response.
    fn exchange<Q: Copy, R: Copy>(&self, offset: usize, req: Q) -> KernelResult<R> {
        // SAFETY: `offset` is the offset_of! of an `Exchange<Q, R>` field of
        // ControlPage, which lies inside the page-aligned control allocation.
        let slot = unsafe { self.page().cast::<u8>().add(offset).cast::<Exchange<Q, R>>() };
        // SAFETY: `slot` is valid and aligned; the request half is
        // driver-owned until the chain is posted.
        let resp_at = unsafe {
            ptr::write_volatile(addr_of_mut!((*slot).req), req);
            addr_of!((*slot).resp) as usize - slot as usize
        };

        self.device.submit(
            CONTROL_QUEUE,
            self.page.phys() + offset as u64,
            size_of::<Exchange<Q, R>>() as u32,
            resp_at as u32,
        )?;

        // SAFETY: The device has completed the chain, so the response half is
        // back in driver ownership.
        Ok(unsafe { ptr::read_volatile(addr_of!((*slot).resp)) })
    }

    fn get_display_info(&self) -> KernelResult<Vec<VirtioGpuDisplayOne>> {
        let resp: VirtioGpuRespDisplayInfo = self.exchange(
            offset_of!(ControlPage, display_info),
            VirtioGpuCtrlHdr::new(VIRTIO_GPU_CMD_GET_DISPLAY_INFO),
        )?;
        check_response(&resp.hdr, VIRTIO_GPU_RESP_OK_DISPLAY_INFO)?;
        Ok(resp.pmodes.iter().copied().filter(|mode| mode.enabled != 0).collect())
    }

    fn create_resource(&self) -> KernelResult<()> {
        let resp: VirtioGpuCtrlHdr = self.exchange(
            offset_of!(ControlPage, create),
            VirtioGpuResourceCreate2d {
                hdr: VirtioGpuCtrlHdr::new(VIRTIO_GPU_CMD_RESOURCE_CREATE_2D),
                resource_id: FRAMEBUFFER_RESOURCE_ID,
                format: FORMAT_R8G8B8A8_UNORM,
                width: FRAMEBUFFER_WIDTH,
                height: FRAMEBUFFER_HEIGHT,
            },
        )?;
        check_response(&resp, VIRTIO_GPU_RESP_OK_NODATA)
    }

    fn attach_backing(&self) -> KernelResult<()> {
        let resp: VirtioGpuCtrlHdr = self.exchange(
            offset_of!(ControlPage, attach),
            AttachBackingRequest {
                cmd: VirtioGpuResourceAttachBacking {
                    hdr: VirtioGpuCtrlHdr::new(VIRTIO_GPU_CMD_RESOURCE_ATTACH_BACKING),
                    resource_id: FRAMEBUFFER_RESOURCE_ID,
                    nr_entries: 1,
                },
                entry: VirtioGpuMemEntry {
                    addr: self.page.phys() + PAGE_SIZE as u64,
                    length: FRAMEBUFFER_SIZE as u32,
                    padding: 0,
                },
            },
        )?;
        check_response(&resp, VIRTIO_GPU_RESP_OK_NODATA)
    }

    fn set_scanout(&self) -> KernelResult<()> {
        let resp: VirtioGpuCtrlHdr = self.exchange(
            offset_of!(ControlPage, scanout),
            VirtioGpuSetScanout {
                hdr: VirtioGpuCtrlHdr::new(VIRTIO_GPU_CMD_SET_SCANOUT),
                rect: VirtioGpuRect::full(),
                scanout_id: SCANOUT_ID,
                resource_id: FRAMEBUFFER_RESOURCE_ID,
            },
        )?;
        check_response(&resp, VIRTIO_GPU_RESP_OK_NODATA)
    }

    fn transfer_to_host(&self) -> KernelResult<()> {
        let resp: VirtioGpuCtrlHdr = self.exchange(
            offset_of!(ControlPage, transfer),
            VirtioGpuTransferToHost2d {
                hdr: VirtioGpuCtrlHdr::new(VIRTIO_GPU_CMD_TRANSFER_TO_HOST_2D),
                rect: VirtioGpuRect::full(),
                offset: 0,
                resource_id: FRAMEBUFFER_RESOURCE_ID,
                padding: 0,
            },
        )?;
        check_response(&resp, VIRTIO_GPU_RESP_OK_NODATA)
    }

    fn resource_flush(&self) -> KernelResult<()> {
        let resp: VirtioGpuCtrlHdr = self.exchange(
            offset_of!(ControlPage, flush),
            VirtioGpuResourceFlush {
                hdr: VirtioGpuCtrlHdr::new(VIRTIO_GPU_CMD_RESOURCE_FLUSH),
                rect: VirtioGpuRect::full(),
                resource_id: FRAMEBUFFER_RESOURCE_ID,
                padding: 0,
            },
        )?;
        check_response(&resp, VIRTIO_GPU_RESP_OK_NODATA)
    }
}

lazy_static! {
    static ref VIRTIO_GPU: Mutex<GpuSession> = Mutex::new(GpuSession::new());
}

/// Initialize the process-wide GPU session against the global registry.
pub fn init() -> KernelResult<()> {
    let registry = super::registry()?;
    log::info!("[VIRTIO-GPU] Initializing");
    VIRTIO_GPU.lock().init(registry).inspect_err(|e| {
        log::error!("[VIRTIO-GPU] Init failed: {}", e);
    })
}

/// Flush the VirtIO GPU framebuffer to the display.
pub fn flush() -> KernelResult<()> {
    VIRTIO_GPU.lock().flush()
}

/// Raw framebuffer pointer, `None` until [`init`] succeeded.
pub fn framebuffer() -> Option<NonNull<u32>> {
    VIRTIO_GPU.lock().framebuffer_ptr()
}

/// Execute a closure with the framebuffer (mutable access).
pub fn with_framebuffer<R, F: FnOnce(&mut Framebuffer<'_>) -> R>(f: F) -> Option<R> {
    VIRTIO_GPU.lock().framebuffer().map(|mut fb| f(&mut fb))
}

/// Check if the GPU session is initialized.
pub fn is_available() -> bool {
    VIRTIO_GPU.lock().is_initialized()
}
