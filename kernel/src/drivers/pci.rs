//! PCI Bus Driver
//!
//! Configuration-space access, brute-force device lookup and the capability
//! list walker used by the VirtIO transport.

use alloc::vec::Vec;
use core::fmt;

use crate::error::{KernelError, KernelResult};

/// PCI configuration space registers (type 0 header)
#[repr(u16)]
#[allow(dead_code)] // Hardware register definitions per PCI specification
#[derive(Debug, Clone, Copy)]
pub enum PciConfigRegister {
    VendorId = 0x00,
    DeviceId = 0x02,
    Command = 0x04,
    Status = 0x06,
    RevisionId = 0x08,
    ProgIf = 0x09,
    Subclass = 0x0A,
    ClassCode = 0x0B,
    HeaderType = 0x0E,
    Bar0 = 0x10,
    CapabilitiesPointer = 0x34,
    InterruptLine = 0x3C,
    InterruptPin = 0x3D,
}

/// PCI class codes
#[allow(dead_code)] // Hardware constants per PCI specification
pub mod class_codes {
    pub const UNCLASSIFIED: u8 = 0x00;
    pub const MASS_STORAGE: u8 = 0x01;
    pub const NETWORK: u8 = 0x02;
    pub const DISPLAY: u8 = 0x03;
    pub const MULTIMEDIA: u8 = 0x04;
    pub const MEMORY: u8 = 0x05;
    pub const BRIDGE: u8 = 0x06;
    pub const COMMUNICATION: u8 = 0x07;
    pub const SYSTEM: u8 = 0x08;
    pub const INPUT: u8 = 0x09;
    pub const SERIAL_BUS: u8 = 0x0C;
}

/// PCI command register flags
#[allow(dead_code)] // Hardware constants per PCI specification
pub mod command_flags {
    pub const IO_SPACE: u16 = 1 << 0;
    pub const MEMORY_SPACE: u16 = 1 << 1;
    pub const BUS_MASTER: u16 = 1 << 2;
    pub const INTERRUPT_DISABLE: u16 = 1 << 10;
}

/// PCI status register flags
pub mod status_flags {
    /// A capability list is present at [`super::PciConfigRegister::CapabilitiesPointer`].
    pub const CAPABILITIES_LIST: u16 = 1 << 4;
}

/// Size of the legacy configuration space in bytes.
pub const CONFIG_SPACE_SIZE: u16 = 256;

/// Capability ID of vendor-specific capabilities (the kind VirtIO uses).
pub const CAP_ID_VENDOR_SPECIFIC: u8 = 0x09;

/// Size of a vendor-specific capability record as laid out by VirtIO.
pub const CAPABILITY_RECORD_SIZE: u16 = 16;

/// PCI function address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PciAddress {
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
}

impl PciAddress {
    /// Sentinel returned by the lookup functions when nothing matched.
    pub const NOT_FOUND: Self = Self {
        bus: 0xFF,
        slot: 0xFF,
        function: 0xFF,
    };

    pub const fn new(bus: u8, slot: u8, function: u8) -> Self {
        Self {
            bus,
            slot,
            function,
        }
    }

    /// Whether this names a real function (slot < 32, function < 8).
    pub fn is_valid(&self) -> bool {
        self.slot < 32 && self.function < 8
    }

    /// `Some(self)` unless this is the not-found sentinel.
    pub fn found(self) -> Option<Self> {
        self.is_valid().then_some(self)
    }

    /// Mechanism #1 configuration address for the dword containing `offset`.
    pub fn config_address(&self, offset: u16) -> u32 {
        0x8000_0000
            | ((self.bus as u32) << 16)
            | ((self.slot as u32) << 11)
            | ((self.function as u32) << 8)
            | (offset as u32 & 0xFC)
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.slot, self.function)
    }
}

/// Access to PCI configuration space.
///
/// Implementors provide dword reads and writes; the narrower and wider
/// accessors are derived from them. Every access must be naturally aligned.
pub trait ConfigSpace: Send + Sync {
    fn read_dword(&self, address: PciAddress, offset: u16) -> u32;
    fn write_dword(&self, address: PciAddress, offset: u16, value: u32);

    fn read_byte(&self, address: PciAddress, offset: u16) -> u8 {
        debug_assert!(offset < CONFIG_SPACE_SIZE);
        let dword = self.read_dword(address, offset & !3);
        (dword >> ((offset & 3) * 8)) as u8
    }

    fn read_word(&self, address: PciAddress, offset: u16) -> u16 {
        debug_assert!(offset % 2 == 0, "unaligned config word read at {:#x}", offset);
        let dword = self.read_dword(address, offset & !3);
        (dword >> ((offset & 3) * 8)) as u16
    }

    fn read_qword(&self, address: PciAddress, offset: u16) -> u64 {
        debug_assert!(offset % 8 == 0, "unaligned config qword read at {:#x}", offset);
        let low = self.read_dword(address, offset) as u64;
        let high = self.read_dword(address, offset + 4) as u64;
        low | (high << 32)
    }

    fn write_byte(&self, address: PciAddress, offset: u16, value: u8) {
        let shift = (offset & 3) * 8;
        let current = self.read_dword(address, offset & !3);
        let updated = (current & !(0xFF << shift)) | ((value as u32) << shift);
        self.write_dword(address, offset & !3, updated);
    }

    fn write_word(&self, address: PciAddress, offset: u16, value: u16) {
        debug_assert!(offset % 2 == 0, "unaligned config word write at {:#x}", offset);
        let shift = (offset & 3) * 8;
        let current = self.read_dword(address, offset & !3);
        let updated = (current & !(0xFFFF << shift)) | ((value as u32) << shift);
        self.write_dword(address, offset & !3, updated);
    }

    fn write_qword(&self, address: PciAddress, offset: u16, value: u64) {
        debug_assert!(offset % 8 == 0, "unaligned config qword write at {:#x}", offset);
        self.write_dword(address, offset, value as u32);
        self.write_dword(address, offset + 4, (value >> 32) as u32);
    }

    /// Copy `buf.len()` bytes starting at `offset` using the widest aligned
    /// accesses available.
    fn read_data(&self, address: PciAddress, offset: u16, buf: &mut [u8]) {
        assert!(
            offset as usize + buf.len() <= CONFIG_SPACE_SIZE as usize,
            "config read past end of configuration space"
        );

        let mut pos = 0;
        while pos < buf.len() {
            let at = offset + pos as u16;
            let left = buf.len() - pos;
            if at % 4 == 0 && left >= 4 {
                buf[pos..pos + 4].copy_from_slice(&self.read_dword(address, at).to_le_bytes());
                pos += 4;
            } else if at % 2 == 0 && left >= 2 {
                buf[pos..pos + 2].copy_from_slice(&self.read_word(address, at).to_le_bytes());
                pos += 2;
            } else {
                buf[pos] = self.read_byte(address, at);
                pos += 1;
            }
        }
    }
}

/// Configuration mechanism #1 over I/O ports 0xCF8/0xCFC.
#[cfg(target_arch = "x86_64")]
pub struct PortIoConfigSpace {
    // The address/data port pair must not be interleaved.
    lock: spin::Mutex<()>,
}

#[cfg(target_arch = "x86_64")]
impl PortIoConfigSpace {
    const CONFIG_ADDRESS: u16 = 0xCF8;
    const CONFIG_DATA: u16 = 0xCFC;

    pub const fn new() -> Self {
        Self {
            lock: spin::Mutex::new(()),
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl Default for PortIoConfigSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "x86_64")]
impl ConfigSpace for PortIoConfigSpace {
    fn read_dword(&self, address: PciAddress, offset: u16) -> u32 {
        let _guard = self.lock.lock();
        // SAFETY: PCI configuration space access requires writing the target
        // address to CONFIG_ADDRESS then reading CONFIG_DATA. These are the
        // standard mechanism #1 ports and the pair is serialized by `lock`.
        unsafe {
            crate::arch::outl(Self::CONFIG_ADDRESS, address.config_address(offset));
            crate::arch::inl(Self::CONFIG_DATA)
        }
    }

    fn write_dword(&self, address: PciAddress, offset: u16, value: u32) {
        let _guard = self.lock.lock();
        // SAFETY: Same invariants as read_dword above.
        unsafe {
            crate::arch::outl(Self::CONFIG_ADDRESS, address.config_address(offset));
            crate::arch::outl(Self::CONFIG_DATA, value);
        }
    }
}

/// Type 0 configuration header (the first 64 bytes of configuration space)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciHeader {
    pub vendor_id: u16,
    pub device_id: u16,
    pub command: u16,
    pub status: u16,
    pub revision: u8,
    pub prog_if: u8,
    pub subclass: u8,
    pub class_code: u8,
    pub cache_line_size: u8,
    pub latency_timer: u8,
    pub header_type: u8,
    pub bist: u8,
    pub bars: [u32; 6],
    pub cardbus_cis: u32,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    pub expansion_rom: u32,
    pub capabilities_ptr: u8,
    pub interrupt_line: u8,
    pub interrupt_pin: u8,
    pub min_grant: u8,
    pub max_latency: u8,
}

impl PciHeader {
    fn from_bytes(raw: &[u8; 64]) -> Self {
        let word = |at: usize| u16::from_le_bytes([raw[at], raw[at + 1]]);
        let dword = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);

        let mut bars = [0u32; 6];
        for (i, bar) in bars.iter_mut().enumerate() {
            *bar = dword(0x10 + i * 4);
        }

        Self {
            vendor_id: word(0x00),
            device_id: word(0x02),
            command: word(0x04),
            status: word(0x06),
            revision: raw[0x08],
            prog_if: raw[0x09],
            subclass: raw[0x0A],
            class_code: raw[0x0B],
            cache_line_size: raw[0x0C],
            latency_timer: raw[0x0D],
            header_type: raw[0x0E],
            bist: raw[0x0F],
            bars,
            cardbus_cis: dword(0x28),
            subsystem_vendor_id: word(0x2C),
            subsystem_id: word(0x2E),
            expansion_rom: dword(0x30),
            capabilities_ptr: raw[0x34],
            interrupt_line: raw[0x3C],
            interrupt_pin: raw[0x3D],
            min_grant: raw[0x3E],
            max_latency: raw[0x3F],
        }
    }

    pub fn has_capabilities(&self) -> bool {
        self.status & status_flags::CAPABILITIES_LIST != 0
    }

    /// Check if device is multifunction
    pub fn is_multifunction(&self) -> bool {
        self.header_type & 0x80 != 0
    }
}

/// Read the whole type 0 header of `address`.
pub fn read_header(config: &dyn ConfigSpace, address: PciAddress) -> PciHeader {
    let mut raw = [0u8; 64];
    for (i, chunk) in raw.chunks_exact_mut(8).enumerate() {
        chunk.copy_from_slice(&config.read_qword(address, (i * 8) as u16).to_le_bytes());
    }
    PciHeader::from_bytes(&raw)
}

/// PCI Base Address Register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciBar {
    Memory {
        address: u64,
        prefetchable: bool,
        is_64bit: bool,
    },
    Io {
        address: u32,
    },
    None,
}

impl PciBar {
    /// Get memory address if this is a memory BAR
    pub fn memory_address(&self) -> Option<u64> {
        match self {
            PciBar::Memory { address, .. } => Some(*address),
            _ => None,
        }
    }
}

/// Decode BAR `index` (0..6). A 64-bit memory BAR consumes `index + 1` as
/// its upper half.
pub fn read_bar(config: &dyn ConfigSpace, address: PciAddress, index: u8) -> KernelResult<PciBar> {
    let offset = PciConfigRegister::Bar0 as u16 + index as u16 * 4;
    if index >= 6 {
        return Err(KernelError::ProtocolError {
            reason: "BAR index out of range",
            offset,
        });
    }

    let value = config.read_dword(address, offset);
    if value == 0 {
        return Ok(PciBar::None);
    }

    if value & 1 != 0 {
        return Ok(PciBar::Io {
            address: value & 0xFFFF_FFFC,
        });
    }

    let is_64bit = (value >> 1) & 3 == 2;
    let prefetchable = (value >> 3) & 1 != 0;
    let mut base = (value & 0xFFFF_FFF0) as u64;

    if is_64bit {
        if index == 5 {
            return Err(KernelError::ProtocolError {
                reason: "64-bit BAR in last slot",
                offset,
            });
        }
        base |= (config.read_dword(address, offset + 4) as u64) << 32;
    }

    Ok(PciBar::Memory {
        address: base,
        prefetchable,
        is_64bit,
    })
}

/// Turn on memory decoding and bus mastering so MMIO and DMA work.
pub fn enable_device(config: &dyn ConfigSpace, address: PciAddress) {
    let command = config.read_word(address, PciConfigRegister::Command as u16);
    let enabled = command | command_flags::MEMORY_SPACE | command_flags::BUS_MASTER;
    if enabled != command {
        config.write_word(address, PciConfigRegister::Command as u16, enabled);
    }
    log::debug!("[PCI] Enabled memory space and bus mastering on {}", address);
}

pub fn interrupt_line(config: &dyn ConfigSpace, address: PciAddress) -> u8 {
    config.read_byte(address, PciConfigRegister::InterruptLine as u16)
}

fn all_functions() -> impl Iterator<Item = PciAddress> {
    (0..=255u8).flat_map(|bus| {
        (0..32u8).flat_map(move |slot| (0..8u8).map(move |function| PciAddress::new(bus, slot, function)))
    })
}

/// First function whose vendor, class and subclass match, or
/// [`PciAddress::NOT_FOUND`].
pub fn find_device_by_class(config: &dyn ConfigSpace, vendor: u16, class: u8, subclass: u8) -> PciAddress {
    all_functions()
        .find(|&address| {
            let ids = config.read_word(address, PciConfigRegister::Subclass as u16);
            ids == u16::from_le_bytes([subclass, class])
                && config.read_word(address, PciConfigRegister::VendorId as u16) == vendor
        })
        .unwrap_or(PciAddress::NOT_FOUND)
}

/// First function with the given vendor and device id, or
/// [`PciAddress::NOT_FOUND`].
pub fn find_device_by_id(config: &dyn ConfigSpace, vendor: u16, device_id: u16) -> PciAddress {
    let wanted = (vendor as u32) | ((device_id as u32) << 16);
    all_functions()
        .find(|&address| config.read_dword(address, PciConfigRegister::VendorId as u16) == wanted)
        .unwrap_or(PciAddress::NOT_FOUND)
}

/// A vendor-specific capability record as laid out by VirtIO:
/// `cap_vndr, cap_next, cap_len, cfg_type, bar, padding[3], offset, length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityRecord {
    /// Where the record sits in configuration space.
    pub position: u16,
    pub cap_vndr: u8,
    pub cap_next: u8,
    pub cap_len: u8,
    pub cfg_type: u8,
    pub bar: u8,
    /// Offset of the structure inside the BAR.
    pub offset: u32,
    /// Length of the structure in bytes.
    pub length: u32,
}

impl CapabilityRecord {
    fn parse(position: u16, raw: &[u8; CAPABILITY_RECORD_SIZE as usize]) -> Self {
        Self {
            position,
            cap_vndr: raw[0],
            cap_next: raw[1],
            cap_len: raw[2],
            cfg_type: raw[3],
            bar: raw[4],
            offset: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            length: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        }
    }
}

/// Walk the capability list of `address` and return its vendor-specific
/// records in chain order. Other capability kinds (MSI-X, power management,
/// ...) are stepped over.
pub fn read_capabilities(config: &dyn ConfigSpace, address: PciAddress) -> KernelResult<Vec<CapabilityRecord>> {
    let status = config.read_word(address, PciConfigRegister::Status as u16);
    if status & status_flags::CAPABILITIES_LIST == 0 {
        return Err(KernelError::ProtocolError {
            reason: "no capability list",
            offset: PciConfigRegister::Status as u16,
        });
    }

    let mut records = Vec::new();
    let mut visited = [false; (CONFIG_SPACE_SIZE / 4) as usize];
    let mut next = config.read_byte(address, PciConfigRegister::CapabilitiesPointer as u16) as u16;

    while next != 0 {
        if next % 4 != 0 {
            return Err(KernelError::ProtocolError {
                reason: "capability pointer not dword aligned",
                offset: next,
            });
        }
        if next + CAPABILITY_RECORD_SIZE > CONFIG_SPACE_SIZE {
            return Err(KernelError::ProtocolError {
                reason: "capability record past end of configuration space",
                offset: next,
            });
        }
        let slot = &mut visited[(next / 4) as usize];
        if *slot {
            return Err(KernelError::ProtocolError {
                reason: "capability chain loops",
                offset: next,
            });
        }
        *slot = true;

        let mut raw = [0u8; CAPABILITY_RECORD_SIZE as usize];
        config.read_data(address, next, &mut raw);
        let record = CapabilityRecord::parse(next, &raw);

        if record.cap_vndr == CAP_ID_VENDOR_SPECIFIC {
            if (record.cap_len as u16) < CAPABILITY_RECORD_SIZE {
                return Err(KernelError::ProtocolError {
                    reason: "capability record too short",
                    offset: next,
                });
            }
            records.push(record);
        } else {
            log::trace!("[PCI] {}: skipping capability {:#04x} at {:#04x}", address, record.cap_vndr, next);
        }

        next = record.cap_next as u16;
    }

    Ok(records)
}

/// A present function found by [`enumerate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciFunction {
    pub address: PciAddress,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_code: u8,
    pub subclass: u8,
    pub header_type: u8,
}

fn probe_function(config: &dyn ConfigSpace, address: PciAddress) -> Option<PciFunction> {
    let ids = config.read_dword(address, PciConfigRegister::VendorId as u16);
    let vendor_id = ids as u16;
    if vendor_id == 0xFFFF {
        return None;
    }

    let class = config.read_dword(address, PciConfigRegister::RevisionId as u16);
    let class_code = (class >> 24) as u8;
    if class_code == 0xFF {
        return None;
    }

    Some(PciFunction {
        address,
        vendor_id,
        device_id: (ids >> 16) as u16,
        class_code,
        subclass: (class >> 16) as u8,
        header_type: config.read_byte(address, PciConfigRegister::HeaderType as u16),
    })
}

/// List every present function, probing functions 1..8 only on
/// multi-function devices.
pub fn enumerate(config: &dyn ConfigSpace) -> Vec<PciFunction> {
    let mut functions = Vec::new();

    for bus in 0..=255u8 {
        for slot in 0..32u8 {
            let Some(first) = probe_function(config, PciAddress::new(bus, slot, 0)) else {
                continue;
            };
            let multifunction = first.header_type & 0x80 != 0;
            functions.push(first);

            if multifunction {
                functions.extend((1..8).filter_map(|function| probe_function(config, PciAddress::new(bus, slot, function))));
            }
        }
    }

    for function in &functions {
        log::info!(
            "[PCI] {} {:04x}:{:04x} {} ({})",
            function.address,
            function.vendor_id,
            function.device_id,
            device_type_name(function.class_code, function.subclass),
            vendor_name(function.vendor_id)
        );
    }

    functions
}

/// Human-readable name for a class/subclass pair.
pub fn device_type_name(class: u8, subclass: u8) -> &'static str {
    match (class, subclass) {
        (0x00, 0x01) => "VGA-compatible Device",
        (0x01, 0x00) => "SCSI Bus Controller",
        (0x01, 0x01) => "IDE Controller",
        (0x01, 0x05) => "ATA Controller",
        (0x01, 0x06) => "SATA Controller",
        (0x01, 0x08) => "NVM Controller",
        (0x01, _) => "Mass Storage Controller",
        (0x02, 0x00) => "Ethernet Controller",
        (0x02, _) => "Network Controller",
        (0x03, 0x00) => "VGA-compatible Controller",
        (0x03, 0x01) => "XGA Controller",
        (0x03, 0x02) => "3D Controller",
        (0x03, _) => "Display Controller",
        (0x04, 0x01) => "Audio Device",
        (0x04, 0x03) => "Audio Device (HDA)",
        (0x04, _) => "Multimedia Device",
        (0x05, _) => "Memory Controller",
        (0x06, 0x00) => "Host Bridge",
        (0x06, 0x01) => "ISA Bridge",
        (0x06, 0x04) => "PCI-to-PCI Bridge",
        (0x06, 0x80) => "Other Bridge Device",
        (0x06, _) => "Bridge Device",
        (0x07, 0x00) => "Serial Controller",
        (0x07, _) => "Communication Controller",
        (0x08, 0x00) => "Programmable Interrupt Controller",
        (0x08, 0x80) => "Other System Peripheral",
        (0x08, _) => "System Peripheral",
        (0x09, _) => "Input Controller",
        (0x0C, 0x03) => "USB Controller",
        (0x0C, 0x05) => "SMBus",
        (0x0C, _) => "Serial Bus Controller",
        (0xFF, _) => "Unassigned Class",
        _ => "Unknown device",
    }
}

/// Human-readable vendor name for log output.
pub fn vendor_name(vendor: u16) -> &'static str {
    match vendor {
        0x8086 => "Intel",
        0x1022 => "AMD",
        0x1002 => "ATI/AMD",
        0x10DE => "NVIDIA",
        0x1AF4 => "Red Hat (VirtIO)",
        0x1B36 => "Red Hat (QEMU)",
        0x1234 => "QEMU",
        0x15AD => "VMware",
        0x80EE => "VirtualBox",
        0x10EC => "Realtek",
        _ => "Unknown vendor",
    }
}
