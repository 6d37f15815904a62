//! Virtio PCI transport: capability mapping and status negotiation
//!
//! The device-status byte only ever gains bits between resets:
//!
//! ```text
//!   0 -> ACKNOWLEDGE -> +DRIVER -> (features) -> +FEATURES_OK -> (queues) -> +DRIVER_OK
//! ```
//!
//! A device that clears FEATURES_OK is marked FAILED and abandoned.

use alloc::boxed::Box;

use super::{
    common_cfg, pci_cap, queue, DeviceStatus, NegotiationState, VirtioDevice, NO_VECTOR,
};
use crate::{
    drivers::pci::{self, CapabilityRecord, PciAddress, CAP_ID_VENDOR_SPECIFIC, CONFIG_SPACE_SIZE},
    error::{KernelError, KernelResult},
    platform::{Mmio, Platform},
};

/// The four MMIO windows a modern virtio PCI device must expose.
pub struct CapabilityWindows {
    pub common: Box<dyn Mmio>,
    pub notify: Box<dyn Mmio>,
    pub isr: Box<dyn Mmio>,
    pub device: Box<dyn Mmio>,
    pub notify_off_multiplier: u32,
}

#[derive(Default)]
struct PartialWindows {
    common: Option<Box<dyn Mmio>>,
    notify: Option<Box<dyn Mmio>>,
    isr: Option<Box<dyn Mmio>>,
    device: Option<Box<dyn Mmio>>,
    notify_off_multiplier: u32,
}

impl PartialWindows {
    fn slot(&mut self, cfg_type: u8) -> Option<&mut Option<Box<dyn Mmio>>> {
        match cfg_type {
            pci_cap::COMMON_CFG => Some(&mut self.common),
            pci_cap::NOTIFY_CFG => Some(&mut self.notify),
            pci_cap::ISR_CFG => Some(&mut self.isr),
            pci_cap::DEVICE_CFG => Some(&mut self.device),
            _ => None,
        }
    }

    fn complete(self) -> KernelResult<CapabilityWindows> {
        let missing = |reason| KernelError::ProtocolError {
            reason,
            offset: pci::PciConfigRegister::CapabilitiesPointer as u16,
        };

        let common = self.common.ok_or(missing("no common configuration capability"))?;
        if common.len() < common_cfg::SIZE {
            return Err(KernelError::ProtocolError {
                reason: "common configuration window too small",
                offset: pci::PciConfigRegister::CapabilitiesPointer as u16,
            });
        }

        Ok(CapabilityWindows {
            common,
            notify: self.notify.ok_or(missing("no notification capability"))?,
            isr: self.isr.ok_or(missing("no ISR capability"))?,
            device: self.device.ok_or(missing("no device configuration capability"))?,
            notify_off_multiplier: self.notify_off_multiplier,
        })
    }
}

fn map_capability(
    platform: &dyn Platform,
    address: PciAddress,
    cap: &CapabilityRecord,
) -> KernelResult<Box<dyn Mmio>> {
    let bar = pci::read_bar(platform.config_space(), address, cap.bar)?;
    let base = bar.memory_address().ok_or(KernelError::ProtocolError {
        reason: "capability BAR is not a memory BAR",
        offset: cap.position,
    })?;
    platform.map_mmio(base + cap.offset as u64, cap.length as usize)
}

/// Map the common, notify, ISR and device-config windows described by the
/// capability list of `address`. The first capability of each kind wins;
/// later duplicates are ignored.
pub fn identify_capabilities(platform: &dyn Platform, address: PciAddress) -> KernelResult<CapabilityWindows> {
    let config = platform.config_space();
    let mut windows = PartialWindows::default();

    for cap in pci::read_capabilities(config, address)? {
        if cap.cap_vndr != CAP_ID_VENDOR_SPECIFIC {
            continue;
        }

        if cap.cfg_type == pci_cap::PCI_CFG {
            log::trace!("[VIRTIO] {}: ignoring PCI config access capability", address);
            continue;
        }

        let Some(slot) = windows.slot(cap.cfg_type) else {
            log::debug!("[VIRTIO] {}: unknown capability type {}", address, cap.cfg_type);
            continue;
        };
        if slot.is_some() {
            log::debug!(
                "[VIRTIO] {}: duplicate capability type {} at {:#04x} ignored",
                address,
                cap.cfg_type,
                cap.position
            );
            continue;
        }

        *slot = Some(map_capability(platform, address, &cap)?);

        if cap.cfg_type == pci_cap::NOTIFY_CFG {
            let at = cap.position + 16;
            if at + 4 > CONFIG_SPACE_SIZE || (cap.cap_len as u16) < 20 {
                return Err(KernelError::ProtocolError {
                    reason: "notification capability lacks multiplier",
                    offset: cap.position,
                });
            }
            windows.notify_off_multiplier = config.read_dword(address, at);
        }

        log::debug!(
            "[VIRTIO] {}: cfg_type {} -> BAR{} + {:#x} ({} bytes)",
            address,
            cap.cfg_type,
            cap.bar,
            cap.offset,
            cap.length
        );
    }

    windows.complete()
}

impl VirtioDevice {
    /// Raw device-status byte.
    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.common.read8(common_cfg::DEVICE_STATUS))
    }

    fn add_status(&self, bits: DeviceStatus) {
        let current = self.status();
        self.common.write8(common_cfg::DEVICE_STATUS, (current | bits).bits());
    }

    /// Write zero to the status byte, returning the device to its initial
    /// state.
    pub fn reset(&self) {
        self.common.write8(common_cfg::DEVICE_STATUS, 0);
        self.set_state(NegotiationState::Discovered);
    }

    /// Signal that the driver has given up on the device.
    pub fn fail(&self) {
        self.add_status(DeviceStatus::FAILED);
        self.set_state(NegotiationState::Failed);
        log::warn!("[VIRTIO] {}: marked FAILED", self.address);
    }

    /// Whether the device has asked for a reset and full re-negotiation.
    pub fn needs_reset(&self) -> bool {
        self.status().contains(DeviceStatus::NEEDS_RESET)
    }

    /// Read the 64-bit device feature word.
    pub fn device_features(&self) -> u64 {
        self.common.write32(common_cfg::DEVICE_FEATURE_SELECT, 0);
        let low = self.common.read32(common_cfg::DEVICE_FEATURE) as u64;
        self.common.write32(common_cfg::DEVICE_FEATURE_SELECT, 1);
        let high = self.common.read32(common_cfg::DEVICE_FEATURE) as u64;
        low | (high << 32)
    }

    fn write_driver_features(&self, features: u64) {
        self.common.write32(common_cfg::DRIVER_FEATURE_SELECT, 0);
        self.common.write32(common_cfg::DRIVER_FEATURE, features as u32);
        self.common.write32(common_cfg::DRIVER_FEATURE_SELECT, 1);
        self.common.write32(common_cfg::DRIVER_FEATURE, (features >> 32) as u32);
    }

    /// Run the initialization sequence from reset to DRIVER_OK, configuring
    /// every virtqueue on the way.
    pub fn negotiate(&mut self, platform: &dyn Platform) -> KernelResult<()> {
        self.reset();

        self.add_status(DeviceStatus::ACKNOWLEDGE);
        self.set_state(NegotiationState::Acknowledged);

        self.add_status(DeviceStatus::DRIVER);
        self.set_state(NegotiationState::DriverKnown);

        let offered = self.device_features();
        log::debug!("[VIRTIO] {}: device features {:#018x}, accepting none", self.address, offered);
        self.write_driver_features(0);
        self.set_state(NegotiationState::FeaturesOffered);

        self.add_status(DeviceStatus::FEATURES_OK);
        if !self.status().contains(DeviceStatus::FEATURES_OK) {
            log::error!("[VIRTIO] {}: device rejected feature set", self.address);
            self.fail();
            return Err(KernelError::UnsupportedDevice {
                device_id: self.device_id,
            });
        }
        self.set_state(NegotiationState::FeaturesOk);

        self.common.write16(common_cfg::MSIX_CONFIG, NO_VECTOR);
        self.queues = queue::configure_queues(&*self.common, &*self.notify, self.notify_off_multiplier, platform)?;
        self.set_state(NegotiationState::QueuesConfigured);

        self.add_status(DeviceStatus::DRIVER_OK);
        self.set_state(NegotiationState::DriverOk);
        self.mark_config_current();
        Ok(())
    }

    /// Current value of the device's configuration generation counter.
    pub fn config_generation(&self) -> u8 {
        self.common.read8(common_cfg::CONFIG_GENERATION)
    }

    /// Whether device-specific configuration is unchanged since the last
    /// [`mark_config_current`](Self::mark_config_current).
    pub fn is_config_current(&self) -> bool {
        self.config_generation() == self.cfg_generation.load(core::sync::atomic::Ordering::Acquire)
    }

    pub fn mark_config_current(&self) {
        self.cfg_generation
            .store(self.config_generation(), core::sync::atomic::Ordering::Release);
    }

    /// Copy device-specific configuration into `buf`, retrying until the
    /// generation counter is the same before and after the copy.
    pub fn read_device_config(&self, offset: usize, buf: &mut [u8]) -> KernelResult<()> {
        if offset + buf.len() > self.device_cfg.len() {
            return Err(KernelError::ProtocolError {
                reason: "device configuration read out of range",
                offset: offset as u16,
            });
        }

        loop {
            let before = self.config_generation();
            for (i, byte) in buf.iter_mut().enumerate() {
                *byte = self.device_cfg.read8(offset + i);
            }
            let after = self.config_generation();
            if before == after {
                self.cfg_generation.store(after, core::sync::atomic::Ordering::Release);
                return Ok(());
            }
        }
    }
}
