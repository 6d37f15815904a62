//! Error types for the driver core
//!
//! Every component boundary (PCI scanner, VirtIO transport, virtqueue
//! manager, GPU sequencer) returns [`KernelResult`]. Nothing retries
//! internally; the retry policy, if any, belongs to the caller.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// A device or table entry is absent. Recoverable: the caller may retry
    /// discovery later.
    NotFound {
        resource: &'static str,
        id: u64,
    },

    /// Malformed capability chain, misaligned or out-of-range offset, or a
    /// device that broke the ring protocol. Fatal to that device.
    ProtocolError {
        reason: &'static str,
        offset: u16,
    },

    /// The device rejected feature negotiation (FEATURES_OK cleared).
    UnsupportedDevice {
        device_id: u16,
    },

    /// The device advertises more virtqueues than the driver was built for.
    TooManyQueues {
        requested: u16,
        max: u16,
    },

    /// A compiled-in limit was exceeded.
    ResourceExhausted {
        resource: &'static str,
    },

    /// Backing memory for a ring or control page is unavailable.
    AllocationFailure {
        requested: usize,
    },

    /// Operation attempted in the wrong lifecycle state.
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// The device answered a command with an error response.
    HardwareError {
        device: &'static str,
        code: u32,
    },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { resource, id } => write!(f, "{} with id {:#x} not found", resource, id),
            Self::ProtocolError { reason, offset } => {
                write!(f, "Protocol error at offset {:#04x}: {}", offset, reason)
            }
            Self::UnsupportedDevice { device_id } => {
                write!(f, "Device {:#06x} rejected feature negotiation", device_id)
            }
            Self::TooManyQueues { requested, max } => {
                write!(f, "Device wants {} virtqueues, at most {} supported", requested, max)
            }
            Self::ResourceExhausted { resource } => write!(f, "Resource exhausted: {}", resource),
            Self::AllocationFailure { requested } => {
                write!(f, "Allocation of {} contiguous bytes failed", requested)
            }
            Self::InvalidState { expected, actual } => {
                write!(f, "Invalid state: expected {}, got {}", expected, actual)
            }
            Self::HardwareError { device, code } => {
                write!(f, "Hardware error on {}: code 0x{:x}", device, code)
            }
        }
    }
}
