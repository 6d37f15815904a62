//! Device drivers module
//!
//! The PCI configuration-space layer and the VirtIO stack built on it.

pub mod pci;
pub mod virtio;

pub use pci::{ConfigSpace, PciAddress};
pub use virtio::{VirtioDevice, VirtioRegistry};
