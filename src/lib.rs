//! Spare accelerator memory as a volatile block device.
//!
//! A region of device memory is allocated through a [`runtime::Runtime`]
//! and attached to a kernel NBD device, which then forwards every block
//! request to it. Transfers are synchronous: a request completes only once
//! the device has confirmed it.

mod device;
mod nbd;
mod sys;

pub mod backend;
pub mod bridge;
pub mod catalog;
pub mod config;
pub mod error;
pub mod host;
#[cfg(feature = "opencl")]
pub mod opencl;
pub mod runtime;
pub mod selector;
pub mod size;
pub mod stripe;

pub use backend::{MemoryBackend, Storage};
pub use bridge::{BridgeAdapter, Volume};
pub use catalog::DeviceCatalog;
pub use device::{attach_device, attach_device_with, AttachOptions, BlockDevice};
pub use error::{Error, Result};
pub use selector::DeviceSpec;
pub use stripe::StripeSet;
