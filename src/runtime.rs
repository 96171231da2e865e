//! Seam between the bridge and an accelerator compute runtime.
//!
//! A [`Runtime`] enumerates platforms and devices and allocates [`Region`]s.
//! Every transfer on a region is synchronous: it returns only after the
//! device has confirmed completion.

use std::fmt;

use thiserror::Error;

/// A failed call into the accelerator runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed: {message}")]
pub struct RuntimeError {
    /// Runtime call that failed.
    pub operation: &'static str,
    /// What the runtime reported.
    pub message: String,
}

impl RuntimeError {
    pub fn new(operation: &'static str, message: impl fmt::Display) -> Self {
        Self {
            operation,
            message: message.to_string(),
        }
    }
}

/// An accelerator compute runtime.
pub trait Runtime {
    type Platform: Clone;
    type Device: Clone;
    type Region: Region;

    /// All platforms visible to this process.
    fn platforms(&self) -> Result<Vec<Self::Platform>, RuntimeError>;
    fn platform_name(&self, platform: &Self::Platform) -> Result<String, RuntimeError>;
    /// All devices of a platform.
    fn devices(&self, platform: &Self::Platform) -> Result<Vec<Self::Device>, RuntimeError>;

    fn device_name(&self, device: &Self::Device) -> Result<String, RuntimeError>;
    fn device_vendor(&self, device: &Self::Device) -> Result<String, RuntimeError>;
    /// Total global memory of the device in bytes.
    fn device_memory(&self, device: &Self::Device) -> Result<u64, RuntimeError>;
    /// Availability as reported by the runtime.
    fn device_available(&self, device: &Self::Device) -> Result<bool, RuntimeError>;

    /// Reserve `size` bytes on `device`, together with whatever context and
    /// queue the transfers need. Either the whole region is reserved or
    /// nothing is.
    fn allocate(&self, device: &Self::Device, size: u64) -> Result<Self::Region, RuntimeError>;
}

/// A contiguous allocation on one device.
pub trait Region: Send {
    /// Size of the region in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst`, blocking until
    /// the transfer has completed.
    fn read(&mut self, offset: u64, dst: &mut [u8]) -> Result<(), RuntimeError>;

    /// Copy `src` to the region at `offset`, blocking until the device has
    /// confirmed the write.
    fn write(&mut self, offset: u64, src: &[u8]) -> Result<(), RuntimeError>;

    /// Release the buffer, then the queue, then the context.
    fn release(self) -> Result<(), RuntimeError>
    where
        Self: Sized;
}
