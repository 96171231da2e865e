//! Error types for the bridge.

use std::io;

use nix::errno::Errno;
use thiserror::Error;

use crate::runtime::RuntimeError;
use crate::selector::DeviceSpec;

/// Bridge result type
pub type Result<T> = std::result::Result<T, Error>;

/// Bridge error types
#[derive(Debug, Error)]
pub enum Error {
    /// The runtime reports no platform at all
    #[error("no compatible platform found")]
    NoPlatformFound,

    /// A `platform:device` pair outside of the enumerated bounds
    #[error("device {spec} does not exist ({platforms} platform(s), {devices} device(s) on the requested platform)")]
    DeviceIndexOutOfRange {
        spec: DeviceSpec,
        platforms: usize,
        devices: usize,
    },

    /// Malformed capacity string
    #[error("invalid size {0:?}: expected digits followed by an optional K, M, G or T")]
    InvalidSizeFormat(String),

    /// Malformed `platform:device` token
    #[error("invalid device {0:?}: expected <platform>:<device>")]
    InvalidDeviceSpec(String),

    /// The same device named twice for one volume
    #[error("device {0} is listed more than once")]
    DuplicateDevice(DeviceSpec),

    /// The runtime could not reserve the region
    #[error("failed to allocate {size} bytes on device {spec}")]
    AllocationFailed {
        spec: DeviceSpec,
        size: u64,
        #[source]
        source: RuntimeError,
    },

    /// The region was released by a disconnect
    #[error("backend has been released")]
    BackendReleased,

    /// Disconnect called on a released backend
    #[error("backend was already released")]
    AlreadyReleased,

    /// Request range outside of the region
    #[error("request at offset {offset} with length {length} exceeds device size {size}")]
    OutOfRange { offset: u64, length: u64, size: u64 },

    /// One part of a request spanning several stripe regions failed
    #[error("sub-request on region {region} (local offset {offset}, length {length}) failed")]
    SubRequestFailed {
        region: usize,
        offset: u64,
        length: u64,
        #[source]
        source: Box<Error>,
    },

    /// A transfer to or from device memory failed
    #[error("transfer failed: {0}")]
    Transfer(#[from] RuntimeError),

    /// Block size not usable by the NBD driver
    #[error("invalid block size {0}: expected a power of two between 512 and 65536")]
    InvalidBlockSize(u32),

    /// Not even one block fits into the device memory
    #[error("{size} bytes cannot hold a single block of {block_size} bytes")]
    VolumeTooSmall { size: u64, block_size: u32 },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Errno reported to the kernel in the NBD reply.
    pub fn errno(&self) -> Errno {
        match self {
            Error::OutOfRange { .. } => Errno::EINVAL,
            Error::BackendReleased | Error::AlreadyReleased => Errno::ESHUTDOWN,
            Error::Io(err) => err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO),
            _ => Errno::EIO,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        io::Error::from_raw_os_error(err.errno() as i32)
    }
}
