//! Glue between a [`Storage`] and the NBD engine.

use std::io;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::backend::{MemoryBackend, Storage};
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::runtime::Region;
use crate::stripe::StripeSet;

pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Device memory behind the block device: one region or a stripe set.
#[derive(Debug)]
pub enum Volume<R: Region> {
    Single(MemoryBackend<R>),
    Striped(StripeSet<R>),
}

impl<R: Region> Storage for Volume<R> {
    fn size(&self) -> u64 {
        match self {
            Volume::Single(backend) => backend.size(),
            Volume::Striped(set) => set.size(),
        }
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Volume::Single(backend) => backend.read(offset, buf),
            Volume::Striped(set) => set.read(offset, buf),
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        match self {
            Volume::Single(backend) => backend.write(offset, data),
            Volume::Striped(set) => set.write(offset, data),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            Volume::Single(backend) => backend.flush(),
            Volume::Striped(set) => set.flush(),
        }
    }

    fn trim(&mut self, offset: u64, length: u32) -> Result<()> {
        match self {
            Volume::Single(backend) => backend.trim(offset, length),
            Volume::Striped(set) => set.trim(offset, length),
        }
    }

    fn disconnect(&mut self) -> Result<()> {
        match self {
            Volume::Single(backend) => backend.disconnect(),
            Volume::Striped(set) => set.disconnect(),
        }
    }
}

/// Serves a [`Storage`] as an NBD block device.
///
/// Every storage call completes its device transfer before returning, so
/// the engine never has more than one request in flight.
#[derive(Debug)]
pub struct BridgeAdapter<S> {
    storage: S,
    block_size: u32,
}

impl<S: Storage> BridgeAdapter<S> {
    /// Serve `storage` in blocks of `block_size` bytes: a power of two from
    /// 512 to 65536. The storage must hold at least one block.
    pub fn new(storage: S, block_size: u32) -> Result<Self> {
        validate_block_size(block_size)?;
        let size = storage.size();
        if size < u64::from(block_size) {
            return Err(Error::VolumeTooSmall { size, block_size });
        }
        if size % u64::from(block_size) != 0 {
            warn!(
                size,
                block_size,
                exposed = size - size % u64::from(block_size),
                "size is not a multiple of the block size, the tail is not exposed"
            );
        }
        Ok(Self {
            storage,
            block_size,
        })
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

}

/// Block sizes the kernel driver accepts.
pub fn validate_block_size(block_size: u32) -> Result<()> {
    if !block_size.is_power_of_two() || !(512..=65536).contains(&block_size) {
        return Err(Error::InvalidBlockSize(block_size));
    }
    Ok(())
}

fn request_failed(operation: &'static str, offset: u64, length: u64, err: Error) -> io::Error {
    warn!(operation, offset, length, error = %err, "request failed");
    err.into()
}

#[async_trait]
impl<S: Storage> BlockDevice for BridgeAdapter<S> {
    async fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.storage
            .read(offset, buf)
            .map_err(|err| request_failed("read", offset, buf.len() as u64, err))
    }

    async fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.storage
            .write(offset, buf)
            .map_err(|err| request_failed("write", offset, buf.len() as u64, err))
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.storage
            .flush()
            .map_err(|err| request_failed("flush", 0, 0, err))
    }

    async fn trim(&mut self, offset: u64, len: u32) -> io::Result<()> {
        self.storage
            .trim(offset, len)
            .map_err(|err| request_failed("trim", offset, u64::from(len), err))
    }

    async fn disconnect(&mut self) {
        info!("received a disconnect request");
        match self.storage.disconnect() {
            Ok(()) => info!("device memory released"),
            Err(err) => warn!(%err, "disconnect"),
        }
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.storage.size() / u64::from(self.block_size)
    }
}
