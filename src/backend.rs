//! A block store backed by a single device-memory region.

use tracing::{debug, info, warn};

use crate::catalog::DeviceEntry;
use crate::error::{Error, Result};
use crate::runtime::{Region, Runtime, RuntimeError};
use crate::selector::DeviceSpec;
use crate::size::ByteSize;

/// Synchronous block storage served to the bridge.
///
/// Every call returns only once the underlying transfer has completed.
pub trait Storage: Send {
    /// Size in bytes.
    fn size(&self) -> u64;
    /// Fill `buf` with the bytes at `offset`.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    /// Store `data` at `offset`.
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
    /// Hint that a range is unused. Contents are left as they are.
    fn trim(&mut self, offset: u64, length: u32) -> Result<()>;
    /// Release all device resources. Later calls return `AlreadyReleased`.
    fn disconnect(&mut self) -> Result<()>;
}

/// Owner of one allocated region of device memory.
///
/// A backend only exists once its region has been allocated. `disconnect`
/// releases the region, after which every operation fails with
/// `BackendReleased`.
#[derive(Debug)]
pub struct MemoryBackend<R: Region> {
    spec: DeviceSpec,
    size: u64,
    region: Option<R>,
}

impl<R: Region> MemoryBackend<R> {
    /// Reserve `size` bytes on `device`.
    pub fn allocate<T>(runtime: &T, device: &DeviceEntry<T::Device>, size: u64) -> Result<Self>
    where
        T: Runtime<Region = R>,
    {
        let spec = device.spec;
        let failed = |source| Error::AllocationFailed { spec, size, source };

        if size == 0 {
            return Err(failed(RuntimeError::new("allocate", "zero-sized region")));
        }
        // Memory is 0 when the runtime could not report it; leave the
        // decision to the runtime then.
        if device.info.memory != 0 && size > device.info.memory {
            return Err(failed(RuntimeError::new(
                "allocate",
                format!("device has only {} bytes", device.info.memory),
            )));
        }

        info!(device = %spec, size = %ByteSize(size), "allocating device memory");
        let region = runtime.allocate(&device.handle, size).map_err(failed)?;
        Ok(Self::from_region(spec, region))
    }

    /// Wrap a region that has already been allocated.
    pub fn from_region(spec: DeviceSpec, region: R) -> Self {
        Self {
            spec,
            size: region.len(),
            region: Some(region),
        }
    }

    pub fn spec(&self) -> DeviceSpec {
        self.spec
    }

    pub fn is_released(&self) -> bool {
        self.region.is_none()
    }

    fn check_range(&self, offset: u64, length: usize) -> Result<()> {
        let length = length as u64;
        match offset.checked_add(length) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::OutOfRange {
                offset,
                length,
                size: self.size,
            }),
        }
    }

    fn region(&mut self) -> Result<&mut R> {
        self.region.as_mut().ok_or(Error::BackendReleased)
    }
}

impl<R: Region> Storage for MemoryBackend<R> {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.region()?;
        self.check_range(offset, buf.len())?;
        debug!(device = %self.spec, offset, length = buf.len(), "read");
        self.region()?.read(offset, buf)?;
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.region()?;
        self.check_range(offset, data.len())?;
        debug!(device = %self.spec, offset, length = data.len(), "write");
        self.region()?.write(offset, data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        // Transfers are synchronous, nothing is ever pending.
        self.region()?;
        debug!(device = %self.spec, "flush");
        Ok(())
    }

    fn trim(&mut self, offset: u64, length: u32) -> Result<()> {
        self.region()?;
        debug!(device = %self.spec, offset, length, "trim");
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let region = self.region.take().ok_or(Error::AlreadyReleased)?;
        info!(device = %self.spec, size = self.size, "releasing device memory");
        if let Err(err) = region.release() {
            warn!(device = %self.spec, %err, "release failed");
        }
        Ok(())
    }
}

impl<R: Region> Drop for MemoryBackend<R> {
    fn drop(&mut self) {
        if !self.is_released() {
            // Release returns the region to the device; errors are logged there.
            let _ = self.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use proptest::prelude::*;

    use super::*;
    use crate::catalog::DeviceCatalog;
    use crate::host::{HostDevice, HostRegion, HostRuntime};
    use crate::selector::resolve;

    fn backend(runtime: &HostRuntime, size: u64) -> MemoryBackend<HostRegion> {
        let catalog = DeviceCatalog::enumerate(runtime).unwrap();
        let device = resolve(&catalog, DeviceSpec::new(0, 0)).unwrap();
        MemoryBackend::allocate(runtime, device, size).unwrap()
    }

    #[test]
    fn test_allocate_exact_size() {
        let runtime = HostRuntime::with_capacities(&[1 << 20]);
        let backend = backend(&runtime, 12345);
        assert_eq!(backend.size(), 12345);
        assert_eq!(backend.spec(), DeviceSpec::new(0, 0));
        assert_eq!(runtime.live_regions(), 1);
    }

    #[test]
    fn test_allocate_too_large() {
        let runtime = HostRuntime::with_capacities(&[4096]);
        let catalog = DeviceCatalog::enumerate(&runtime).unwrap();
        let device = resolve(&catalog, DeviceSpec::new(0, 0)).unwrap();

        for size in [0, 4097] {
            assert!(matches!(
                MemoryBackend::allocate(&runtime, device, size),
                Err(Error::AllocationFailed { size: s, .. }) if s == size
            ));
        }
        assert_eq!(runtime.live_regions(), 0);
    }

    #[test]
    fn test_out_of_range() {
        let runtime = HostRuntime::with_capacities(&[4096]);
        let mut backend = backend(&runtime, 4096);

        let mut buf = [0u8; 16];
        assert!(matches!(
            backend.read(4090, &mut buf),
            Err(Error::OutOfRange { offset: 4090, length: 16, size: 4096 })
        ));
        assert!(matches!(backend.write(u64::MAX, &buf), Err(Error::OutOfRange { .. })));
        backend.read(4080, &mut buf).unwrap();
        backend.read(4096, &mut []).unwrap();
    }

    #[test]
    fn test_flush_and_trim_keep_contents() {
        let runtime = HostRuntime::with_capacities(&[4096]);
        let mut backend = backend(&runtime, 4096);

        backend.write(100, b"persistent").unwrap();
        backend.flush().unwrap();
        backend.trim(0, 4096).unwrap();
        backend.trim(1 << 40, u32::MAX).unwrap();

        let mut buf = [0u8; 10];
        backend.read(100, &mut buf).unwrap();
        assert_eq!(&buf, b"persistent");
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let runtime = HostRuntime::with_capacities(&[4096]);
        let mut backend = backend(&runtime, 4096);

        backend.disconnect().unwrap();
        assert!(backend.is_released());
        assert_eq!(runtime.live_regions(), 0);
        assert!(matches!(backend.disconnect(), Err(Error::AlreadyReleased)));
        assert_eq!(runtime.live_regions(), 0);
    }

    #[test]
    fn test_drop_releases_region() {
        let runtime = HostRuntime::with_capacities(&[4096]);
        let backend = backend(&runtime, 64);
        assert_eq!(runtime.live_regions(), 1);
        drop(backend);
        assert_eq!(runtime.live_regions(), 0);
    }

    #[test]
    fn test_use_after_disconnect() {
        let runtime = HostRuntime::with_capacities(&[4096]);
        let mut backend = backend(&runtime, 4096);
        backend.disconnect().unwrap();

        let mut buf = [0u8; 4];
        assert!(matches!(backend.read(0, &mut buf), Err(Error::BackendReleased)));
        assert!(matches!(backend.write(0, &buf), Err(Error::BackendReleased)));
        assert!(matches!(backend.flush(), Err(Error::BackendReleased)));
        assert!(matches!(backend.trim(0, 4), Err(Error::BackendReleased)));
        // Range errors do not take precedence over the released state.
        assert!(matches!(backend.read(1 << 20, &mut buf), Err(Error::BackendReleased)));
    }

    #[test]
    fn test_transfer_failure() {
        let device = HostDevice::new("flaky", 4096);
        let fault = device.fault_switch();
        let runtime = HostRuntime::new().with_platform("Host", vec![device]);
        let mut backend = backend(&runtime, 4096);

        fault.store(true, Ordering::SeqCst);
        assert!(matches!(backend.write(0, b"x"), Err(Error::Transfer(_))));
        fault.store(false, Ordering::SeqCst);
        backend.write(0, b"x").unwrap();
    }

    proptest! {
        #[test]
        fn write_then_read_returns_written(
            offset in 0u64..8192,
            data in proptest::collection::vec(any::<u8>(), 0..1024),
        ) {
            let runtime = HostRuntime::with_capacities(&[8192]);
            let mut backend = backend(&runtime, 8192);
            let fits = offset + data.len() as u64 <= 8192;

            prop_assert_eq!(backend.write(offset, &data).is_ok(), fits);
            if fits {
                let mut buf = vec![0u8; data.len()];
                backend.read(offset, &mut buf).unwrap();
                prop_assert_eq!(buf, data);
            }
        }
    }
}
