//! A [`Runtime`] backed by host memory.
//!
//! Emulates platforms and devices of given capacities so the bridge can be
//! exercised without accelerator hardware. Devices can be made to fail their
//! metadata queries or their transfers.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::runtime::{Region, Runtime, RuntimeError};

/// An emulated device.
#[derive(Debug, Clone)]
pub struct HostDevice {
    name: String,
    vendor: String,
    memory: u64,
    available: bool,
    readable: bool,
    faults: Faults,
}

/// Shared fault flags of a device and its regions.
#[derive(Debug, Clone, Default)]
struct Faults {
    all: Arc<AtomicBool>,
    writes: Arc<AtomicBool>,
    torn: Arc<AtomicBool>,
}

impl HostDevice {
    pub fn new(name: impl Into<String>, memory: u64) -> Self {
        Self {
            name: name.into(),
            vendor: "Host Memory".to_string(),
            memory,
            available: true,
            readable: true,
            faults: Faults::default(),
        }
    }

    /// Report the device as unavailable.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Make every metadata query on this device fail.
    pub fn unreadable(mut self) -> Self {
        self.readable = false;
        self
    }

    /// While the returned flag is set, every transfer on regions of this
    /// device fails.
    pub fn fault_switch(&self) -> Arc<AtomicBool> {
        self.faults.all.clone()
    }

    /// While the returned flag is set, writes to regions of this device fail.
    pub fn write_fault_switch(&self) -> Arc<AtomicBool> {
        self.faults.writes.clone()
    }

    /// When the returned flag is set, the next write to a region of this
    /// device stores only its first half and then fails. The flag clears
    /// itself.
    pub fn torn_write_switch(&self) -> Arc<AtomicBool> {
        self.faults.torn.clone()
    }

    fn query<V>(
        &self,
        operation: &'static str,
        value: impl FnOnce() -> V,
    ) -> Result<V, RuntimeError> {
        if self.readable {
            Ok(value())
        } else {
            Err(RuntimeError::new(operation, "device info unavailable"))
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostPlatform {
    name: String,
    devices: Vec<HostDevice>,
}

/// Host-memory runtime.
#[derive(Debug, Clone, Default)]
pub struct HostRuntime {
    platforms: Vec<HostPlatform>,
    live: Arc<AtomicUsize>,
}

impl HostRuntime {
    /// A runtime without any platform.
    pub fn new() -> Self {
        Self::default()
    }

    /// One platform with one device per capacity.
    pub fn with_capacities(capacities: &[u64]) -> Self {
        let devices = capacities
            .iter()
            .enumerate()
            .map(|(i, &memory)| HostDevice::new(format!("Emulated device {i}"), memory))
            .collect();
        Self::new().with_platform("Host Emulation", devices)
    }

    pub fn with_platform(mut self, name: impl Into<String>, devices: Vec<HostDevice>) -> Self {
        self.platforms.push(HostPlatform {
            name: name.into(),
            devices,
        });
        self
    }

    /// Number of regions allocated and not yet released.
    pub fn live_regions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl Runtime for HostRuntime {
    type Platform = HostPlatform;
    type Device = HostDevice;
    type Region = HostRegion;

    fn platforms(&self) -> Result<Vec<HostPlatform>, RuntimeError> {
        Ok(self.platforms.clone())
    }

    fn platform_name(&self, platform: &HostPlatform) -> Result<String, RuntimeError> {
        Ok(platform.name.clone())
    }

    fn devices(&self, platform: &HostPlatform) -> Result<Vec<HostDevice>, RuntimeError> {
        Ok(platform.devices.clone())
    }

    fn device_name(&self, device: &HostDevice) -> Result<String, RuntimeError> {
        device.query("device name", || device.name.clone())
    }

    fn device_vendor(&self, device: &HostDevice) -> Result<String, RuntimeError> {
        device.query("device vendor", || device.vendor.clone())
    }

    fn device_memory(&self, device: &HostDevice) -> Result<u64, RuntimeError> {
        device.query("device memory", || device.memory)
    }

    fn device_available(&self, device: &HostDevice) -> Result<bool, RuntimeError> {
        device.query("device availability", || device.available)
    }

    fn allocate(&self, device: &HostDevice, size: u64) -> Result<HostRegion, RuntimeError> {
        if size == 0 || size > device.memory {
            return Err(RuntimeError::new(
                "allocate",
                format!("cannot reserve {size} bytes on a device with {} bytes", device.memory),
            ));
        }
        let len = usize::try_from(size).map_err(|err| RuntimeError::new("allocate", err))?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(HostRegion {
            data: vec![0; len],
            faults: device.faults.clone(),
            live: self.live.clone(),
        })
    }
}

/// A region of host memory.
#[derive(Debug)]
pub struct HostRegion {
    data: Vec<u8>,
    faults: Faults,
    live: Arc<AtomicUsize>,
}

impl HostRegion {
    fn range(
        &self,
        operation: &'static str,
        offset: u64,
        len: usize,
    ) -> Result<Range<usize>, RuntimeError> {
        let write_failed = operation == "write" && self.faults.writes.load(Ordering::SeqCst);
        if write_failed || self.faults.all.load(Ordering::SeqCst) {
            return Err(RuntimeError::new(operation, "device fault"));
        }
        usize::try_from(offset)
            .ok()
            .and_then(|start| Some(start..start.checked_add(len)?))
            .filter(|range| range.end <= self.data.len())
            .ok_or_else(|| RuntimeError::new(operation, "range outside of buffer"))
    }
}

impl Region for HostRegion {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&mut self, offset: u64, dst: &mut [u8]) -> Result<(), RuntimeError> {
        let range = self.range("read", offset, dst.len())?;
        dst.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, offset: u64, src: &[u8]) -> Result<(), RuntimeError> {
        let range = self.range("write", offset, src.len())?;
        if self.faults.torn.swap(false, Ordering::SeqCst) {
            let half = src.len() / 2;
            self.data[range.start..range.start + half].copy_from_slice(&src[..half]);
            return Err(RuntimeError::new("write", "transfer interrupted"));
        }
        self.data[range].copy_from_slice(src);
        Ok(())
    }

    fn release(self) -> Result<(), RuntimeError> {
        self.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
