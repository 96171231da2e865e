//! Platform and device enumeration.
//!
//! Enumeration is best effort: a device whose metadata cannot be read is
//! still listed, with empty or zero values in place of what is missing.

use std::fmt::{self, Write};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::runtime::{Runtime, RuntimeError};
use crate::selector::DeviceSpec;

/// Metadata of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    /// Total global memory in bytes.
    pub memory: u64,
    /// Availability as reported by the runtime.
    pub available: bool,
}

/// A device as found during enumeration.
#[derive(Debug, Clone)]
pub struct DeviceEntry<D> {
    pub spec: DeviceSpec,
    pub handle: D,
    pub info: DeviceInfo,
}

/// A platform and its devices.
#[derive(Debug, Clone)]
pub struct PlatformEntry<P, D> {
    pub index: usize,
    pub name: String,
    pub handle: P,
    pub devices: Vec<DeviceEntry<D>>,
}

/// Snapshot of all platforms and devices, taken once per invocation.
pub struct DeviceCatalog<T: Runtime> {
    platforms: Vec<PlatformEntry<T::Platform, T::Device>>,
}

impl<T: Runtime> DeviceCatalog<T> {
    /// Query the runtime for every platform and device.
    pub fn enumerate(runtime: &T) -> Result<Self> {
        let handles = runtime.platforms().unwrap_or_else(|err| {
            warn!(%err, "platform enumeration failed");
            Vec::new()
        });
        if handles.is_empty() {
            return Err(Error::NoPlatformFound);
        }

        let platforms = handles
            .into_iter()
            .enumerate()
            .map(|(index, handle)| {
                let name = runtime.platform_name(&handle).unwrap_or_else(|err| {
                    debug!(platform = index, %err, "platform name query failed");
                    String::new()
                });
                debug!(platform = index, name = %name, "platform found");
                let devices = runtime.devices(&handle).unwrap_or_else(|err| {
                    warn!(platform = index, %err, "device enumeration failed");
                    Vec::new()
                });
                let devices = devices
                    .into_iter()
                    .enumerate()
                    .map(|(device, handle)| {
                        let spec = DeviceSpec::new(index, device);
                        let info = query_info(runtime, spec, &handle);
                        DeviceEntry { spec, handle, info }
                    })
                    .collect();
                PlatformEntry {
                    index,
                    name,
                    handle,
                    devices,
                }
            })
            .collect();

        Ok(Self { platforms })
    }

    pub fn platforms(&self) -> &[PlatformEntry<T::Platform, T::Device>] {
        &self.platforms
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceEntry<T::Device>> {
        self.platforms.iter().flat_map(|p| p.devices.iter())
    }

    /// The device listing shown by the `list` operation.
    pub fn table(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_table(&mut out);
        out
    }

    pub fn write_table<W: Write>(&self, out: &mut W) -> fmt::Result {
        writeln!(
            out,
            "{:>11}  {:>9}  {:<NAME_WIDTH$}  {:<VENDOR_WIDTH$}  {:>16}  {:>6}",
            "Platform ID", "Device ID", "Name", "Vendor", "Total Memory", "Usable"
        )?;
        writeln!(out, "{}", "=".repeat(11 + 9 + NAME_WIDTH + VENDOR_WIDTH + 16 + 6 + 10))?;
        for device in self.devices() {
            writeln!(
                out,
                "{:>11}  {:>9}  {:<NAME_WIDTH$}  {:<VENDOR_WIDTH$}  {:>16}  {:>6}",
                device.spec.platform,
                device.spec.device,
                truncate(&device.info.name, NAME_WIDTH),
                truncate(&device.info.vendor, VENDOR_WIDTH),
                device.info.memory,
                if device.info.available { "yes" } else { "no" },
            )?;
        }
        Ok(())
    }
}

const NAME_WIDTH: usize = 32;
const VENDOR_WIDTH: usize = 24;

fn truncate(s: &str, width: usize) -> &str {
    match s.char_indices().nth(width) {
        Some((end, _)) => &s[..end],
        None => s,
    }
}

fn query_info<T: Runtime>(runtime: &T, spec: DeviceSpec, device: &T::Device) -> DeviceInfo {
    fn or_default<V: Default>(spec: DeviceSpec, value: std::result::Result<V, RuntimeError>) -> V {
        value.unwrap_or_else(|err| {
            debug!(device = %spec, %err, "device query failed");
            V::default()
        })
    }

    DeviceInfo {
        name: or_default(spec, runtime.device_name(device)),
        vendor: or_default(spec, runtime.device_vendor(device)),
        memory: or_default(spec, runtime.device_memory(device)),
        available: or_default(spec, runtime.device_available(device)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostDevice, HostRuntime};

    const GIB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_enumerate() {
        let runtime = HostRuntime::new()
            .with_platform(
                "Host",
                vec![HostDevice::new("small", 2 * GIB), HostDevice::new("large", 4 * GIB)],
            )
            .with_platform("Empty", vec![]);
        let catalog = DeviceCatalog::enumerate(&runtime).unwrap();

        assert_eq!(catalog.platforms().len(), 2);
        assert_eq!(catalog.platforms()[0].name, "Host");
        assert_eq!(catalog.platforms()[1].name, "Empty");
        assert_eq!(catalog.platforms()[1].devices.len(), 0);
        let devices: Vec<_> = catalog.devices().collect();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].spec, DeviceSpec::new(0, 1));
        assert_eq!(devices[1].info.memory, 4 * GIB);
        assert!(devices[1].info.available);
    }

    #[test]
    fn test_no_platform() {
        assert!(matches!(
            DeviceCatalog::enumerate(&HostRuntime::new()),
            Err(Error::NoPlatformFound)
        ));
    }

    #[test]
    fn test_unreadable_metadata_is_tolerated() {
        let runtime = HostRuntime::new().with_platform(
            "Host",
            vec![
                HostDevice::new("broken", GIB).unreadable(),
                HostDevice::new("fine", GIB).unavailable(),
            ],
        );
        let catalog = DeviceCatalog::enumerate(&runtime).unwrap();
        let devices: Vec<_> = catalog.devices().collect();

        assert_eq!(devices[0].info, DeviceInfo::default());
        assert_eq!(devices[1].info.name, "fine");
        assert!(!devices[1].info.available);
    }

    #[test]
    fn test_table_has_stable_width() {
        let runtime = HostRuntime::new().with_platform(
            "Host",
            vec![
                HostDevice::new("a", GIB),
                HostDevice::new("a device with a very long marketing name indeed", 2 * GIB),
            ],
        );
        let table = DeviceCatalog::enumerate(&runtime).unwrap().table();
        let lines: Vec<_> = table.lines().collect();

        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("Platform ID"));
        assert_eq!(lines[2].len(), lines[3].len());
        assert_eq!(lines[0].len(), lines[2].len());
        assert!(lines[3].contains(&(2 * GIB).to_string()));
        assert!(lines[3].ends_with("yes"));
    }
}
