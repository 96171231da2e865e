//! Picking devices out of a catalog by `platform:device` index pairs.

use std::fmt;
use std::str::FromStr;

use crate::catalog::{DeviceCatalog, DeviceEntry};
use crate::error::{Error, Result};
use crate::runtime::Runtime;

/// A `platform:device` index pair as given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceSpec {
    pub platform: usize,
    pub device: usize,
}

impl DeviceSpec {
    pub fn new(platform: usize, device: usize) -> Self {
        Self { platform, device }
    }
}

impl FromStr for DeviceSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidDeviceSpec(s.to_string());
        let (platform, device) = s.split_once(':').ok_or_else(invalid)?;
        let index = |part: &str| -> Result<usize> {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse().map_err(|_| invalid())
        };
        Ok(Self {
            platform: index(platform)?,
            device: index(device)?,
        })
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.device)
    }
}

/// Look up one device, checking both indices against the enumeration.
pub fn resolve<T: Runtime>(
    catalog: &DeviceCatalog<T>,
    spec: DeviceSpec,
) -> Result<&DeviceEntry<T::Device>> {
    let platforms = catalog.platforms();
    let out_of_range = |devices| Error::DeviceIndexOutOfRange {
        spec,
        platforms: platforms.len(),
        devices,
    };
    let platform = platforms.get(spec.platform).ok_or_else(|| out_of_range(0))?;
    platform
        .devices
        .get(spec.device)
        .ok_or_else(|| out_of_range(platform.devices.len()))
}

/// Look up several distinct devices, in the given order.
pub fn resolve_all<'a, T: Runtime>(
    catalog: &'a DeviceCatalog<T>,
    specs: &[DeviceSpec],
) -> Result<Vec<&'a DeviceEntry<T::Device>>> {
    for (i, spec) in specs.iter().enumerate() {
        if specs[..i].contains(spec) {
            return Err(Error::DuplicateDevice(*spec));
        }
    }
    specs.iter().map(|spec| resolve(catalog, *spec)).collect()
}
