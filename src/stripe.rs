//! One logical address space over regions on several devices.
//!
//! Regions are laid out back to back: region `i` covers the logical range
//! starting at the sum of the sizes of regions `0..i`. A request crossing a
//! region boundary is split into one sub-request per region, issued in
//! offset order.

use std::ops::Range;

use tracing::{debug, error, info, warn};

use crate::backend::{MemoryBackend, Storage};
use crate::catalog::DeviceEntry;
use crate::error::{Error, Result};
use crate::runtime::{Region, Runtime};

/// The part of a logical request that falls into one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Index of the owning region.
    pub region: usize,
    /// Offset within the region.
    pub offset: u64,
    /// Position of this part within the caller's buffer.
    pub buf: Range<usize>,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Ordered, immutable set of regions on distinct devices.
#[derive(Debug)]
pub struct StripeSet<R: Region> {
    regions: Vec<MemoryBackend<R>>,
    /// Logical start offset of each region.
    starts: Vec<u64>,
    size: u64,
}

/// Split `total` bytes into `parts` shares, the leading shares taking one
/// extra byte each until the remainder is used up.
pub fn split_evenly(total: u64, parts: usize) -> Vec<u64> {
    if parts == 0 {
        return Vec::new();
    }
    let parts_u64 = parts as u64;
    let (share, rest) = (total / parts_u64, total % parts_u64);
    (0..parts_u64).map(|i| share + u64::from(i < rest)).collect()
}

impl<R: Region> StripeSet<R> {
    /// Allocate `total` bytes spread evenly over `devices`.
    ///
    /// Allocation is all or nothing: when one region cannot be allocated the
    /// regions already reserved are released again.
    pub fn allocate<T>(runtime: &T, devices: &[&DeviceEntry<T::Device>], total: u64) -> Result<Self>
    where
        T: Runtime<Region = R>,
    {
        let mut regions = Vec::with_capacity(devices.len());
        for (device, size) in devices.iter().zip(split_evenly(total, devices.len())) {
            match MemoryBackend::allocate(runtime, device, size) {
                Ok(backend) => regions.push(backend),
                Err(err) => {
                    for mut backend in regions {
                        match backend.disconnect() {
                            Ok(()) | Err(Error::AlreadyReleased) => {}
                            Err(release) => warn!(
                                device = %backend.spec(),
                                err = %release,
                                "release after failed allocation"
                            ),
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(Self::new(regions))
    }

    /// Concatenate already allocated backends, in order.
    pub fn new(regions: Vec<MemoryBackend<R>>) -> Self {
        let mut starts = Vec::with_capacity(regions.len());
        let mut size = 0;
        for region in &regions {
            starts.push(size);
            size += region.size();
        }
        info!(regions = regions.len(), size, "stripe set ready");
        Self {
            regions,
            starts,
            size,
        }
    }

    /// The region owning logical `offset` and the offset within it.
    pub fn locate(&self, offset: u64) -> Option<(usize, u64)> {
        if offset >= self.size {
            return None;
        }
        // First region starting after `offset`, minus one. Empty regions
        // share their start with the next one and are skipped this way.
        let region = self.starts.partition_point(|&start| start <= offset) - 1;
        Some((region, offset - self.starts[region]))
    }

    /// Split the logical range `offset..offset + length` into per-region
    /// segments in offset order.
    pub fn segments(&self, offset: u64, length: u64) -> Result<Vec<Segment>> {
        let out_of_range = Error::OutOfRange {
            offset,
            length,
            size: self.size,
        };
        match offset.checked_add(length) {
            Some(end) if end <= self.size => {}
            _ => return Err(out_of_range),
        }

        let mut segments = Vec::new();
        let mut done = 0u64;
        while done < length {
            let (region, local) = match self.locate(offset + done) {
                Some(found) => found,
                None => return Err(out_of_range),
            };
            let available = self.regions[region].size() - local;
            let take = available.min(length - done);
            let start = done as usize;
            segments.push(Segment {
                region,
                offset: local,
                buf: start..start + take as usize,
            });
            done += take;
        }
        Ok(segments)
    }

    fn sub_request_failed(segment: &Segment, source: Error) -> Error {
        Error::SubRequestFailed {
            region: segment.region,
            offset: segment.offset,
            length: segment.len() as u64,
            source: Box::new(source),
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.regions.iter().any(|region| region.is_released()) {
            return Err(Error::BackendReleased);
        }
        Ok(())
    }

    fn write_segments(&mut self, segments: &[Segment], data: &[u8]) -> Result<()> {
        for (done, segment) in segments.iter().enumerate() {
            if let Err(err) = self.regions[segment.region].write(segment.offset, &data[segment.buf.clone()]) {
                debug!(completed = done, total = segments.len(), "striped write aborted");
                return Err(Self::sub_request_failed(segment, err));
            }
        }
        Ok(())
    }
}

impl<R: Region> Storage for StripeSet<R> {
    fn size(&self) -> u64 {
        self.size
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_live()?;
        for segment in self.segments(offset, buf.len() as u64)? {
            self.regions[segment.region]
                .read(segment.offset, &mut buf[segment.buf.clone()])
                .map_err(|err| Self::sub_request_failed(&segment, err))?;
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.ensure_live()?;
        let segments = self.segments(offset, data.len() as u64)?;
        if segments.len() < 2 {
            return self.write_segments(&segments, data);
        }

        // Keep what is about to be overwritten so a failure half way
        // through can be undone.
        let mut previous = vec![0u8; data.len()];
        for segment in &segments {
            self.regions[segment.region]
                .read(segment.offset, &mut previous[segment.buf.clone()])
                .map_err(|err| Self::sub_request_failed(segment, err))?;
        }

        let result = self.write_segments(&segments, data);
        if let Err(Error::SubRequestFailed { region, .. }) = &result {
            // The failed segment may have been partly written, so it is
            // restored along with the ones before it.
            let failed = segments
                .iter()
                .position(|s| s.region == *region)
                .unwrap_or(segments.len() - 1);
            for segment in &segments[..=failed] {
                if let Err(err) =
                    self.regions[segment.region].write(segment.offset, &previous[segment.buf.clone()])
                {
                    error!(region = segment.region, %err, "rollback of partial write failed");
                }
            }
        }
        result
    }

    fn flush(&mut self) -> Result<()> {
        self.ensure_live()?;
        for region in &mut self.regions {
            region.flush()?;
        }
        Ok(())
    }

    fn trim(&mut self, offset: u64, length: u32) -> Result<()> {
        self.ensure_live()?;
        // Trimming is advisory, a range past the end is simply ignored.
        let Ok(segments) = self.segments(offset, u64::from(length)) else {
            return Ok(());
        };
        for segment in segments {
            self.regions[segment.region].trim(segment.offset, segment.len() as u32)?;
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let mut released = 0;
        for (index, region) in self.regions.iter_mut().enumerate() {
            match region.disconnect() {
                Ok(()) => released += 1,
                Err(Error::AlreadyReleased) => {}
                Err(err) => warn!(region = index, %err, "disconnect failed"),
            }
        }
        if released == 0 && !self.regions.is_empty() {
            return Err(Error::AlreadyReleased);
        }
        Ok(())
    }
}
