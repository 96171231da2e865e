//! OpenCL runtime: regions are `CL_MEM_READ_WRITE` buffers.

use ocl::enums::{DeviceInfo, DeviceInfoResult};
use ocl::flags::MemFlags;
use ocl::{Buffer, Context, Device, Platform, Queue};

use crate::runtime::{Region, Runtime, RuntimeError};

/// The OpenCL installable client driver, as seen by this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenClRuntime;

impl OpenClRuntime {
    pub fn new() -> Self {
        Self
    }
}

/// A device together with the platform it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct ClDevice {
    platform: Platform,
    device: Device,
}

impl Runtime for OpenClRuntime {
    type Platform = Platform;
    type Device = ClDevice;
    type Region = ClRegion;

    fn platforms(&self) -> Result<Vec<Platform>, RuntimeError> {
        let ids = ocl::core::get_platform_ids()
            .map_err(|err| RuntimeError::new("clGetPlatformIDs", err))?;
        Ok(ids.into_iter().map(Platform::new).collect())
    }

    fn platform_name(&self, platform: &Platform) -> Result<String, RuntimeError> {
        platform
            .name()
            .map_err(|err| RuntimeError::new("CL_PLATFORM_NAME", err))
    }

    fn devices(&self, platform: &Platform) -> Result<Vec<ClDevice>, RuntimeError> {
        let devices =
            Device::list_all(platform).map_err(|err| RuntimeError::new("clGetDeviceIDs", err))?;
        Ok(devices
            .into_iter()
            .map(|device| ClDevice {
                platform: *platform,
                device,
            })
            .collect())
    }

    fn device_name(&self, device: &ClDevice) -> Result<String, RuntimeError> {
        device
            .device
            .name()
            .map_err(|err| RuntimeError::new("CL_DEVICE_NAME", err))
    }

    fn device_vendor(&self, device: &ClDevice) -> Result<String, RuntimeError> {
        device
            .device
            .vendor()
            .map_err(|err| RuntimeError::new("CL_DEVICE_VENDOR", err))
    }

    fn device_memory(&self, device: &ClDevice) -> Result<u64, RuntimeError> {
        match device.device.info(DeviceInfo::GlobalMemSize) {
            Ok(DeviceInfoResult::GlobalMemSize(bytes)) => Ok(bytes),
            Ok(other) => Err(RuntimeError::new(
                "CL_DEVICE_GLOBAL_MEM_SIZE",
                format!("unexpected {other:?}"),
            )),
            Err(err) => Err(RuntimeError::new("CL_DEVICE_GLOBAL_MEM_SIZE", err)),
        }
    }

    fn device_available(&self, device: &ClDevice) -> Result<bool, RuntimeError> {
        match device.device.info(DeviceInfo::Available) {
            Ok(DeviceInfoResult::Available(available)) => Ok(available),
            Ok(other) => Err(RuntimeError::new(
                "CL_DEVICE_AVAILABLE",
                format!("unexpected {other:?}"),
            )),
            Err(err) => Err(RuntimeError::new("CL_DEVICE_AVAILABLE", err)),
        }
    }

    fn allocate(&self, device: &ClDevice, size: u64) -> Result<ClRegion, RuntimeError> {
        let len = usize::try_from(size).map_err(|err| RuntimeError::new("clCreateBuffer", err))?;
        let context = Context::builder()
            .platform(device.platform)
            .devices(device.device)
            .build()
            .map_err(|err| RuntimeError::new("clCreateContext", err))?;
        let queue = Queue::new(&context, device.device, None)
            .map_err(|err| RuntimeError::new("clCreateCommandQueue", err))?;
        // Filling commits the allocation now rather than on first use.
        let buffer = Buffer::<u8>::builder()
            .queue(queue.clone())
            .flags(MemFlags::new().read_write())
            .len(len)
            .fill_val(0u8)
            .build()
            .map_err(|err| RuntimeError::new("clCreateBuffer", err))?;
        queue
            .finish()
            .map_err(|err| RuntimeError::new("clFinish", err))?;

        Ok(ClRegion {
            buffer,
            queue,
            context,
            size,
        })
    }
}

/// A buffer and the queue and context it was created with. Dropping the
/// fields in declaration order releases them buffer first.
#[derive(Debug)]
pub struct ClRegion {
    buffer: Buffer<u8>,
    queue: Queue,
    context: Context,
    size: u64,
}

fn offset(operation: &'static str, offset: u64) -> Result<usize, RuntimeError> {
    usize::try_from(offset).map_err(|err| RuntimeError::new(operation, err))
}

impl Region for ClRegion {
    fn len(&self) -> u64 {
        self.size
    }

    fn read(&mut self, from: u64, dst: &mut [u8]) -> Result<(), RuntimeError> {
        if dst.is_empty() {
            return Ok(());
        }
        let from = offset("clEnqueueReadBuffer", from)?;
        let len = dst.len();
        // Buffer commands block until the transfer is done unless told otherwise.
        self.buffer
            .read(dst)
            .queue(&self.queue)
            .offset(from)
            .len(len)
            .enq()
            .map_err(|err| RuntimeError::new("clEnqueueReadBuffer", err))?;
        self.queue
            .finish()
            .map_err(|err| RuntimeError::new("clFinish", err))
    }

    fn write(&mut self, to: u64, src: &[u8]) -> Result<(), RuntimeError> {
        if src.is_empty() {
            return Ok(());
        }
        let to = offset("clEnqueueWriteBuffer", to)?;
        self.buffer
            .write(src)
            .queue(&self.queue)
            .offset(to)
            .len(src.len())
            .enq()
            .map_err(|err| RuntimeError::new("clEnqueueWriteBuffer", err))?;
        self.queue
            .finish()
            .map_err(|err| RuntimeError::new("clFinish", err))
    }

    fn release(self) -> Result<(), RuntimeError> {
        let finished = self
            .queue
            .finish()
            .map_err(|err| RuntimeError::new("clFinish", err));
        let ClRegion {
            buffer,
            queue,
            context,
            ..
        } = self;
        drop(buffer);
        drop(queue);
        drop(context);
        finished
    }
}
