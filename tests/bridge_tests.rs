//! End-to-end tests: enumeration, selection, allocation and serving against
//! the host-memory runtime.

use vram_nbd::bridge::DEFAULT_BLOCK_SIZE;
use vram_nbd::catalog::DeviceCatalog;
use vram_nbd::host::{HostDevice, HostRuntime};
use vram_nbd::selector::{resolve, resolve_all};
use vram_nbd::size::parse_size;
use vram_nbd::{
    attach_device, BlockDevice, BridgeAdapter, DeviceSpec, Error, MemoryBackend, Storage,
    StripeSet, Volume,
};

const GIB: u64 = 1024 * 1024 * 1024;

fn two_devices() -> HostRuntime {
    HostRuntime::new().with_platform(
        "Host",
        vec![HostDevice::new("two", 2 * GIB), HostDevice::new("four", 4 * GIB)],
    )
}

#[test]
fn test_single_allocates_requested_size_on_selected_device() {
    let runtime = two_devices();
    let catalog = DeviceCatalog::enumerate(&runtime).unwrap();
    let spec: DeviceSpec = "0:1".parse().unwrap();

    let device = resolve(&catalog, spec).unwrap();
    assert_eq!(device.info.name, "four");
    let backend = MemoryBackend::allocate(&runtime, device, parse_size("1G").unwrap()).unwrap();

    assert_eq!(backend.size(), 1_073_741_824);
    assert_eq!(backend.spec(), DeviceSpec::new(0, 1));
    assert_eq!(runtime.live_regions(), 1);
}

#[test]
fn test_selection_out_of_range_allocates_nothing() {
    let runtime = two_devices();
    let catalog = DeviceCatalog::enumerate(&runtime).unwrap();

    for spec in ["0:2", "1:0"] {
        let spec: DeviceSpec = spec.parse().unwrap();
        assert!(matches!(
            resolve(&catalog, spec),
            Err(Error::DeviceIndexOutOfRange { .. })
        ));
    }
    let specs = [DeviceSpec::new(0, 0), DeviceSpec::new(0, 5)];
    assert!(matches!(
        resolve_all(&catalog, &specs),
        Err(Error::DeviceIndexOutOfRange { .. })
    ));
    assert_eq!(runtime.live_regions(), 0);
}

#[test]
fn test_allocation_larger_than_device() {
    let runtime = two_devices();
    let catalog = DeviceCatalog::enumerate(&runtime).unwrap();
    let device = resolve(&catalog, DeviceSpec::new(0, 0)).unwrap();

    assert!(matches!(
        MemoryBackend::allocate(&runtime, device, parse_size("3G").unwrap()),
        Err(Error::AllocationFailed { .. })
    ));
    assert_eq!(runtime.live_regions(), 0);
}

#[tokio::test]
async fn test_striped_volume_through_adapter() {
    let runtime = HostRuntime::with_capacities(&[512 * 1024, 512 * 1024]);
    let catalog = DeviceCatalog::enumerate(&runtime).unwrap();
    let devices = resolve_all(&catalog, &[DeviceSpec::new(0, 0), DeviceSpec::new(0, 1)]).unwrap();
    let set = StripeSet::allocate(&runtime, &devices, parse_size("1M").unwrap()).unwrap();
    let mut adapter = BridgeAdapter::new(Volume::Striped(set), 512).unwrap();
    assert_eq!(adapter.block_count(), 2048);

    let data: Vec<u8> = (0..600 * 1024u32).map(|i| (i % 241) as u8).collect();
    adapter.write(400 * 1024, &data).await.unwrap();
    adapter.flush().await.unwrap();
    adapter.trim(0, 4096).await.unwrap();

    let mut all = vec![0u8; 1024 * 1024];
    adapter.read(0, &mut all).await.unwrap();
    assert!(all[..400 * 1024].iter().all(|&b| b == 0));
    assert_eq!(&all[400 * 1024..1000 * 1024], &data[..]);
    assert!(all[1000 * 1024..].iter().all(|&b| b == 0));

    adapter.disconnect().await;
    assert_eq!(runtime.live_regions(), 0);
    assert!(adapter.read(0, &mut all[..512]).await.is_err());
}

#[tokio::test]
async fn test_failed_attach_releases_memory() {
    let runtime = HostRuntime::with_capacities(&[1 << 20]);
    let catalog = DeviceCatalog::enumerate(&runtime).unwrap();
    let device = resolve(&catalog, DeviceSpec::new(0, 0)).unwrap();
    let backend = MemoryBackend::allocate(&runtime, device, 1 << 20).unwrap();
    assert_eq!(runtime.live_regions(), 1);

    let adapter = BridgeAdapter::new(Volume::Single(backend), DEFAULT_BLOCK_SIZE).unwrap();
    assert!(attach_device("/nonexistent/nbd0", adapter).await.is_err());
    assert_eq!(runtime.live_regions(), 0);
}

#[test]
fn test_listing_does_not_allocate() {
    let runtime = two_devices();
    let table = DeviceCatalog::enumerate(&runtime).unwrap().table();

    assert!(table.contains("four"));
    assert!(table.contains(&(4 * GIB).to_string()));
    assert_eq!(runtime.live_regions(), 0);
}

#[test]
fn test_volume_smaller_than_a_block_is_refused() {
    let runtime = HostRuntime::with_capacities(&[GIB]);
    let catalog = DeviceCatalog::enumerate(&runtime).unwrap();
    let device = resolve(&catalog, DeviceSpec::new(0, 0)).unwrap();
    let backend = MemoryBackend::allocate(&runtime, device, parse_size("1K").unwrap()).unwrap();

    assert!(matches!(
        BridgeAdapter::new(Volume::Single(backend), DEFAULT_BLOCK_SIZE),
        Err(Error::VolumeTooSmall { size: 1024, block_size: 4096 })
    ));
    assert_eq!(runtime.live_regions(), 0);
}
