use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vram_nbd::config::{Cli, Operation};
use vram_nbd::host::HostRuntime;
use vram_nbd::runtime::{Region, Runtime};
use vram_nbd::selector::{resolve, resolve_all};
use vram_nbd::{attach_device_with, BridgeAdapter, DeviceCatalog, MemoryBackend, StripeSet, Volume};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.default_log_filter().into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let result = if cli.emulate.is_empty() {
        run_accelerator(&cli).await
    } else {
        let capacities: Vec<u64> = cli.emulate.iter().map(|size| size.bytes()).collect();
        run(HostRuntime::with_capacities(&capacities), &cli).await
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(2)
        }
    }
}

#[cfg(feature = "opencl")]
async fn run_accelerator(cli: &Cli) -> anyhow::Result<()> {
    run(vram_nbd::opencl::OpenClRuntime::new(), cli).await
}

#[cfg(not(feature = "opencl"))]
async fn run_accelerator(cli: &Cli) -> anyhow::Result<()> {
    tracing::warn!("built without the `opencl` feature, only --emulate devices are available");
    run(HostRuntime::new(), cli).await
}

async fn run<T>(runtime: T, cli: &Cli) -> anyhow::Result<()>
where
    T: Runtime,
    T::Region: Unpin,
{
    let catalog = DeviceCatalog::enumerate(&runtime)?;
    info!("{} compatible platform(s) found", catalog.platforms().len());

    match &cli.operation {
        Operation::List => {
            eprint!("{}", catalog.table());
            Ok(())
        }
        Operation::Single {
            nbd_device,
            size,
            device,
        } => {
            info!(device = %device, "enqueuing device");
            let entry = resolve(&catalog, *device)?;
            let backend = MemoryBackend::allocate(&runtime, entry, size.bytes())?;
            serve(nbd_device, Volume::Single(backend), cli).await
        }
        Operation::Stripe {
            nbd_device,
            size,
            devices,
        } => {
            for device in devices {
                info!(device = %device, "enqueuing device");
            }
            let entries = resolve_all(&catalog, devices)?;
            let set = StripeSet::allocate(&runtime, &entries, size.bytes())?;
            serve(nbd_device, Volume::Striped(set), cli).await
        }
    }
}

async fn serve<R>(path: &Path, volume: Volume<R>, cli: &Cli) -> anyhow::Result<()>
where
    R: Region + Unpin,
{
    let adapter = BridgeAdapter::new(volume, cli.block_size)?;
    attach_device_with(path, adapter, cli.attach_options())
        .await
        .with_context(|| format!("serving {}", path.display()))
}
