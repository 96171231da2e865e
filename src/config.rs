//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::bridge::{validate_block_size, DEFAULT_BLOCK_SIZE};
use crate::device::AttachOptions;
use crate::selector::DeviceSpec;
use crate::size::ByteSize;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "vram-nbd",
    version,
    about = "Use the spare memory of an OpenCL device as a block device",
    arg_required_else_help = true,
    after_help = "Examples:\n    \
        vram-nbd list\n    \
        vram-nbd single /dev/nbd0 512M 0:0\n    \
        vram-nbd stripe /dev/nbd1 1G 0:0 0:1 0:2"
)]
pub struct Cli {
    /// Enable verbose logging, including every block request.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Block size announced to the kernel.
    #[arg(
        long,
        global = true,
        value_name = "BYTES",
        default_value_t = DEFAULT_BLOCK_SIZE,
        value_parser = parse_block_size
    )]
    pub block_size: u32,

    /// Seconds the kernel waits for a request before failing it.
    #[arg(long, global = true, value_name = "SECS", default_value_t = 10)]
    pub timeout: u64,

    /// Serve from host memory instead of OpenCL, emulating one device of
    /// this capacity. Repeat for more devices.
    #[arg(long, global = true, value_name = "SIZE")]
    pub emulate: Vec<ByteSize>,

    #[command(subcommand)]
    pub operation: Operation,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// List available platforms and devices.
    List,

    /// Use memory from a single device.
    Single {
        /// NBD device node, e.g. /dev/nbd0.
        nbd_device: PathBuf,
        /// Capacity: digits with an optional K, M, G or T suffix.
        size: ByteSize,
        /// Device as <platform>:<device>, see `list`.
        device: DeviceSpec,
    },

    /// Use memory from several devices, one after another.
    Stripe {
        /// NBD device node, e.g. /dev/nbd0.
        nbd_device: PathBuf,
        /// Total capacity, split evenly over the devices.
        size: ByteSize,
        /// Devices as <platform>:<device>, see `list`.
        #[arg(required = true, num_args = 1..)]
        devices: Vec<DeviceSpec>,
    },
}

fn parse_block_size(s: &str) -> Result<u32, String> {
    let block_size = s.parse().map_err(|_| format!("{s:?} is not a number"))?;
    validate_block_size(block_size).map_err(|err| err.to_string())?;
    Ok(block_size)
}

impl Cli {
    pub fn attach_options(&self) -> AttachOptions {
        AttachOptions {
            timeout: self.timeout,
            ..AttachOptions::default()
        }
    }

    /// Log filter used when `RUST_LOG` is not set.
    pub fn default_log_filter(&self) -> &'static str {
        if self.verbose {
            "vram_nbd=debug"
        } else {
            "vram_nbd=info"
        }
    }
}
