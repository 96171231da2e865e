//! Kernel NBD driver ioctls.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use nix::{errno::Errno, libc, request_code_none};

// Flags are there
pub const HAS_FLAGS: u64 = 1;
// Send FLUSH
pub const SEND_FLUSH: u64 = 1 << 2;
// Send TRIM (discard)
pub const SEND_TRIM: u64 = 1 << 5;
// Send NBD_CMD_WRITE_ZEROES
pub const SEND_WRITE_ZEROES: u64 = 1 << 6;

/// Request numbers of the `0xab` ioctl family.
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum Nbd {
    SetSock = 0,
    SetBlockSize = 1,
    DoIt = 3,
    ClearSock = 4,
    ClearQueue = 5,
    SetSizeBlocks = 7,
    Disconnect = 8,
    SetTimeout = 9,
    SetFlags = 10,
}

fn ioctl<F: AsRawFd>(f: &F, request: Nbd, arg: libc::c_ulong) -> io::Result<()> {
    Errno::result(unsafe { libc::ioctl(f.as_raw_fd(), request_code_none!(0xab, request as u8), arg) })?;
    Ok(())
}

pub fn set_sock<F: AsRawFd>(f: &F, sock: RawFd) -> io::Result<()> {
    ioctl(f, Nbd::SetSock, sock as libc::c_ulong)
}

pub fn set_block_size<F: AsRawFd>(f: &F, size: u32) -> io::Result<()> {
    ioctl(f, Nbd::SetBlockSize, libc::c_ulong::from(size))
}

/// Serve the device until it is disconnected. Blocks the calling thread.
pub fn do_it<F: AsRawFd>(f: &F) -> io::Result<()> {
    ioctl(f, Nbd::DoIt, 0)
}

pub fn clear_sock<F: AsRawFd>(f: &F) -> io::Result<()> {
    ioctl(f, Nbd::ClearSock, 0)
}

pub fn clear_queue<F: AsRawFd>(f: &F) -> io::Result<()> {
    ioctl(f, Nbd::ClearQueue, 0)
}

pub fn set_size_blocks<F: AsRawFd>(f: &F, blocks: u64) -> io::Result<()> {
    ioctl(f, Nbd::SetSizeBlocks, blocks as libc::c_ulong)
}

/// Ask the kernel to send a disconnect request over the socket.
pub fn disconnect<F: AsRawFd>(f: &F) -> io::Result<()> {
    ioctl(f, Nbd::Disconnect, 0)
}

pub fn set_timeout<F: AsRawFd>(f: &F, seconds: u64) -> io::Result<()> {
    ioctl(f, Nbd::SetTimeout, seconds as libc::c_ulong)
}

pub fn set_flags<F: AsRawFd>(f: &F, flags: u64) -> io::Result<()> {
    ioctl(f, Nbd::SetFlags, flags as libc::c_ulong)
}
