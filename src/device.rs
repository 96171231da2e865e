use async_trait::async_trait;
use core::pin::Pin;
use core::task::{Context, Poll};
use futures_util::stream::{Stream, StreamExt};
use nix::errno::Errno;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::thread::JoinHandle;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use crate::{nbd, sys};

/// A block device.
#[async_trait]
pub trait BlockDevice: Send {
    /// Read a block from offset.
    async fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
    /// Write a block of data at offset.
    async fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;
    /// Make all completed writes durable.
    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
    /// Range is no longer in use.
    async fn trim(&mut self, _offset: u64, _len: u32) -> io::Result<()> {
        Ok(())
    }
    /// Fill a range with zeroes.
    async fn write_zeroes(&mut self, offset: u64, len: u32) -> io::Result<()> {
        let zeroes = vec![0u8; (len as usize).min(ZERO_CHUNK)];
        let mut done = 0;
        while done < len as usize {
            let n = (len as usize - done).min(zeroes.len());
            self.write(offset + done as u64, &zeroes[..n]).await?;
            done += n;
        }
        Ok(())
    }
    /// The session has ended; called exactly once.
    async fn disconnect(&mut self) {}
    /// Size of a block on device.
    fn block_size(&self) -> u32;
    /// Number of blocks on device.
    fn block_count(&self) -> u64;
}

const ZERO_CHUNK: usize = 64 * 1024;

/// Settings handed to the kernel driver when attaching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachOptions {
    /// Seconds before the kernel gives up on a request.
    pub timeout: u64,
    /// Transmission flags, see `sys`.
    pub flags: u64,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            timeout: 10,
            flags: sys::HAS_FLAGS | sys::SEND_FLUSH | sys::SEND_TRIM | sys::SEND_WRITE_ZEROES,
        }
    }
}

struct RequestStream {
    sock: Option<UnixStream>,
    do_it_thread: Option<JoinHandle<io::Result<()>>>,
    read_buf: [u8; nbd::SIZE_OF_REQUEST],
    filled: usize,
    file: std::fs::File,
}

/// Attach a block device to a NBD dev file.
pub async fn attach_device<P, B>(path: P, block_device: B) -> io::Result<()>
where
    P: AsRef<Path>,
    B: Unpin + BlockDevice,
{
    attach_device_with(path, block_device, AttachOptions::default()).await
}

/// Attach a block device to a NBD dev file and serve it until the kernel
/// disconnects. Ctrl-C requests an orderly disconnect.
///
/// The block device is disconnected exactly once, also when attaching
/// fails or the kernel goes away without a disconnect request.
pub async fn attach_device_with<P, B>(
    path: P,
    mut block_device: B,
    options: AttachOptions,
) -> io::Result<()>
where
    P: AsRef<Path>,
    B: Unpin + BlockDevice,
{
    let mut stream = match open(path.as_ref(), &block_device, options).await {
        Ok(stream) => stream,
        Err(err) => {
            block_device.disconnect().await;
            return Err(err);
        }
    };

    let mut disconnected = false;
    let result = serve(&mut stream, &mut block_device, &mut disconnected).await;
    if !disconnected {
        block_device.disconnect().await;
    }
    let finished = stream.shutdown();
    result.and(finished)
}

async fn open<B: BlockDevice>(
    path: &Path,
    block_device: &B,
    options: AttachOptions,
) -> io::Result<RequestStream> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .await?
        .into_std()
        .await;

    let (sock, kernel_sock) = UnixStream::pair()?;
    sys::set_block_size(&file, block_device.block_size())?;
    sys::set_size_blocks(&file, block_device.block_count())?;
    sys::set_timeout(&file, options.timeout)?;
    sys::clear_sock(&file)?;

    let inner_file = file.try_clone()?;
    let do_it_thread = Some(std::thread::spawn(move || -> io::Result<()> {
        sys::set_sock(&inner_file, kernel_sock.as_raw_fd())?;
        if let Err(err) = sys::set_flags(&inner_file, options.flags) {
            warn!(%err, "kernel refused transmission flags");
        }
        // The do_it ioctl will block until device is disconnected, hence
        // the separate thread.
        sys::do_it(&inner_file)?;
        let _ = sys::clear_sock(&inner_file);
        let _ = sys::clear_queue(&inner_file);
        Ok(())
    }));

    info!(
        path = %path.display(),
        block_size = block_device.block_size(),
        blocks = block_device.block_count(),
        "device attached"
    );

    Ok(RequestStream {
        sock: Some(sock),
        do_it_thread,
        read_buf: [0; nbd::SIZE_OF_REQUEST],
        filled: 0,
        file,
    })
}

async fn serve<B>(
    stream: &mut RequestStream,
    block_device: &mut B,
    disconnected: &mut bool,
) -> io::Result<()>
where
    B: Unpin + BlockDevice,
{
    let control = stream.file.try_clone()?;
    let mut interrupted = false;
    let mut reply_buf = vec![];
    let mut write_buf = vec![];
    loop {
        let request = tokio::select! {
            next = stream.next() => match next {
                Some(request) => request?,
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                info!("interrupted, asking the kernel to disconnect");
                if let Err(err) = sys::disconnect(&control) {
                    warn!(%err, "disconnect ioctl failed");
                }
                continue;
            }
        };
        let sock = match stream.sock {
            Some(ref mut sock) => sock,
            None => break,
        };
        match handle_request(block_device, &request, sock, &mut reply_buf, &mut write_buf).await? {
            Flow::Reply => {
                sock.write_all(&reply_buf).await?;
                reply_buf.clear();
            }
            Flow::Disconnect => {
                *disconnected = true;
                break;
            }
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    /// `reply_buf` holds the reply to send.
    Reply,
    /// The kernel ended the session; nothing is sent back.
    Disconnect,
}

fn errno(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(Errno::EIO as i32)
}

/// Serve one request. A write payload is taken from `sock`.
async fn handle_request<B, S>(
    block_device: &mut B,
    request: &nbd::Request,
    sock: &mut S,
    reply_buf: &mut Vec<u8>,
    write_buf: &mut Vec<u8>,
) -> io::Result<Flow>
where
    B: BlockDevice,
    S: AsyncRead + Unpin,
{
    debug!(
        command = ?request.command,
        offset = request.from,
        length = request.len,
        fua = request.flags.fua,
        "request"
    );
    let mut reply = nbd::Reply::from_request(request);
    match request.command {
        nbd::Command::Read => {
            let start_offs = reply_buf.len();
            reply_buf.resize(start_offs + nbd::SIZE_OF_REPLY + request.len(), 0);
            if let Err(err) = block_device
                .read(
                    request.from,
                    &mut reply_buf[start_offs + nbd::SIZE_OF_REPLY..],
                )
                .await
            {
                reply.error = errno(&err);
                // No payload follows an error reply.
                reply_buf.truncate(start_offs + nbd::SIZE_OF_REPLY);
            }
            reply.write_to_slice(&mut reply_buf[start_offs..])?;
        }
        nbd::Command::Write => {
            write_buf.resize(request.len(), 0);
            sock.read_exact(write_buf).await?;
            if let Err(err) = block_device.write(request.from, &write_buf[..]).await {
                reply.error = errno(&err);
            }
            reply.append_to_vec(reply_buf)?;
        }
        nbd::Command::Flush => {
            if let Err(err) = block_device.flush().await {
                reply.error = errno(&err);
            }
            reply.append_to_vec(reply_buf)?;
        }
        nbd::Command::Trim => {
            if let Err(err) = block_device.trim(request.from, request.len).await {
                reply.error = errno(&err);
            }
            reply.append_to_vec(reply_buf)?;
        }
        nbd::Command::WriteZeroes => {
            if let Err(err) = block_device.write_zeroes(request.from, request.len).await {
                reply.error = errno(&err);
            }
            reply.append_to_vec(reply_buf)?;
        }
        nbd::Command::Disc => {
            block_device.disconnect().await;
            return Ok(Flow::Disconnect);
        }
    }
    Ok(Flow::Reply)
}

impl RequestStream {
    /// Detach from the kernel and wait for the driver thread.
    fn shutdown(&mut self) -> io::Result<()> {
        let _ = sys::disconnect(&self.file);
        self.sock = None;
        match self.do_it_thread.take() {
            Some(thread) => thread
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("NBD driver thread panicked"))),
            None => Ok(()),
        }
    }

    fn read_next(&mut self, cx: &mut Context) -> Poll<Option<io::Result<nbd::Request>>> {
        let sock = match self.sock {
            Some(ref mut sock) => sock,
            None => return Poll::Ready(None),
        };
        while self.filled < nbd::SIZE_OF_REQUEST {
            let mut buf = ReadBuf::new(&mut self.read_buf[self.filled..]);
            match Pin::new(&mut *sock).poll_read(cx, &mut buf) {
                Poll::Ready(Ok(())) => {
                    let n = buf.filled().len();
                    if n == 0 && self.filled == 0 {
                        return Poll::Ready(None);
                    }
                    if n == 0 {
                        return Poll::Ready(Some(Err(io::Error::from(
                            io::ErrorKind::UnexpectedEof,
                        ))));
                    }
                    self.filled += n;
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Some(Err(err))),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.filled = 0;
        Poll::Ready(Some(nbd::Request::try_from_bytes(&self.read_buf)))
    }
}

impl Drop for RequestStream {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(%err, "NBD driver thread failed");
        }
    }
}

impl Stream for RequestStream {
    type Item = io::Result<nbd::Request>;
    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        self.read_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nbd::tests::request_bytes;

    struct MemDev {
        data: Vec<u8>,
        block_size: u32,
        disconnects: usize,
    }

    impl MemDev {
        fn new(block_size: u32, num_blocks: usize) -> Self {
            Self {
                data: vec![0; num_blocks * block_size as usize],
                block_size,
                disconnects: 0,
            }
        }

        fn range(&self, offset: u64, len: usize) -> io::Result<std::ops::Range<usize>> {
            let start = offset as usize;
            if start + len > self.data.len() {
                return Err(io::Error::from_raw_os_error(Errno::EINVAL as i32));
            }
            Ok(start..start + len)
        }
    }

    #[async_trait]
    impl BlockDevice for MemDev {
        async fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
            let range = self.range(offset, buf.len())?;
            buf.copy_from_slice(&self.data[range]);
            Ok(())
        }
        async fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
            let range = self.range(offset, buf.len())?;
            self.data[range].copy_from_slice(buf);
            Ok(())
        }
        async fn disconnect(&mut self) {
            self.disconnects += 1;
        }
        fn block_size(&self) -> u32 {
            self.block_size
        }
        fn block_count(&self) -> u64 {
            (self.data.len() / self.block_size as usize) as u64
        }
    }

    async fn handle(dev: &mut MemDev, header: Vec<u8>, payload: &[u8]) -> (Flow, Vec<u8>) {
        let request = nbd::Request::try_from_bytes(&header).unwrap();
        let mut sock = payload;
        let mut reply_buf = vec![];
        let mut write_buf = vec![];
        let flow = handle_request(dev, &request, &mut sock, &mut reply_buf, &mut write_buf)
            .await
            .unwrap();
        (flow, reply_buf)
    }

    fn reply_error(reply: &[u8]) -> i32 {
        i32::from_be_bytes(reply[4..8].try_into().unwrap())
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let mut dev = MemDev::new(512, 8);

        let (flow, reply) = handle(&mut dev, request_bytes(1, 7, 100, 5), b"hello").await;
        assert_eq!(flow, Flow::Reply);
        assert_eq!(reply.len(), nbd::SIZE_OF_REPLY);
        assert_eq!(reply_error(&reply), 0);
        assert_eq!(&reply[8..], &7u64.to_be_bytes());

        let (_, reply) = handle(&mut dev, request_bytes(0, 8, 100, 5), b"").await;
        assert_eq!(reply_error(&reply), 0);
        assert_eq!(&reply[nbd::SIZE_OF_REPLY..], b"hello");
    }

    #[tokio::test]
    async fn test_failed_read_has_no_payload() {
        let mut dev = MemDev::new(512, 1);
        let (_, reply) = handle(&mut dev, request_bytes(0, 1, 500, 100), b"").await;
        assert_eq!(reply.len(), nbd::SIZE_OF_REPLY);
        assert_eq!(reply_error(&reply), Errno::EINVAL as i32);
    }

    #[tokio::test]
    async fn test_write_zeroes() {
        let mut dev = MemDev::new(512, 512);
        dev.data.iter_mut().for_each(|b| *b = 0xff);

        let len = (ZERO_CHUNK * 2 + 10) as u32;
        let (_, reply) = handle(&mut dev, request_bytes(6, 1, 1, len), b"").await;
        assert_eq!(reply_error(&reply), 0);
        assert_eq!(dev.data[0], 0xff);
        assert!(dev.data[1..=len as usize].iter().all(|&b| b == 0));
        assert_eq!(dev.data[len as usize + 1], 0xff);
    }

    #[tokio::test]
    async fn test_flush_trim_and_disconnect() {
        let mut dev = MemDev::new(512, 1);

        let (flow, reply) = handle(&mut dev, request_bytes(3, 1, 0, 0), b"").await;
        assert_eq!((flow, reply_error(&reply)), (Flow::Reply, 0));
        let (flow, reply) = handle(&mut dev, request_bytes(4, 2, 0, 512), b"").await;
        assert_eq!((flow, reply_error(&reply)), (Flow::Reply, 0));

        let (flow, reply) = handle(&mut dev, request_bytes(2, 3, 0, 0), b"").await;
        assert_eq!(flow, Flow::Disconnect);
        assert!(reply.is_empty());
        assert_eq!(dev.disconnects, 1);
    }

    #[tokio::test]
    async fn test_truncated_write_payload() {
        let mut dev = MemDev::new(512, 1);
        let request = nbd::Request::try_from_bytes(&request_bytes(1, 1, 0, 10)).unwrap();
        let mut sock: &[u8] = b"short";
        let result = handle_request(&mut dev, &request, &mut sock, &mut vec![], &mut vec![]).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_default_options() {
        let options = AttachOptions::default();
        assert_eq!(options.timeout, 10);
        assert_ne!(options.flags & sys::SEND_TRIM, 0);
        assert_ne!(options.flags & sys::SEND_FLUSH, 0);
    }
}
