//! TUN device plumbing
//!
//! A device is any duplex byte stream carrying raw IP packets. The tunnel
//! splits it: the read half feeds the relay loop, the write half sits behind
//! a [`DeviceWriter`] that the network stack emits packets through.

#[cfg(unix)]
mod fd;

#[cfg(unix)]
pub use fd::FdDevice;

use crate::stack::PacketOutput;
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A duplex packet device the tunnel can take exclusive ownership of
pub trait TunDevice: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> TunDevice for T {}

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Write side of the device, shared between the stack's output path and
/// the tunnel's teardown.
///
/// Closing is one-shot: after [`DeviceWriter::close`] every write fails with
/// `BrokenPipe` and further closes do nothing. A close aborts any write that
/// is blocked on the device.
pub struct DeviceWriter {
    inner: Mutex<Option<BoxedWriter>>,
    closed: CancellationToken,
}

impl DeviceWriter {
    /// Wrap the write half of a device
    pub fn new<W: AsyncWrite + Send + 'static>(writer: W) -> Self {
        DeviceWriter {
            inner: Mutex::new(Some(Box::pin(writer))),
            closed: CancellationToken::new(),
        }
    }

    /// Shut down and release the write half.
    ///
    /// Returns `true` if this call performed the close.
    pub async fn close(&self) -> io::Result<bool> {
        // Wakes a pending write so it drops the lock
        self.closed.cancel();

        let writer = self.inner.lock().await.take();
        match writer {
            Some(mut writer) => {
                debug!("Closing TUN device");
                writer.shutdown().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Whether the device has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

fn device_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "TUN device is closed")
}

#[async_trait]
impl PacketOutput for DeviceWriter {
    async fn write_packet(&self, packet: &[u8]) -> io::Result<()> {
        let mut guard = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(device_closed()),
            guard = self.inner.lock() => guard,
        };
        let writer = guard.as_mut().ok_or_else(device_closed)?;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(device_closed()),
            result = writer.write_all(packet) => result?,
        }
        trace!("Wrote {} byte packet to TUN device", packet.len());
        Ok(())
    }
}

impl std::fmt::Debug for DeviceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceWriter")
            .field("closed", &self.is_closed())
            .finish()
    }
}
