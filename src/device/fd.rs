//! TUN device backed by a raw file descriptor.
//!
//! Mobile VPN services hand over the TUN interface as a bare fd. The fd is
//! switched to non-blocking mode and registered with the tokio reactor, so
//! reads park the relay task instead of a worker thread.

use crate::error::{Result, TunnelError};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};

/// Async TUN device over an owned file descriptor.
///
/// Dropping the device closes the fd.
pub struct FdDevice {
    inner: AsyncFd<File>,
}

impl FdDevice {
    /// Take ownership of `fd`.
    ///
    /// Negative or invalid descriptors are rejected with a configuration
    /// error and are left untouched. Must be called within a tokio runtime.
    pub fn from_raw_fd(fd: RawFd) -> Result<Self> {
        if fd < 0 {
            return Err(TunnelError::config(format!("invalid device fd {}", fd)));
        }

        let original_flags = set_nonblocking(fd).map_err(|e| {
            TunnelError::config(format!("unusable device fd {}: {}", fd, e))
        })?;

        // SAFETY: the caller hands the fd over for exclusive use and fcntl
        // above proved it is open.
        let file = unsafe { File::from_raw_fd(fd) };
        let inner = AsyncFd::try_new(file).map_err(|e| {
            let (file, err) = e.into_parts();
            // Give the fd back to the caller as it was handed over
            let fd = file.into_raw_fd();
            if let Err(restore) = set_flags(fd, original_flags) {
                warn!("Failed to restore flags of fd {}: {}", fd, restore);
            }
            TunnelError::config(format!("unusable device fd {}: {}", fd, err))
        })?;

        debug!("Wrapped TUN fd {}", fd);
        Ok(Self { inner })
    }
}

impl AsRawFd for FdDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl AsyncRead for FdDevice {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;

            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                Ok(Ok(len)) => {
                    buf.advance(len);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(err)) => return Poll::Ready(Err(err)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for FdDevice {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;

            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl std::fmt::Debug for FdDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdDevice")
            .field("fd", &self.inner.as_raw_fd())
            .finish()
    }
}

/// Set a file descriptor to non-blocking mode, returning its previous flags.
fn set_nonblocking(fd: RawFd) -> io::Result<libc::c_int> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    set_flags(fd, flags | libc::O_NONBLOCK)?;
    Ok(flags)
}

fn set_flags(fd: RawFd, flags: libc::c_int) -> io::Result<()> {
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
