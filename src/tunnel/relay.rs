//! Relay loop: TUN device → network stack.
//!
//! One task per tunnel. It reads at most one MTU per iteration into a single
//! buffer that lives as long as the task, and pushes every chunk into the
//! stack's ingestion sink. It never restarts; the reason it stopped is its
//! return value.

use crate::error::TunnelError;
use crate::stack::NetworkStack;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Why the relay loop stopped
#[derive(Debug)]
pub enum RelayExit {
    /// Stop cancelled the loop
    Cancelled,
    /// The device reported end-of-stream
    EndOfStream,
    /// Reading the device or feeding the stack failed
    Failed(TunnelError),
}

impl RelayExit {
    /// Whether the loop ended because of an error
    pub fn is_failure(&self) -> bool {
        matches!(self, RelayExit::Failed(_))
    }
}

/// Copy packets from `device` into `stack` until cancelled, EOF, or error.
pub async fn run_relay<R>(
    mut device: R,
    stack: Arc<dyn NetworkStack>,
    cancel: CancellationToken,
    mtu: usize,
) -> RelayExit
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; mtu];
    let mut packets: u64 = 0;

    debug!("Relay loop started (mtu={})", mtu);

    let exit = loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => break RelayExit::Cancelled,
            result = device.read(&mut buf) => match result {
                Ok(0) => break RelayExit::EndOfStream,
                Ok(n) => n,
                Err(e) => break RelayExit::Failed(TunnelError::Device(e)),
            },
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break RelayExit::Cancelled,
            result = stack.input(&buf[..n]) => {
                if let Err(e) = result {
                    break RelayExit::Failed(e);
                }
            }
        }

        packets += 1;
        trace!("Relayed {} bytes into stack", n);
    };

    match &exit {
        RelayExit::Failed(e) => warn!("copy tun->stack failed after {} packets: {}", packets, e),
        other => debug!("Relay loop exited after {} packets: {:?}", packets, other),
    }

    exit
}
