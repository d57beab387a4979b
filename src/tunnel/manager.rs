//! Tunnel lifecycle: start and stop.

use super::relay::{run_relay, RelayExit};
use crate::config::TunnelConfig;
use crate::device::{DeviceWriter, TunDevice};
use crate::error::{Result, TunnelError};
use crate::helper::{DEFAULT_MTU, STOP_TIMEOUT};
use crate::proxy::{Socks5TcpHandler, Socks5UdpHandler};
use crate::stack::{NetworkStack, StackBuilder};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Starts tunnels: TUN device → network stack → SOCKS5 proxy.
///
/// Every start builds a fresh stack from the builder, so handles produced
/// by one manager never share handler slots.
pub struct TunnelManager<B> {
    builder: B,
    mtu: usize,
}

impl<B: StackBuilder> TunnelManager<B> {
    /// Create a manager that builds stacks with `builder`
    pub fn new(builder: B) -> Self {
        TunnelManager {
            builder,
            mtu: DEFAULT_MTU,
        }
    }

    /// Set the relay read size
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Start a tunnel with default timeouts.
    ///
    /// An empty host or a port outside 1..=65535 fails with
    /// [`TunnelError::Config`] before anything is built.
    pub fn start<D: TunDevice>(
        &self,
        device: D,
        proxy_host: &str,
        proxy_port: i64,
    ) -> Result<TunnelHandle> {
        let config = TunnelConfig::new(proxy_host, proxy_port)?;
        self.start_with_config(device, config)
    }

    /// Start a tunnel from a validated configuration.
    ///
    /// Returns once handlers are registered and the relay task is spawned.
    /// Must be called within a tokio runtime.
    pub fn start_with_config<D: TunDevice>(
        &self,
        device: D,
        config: TunnelConfig,
    ) -> Result<TunnelHandle> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(TunnelError::config(
                "tunnel must be started within a tokio runtime",
            ));
        }
        if self.mtu == 0 {
            return Err(TunnelError::config("MTU must be greater than 0"));
        }

        let stack = self.builder.build()?;

        let (reader, writer) = tokio::io::split(device);
        let device = Arc::new(DeviceWriter::new(writer));
        stack.set_output(device.clone());

        stack
            .handlers()
            .register_tcp(Some(Arc::new(Socks5TcpHandler::new(&config))));
        stack
            .handlers()
            .register_udp(Some(Arc::new(Socks5UdpHandler::new(&config))));

        let cancel = CancellationToken::new();
        let relay = tokio::spawn(run_relay(reader, stack.clone(), cancel.clone(), self.mtu));

        info!("Tunnel started via SOCKS5 proxy {}", config);

        Ok(TunnelHandle {
            running: true,
            config,
            stack,
            device,
            cancel,
            relay: Some(relay),
            exit: None,
        })
    }
}

impl<B> std::fmt::Debug for TunnelManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager").field("mtu", &self.mtu).finish()
    }
}

/// A started tunnel.
///
/// Owns the device between start and stop. Dropping a running handle
/// cancels the relay and clears the handlers, but only [`TunnelHandle::stop`]
/// closes the stack and the device in order.
pub struct TunnelHandle {
    running: bool,
    config: TunnelConfig,
    stack: Arc<dyn NetworkStack>,
    device: Arc<DeviceWriter>,
    cancel: CancellationToken,
    relay: Option<JoinHandle<RelayExit>>,
    exit: Option<RelayExit>,
}

impl TunnelHandle {
    /// Whether the tunnel has not been stopped yet
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Proxy configuration the tunnel was started with
    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// The tunnel's network stack
    pub fn stack(&self) -> &Arc<dyn NetworkStack> {
        &self.stack
    }

    /// Whether the relay task has ended
    pub fn is_relay_finished(&self) -> bool {
        self.relay.as_ref().map_or(true, |relay| relay.is_finished())
    }

    /// How the relay loop ended, once stop has collected it
    pub fn relay_exit(&self) -> Option<&RelayExit> {
        self.exit.as_ref()
    }

    /// Tear the tunnel down.
    ///
    /// Clears the handler slots, closes the stack, then closes the device
    /// and joins the relay task. Each of the three waits is bounded by
    /// [`STOP_TIMEOUT`]. Does nothing when the tunnel is already stopped.
    /// Never fails; problems are logged.
    pub async fn stop(&mut self) {
        if !self.running {
            debug!("Tunnel already stopped");
            return;
        }

        info!("Stopping tunnel via {}", self.config);

        self.stack.handlers().clear();

        match tokio::time::timeout(STOP_TIMEOUT, self.stack.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to close network stack: {}", e),
            Err(_) => warn!("Network stack did not close within {:?}", STOP_TIMEOUT),
        }

        self.cancel.cancel();
        match tokio::time::timeout(STOP_TIMEOUT, self.device.close()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Failed to close TUN device: {}", e),
            Err(_) => warn!("TUN device did not close within {:?}", STOP_TIMEOUT),
        }

        if let Some(mut relay) = self.relay.take() {
            match tokio::time::timeout(STOP_TIMEOUT, &mut relay).await {
                Ok(Ok(exit)) => {
                    debug!("Relay loop joined: {:?}", exit);
                    self.exit = Some(exit);
                }
                Ok(Err(e)) => warn!("Relay task failed: {}", e),
                Err(_) => {
                    relay.abort();
                    warn!("Relay loop did not exit within {:?}, aborted", STOP_TIMEOUT);
                    self.exit = Some(RelayExit::Failed(TunnelError::Timeout(format!(
                        "relay loop still running after {:?}",
                        STOP_TIMEOUT
                    ))));
                }
            }
        }

        self.running = false;
        info!("Tunnel stopped");
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        if self.running {
            warn!("Tunnel handle dropped while running, cancelling relay");
            self.cancel.cancel();
            self.stack.handlers().clear();
        }
    }
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("running", &self.running)
            .field("config", &self.config)
            .field("handlers", self.stack.handlers())
            .field("exit", &self.exit)
            .finish()
    }
}

/// Stop `handle` if present and running.
pub async fn stop_tunnel(handle: Option<&mut TunnelHandle>) {
    match handle {
        Some(handle) => handle.stop().await,
        None => debug!("stop_tunnel called without a handle"),
    }
}
