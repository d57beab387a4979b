//! SOCKS5 relay for TCP flows
//!
//! Each flow gets its own proxy connection: connect, CONNECT to the flow's
//! destination, then copy bytes both ways until either side closes.

use super::{connect_proxy, SocketOpts, TcpConnHandler, TcpFlow};
use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::helper::copy_bidirectional;
use anyhow::Context;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Relays TCP flows through a SOCKS5 proxy
#[derive(Debug, Clone)]
pub struct Socks5TcpHandler {
    /// Proxy host
    proxy_host: String,
    /// Proxy port
    proxy_port: u16,
    /// Bound on connecting to the proxy and completing CONNECT
    dial_timeout: Duration,
    /// Socket options for proxy connections
    socket_opts: SocketOpts,
}

impl Socks5TcpHandler {
    /// Create a handler for the proxy in `config`
    pub fn new(config: &TunnelConfig) -> Self {
        Socks5TcpHandler {
            proxy_host: config.proxy_host().to_string(),
            proxy_port: config.proxy_port(),
            dial_timeout: config.dial_timeout(),
            socket_opts: SocketOpts::default(),
        }
    }

    /// Set socket options
    pub fn with_socket_opts(mut self, opts: SocketOpts) -> Self {
        self.socket_opts = opts;
        self
    }

    /// Open a proxy connection already CONNECTed to `target`
    async fn dial(&self, target: SocketAddr) -> anyhow::Result<TcpStream> {
        let handshake = async {
            let mut stream =
                connect_proxy(&self.proxy_host, self.proxy_port, &self.socket_opts).await?;
            async_socks5::connect(&mut stream, target, None)
                .await
                .with_context(|| format!("SOCKS5 CONNECT to {} failed", target))?;
            Ok::<_, anyhow::Error>(stream)
        };

        tokio::time::timeout(self.dial_timeout, handshake)
            .await
            .with_context(|| {
                format!(
                    "Dial timeout after {:?} via {}:{}",
                    self.dial_timeout, self.proxy_host, self.proxy_port
                )
            })?
    }

    async fn relay(&self, flow: TcpFlow) -> anyhow::Result<()> {
        let TcpFlow {
            local_addr,
            remote_addr,
            mut stream,
        } = flow;

        let mut proxy = self.dial(remote_addr).await?;
        info!("SOCKS5 TCP tunnel established {} -> {}", local_addr, remote_addr);

        match copy_bidirectional(&mut *stream, &mut proxy).await {
            Ok((up, down)) => debug!(
                "TCP flow {} -> {} closed: {} bytes up, {} bytes down",
                local_addr, remote_addr, up, down
            ),
            Err(e) => debug!("TCP flow {} -> {} relay ended: {}", local_addr, remote_addr, e),
        }

        Ok(())
    }
}

#[async_trait]
impl TcpConnHandler for Socks5TcpHandler {
    async fn handle_tcp(&self, flow: TcpFlow) -> Result<()> {
        self.relay(flow)
            .await
            .map_err(|e| TunnelError::Flow(format!("{:#}", e)))
    }
}
