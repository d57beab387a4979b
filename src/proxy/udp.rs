//! SOCKS5 relay for UDP flows
//!
//! A UDP flow becomes one UDP ASSOCIATE session on the proxy. Datagrams move
//! between the flow and the association until the session sits idle for
//! the configured timeout or the flow closes.

use super::{connect_proxy, SocketOpts, UdpConnHandler, UdpFlow};
use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::helper::MAX_DATAGRAM_SIZE;
use anyhow::Context;
use async_socks5::SocksDatagram;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, Instant};
use tracing::{debug, trace};

/// Relays UDP flows through a SOCKS5 proxy
#[derive(Debug, Clone)]
pub struct Socks5UdpHandler {
    /// Proxy host
    proxy_host: String,
    /// Proxy port
    proxy_port: u16,
    /// Bound on connecting to the proxy and completing UDP ASSOCIATE
    dial_timeout: Duration,
    /// Session expiry after inactivity
    idle_timeout: Duration,
    /// Socket options for the association's control connection
    socket_opts: SocketOpts,
}

impl Socks5UdpHandler {
    /// Create a handler for the proxy in `config`
    pub fn new(config: &TunnelConfig) -> Self {
        Socks5UdpHandler {
            proxy_host: config.proxy_host().to_string(),
            proxy_port: config.proxy_port(),
            dial_timeout: config.dial_timeout(),
            idle_timeout: config.udp_idle_timeout(),
            socket_opts: SocketOpts::for_udp_control(),
        }
    }

    /// Set custom session timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Establish a UDP association with the proxy
    async fn associate(&self) -> anyhow::Result<SocksDatagram<TcpStream>> {
        let handshake = async {
            let control =
                connect_proxy(&self.proxy_host, self.proxy_port, &self.socket_opts).await?;

            let local_ip = control.local_addr()?.ip();
            let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0))
                .await
                .with_context(|| "Failed to bind UDP socket")?;

            let datagram = SocksDatagram::associate(control, socket, None, None::<SocketAddr>)
                .await
                .with_context(|| "SOCKS5 UDP ASSOCIATE failed")?;
            Ok::<_, anyhow::Error>(datagram)
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

    async fn relay(&self, flow: UdpFlow) -> anyhow::Result<()> {
        let UdpFlow {
            local_addr,
            remote_addr,
            mut stream,
        } = flow;

        let datagram = self.associate().await?;
        debug!("SOCKS5 UDP session opened {} -> {}", local_addr, remote_addr);

        let mut flow_buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut proxy_buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let idle = sleep(self.idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                result = stream.read(&mut flow_buf) => {
                    let n = result.with_context(|| "UDP flow read failed")?;
                    if n == 0 {
                        debug!("UDP flow {} -> {} closed by stack", local_addr, remote_addr);
                        break;
                    }
                    datagram
                        .send_to(&flow_buf[..n], remote_addr)
                        .await
                        .with_context(|| format!("Failed to send datagram to {}", remote_addr))?;
                    trace!("UDP {} bytes {} -> {}", n, local_addr, remote_addr);
                }
                result = datagram.recv_from(&mut proxy_buf) => {
                    let (n, from) = result.with_context(|| "UDP association receive failed")?;
                    stream
                        .write_all(&proxy_buf[..n])
                        .await
                        .with_context(|| "UDP flow write failed")?;
                    trace!("UDP {} bytes {:?} -> {}", n, from, local_addr);
                }
                _ = &mut idle => {
                    debug!(
                        "UDP session {} -> {} idle for {:?}, closing",
                        local_addr, remote_addr, self.idle_timeout
                    );
                    break;
                }
            }
            idle.as_mut().reset(Instant::now() + self.idle_timeout);
        }

        Ok(())
    }
}

#[async_trait]
impl UdpConnHandler for Socks5UdpHandler {
    async fn handle_udp(&self, flow: UdpFlow) -> Result<()> {
        self.relay(flow)
            .await
            .map_err(|e| TunnelError::Flow(format!("{:#}", e)))
    }
}
