//! Proxy handlers for flows accepted by the network stack
//!
//! Each accepted TCP connection or UDP association becomes a flow that is
//! relayed through its own SOCKS5 connection. Handler failures stay inside
//! the flow's task.

mod tcp;
mod udp;

pub use tcp::Socks5TcpHandler;
pub use udp::Socks5UdpHandler;

use crate::error::Result;
use async_trait::async_trait;
use std::fmt::{self, Debug, Display};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Byte stream of one flow as exposed by the network stack.
///
/// For UDP flows every read yields one datagram and every write sends one.
pub trait FlowStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> FlowStream for T {}

/// A TCP connection accepted by the network stack
pub struct TcpFlow {
    /// Address of the application inside the TUN network
    pub local_addr: SocketAddr,
    /// Destination the application is connecting to
    pub remote_addr: SocketAddr,
    /// Connection payload stream
    pub stream: Box<dyn FlowStream>,
}

impl TcpFlow {
    /// Create a new TCP flow
    pub fn new<S: FlowStream + 'static>(
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        stream: S,
    ) -> Self {
        TcpFlow {
            local_addr,
            remote_addr,
            stream: Box::new(stream),
        }
    }
}

impl Display for TcpFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp {} -> {}", self.local_addr, self.remote_addr)
    }
}

impl Debug for TcpFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpFlow")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

/// A UDP association accepted by the network stack
pub struct UdpFlow {
    /// Address of the application inside the TUN network
    pub local_addr: SocketAddr,
    /// Destination the application is sending to
    pub remote_addr: SocketAddr,
    /// Datagram-framed payload stream
    pub stream: Box<dyn FlowStream>,
}

impl UdpFlow {
    /// Create a new UDP flow
    pub fn new<S: FlowStream + 'static>(
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        stream: S,
    ) -> Self {
        UdpFlow {
            local_addr,
            remote_addr,
            stream: Box::new(stream),
        }
    }
}

impl Display for UdpFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "udp {} -> {}", self.local_addr, self.remote_addr)
    }
}

impl Debug for UdpFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpFlow")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

/// Handles TCP flows dispatched by a network stack
#[async_trait]
pub trait TcpConnHandler: Debug + Send + Sync {
    /// Relay one flow until either side closes.
    ///
    /// Errors are reported as [`TunnelError::Flow`](crate::TunnelError::Flow).
    async fn handle_tcp(&self, flow: TcpFlow) -> Result<()>;
}

/// Handles UDP flows dispatched by a network stack
#[async_trait]
pub trait UdpConnHandler: Debug + Send + Sync {
    /// Relay one association until it goes idle or either side closes.
    async fn handle_udp(&self, flow: UdpFlow) -> Result<()>;
}

/// Socket options applied to proxy connections
#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Enable TCP_NODELAY
    pub nodelay: bool,
    /// TCP keepalive timeout
    pub keepalive_secs: Option<u64>,
    /// TCP keepalive interval
    pub keepalive_interval: Option<u64>,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(20),
            keepalive_interval: Some(8),
        }
    }
}

impl SocketOpts {
    /// Options for the control connection of a UDP association, which
    /// carries no payload and must survive idle periods
    pub fn for_udp_control() -> Self {
        SocketOpts {
            nodelay: true,
            keepalive_secs: Some(30),
            keepalive_interval: Some(10),
        }
    }

    /// Apply socket options to a TCP stream
    pub fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;

        if let (Some(timeout), Some(interval)) = (self.keepalive_secs, self.keepalive_interval) {
            let socket = socket2::SockRef::from(stream);
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(timeout))
                .with_interval(Duration::from_secs(interval));
            socket.set_tcp_keepalive(&keepalive)?;
        }

        Ok(())
    }
}

/// Connect to the SOCKS5 proxy and apply socket options
async fn connect_proxy(host: &str, port: u16, opts: &SocketOpts) -> anyhow::Result<TcpStream> {
    use anyhow::Context;

    let stream = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("Failed to connect to SOCKS5 proxy {}:{}", host, port))?;

    if let Err(e) = opts.apply(&stream) {
        tracing::warn!("Failed to apply socket options: {}", e);
    }

    Ok(stream)
}
