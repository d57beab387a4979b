//! Network stack contract
//!
//! A [`NetworkStack`] turns raw IP packets into TCP/UDP flows. The tunnel
//! feeds it inbound packets through [`NetworkStack::input`], receives the
//! packets it emits through a [`PacketOutput`], and hands new flows to the
//! handlers registered in its [`HandlerSlots`].
//!
//! Handler slots belong to each stack instance, so two tunnels never share
//! or overwrite each other's handlers.

#[cfg(feature = "ipstack")]
mod ipstack;

#[cfg(feature = "ipstack")]
pub use self::ipstack::IpStackNetwork;

use crate::error::Result;
use crate::proxy::{TcpConnHandler, TcpFlow, UdpConnHandler, UdpFlow};
use async_trait::async_trait;
use std::io;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Sink for packets a stack wants to send back out of the TUN device.
#[async_trait]
pub trait PacketOutput: Send + Sync {
    /// Write one outbound IP packet
    async fn write_packet(&self, packet: &[u8]) -> io::Result<()>;
}

/// User-space IP stack consumed by the tunnel
#[async_trait]
pub trait NetworkStack: Send + Sync {
    /// Handler slots new flows are dispatched to
    fn handlers(&self) -> &HandlerSlots;

    /// Install the callback used for every outbound packet
    fn set_output(&self, output: Arc<dyn PacketOutput>);

    /// Ingest one chunk of inbound packet bytes
    async fn input(&self, packet: &[u8]) -> Result<()>;

    /// Release all flow state and stop emitting packets.
    ///
    /// Called at most once per tunnel.
    async fn close(&self) -> Result<()>;
}

/// Constructs a fresh [`NetworkStack`] for each tunnel start.
///
/// Any `Fn() -> Result<S>` closure is a builder.
pub trait StackBuilder: Send + Sync {
    /// Build a new, unshared stack instance
    fn build(&self) -> Result<Arc<dyn NetworkStack>>;
}

impl<F, S> StackBuilder for F
where
    F: Fn() -> Result<S> + Send + Sync,
    S: NetworkStack + 'static,
{
    fn build(&self) -> Result<Arc<dyn NetworkStack>> {
        Ok(Arc::new(self()?))
    }
}

/// The "current TCP handler" and "current UDP handler" of one stack.
#[derive(Default)]
pub struct HandlerSlots {
    tcp: RwLock<Option<Arc<dyn TcpConnHandler>>>,
    udp: RwLock<Option<Arc<dyn UdpConnHandler>>>,
}

impl HandlerSlots {
    /// Create empty slots
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the TCP handler; `None` clears the slot
    pub fn register_tcp(&self, handler: Option<Arc<dyn TcpConnHandler>>) {
        *self.tcp.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    /// Replace the UDP handler; `None` clears the slot
    pub fn register_udp(&self, handler: Option<Arc<dyn UdpConnHandler>>) {
        *self.udp.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    /// Clear both slots
    pub fn clear(&self) {
        self.register_tcp(None);
        self.register_udp(None);
    }

    /// Current TCP handler
    pub fn tcp(&self) -> Option<Arc<dyn TcpConnHandler>> {
        self.tcp.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Current UDP handler
    pub fn udp(&self) -> Option<Arc<dyn UdpConnHandler>> {
        self.udp.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Whether either slot holds a handler
    pub fn is_any_registered(&self) -> bool {
        self.tcp().is_some() || self.udp().is_some()
    }

    /// Hand a new TCP flow to the current handler on its own task.
    ///
    /// Returns `false` and drops the flow when no handler is registered.
    pub fn dispatch_tcp(&self, flow: TcpFlow) -> bool {
        let Some(handler) = self.tcp() else {
            debug!("No TCP handler registered, dropping {}", flow);
            return false;
        };

        tokio::spawn(async move {
            let desc = flow.to_string();
            match handler.handle_tcp(flow).await {
                Ok(()) => debug!("TCP flow {} finished", desc),
                Err(e) => warn!("TCP flow {} failed: {}", desc, e),
            }
        });
        true
    }

    /// Hand a new UDP flow to the current handler on its own task.
    ///
    /// Returns `false` and drops the flow when no handler is registered.
    pub fn dispatch_udp(&self, flow: UdpFlow) -> bool {
        let Some(handler) = self.udp() else {
            debug!("No UDP handler registered, dropping {}", flow);
            return false;
        };

        tokio::spawn(async move {
            let desc = flow.to_string();
            match handler.handle_udp(flow).await {
                Ok(()) => debug!("UDP flow {} finished", desc),
                Err(e) => warn!("UDP flow {} failed: {}", desc, e),
            }
        });
        true
    }
}

impl std::fmt::Debug for HandlerSlots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerSlots")
            .field("tcp", &self.tcp())
            .field("udp", &self.udp())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TunnelError;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    struct ChannelHandler {
        seen: mpsc::UnboundedSender<SocketAddr>,
        fail: bool,
    }

    #[async_trait]
    impl TcpConnHandler for ChannelHandler {
        async fn handle_tcp(&self, flow: TcpFlow) -> Result<()> {
            let _ = self.seen.send(flow.remote_addr);
            if self.fail {
                return Err(TunnelError::Flow("proxy refused".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl UdpConnHandler for ChannelHandler {
        async fn handle_udp(&self, flow: UdpFlow) -> Result<()> {
            let _ = self.seen.send(flow.remote_addr);
            Ok(())
        }
    }

    fn tcp_flow(remote: &str) -> TcpFlow {
        let (stream, _peer) = duplex(64);
        TcpFlow::new("10.0.0.2:40000".parse().unwrap(), remote.parse().unwrap(), stream)
    }

    fn udp_flow(remote: &str) -> UdpFlow {
        let (stream, _peer) = duplex(64);
        UdpFlow::new("10.0.0.2:40001".parse().unwrap(), remote.parse().unwrap(), stream)
    }

    #[test]
    fn test_slots_start_empty() {
        let slots = HandlerSlots::new();
        assert!(slots.tcp().is_none());
        assert!(slots.udp().is_none());
        assert!(!slots.is_any_registered());
    }

    #[test]
    fn test_register_and_clear() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handler = Arc::new(ChannelHandler { seen: tx, fail: false });
        let slots = HandlerSlots::new();

        slots.register_tcp(Some(handler.clone()));
        assert!(slots.tcp().is_some());
        assert!(slots.udp().is_none());
        assert!(slots.is_any_registered());

        slots.register_udp(Some(handler));
        assert!(slots.udp().is_some());

        slots.clear();
        assert!(!slots.is_any_registered());
    }

    #[test]
    fn test_slots_are_per_instance() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = HandlerSlots::new();
        let second = HandlerSlots::new();

        first.register_tcp(Some(Arc::new(ChannelHandler { seen: tx, fail: false })));
        assert!(first.is_any_registered());
        assert!(!second.is_any_registered());
    }

    #[tokio::test]
    async fn test_dispatch_without_handler_drops_flow() {
        let slots = HandlerSlots::new();
        assert!(!slots.dispatch_tcp(tcp_flow("1.1.1.1:443")));
        assert!(!slots.dispatch_udp(udp_flow("8.8.8.8:53")));
    }

    #[tokio::test]
    async fn test_dispatch_runs_handler() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(ChannelHandler { seen: tx, fail: false });
        let slots = HandlerSlots::new();
        slots.register_tcp(Some(handler.clone()));
        slots.register_udp(Some(handler));

        assert!(slots.dispatch_tcp(tcp_flow("1.1.1.1:443")));
        assert!(slots.dispatch_udp(udp_flow("8.8.8.8:53")));

        let mut seen = vec![
            tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap(),
            tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap(),
        ];
        seen.sort();
        assert_eq!(
            seen,
            vec![
                "1.1.1.1:443".parse::<SocketAddr>().unwrap(),
                "8.8.8.8:53".parse::<SocketAddr>().unwrap()
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_flow_does_not_affect_others() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let slots = HandlerSlots::new();
        slots.register_tcp(Some(Arc::new(ChannelHandler { seen: tx.clone(), fail: true })));

        assert!(slots.dispatch_tcp(tcp_flow("1.1.1.1:443")));
        rx.recv().await.unwrap();

        slots.register_tcp(Some(Arc::new(ChannelHandler { seen: tx, fail: false })));
        assert!(slots.dispatch_tcp(tcp_flow("1.0.0.1:443")));
        assert_eq!(rx.recv().await.unwrap(), "1.0.0.1:443".parse::<SocketAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_closure_is_stack_builder() {
        struct NullStack(HandlerSlots);

        #[async_trait]
        impl NetworkStack for NullStack {
            fn handlers(&self) -> &HandlerSlots {
                &self.0
            }
            fn set_output(&self, _output: Arc<dyn PacketOutput>) {}
            async fn input(&self, _packet: &[u8]) -> Result<()> {
                Ok(())
            }
            async fn close(&self) -> Result<()> {
                Ok(())
            }
        }

        let builds = AtomicUsize::new(0);
        let builder = || -> Result<NullStack> {
            builds.fetch_add(1, Ordering::SeqCst);
            Ok(NullStack(HandlerSlots::new()))
        };
        let stack = StackBuilder::build(&builder).unwrap();
        assert!(!stack.handlers().is_any_registered());
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_debug() {
        let debug = format!("{:?}", HandlerSlots::new());
        assert!(debug.contains("HandlerSlots"));
        assert!(debug.contains("tcp: None"));
    }
}
