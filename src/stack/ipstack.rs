//! [`NetworkStack`] backed by the `ipstack` crate.
//!
//! `ipstack` owns its device, so it is given a channel device: inbound
//! packets are pushed into a bounded queue it reads from, and every packet
//! it writes lands in a queue drained by an emit task that calls the
//! installed [`PacketOutput`]. Accepted TCP/UDP streams become flows and go
//! to the stack's handler slots.
//!
//! Dropping the stack without [`NetworkStack::close`] still stops every task
//! it spawned.

use super::{HandlerSlots, NetworkStack, PacketOutput};
use crate::error::{Result, TunnelError};
use crate::proxy::{TcpFlow, UdpFlow};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Inbound packets buffered before `input` applies backpressure
const INBOUND_QUEUE_SIZE: usize = 1024;

type OutputSlot = Arc<RwLock<Option<Arc<dyn PacketOutput>>>>;

/// User-space TCP/IP stack built on `ipstack`
pub struct IpStackNetwork {
    slots: Arc<HandlerSlots>,
    inbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    output: OutputSlot,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// ipstack's own packet processing task
    run: AbortHandle,
}

impl IpStackNetwork {
    /// Create a stack for packets up to `mtu` bytes.
    ///
    /// Spawns the accept and emit tasks, so it must run inside a tokio
    /// runtime.
    pub fn new(mtu: usize) -> Result<Self> {
        let mtu = u16::try_from(mtu)
            .map_err(|_| TunnelError::Stack(format!("MTU {} out of range", mtu)))?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_SIZE);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let device = ChannelDevice {
            inbound: inbound_rx,
            outbound: outbound_tx,
        };

        let mut config = ipstack::IpStackConfig::default();
        config.mtu(mtu);
        let ip_stack = ipstack::IpStack::new(config, device);
        let run = ip_stack.handle.abort_handle();

        let slots = Arc::new(HandlerSlots::new());
        let output: OutputSlot = Arc::new(RwLock::new(None));
        let cancel = CancellationToken::new();

        let tasks = vec![
            tokio::spawn(accept_loop(ip_stack, slots.clone(), cancel.clone())),
            tokio::spawn(emit_loop(outbound_rx, output.clone(), cancel.clone())),
        ];

        debug!("ipstack network stack created (mtu={})", mtu);

        Ok(IpStackNetwork {
            slots,
            inbound: Mutex::new(Some(inbound_tx)),
            output,
            cancel,
            tasks: Mutex::new(tasks),
            run,
        })
    }
}

#[async_trait]
impl NetworkStack for IpStackNetwork {
    fn handlers(&self) -> &HandlerSlots {
        &self.slots
    }

    fn set_output(&self, output: Arc<dyn PacketOutput>) {
        *self.output.write().unwrap_or_else(PoisonError::into_inner) = Some(output);
    }

    async fn input(&self, packet: &[u8]) -> Result<()> {
        let sender = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| TunnelError::Stack("network stack is closed".to_string()))?;

        sender
            .send(Bytes::copy_from_slice(packet))
            .await
            .map_err(|_| TunnelError::Stack("network stack is closed".to_string()))
    }

    async fn close(&self) -> Result<()> {
        let sender = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_none() {
            return Ok(());
        }
        drop(sender);

        self.cancel.cancel();
        self.run.abort();
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("ipstack task ended abnormally: {}", e);
            }
        }

        *self.output.write().unwrap_or_else(PoisonError::into_inner) = None;
        debug!("ipstack network stack closed");
        Ok(())
    }
}

impl Drop for IpStackNetwork {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.run.abort();
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for IpStackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpStackNetwork")
            .field("slots", &self.slots)
            .field("closed", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Accept streams from ipstack and dispatch them as flows
async fn accept_loop(
    mut ip_stack: ipstack::IpStack,
    slots: Arc<HandlerSlots>,
    cancel: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = ip_stack.accept() => match result {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("ipstack accept ended: {:?}", e);
                    break;
                }
            },
        };

        match stream {
            ipstack::stream::IpStackStream::Tcp(tcp) => {
                let flow = TcpFlow::new(tcp.local_addr(), tcp.peer_addr(), tcp);
                debug!("Accepted {}", flow);
                slots.dispatch_tcp(flow);
            }
            ipstack::stream::IpStackStream::Udp(udp) => {
                let flow = UdpFlow::new(udp.local_addr(), udp.peer_addr(), udp);
                debug!("Accepted {}", flow);
                slots.dispatch_udp(flow);
            }
            _ => trace!("Ignoring non TCP/UDP packet"),
        }
    }

    debug!("ipstack accept loop stopped");
}

/// Drain packets ipstack emits into the installed output
async fn emit_loop(
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    output: OutputSlot,
    cancel: CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            packet = outbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        let sink = output.read().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(sink) = sink else {
            trace!("No output installed, dropping {} byte packet", packet.len());
            continue;
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = sink.write_packet(&packet) => {
                if let Err(e) = result {
                    warn!("Failed to write {} byte packet to device: {}", packet.len(), e);
                }
            }
        }
    }

    debug!("ipstack emit loop stopped");
}

/// Packet device ipstack reads from and writes to
struct ChannelDevice {
    inbound: mpsc::Receiver<Bytes>,
    outbound: mpsc::UnboundedSender<Bytes>,
}

impl AsyncRead for ChannelDevice {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.inbound.poll_recv(cx) {
            Poll::Ready(Some(packet)) => {
                let len = packet.len().min(buf.remaining());
                buf.put_slice(&packet[..len]);
                Poll::Ready(Ok(()))
            }
            // Closed queue: park until the run task is aborted. An empty
            // read would be handed back to ipstack as a packet.
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for ChannelDevice {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.outbound.send(Bytes::copy_from_slice(buf)) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "network stack is closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
