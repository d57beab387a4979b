//! Test utilities and mocks for Tunsocks
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::TcpListener;
use tunsocks::{HandlerSlots, NetworkStack, PacketOutput, StackBuilder, TunnelManager};

/// Network stack that records everything the tunnel does to it
#[derive(Default)]
pub struct RecordingStack {
    slots: HandlerSlots,
    inputs: Mutex<Vec<Vec<u8>>>,
    output: Mutex<Option<Arc<dyn PacketOutput>>>,
    closes: AtomicUsize,
}

impl RecordingStack {
    /// Every ingested chunk, in order
    pub fn inputs(&self) -> Vec<Vec<u8>> {
        self.inputs.lock().unwrap().clone()
    }

    /// All ingested bytes concatenated
    pub fn ingested(&self) -> Vec<u8> {
        self.inputs().concat()
    }

    /// Number of close calls
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Whether the tunnel installed an output callback
    pub fn has_output(&self) -> bool {
        self.output.lock().unwrap().is_some()
    }

    /// Emit a packet through the installed output
    pub async fn emit(&self, packet: &[u8]) -> io::Result<()> {
        let output = self.output.lock().unwrap().clone();
        match output {
            Some(output) => output.write_packet(packet).await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "no output")),
        }
    }

    /// Wait until at least `len` bytes were ingested
    pub async fn wait_for_bytes(&self, len: usize) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let bytes = self.ingested();
                if bytes.len() >= len {
                    return bytes;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stack never received the expected bytes")
    }
}

/// Owned view of a shared [`RecordingStack`], as handed to the tunnel
pub struct SharedStack(Arc<RecordingStack>);

#[async_trait]
impl NetworkStack for SharedStack {
    fn handlers(&self) -> &HandlerSlots {
        &self.0.slots
    }

    fn set_output(&self, output: Arc<dyn PacketOutput>) {
        *self.0.output.lock().unwrap() = Some(output);
    }

    async fn input(&self, packet: &[u8]) -> tunsocks::Result<()> {
        self.0.inputs.lock().unwrap().push(packet.to_vec());
        Ok(())
    }

    async fn close(&self) -> tunsocks::Result<()> {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Observes the stacks a manager has built
#[derive(Clone, Default)]
pub struct StackLog {
    built: Arc<Mutex<Vec<Arc<RecordingStack>>>>,
}

impl StackLog {
    /// Number of stacks built so far
    pub fn builds(&self) -> usize {
        self.built.lock().unwrap().len()
    }

    /// Most recently built stack
    pub fn last(&self) -> Arc<RecordingStack> {
        self.built
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no stack was built")
    }
}

/// Manager whose stacks are recorded in the returned log
pub fn recording_manager() -> (TunnelManager<impl StackBuilder>, StackLog) {
    let stacks = StackLog::default();
    let built = stacks.built.clone();
    let manager = TunnelManager::new(move || -> tunsocks::Result<SharedStack> {
        let stack = Arc::new(RecordingStack::default());
        built.lock().unwrap().push(stack.clone());
        Ok(SharedStack(stack))
    });
    (manager, stacks)
}

/// Counters shared between a [`CountingDevice`] and the test
#[derive(Default)]
pub struct DeviceCounters {
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl DeviceCounters {
    /// Total number of operations seen
    pub fn total(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
            + self.writes.load(Ordering::SeqCst)
            + self.shutdowns.load(Ordering::SeqCst)
    }
}

/// In-memory device that counts how it is used
pub struct CountingDevice {
    inner: DuplexStream,
    counters: Arc<DeviceCounters>,
}

impl AsyncRead for CountingDevice {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CountingDevice {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Create a counting device and the host end of its link
pub fn counting_device() -> (CountingDevice, DuplexStream, Arc<DeviceCounters>) {
    let (host_end, inner) = tokio::io::duplex(64 * 1024);
    let counters = Arc::new(DeviceCounters::default());
    let device = CountingDevice {
        inner,
        counters: counters.clone(),
    };
    (device, host_end, counters)
}

/// Minimal SOCKS5 server: no auth, CONNECT only, echoes the payload.
///
/// Each accepted connection reports the CONNECT destination on the channel.
pub async fn spawn_socks5_echo() -> (u16, tokio::sync::mpsc::UnboundedReceiver<std::net::SocketAddr>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut head = [0u8; 2];
                sock.read_exact(&mut head).await.unwrap();
                let mut methods = vec![0u8; head[1] as usize];
                sock.read_exact(&mut methods).await.unwrap();
                sock.write_all(&[0x05, 0x00]).await.unwrap();

                let mut req = [0u8; 4];
                sock.read_exact(&mut req).await.unwrap();
                assert_eq!(req[1], 0x01, "expected CONNECT");
                assert_eq!(req[3], 0x01, "expected IPv4 destination");
                let mut addr = [0u8; 6];
                sock.read_exact(&mut addr).await.unwrap();
                let ip = std::net::Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
                let port = u16::from_be_bytes([addr[4], addr[5]]);
                let _ = tx.send(std::net::SocketAddr::from((ip, port)));
                sock.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await
                    .unwrap();

                let mut buf = [0u8; 1024];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    (port, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counting_device_counts() {
        let (mut device, mut host_end, counters) = counting_device();

        device.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        host_end.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        device.shutdown().await.unwrap();
        assert!(counters.writes.load(Ordering::SeqCst) >= 1);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recording_manager_builds_lazily() {
        let (_manager, stacks) = recording_manager();
        assert_eq!(stacks.builds(), 0);
    }
}
