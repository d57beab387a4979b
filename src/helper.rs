//! Helper utilities for Tunsocks
//!
//! Shared constants and small functions used across the crate.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Link MTU of the TUN device; one relay read never exceeds this
pub const DEFAULT_MTU: usize = 1500;

/// Default proxy dial timeout in seconds
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 5;

/// Default UDP session idle timeout in seconds
pub const DEFAULT_UDP_IDLE_TIMEOUT_SECS: u64 = 60;

/// How long stop waits for the relay loop before aborting it
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest datagram a UDP flow can carry
pub const MAX_DATAGRAM_SIZE: usize = 65535;

/// Bidirectional copy between two async streams
///
/// Copies data from `a` to `b` and from `b` to `a` concurrently.
/// Returns when both directions reach EOF or either one fails.
pub async fn copy_bidirectional<A, B>(a: &mut A, b: &mut B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    tokio::io::copy_bidirectional(a, b).await
}

/// Parse duration from seconds
pub fn duration_from_secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}
