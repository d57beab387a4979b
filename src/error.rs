//! Error types for Tunsocks
//!
//! Configuration errors are the only errors a caller sees synchronously.
//! Device and flow errors are raised inside background tasks and end up in
//! logs (and in [`RelayExit`](crate::tunnel::RelayExit)) instead.

use std::io;
use thiserror::Error;

/// Main error type for tunnel operations
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Invalid proxy endpoint, timeout, or unusable device
    #[error("Configuration error: {0}")]
    Config(String),

    /// Reading from or writing to the TUN device failed
    #[error("Device error: {0}")]
    Device(#[source] io::Error),

    /// The network stack refused a packet or failed to close
    #[error("Network stack error: {0}")]
    Stack(String),

    /// A single proxied flow failed
    #[error("Flow error: {0}")]
    Flow(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Shorthand for a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        TunnelError::Config(msg.into())
    }

    /// Whether this error was raised by configuration validation
    pub fn is_config(&self) -> bool {
        matches!(self, TunnelError::Config(_))
    }
}

/// Result alias for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;
