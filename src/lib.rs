//! # Tunsocks - TUN to SOCKS5 Tunnel
//!
//! Tunsocks bridges a TUN packet device to a remote SOCKS5 proxy. Raw IP
//! packets read from the device are fed into a user-space network stack,
//! which turns them into TCP and UDP flows. Each flow is relayed through the
//! proxy, and the packets the stack emits go back out through the device.
//!
//! ## Features
//!
//! - **Lifecycle Management**: Validated start, ordered and idempotent stop
//! - **Per-Tunnel Handlers**: TCP and UDP handler slots live on each stack instance
//! - **SOCKS5 Relay**: CONNECT for TCP flows, UDP ASSOCIATE for UDP flows
//! - **Mobile Friendly**: Blocking facade over a raw TUN file descriptor
//! - **Pluggable Stack**: Any [`stack::NetworkStack`]; `ipstack` behind a feature
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tunsocks::stack::IpStackNetwork;
//! use tunsocks::TunnelManager;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = TunnelManager::new(|| IpStackNetwork::new(1500));
//!     let mut handle = manager.start(tun_device, "127.0.0.1", 1080)?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     handle.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! TUN device -> relay loop -> NetworkStack -> flow handlers -> SOCKS5 proxy
//!     ^                            |
//!     +------- packet output ------+
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod device;
pub mod error;
pub mod helper;
pub mod mobile;
pub mod proxy;
pub mod stack;
pub mod tunnel;

// Re-export commonly used items
pub use config::{load_config, TunnelConfig};
pub use error::{Result, TunnelError};
pub use stack::{HandlerSlots, NetworkStack, PacketOutput, StackBuilder};
pub use tunnel::{stop_tunnel, RelayExit, TunnelHandle, TunnelManager};

#[cfg(unix)]
pub use device::FdDevice;
#[cfg(unix)]
pub use mobile::MobileTunnel;

/// Version of the Tunsocks library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the library
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "tunsocks");
    }
}
