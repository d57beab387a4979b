//! Tunnel lifecycle
//!
//! [`TunnelManager::start`] wires a TUN device to a network stack and the
//! SOCKS5 handlers, then spawns the relay loop. [`TunnelHandle::stop`] tears
//! it down in order: handlers, stack, device.

mod manager;
mod relay;

pub use manager::{stop_tunnel, TunnelHandle, TunnelManager};
pub use relay::{run_relay, RelayExit};
