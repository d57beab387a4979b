//! Blocking entry points for mobile hosts
//!
//! A VPN service on a phone owns the TUN interface and hands its file
//! descriptor over from a plain thread. [`MobileTunnel`] bundles a tunnel
//! with the tokio runtime that drives it, so start and stop can be called
//! without any async context.

use anyhow::Result;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
pub use self::fd_tunnel::*;

/// Install a global `tracing` subscriber.
///
/// Unknown levels fall back to `info`. Fails if a global subscriber is
/// already set.
pub fn init_logging(level: &str, json: bool) -> Result<()> {
    let level = parse_level(level);

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

#[cfg(unix)]
mod fd_tunnel {
    use crate::config::TunnelConfig;
    use crate::device::FdDevice;
    use crate::error::Result;
    use crate::stack::StackBuilder;
    use crate::tunnel::{TunnelHandle, TunnelManager};
    use std::os::fd::RawFd;
    use tokio::runtime::Runtime;
    use tracing::debug;

    /// A tunnel together with the runtime it runs on
    pub struct MobileTunnel {
        // Dropped before the runtime
        handle: TunnelHandle,
        runtime: Runtime,
    }

    impl MobileTunnel {
        /// Whether the tunnel has not been stopped yet
        pub fn is_running(&self) -> bool {
            self.handle.is_running()
        }

        /// The underlying tunnel handle
        pub fn handle(&self) -> &TunnelHandle {
            &self.handle
        }

        /// Stop the tunnel, blocking until teardown completes.
        ///
        /// Must not be called from inside an async context.
        pub fn stop(&mut self) {
            self.runtime.block_on(self.handle.stop());
        }
    }

    impl std::fmt::Debug for MobileTunnel {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MobileTunnel")
                .field("handle", &self.handle)
                .finish()
        }
    }

    /// Start a tunnel on the TUN `fd` with stacks from `builder`.
    ///
    /// The host and port are validated before the fd is touched; a rejected
    /// fd stays owned by the caller.
    pub fn start_socks_tunnel_with<B: StackBuilder>(
        builder: B,
        fd: RawFd,
        proxy_host: &str,
        proxy_port: i64,
    ) -> Result<MobileTunnel> {
        let config = TunnelConfig::new(proxy_host, proxy_port)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("tunsocks-worker")
            .build()?;

        let handle = {
            let _guard = runtime.enter();
            let device = FdDevice::from_raw_fd(fd)?;
            TunnelManager::new(builder).start_with_config(device, config)?
        };

        debug!("Mobile tunnel started on fd {}", fd);
        Ok(MobileTunnel { handle, runtime })
    }

    /// Start a tunnel on the TUN `fd` backed by the `ipstack` network stack.
    #[cfg(feature = "ipstack")]
    pub fn start_socks_tunnel(fd: RawFd, proxy_host: &str, proxy_port: i64) -> Result<MobileTunnel> {
        use crate::helper::DEFAULT_MTU;
        use crate::stack::IpStackNetwork;

        start_socks_tunnel_with(|| IpStackNetwork::new(DEFAULT_MTU), fd, proxy_host, proxy_port)
    }

    /// Stop `tunnel` if present and running.
    pub fn stop_tunnel(tunnel: Option<&mut MobileTunnel>) {
        match tunnel {
            Some(tunnel) => tunnel.stop(),
            None => debug!("stop_tunnel called without a tunnel"),
        }
    }
}
