//! Tunnel configuration types
//!
//! [`TunnelConfig`] is validated on construction, so holding one means the
//! proxy endpoint and timeouts are usable.

use crate::error::{Result, TunnelError};
use crate::helper::{duration_from_secs, DEFAULT_DIAL_TIMEOUT_SECS, DEFAULT_UDP_IDLE_TIMEOUT_SECS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default dial timeout in seconds
fn default_dial_timeout() -> f64 {
    DEFAULT_DIAL_TIMEOUT_SECS as f64
}

/// Default UDP idle timeout in seconds
fn default_udp_idle_timeout() -> f64 {
    DEFAULT_UDP_IDLE_TIMEOUT_SECS as f64
}

/// Convert a timeout in (possibly fractional) seconds
fn timeout_from_secs(name: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| TunnelError::config(format!("{} must be a positive number of seconds", name)))
}

/// On-disk shape of the tunnel configuration.
///
/// The port is read as a wide integer so that out-of-range values surface as
/// configuration errors instead of integer overflow. Timeouts are seconds and
/// may be fractional.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
struct RawTunnelConfig {
    proxy_host: String,
    proxy_port: i64,
    #[serde(default = "default_dial_timeout")]
    dial_timeout: f64,
    #[serde(default = "default_udp_idle_timeout")]
    udp_idle_timeout: f64,
}

/// Validated SOCKS5 tunnel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTunnelConfig", into = "RawTunnelConfig")]
pub struct TunnelConfig {
    proxy_host: String,
    proxy_port: u16,
    dial_timeout: Duration,
    udp_idle_timeout: Duration,
}

impl TunnelConfig {
    /// Create a configuration with default timeouts
    pub fn new(proxy_host: impl Into<String>, proxy_port: i64) -> Result<Self> {
        Self::with_timeouts(
            proxy_host,
            proxy_port,
            duration_from_secs(DEFAULT_DIAL_TIMEOUT_SECS),
            duration_from_secs(DEFAULT_UDP_IDLE_TIMEOUT_SECS),
        )
    }

    /// Create a configuration with explicit timeouts
    pub fn with_timeouts(
        proxy_host: impl Into<String>,
        proxy_port: i64,
        dial_timeout: Duration,
        udp_idle_timeout: Duration,
    ) -> Result<Self> {
        let proxy_host = proxy_host.into();
        let trimmed = proxy_host.trim();
        if trimmed.is_empty() {
            return Err(TunnelError::config(format!(
                "invalid SOCKS endpoint {:?}:{}: empty host",
                proxy_host, proxy_port
            )));
        }

        let proxy_port = u16::try_from(proxy_port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| {
                TunnelError::config(format!(
                    "invalid SOCKS endpoint {}:{}: port must be in 1..=65535",
                    trimmed, proxy_port
                ))
            })?;

        if dial_timeout.is_zero() {
            return Err(TunnelError::config("dial_timeout must be positive"));
        }
        if udp_idle_timeout.is_zero() {
            return Err(TunnelError::config("udp_idle_timeout must be positive"));
        }

        Ok(Self {
            proxy_host: trimmed.to_string(),
            proxy_port,
            dial_timeout,
            udp_idle_timeout,
        })
    }

    /// SOCKS5 proxy host
    pub fn proxy_host(&self) -> &str {
        &self.proxy_host
    }

    /// SOCKS5 proxy port
    pub fn proxy_port(&self) -> u16 {
        self.proxy_port
    }

    /// Timeout for establishing the proxy connection of a flow
    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    /// Inactivity period after which a UDP session is torn down
    pub fn udp_idle_timeout(&self) -> Duration {
        self.udp_idle_timeout
    }
}

impl fmt::Display for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.proxy_host.contains(':') {
            write!(f, "[{}]:{}", self.proxy_host, self.proxy_port)
        } else {
            write!(f, "{}:{}", self.proxy_host, self.proxy_port)
        }
    }
}

impl TryFrom<RawTunnelConfig> for TunnelConfig {
    type Error = TunnelError;

    fn try_from(raw: RawTunnelConfig) -> Result<Self> {
        TunnelConfig::with_timeouts(
            raw.proxy_host,
            raw.proxy_port,
            timeout_from_secs("dial_timeout", raw.dial_timeout)?,
            timeout_from_secs("udp_idle_timeout", raw.udp_idle_timeout)?,
        )
    }
}

impl From<TunnelConfig> for RawTunnelConfig {
    fn from(config: TunnelConfig) -> Self {
        RawTunnelConfig {
            proxy_host: config.proxy_host,
            proxy_port: i64::from(config.proxy_port),
            dial_timeout: config.dial_timeout.as_secs_f64(),
            udp_idle_timeout: config.udp_idle_timeout.as_secs_f64(),
        }
    }
}
