//! Configuration module for Tunsocks
//!
//! This module provides the tunnel configuration type and TOML loading.

mod tunnel;

pub use tunnel::TunnelConfig;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<TunnelConfig> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<TunnelConfig> {
    toml::from_str(content).with_context(|| "Failed to parse configuration")
}
