//! Proxy configuration types
//!
//! Defines the root configuration and the settings for both proxy roles.

use super::{ChurnConfig, PeerConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Local SOCKS5 listener (SOCKS side)
    #[serde(default)]
    pub socks: SocksConfig,

    /// Outbound connections (network side)
    #[serde(default)]
    pub net: NetConfig,

    /// Peer transport
    #[serde(default)]
    pub peer: PeerConfig,

    /// Datagram obfuscation
    #[serde(default)]
    pub churn: ChurnConfig,

    /// Signaling batches
    #[serde(default)]
    pub signaling: SignalingConfig,
}

impl Config {
    /// Validate every section
    pub fn validate(&self) -> Result<(), String> {
        self.socks.validate()?;
        self.net.validate()?;
        self.peer.validate()?;
        self.churn.validate()?;
        self.signaling.validate()?;

        if self.churn.enabled && self.peer.advertised_addr.is_none() {
            if let Some(ip) = self.churn.bind_addr.filter(|ip| ip.is_unspecified()) {
                return Err(format!(
                    "peer.advertised_addr is required when churn.bind_addr is {}",
                    ip
                ));
            }
        }
        Ok(())
    }
}

/// Default SOCKS5 listen address
fn default_bind_addr() -> String {
    "127.0.0.1:1080".to_string()
}

/// Default connection limit
fn default_max_connections() -> usize {
    1024
}

/// SOCKS5 server configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SocksConfig {
    /// Listen address, e.g. "127.0.0.1:1080"
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Maximum concurrently open client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            max_connections: default_max_connections(),
        }
    }
}

impl SocksConfig {
    /// Parsed listen address
    pub fn bind_socket_addr(&self) -> Result<SocketAddr, String> {
        self.bind_addr
            .parse()
            .map_err(|_| format!("Invalid SOCKS bind address: {}", self.bind_addr))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        self.bind_socket_addr()?;
        if self.max_connections == 0 {
            return Err("max_connections must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Default outbound connect timeout in seconds
fn default_connect_timeout() -> u64 {
    10
}

/// Outbound connection configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NetConfig {
    /// Allow destinations in loopback, private and other non-unicast ranges
    #[serde(default)]
    pub allow_non_unicast: bool,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            allow_non_unicast: false,
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl NetConfig {
    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.connect_timeout == 0 {
            return Err("connect_timeout must be at least 1 second".to_string());
        }
        Ok(())
    }
}

/// Default signaling flush interval in milliseconds
fn default_batch_interval_ms() -> u64 {
    500
}

/// Signaling configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SignalingConfig {
    /// How often buffered negotiation messages are flushed
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: default_batch_interval_ms(),
        }
    }
}

impl SignalingConfig {
    /// Flush interval as a duration
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_interval_ms == 0 {
            return Err("batch_interval_ms must be positive".to_string());
        }
        Ok(())
    }
}
