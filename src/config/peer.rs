//! Peer transport configuration

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

fn default_peer_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_negotiation_timeout() -> u64 {
    30
}

/// Peer transport configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PeerConfig {
    /// IP the transport's datagram socket binds to
    #[serde(default = "default_peer_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port to bind, 0 for any
    #[serde(default)]
    pub port: u16,

    /// Address announced in host candidates; defaults to `bind_addr`
    #[serde(default)]
    pub advertised_addr: Option<IpAddr>,

    /// Seconds to wait for negotiation to complete
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_peer_bind_addr(),
            port: 0,
            advertised_addr: None,
            negotiation_timeout: default_negotiation_timeout(),
        }
    }
}

impl PeerConfig {
    /// Address other peers should dial
    pub fn candidate_addr(&self) -> IpAddr {
        self.advertised_addr.unwrap_or(self.bind_addr)
    }

    /// Negotiation timeout as a duration
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.candidate_addr().is_unspecified() {
            return Err(
                "peer.advertised_addr is required when peer.bind_addr is unspecified".to_string(),
            );
        }
        if self.negotiation_timeout == 0 {
            return Err("negotiation_timeout must be at least 1 second".to_string());
        }
        Ok(())
    }
}
