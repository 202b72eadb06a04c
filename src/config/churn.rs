//! Obfuscation configuration types

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Default transformer name
fn default_transformer_name() -> String {
    "none".to_string()
}

/// Selects and parameterizes a datagram transformer
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TransformerConfig {
    /// Transformer name: "none", "caesar" or "chacha20"
    #[serde(default = "default_transformer_name")]
    pub name: String,

    /// Base64 encoded key material
    #[serde(default)]
    pub key: Option<String>,

    /// Transformer specific JSON
    #[serde(default)]
    pub config: Option<String>,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            name: default_transformer_name(),
            key: None,
            config: None,
        }
    }
}

impl TransformerConfig {
    /// Config for a named transformer with no parameters
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Attach raw key bytes
    pub fn with_key(mut self, key: &[u8]) -> Self {
        use base64::Engine;
        self.key = Some(base64::engine::general_purpose::STANDARD.encode(key));
        self
    }
}

/// Churn configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ChurnConfig {
    /// Route peer transport datagrams through an obfuscation pipe
    #[serde(default)]
    pub enabled: bool,

    /// IP for the public pipe socket; defaults to the peer bind address
    #[serde(default)]
    pub bind_addr: Option<IpAddr>,

    /// Transformer applied to every datagram
    #[serde(default)]
    pub transformer: TransformerConfig,
}

impl ChurnConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.transformer.name.is_empty() {
            return Err("churn.transformer.name must not be empty".to_string());
        }
        Ok(())
    }
}
