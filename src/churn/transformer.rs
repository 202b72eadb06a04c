//! Datagram transformers
//!
//! A transformer rewrites each outgoing datagram and undoes the rewrite on
//! the receiving side. For every transformer `restore(transform(x)) == x`.

use crate::config::TransformerConfig;
use crate::error::SocksRtcError;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt::Debug;
use std::sync::Arc;

/// Reversible datagram rewrite
pub trait Transformer: Debug + Send + Sync {
    /// Name used to select this transformer
    fn name(&self) -> &'static str;

    /// Rewrite an outgoing datagram
    fn transform(&self, data: &[u8]) -> Result<Vec<u8>, SocksRtcError>;

    /// Undo [`transform`](Self::transform) on an incoming datagram
    fn restore(&self, data: &[u8]) -> Result<Vec<u8>, SocksRtcError>;
}

/// Build the transformer named by `config`
///
/// Fails on unknown names and on missing or malformed parameters.
pub fn create_transformer(config: &TransformerConfig) -> Result<Arc<dyn Transformer>, SocksRtcError> {
    let key = decode_key(config)?;
    match config.name.as_str() {
        "none" => Ok(Arc::new(Passthrough)),
        "caesar" => Ok(Arc::new(Caesar::from_config(key, config.config.as_deref())?)),
        "chacha20" => Ok(Arc::new(ChaCha20::new(key)?)),
        other => Err(SocksRtcError::TransformerConfig(format!(
            "unknown transformer: {}",
            other
        ))),
    }
}

fn decode_key(config: &TransformerConfig) -> Result<Option<Vec<u8>>, SocksRtcError> {
    config
        .key
        .as_deref()
        .map(|key| {
            base64::engine::general_purpose::STANDARD
                .decode(key)
                .map_err(|e| SocksRtcError::TransformerConfig(format!("key is not base64: {}", e)))
        })
        .transpose()
}

/// Identity transformer
#[derive(Debug)]
pub struct Passthrough;

impl Transformer for Passthrough {
    fn name(&self) -> &'static str {
        "none"
    }

    fn transform(&self, data: &[u8]) -> Result<Vec<u8>, SocksRtcError> {
        Ok(data.to_vec())
    }

    fn restore(&self, data: &[u8]) -> Result<Vec<u8>, SocksRtcError> {
        Ok(data.to_vec())
    }
}

#[derive(Deserialize)]
struct CaesarParams {
    key: u8,
}

/// Adds a fixed shift to every byte
#[derive(Debug)]
pub struct Caesar {
    shift: u8,
}

impl Caesar {
    /// Create with an explicit shift
    pub fn new(shift: u8) -> Self {
        Caesar { shift }
    }

    /// Shift from a one byte key, or from config `{"key": n}`
    fn from_config(key: Option<Vec<u8>>, config: Option<&str>) -> Result<Self, SocksRtcError> {
        if let Some(key) = key {
            return match key.as_slice() {
                [shift] => Ok(Caesar::new(*shift)),
                _ => Err(SocksRtcError::TransformerConfig(format!(
                    "caesar key must be 1 byte, got {}",
                    key.len()
                ))),
            };
        }

        let config = config.ok_or_else(|| {
            SocksRtcError::TransformerConfig("caesar requires a key".to_string())
        })?;
        let params: CaesarParams = serde_json::from_str(config)
            .map_err(|e| SocksRtcError::TransformerConfig(format!("caesar config: {}", e)))?;
        Ok(Caesar::new(params.key))
    }
}

impl Transformer for Caesar {
    fn name(&self) -> &'static str {
        "caesar"
    }

    fn transform(&self, data: &[u8]) -> Result<Vec<u8>, SocksRtcError> {
        Ok(data.iter().map(|b| b.wrapping_add(self.shift)).collect())
    }

    fn restore(&self, data: &[u8]) -> Result<Vec<u8>, SocksRtcError> {
        Ok(data.iter().map(|b| b.wrapping_sub(self.shift)).collect())
    }
}

/// ChaCha20-Poly1305 with a random nonce prefixed to each datagram
///
/// ```text
/// +-----------+------------------+-----------+
/// | nonce(12) | ciphertext(len)  |  tag(16)  |
/// +-----------+------------------+-----------+
/// ```
pub struct ChaCha20 {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl ChaCha20 {
    fn new(key: Option<Vec<u8>>) -> Result<Self, SocksRtcError> {
        let key = key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| SocksRtcError::TransformerConfig("chacha20 requires a key".to_string()))?;
        let digest = Sha256::digest(&key);
        let unbound = UnboundKey::new(&CHACHA20_POLY1305, digest.as_slice())
            .map_err(|_| SocksRtcError::TransformerConfig("invalid chacha20 key".to_string()))?;

        Ok(ChaCha20 {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }
}

impl Debug for ChaCha20 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaCha20").finish_non_exhaustive()
    }
}

impl Transformer for ChaCha20 {
    fn name(&self) -> &'static str {
        "chacha20"
    }

    fn transform(&self, data: &[u8]) -> Result<Vec<u8>, SocksRtcError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce).map_err(|_| {
            SocksRtcError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "random source failed",
            ))
        })?;

        let mut sealed = data.to_vec();
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut sealed)
            .map_err(|_| SocksRtcError::Serialization("seal failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn restore(&self, data: &[u8]) -> Result<Vec<u8>, SocksRtcError> {
        if data.len() < NONCE_LEN + CHACHA20_POLY1305.tag_len() {
            return Err(SocksRtcError::Serialization(format!(
                "sealed datagram too short: {} bytes",
                data.len()
            )));
        }

        let (nonce, sealed) = data.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| SocksRtcError::Serialization("bad nonce".to_string()))?;
        let mut buf = sealed.to_vec();
        let plain = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| SocksRtcError::Serialization("datagram failed authentication".to_string()))?;
        Ok(plain.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_transformers() -> Vec<Arc<dyn Transformer>> {
        vec![
            create_transformer(&TransformerConfig::named("none")).unwrap(),
            create_transformer(&TransformerConfig::named("caesar").with_key(&[13])).unwrap(),
            create_transformer(&TransformerConfig::named("chacha20").with_key(b"secret")).unwrap(),
        ]
    }

    #[test]
    fn test_restore_inverts_transform() {
        let samples: [&[u8]; 3] = [b"", b"hello world", &[0xFF; 1200]];
        for transformer in all_transformers() {
            for sample in samples {
                let wire = transformer.transform(sample).unwrap();
                assert_eq!(transformer.restore(&wire).unwrap(), sample, "{}", transformer.name());
            }
        }
    }

    #[test]
    fn test_unknown_name_fails() {
        let err = create_transformer(&TransformerConfig::named("rot47")).unwrap_err();
        assert!(matches!(err, SocksRtcError::TransformerConfig(_)));
    }

    #[test]
    fn test_caesar_shifts_bytes() {
        let caesar = Caesar::new(1);
        assert_eq!(caesar.transform(&[0, 1, 255]).unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn test_caesar_from_json_config() {
        let config = TransformerConfig {
            name: "caesar".to_string(),
            key: None,
            config: Some(r#"{"key": 42}"#.to_string()),
        };
        let caesar = create_transformer(&config).unwrap();
        assert_eq!(caesar.transform(&[0]).unwrap(), vec![42]);
    }

    #[test]
    fn test_caesar_parameter_errors() {
        assert!(create_transformer(&TransformerConfig::named("caesar")).is_err());
        assert!(create_transformer(&TransformerConfig::named("caesar").with_key(&[1, 2])).is_err());

        let config = TransformerConfig {
            config: Some("{".to_string()),
            ..TransformerConfig::named("caesar")
        };
        assert!(create_transformer(&config).is_err());

        let config = TransformerConfig {
            key: Some("***".to_string()),
            ..TransformerConfig::named("caesar")
        };
        assert!(create_transformer(&config).is_err());
    }

    #[test]
    fn test_chacha20_requires_key() {
        assert!(create_transformer(&TransformerConfig::named("chacha20")).is_err());
    }

    #[test]
    fn test_chacha20_hides_plaintext_and_detects_tampering() {
        let cipher = create_transformer(&TransformerConfig::named("chacha20").with_key(b"k")).unwrap();
        let a = cipher.transform(b"same").unwrap();
        let b = cipher.transform(b"same").unwrap();
        assert_ne!(a, b);
        assert!(!a.windows(4).any(|w| w == b"same"));

        let mut tampered = a.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        assert!(cipher.restore(&tampered).is_err());
        assert!(cipher.restore(&a[..10]).is_err());

        let other = create_transformer(&TransformerConfig::named("chacha20").with_key(b"x")).unwrap();
        assert!(other.restore(&a).is_err());
    }
}
