//! Test utilities for SocksRtc
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use socksrtc::config::{Config, TransformerConfig};
use socksrtc::peer::PeerRole;
use socksrtc::proxy::{create_transport, RtcToNet, SocksToRtc};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Start a TCP server that echoes everything back
pub async fn start_echo_server() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Test configuration builder
pub struct TestConfigBuilder {
    allow_non_unicast: bool,
    churn: Option<TransformerConfig>,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        TestConfigBuilder {
            allow_non_unicast: true,
            churn: None,
        }
    }
}

impl TestConfigBuilder {
    /// Create a new test config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow loopback and private destinations
    pub fn allow_non_unicast(mut self, allow: bool) -> Self {
        self.allow_non_unicast = allow;
        self
    }

    /// Route the peer transport through churn with `transformer`
    pub fn churn(mut self, transformer: TransformerConfig) -> Self {
        self.churn = Some(transformer);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        let mut config = Config::default();
        config.socks.bind_addr = "127.0.0.1:0".to_string();
        config.net.allow_non_unicast = self.allow_non_unicast;
        config.net.connect_timeout = 2;
        config.peer.negotiation_timeout = 5;
        config.signaling.batch_interval_ms = 10;
        if let Some(transformer) = self.churn {
            config.churn.enabled = true;
            config.churn.transformer = transformer;
        }
        config
    }
}

/// Both halves wired together in-process
pub struct TunnelPair {
    /// SOCKS side
    pub socks: SocksToRtc,
    /// Network side
    pub net: RtcToNet,
    /// Where the SOCKS side listens
    pub socks_addr: SocketAddr,
}

/// Create both halves, pass signaling between them and start them
pub async fn start_tunnel(config: &Config) -> TunnelPair {
    let socks_transport = create_transport(PeerRole::Offerer, config).await.unwrap();
    let net_transport = create_transport(PeerRole::Answerer, config).await.unwrap();

    let socks = SocksToRtc::new(config, socks_transport).unwrap();
    let net = RtcToNet::new(config, net_transport).unwrap();

    let to_net = net.clone();
    socks.signals_for_peer().set_handler(move |batch: String| {
        let _ = to_net.handle_signal_from_peer(&batch);
    });
    let to_socks = socks.clone();
    net.signals_for_peer().set_handler(move |batch: String| {
        let _ = to_socks.handle_signal_from_peer(&batch);
    });

    let (socks_started, net_started) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(socks.start(), net.start())
    })
    .await
    .expect("tunnel did not start in time");

    let endpoint = socks_started.unwrap();
    net_started.unwrap();

    TunnelPair {
        socks,
        net,
        socks_addr: endpoint.to_socket_addr().unwrap(),
    }
}

/// SOCKS5 messages built by hand
pub mod socks5_mock {
    use socksrtc::socks::*;
    use std::net::SocketAddrV4;

    /// Create a no-auth method selection request
    pub fn create_auth_request_no_auth() -> Vec<u8> {
        vec![SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE]
    }

    /// Create a request with `command` to an IPv4 address
    pub fn create_request_ipv4(command: u8, addr: SocketAddrV4) -> Vec<u8> {
        let mut cmd = vec![SOCKS5_VERSION, command, SOCKS5_RESERVED, SOCKS5_ADDR_TYPE_IPV4];
        cmd.extend_from_slice(&addr.ip().octets());
        cmd.extend_from_slice(&addr.port().to_be_bytes());
        cmd
    }

    /// Create a connect command to domain
    pub fn create_connect_domain(domain: &str, port: u16) -> Vec<u8> {
        let mut cmd = vec![
            SOCKS5_VERSION,
            SOCKS5_CMD_TCP_CONNECT,
            SOCKS5_RESERVED,
            SOCKS5_ADDR_TYPE_DOMAIN,
            domain.len() as u8,
        ];
        cmd.extend_from_slice(domain.as_bytes());
        cmd.extend_from_slice(&port.to_be_bytes());
        cmd
    }
}

/// Run the method selection and send `request`; returns the reply code
pub async fn socks5_request(stream: &mut TcpStream, request: &[u8]) -> u8 {
    stream
        .write_all(&socks5_mock::create_auth_request_no_auth())
        .await
        .unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    stream.write_all(request).await.unwrap();
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[3], 0x01);
    reply[1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_server() {
        let addr = start_echo_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_config_builder() {
        let config = TestConfigBuilder::new()
            .allow_non_unicast(false)
            .churn(TransformerConfig::named("none"))
            .build();

        assert!(!config.net.allow_non_unicast);
        assert!(config.churn.enabled);
        assert!(config.validate().is_ok());
    }
}
