//! End-to-end tests: a SOCKS5 client, both proxy halves and an echo server

mod common;

use common::{socks5_mock, socks5_request, start_echo_server, start_tunnel, TestConfigBuilder};
use socksrtc::config::TransformerConfig;
use socksrtc::socks::{SOCKS5_CMD_TCP_BIND, SOCKS5_CMD_TCP_CONNECT};
use socksrtc::ProxyState;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => panic!("expected an IPv4 address"),
    }
}

async fn echo_round_trip(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(10), stream.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(echoed, payload);
}

#[tokio::test]
async fn test_connect_through_tunnel() {
    let echo = start_echo_server().await;
    let tunnel = start_tunnel(&TestConfigBuilder::new().build()).await;

    let mut stream = TcpStream::connect(tunnel.socks_addr).await.unwrap();
    let request = socks5_mock::create_request_ipv4(SOCKS5_CMD_TCP_CONNECT, v4(echo));
    assert_eq!(socks5_request(&mut stream, &request).await, 0x00);

    echo_round_trip(&mut stream, b"hello through the tunnel").await;
    assert_eq!(tunnel.socks.session_count(), 1);

    drop(stream);
    tunnel.socks.stop().await.unwrap();
    assert_eq!(tunnel.socks.state(), ProxyState::Stopped);
}

#[tokio::test]
async fn test_domain_destination() {
    let echo = start_echo_server().await;
    let tunnel = start_tunnel(&TestConfigBuilder::new().build()).await;

    let mut stream = TcpStream::connect(tunnel.socks_addr).await.unwrap();
    let request = socks5_mock::create_connect_domain("localhost", echo.port());
    assert_eq!(socks5_request(&mut stream, &request).await, 0x00);
    echo_round_trip(&mut stream, b"by name").await;

    tunnel.socks.stop().await.unwrap();
}

#[tokio::test]
async fn test_async_socks5_client_bulk_transfer() {
    let echo = start_echo_server().await;
    let tunnel = start_tunnel(&TestConfigBuilder::new().build()).await;

    let mut stream = TcpStream::connect(tunnel.socks_addr).await.unwrap();
    async_socks5::connect(&mut stream, echo, None).await.unwrap();

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let (mut reader, mut writer) = stream.into_split();
    let expected = payload.clone();
    let writing = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer
    });

    let mut echoed = vec![0u8; expected.len()];
    tokio::time::timeout(Duration::from_secs(30), reader.read_exact(&mut echoed))
        .await
        .expect("bulk echo timed out")
        .unwrap();
    assert!(echoed == expected);
    let _writer = writing.await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(tunnel.socks.bytes().sent() >= expected.len() as u64);
    assert!(tunnel.net.bytes().received() >= expected.len() as u64);
    tunnel.socks.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_clients() {
    let echo = start_echo_server().await;
    let tunnel = start_tunnel(&TestConfigBuilder::new().build()).await;

    let mut clients = Vec::new();
    for i in 0..8u8 {
        let socks_addr = tunnel.socks_addr;
        clients.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(socks_addr).await.unwrap();
            let request = socks5_mock::create_request_ipv4(SOCKS5_CMD_TCP_CONNECT, v4(echo));
            assert_eq!(socks5_request(&mut stream, &request).await, 0x00);
            echo_round_trip(&mut stream, &[i; 4096]).await;
        }));
    }
    for client in clients {
        client.await.unwrap();
    }

    tunnel.socks.stop().await.unwrap();
}

#[tokio::test]
async fn test_churn_transformers() {
    let transformers = [
        TransformerConfig::named("none"),
        TransformerConfig::named("caesar").with_key(&[13]),
        TransformerConfig::named("chacha20").with_key(b"shared secret"),
    ];

    for transformer in transformers {
        let name = transformer.name.clone();
        let echo = start_echo_server().await;
        let tunnel = start_tunnel(&TestConfigBuilder::new().churn(transformer).build()).await;

        let mut stream = TcpStream::connect(tunnel.socks_addr).await.unwrap();
        let request = socks5_mock::create_request_ipv4(SOCKS5_CMD_TCP_CONNECT, v4(echo));
        assert_eq!(socks5_request(&mut stream, &request).await, 0x00, "{}", name);
        echo_round_trip(&mut stream, name.as_bytes()).await;

        tunnel.socks.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_non_unicast_destination_refused() {
    let echo = start_echo_server().await;
    let tunnel = start_tunnel(&TestConfigBuilder::new().allow_non_unicast(false).build()).await;

    let mut stream = TcpStream::connect(tunnel.socks_addr).await.unwrap();
    let request = socks5_mock::create_request_ipv4(SOCKS5_CMD_TCP_CONNECT, v4(echo));
    assert_eq!(socks5_request(&mut stream, &request).await, 0x02);

    tunnel.socks.stop().await.unwrap();
}

#[tokio::test]
async fn test_bind_not_supported() {
    let tunnel = start_tunnel(&TestConfigBuilder::new().build()).await;

    let mut stream = TcpStream::connect(tunnel.socks_addr).await.unwrap();
    let request = socks5_mock::create_request_ipv4(SOCKS5_CMD_TCP_BIND, "127.0.0.1:80".parse().unwrap());
    assert_eq!(socks5_request(&mut stream, &request).await, 0x07);

    tunnel.socks.stop().await.unwrap();
}

#[tokio::test]
async fn test_refused_destination_reports_connection_refused() {
    let (listener, addr) = common::create_test_listener().await;
    drop(listener);
    let tunnel = start_tunnel(&TestConfigBuilder::new().build()).await;

    let mut stream = TcpStream::connect(tunnel.socks_addr).await.unwrap();
    let request = socks5_mock::create_request_ipv4(SOCKS5_CMD_TCP_CONNECT, v4(addr));
    assert_eq!(socks5_request(&mut stream, &request).await, 0x05);

    tunnel.socks.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_propagates_to_network_side() {
    let tunnel = start_tunnel(&TestConfigBuilder::new().build()).await;
    assert_eq!(tunnel.socks.state(), ProxyState::Started);
    assert_eq!(tunnel.net.state(), ProxyState::Started);

    tunnel.socks.stop().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), tunnel.net.once_stopped())
        .await
        .expect("network side did not stop");
    assert_eq!(tunnel.net.state(), ProxyState::Stopped);

    // stopping twice is fine
    tunnel.socks.stop().await.unwrap();
    assert!(TcpStream::connect(tunnel.socks_addr).await.is_err());
}
