//! SOCKS side of the proxy
//!
//! [`SocksToRtc`] runs the local SOCKS5 server. Each accepted client gets
//! its own sub-channel on the shared peer transport: the destination is
//! sent as the channel's first message and, once the network side has
//! connected, bytes are relayed until either end closes.

use super::handshake::{encode_message, read_message, ConnectRequest, ConnectResponse};
use super::session::{ByteCounterSink, Session, SessionTable};
use super::signaling::PeerSignaling;
use super::{transport_outcome, Lifecycle, ProxyState};
use crate::config::Config;
use crate::connection::{Connection, HandlerQueue, Server};
use crate::error::{Socks5Error, Socks5ReplyCode, SocksRtcError};
use crate::peer::PeerTransport;
use crate::socks::{
    compose_auth_response, compose_reply, compose_request_response, interpret_auth_handshake,
    interpret_request, AuthMethod, Endpoint, SocksCommand,
};
use anyhow::{anyhow, Context, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

struct Inner {
    bind_addr: SocketAddr,
    max_connections: usize,
    transport: Arc<dyn PeerTransport>,
    signaling: PeerSignaling,
    server: Mutex<Option<Server>>,
    sessions: Arc<SessionTable>,
    bytes: Arc<ByteCounterSink>,
    lifecycle: Lifecycle,
}

/// Local SOCKS5 server relaying over a peer transport
#[derive(Clone)]
pub struct SocksToRtc {
    inner: Arc<Inner>,
}

impl SocksToRtc {
    /// Create the SOCKS side; nothing is bound until [`start`](Self::start)
    ///
    /// The transport's negotiation messages are collected from now on.
    pub fn new(config: &Config, transport: Arc<dyn PeerTransport>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow!(e))
            .context("Invalid configuration")?;
        let bind_addr = config.socks.bind_socket_addr().map_err(|e| anyhow!(e))?;
        let signaling = PeerSignaling::attach(transport.clone(), config.signaling.batch_interval());

        Ok(SocksToRtc {
            inner: Arc::new(Inner {
                bind_addr,
                max_connections: config.socks.max_connections,
                transport,
                signaling,
                server: Mutex::new(None),
                sessions: Arc::new(SessionTable::new()),
                bytes: Arc::new(ByteCounterSink::new()),
                lifecycle: Lifecycle::new(),
            }),
        })
    }

    /// Listen locally and negotiate the peer transport, concurrently
    ///
    /// Fails if either fails, after undoing whichever succeeded. Returns
    /// the bound SOCKS endpoint.
    pub async fn start(&self) -> Result<Endpoint> {
        let inner = &self.inner;
        inner.lifecycle.begin_start()?;
        inner.signaling.start();

        let (listened, negotiated) = tokio::join!(
            Server::listen(inner.bind_addr, inner.max_connections),
            inner.transport.negotiate()
        );

        let server = match (listened, negotiated) {
            (Ok(server), Ok(())) => server,
            (Ok(server), Err(e)) => {
                if let Err(shutdown) = server.shutdown().await {
                    warn!("SOCKS server cleanup failed: {:#}", shutdown);
                }
                self.fail_start();
                return Err(anyhow::Error::new(e).context("Peer transport negotiation failed"));
            }
            (Err(e), negotiated) => {
                if let Err(negotiation) = negotiated {
                    debug!("Negotiation also failed: {}", negotiation);
                }
                self.fail_start();
                return Err(e.context("Failed to start SOCKS server"));
            }
        };

        let endpoint = server.endpoint().clone();
        let handler = inner.clone();
        server.connections().set_handler(move |conn| {
            tokio::spawn(serve_client(handler.clone(), conn));
        });
        *lock(&inner.server) = Some(server);
        inner.lifecycle.set(ProxyState::Started);

        let watcher = self.clone();
        tokio::spawn(async move {
            let kind = watcher.inner.transport.once_closed().await;
            if !watcher.inner.lifecycle.is_stopping() {
                warn!("Peer transport closed ({:?}), stopping SOCKS side", kind);
                if let Err(e) = watcher.stop().await {
                    warn!("Stop after transport loss failed: {:#}", e);
                }
            }
        });

        info!("SOCKS side started on {}", endpoint);
        Ok(endpoint)
    }

    fn fail_start(&self) {
        self.inner.transport.close();
        self.inner.signaling.close();
        self.inner.lifecycle.set(ProxyState::Failed);
    }

    /// Shut down the server, every session and the transport; idempotent
    ///
    /// Fails when the server could not be shut down cleanly, or when the
    /// transport had already broken down rather than closing on request.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.lifecycle.begin_stop() {
            inner.lifecycle.stopped().await;
            return Ok(());
        }

        inner.signaling.close();
        inner.sessions.close_all();

        let server = lock(&inner.server).take();
        let server_result = match server {
            Some(server) => server.shutdown().await,
            None => Ok(()),
        };

        inner.transport.close();
        let kind = inner.transport.once_closed().await;
        debug!("Peer transport finished: {:?}", kind);

        inner.lifecycle.finish_stop();
        info!("SOCKS side stopped");
        server_result.context("Failed to shut down SOCKS server")?;
        transport_outcome(kind)
    }

    /// Wait until the proxy has stopped
    pub async fn once_stopped(&self) {
        self.inner.lifecycle.stopped().await
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProxyState {
        self.inner.lifecycle.state()
    }

    /// Signaling batches to pass to the network side
    pub fn signals_for_peer(&self) -> &HandlerQueue<String> {
        self.inner.signaling.batches()
    }

    /// Handle a signaling batch from the network side
    pub fn handle_signal_from_peer(&self, batch: &str) -> Result<usize, SocksRtcError> {
        self.inner.signaling.handle_batch(batch)
    }

    /// Byte totals across all sessions
    pub fn bytes(&self) -> &Arc<ByteCounterSink> {
        &self.inner.bytes
    }

    /// Number of sessions currently relaying
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }
}

/// Parse a SOCKS message from `buf`, reading more while it is truncated
///
/// `parse` returns the message and its length on the wire; those bytes
/// are consumed from `buf`.
async fn read_socks<T, F>(conn: &Connection, buf: &mut BytesMut, parse: F) -> Result<T, SocksRtcError>
where
    F: Fn(&[u8]) -> Result<(T, usize), Socks5Error>,
{
    loop {
        match parse(&buf[..]) {
            Ok((message, len)) => {
                buf.advance(len);
                return Ok(message);
            }
            Err(e) if e.is_truncated() => match conn.receive().await {
                Some(data) => buf.extend_from_slice(&data),
                None => {
                    return Err(SocksRtcError::Closed(format!(
                        "client {} left during handshake",
                        conn.id()
                    )))
                }
            },
            Err(e) => return Err(e.into()),
        }
    }
}

/// Send a failure reply and make sure it is written
async fn refuse(conn: &Connection, code: Socks5ReplyCode) {
    let reply = compose_reply(code, &Endpoint::unspecified());
    if conn.send(Bytes::from(reply)).await.is_ok() {
        let _ = conn.flush().await;
    }
}

async fn serve_client(inner: Arc<Inner>, local: Connection) {
    let id = local.id();
    if let Err(e) = handshake_and_relay(&inner, local.clone()).await {
        debug!("Client {}: {}", id, e);
        local.close();
    }
}

async fn handshake_and_relay(inner: &Arc<Inner>, local: Connection) -> Result<(), SocksRtcError> {
    let mut buf = BytesMut::new();

    let methods = read_socks(&local, &mut buf, |b| {
        interpret_auth_handshake(b).map(|methods| (methods, 2 + b[1] as usize))
    })
    .await?;
    if !methods.contains(&AuthMethod::NoAuth) {
        debug!("Client {} did not offer NOAUTH ({:?}), using it anyway", local.id(), methods);
    }
    local.send(Bytes::from(compose_auth_response(AuthMethod::NoAuth))).await?;

    let request = match read_socks(&local, &mut buf, |b| {
        interpret_request(b).map(|request| {
            let len = request.wire_len();
            (request, len)
        })
    })
    .await
    {
        Ok(request) => request,
        Err(SocksRtcError::Socks5(e)) => {
            refuse(&local, Socks5ReplyCode::from(&e)).await;
            return Err(e.into());
        }
        Err(e) => return Err(e),
    };

    if request.command != SocksCommand::TcpConnect {
        refuse(&local, Socks5ReplyCode::CommandNotSupported).await;
        return Err(SocksRtcError::UnsupportedCommand(format!("{:?}", request.command)));
    }
    let destination = request.destination.into_endpoint();
    debug!("Client {} requests {}", local.id(), destination);

    let channel = match inner.transport.open_channel().await {
        Ok(channel) => channel,
        Err(e) => {
            refuse(&local, Socks5ReplyCode::GeneralFailure).await;
            return Err(e);
        }
    };

    let mut channel_buf = BytesMut::new();
    let response = request_destination(&channel, &destination, &mut channel_buf).await;

    let bound = match response.map(|response| response.outcome()) {
        Ok(Ok(bound)) => bound,
        Ok(Err(code)) => {
            refuse(&local, code).await;
            channel.close();
            return Err(SocksRtcError::ConnectFailure(format!(
                "{} failed with {:?}",
                destination, code
            )));
        }
        Err(e) => {
            refuse(&local, Socks5ReplyCode::GeneralFailure).await;
            channel.close();
            return Err(e);
        }
    };

    local.send(Bytes::from(compose_request_response(&bound))).await?;
    if !buf.is_empty() {
        channel.send(buf.split().freeze()).await?;
    }
    if !channel_buf.is_empty() {
        local.send(channel_buf.split().freeze()).await?;
    }

    info!("Client {} connected to {}", local.id(), destination);
    Session::new(local, channel, &inner.sessions, &inner.bytes).run().await;
    Ok(())
}

async fn request_destination(
    channel: &Connection,
    destination: &Endpoint,
    buf: &mut BytesMut,
) -> Result<ConnectResponse, SocksRtcError> {
    channel
        .send(encode_message(&ConnectRequest::tcp(destination))?)
        .await?;
    read_message(channel, buf).await
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::CloseKind;
    use crate::peer::PeerRole;
    use crate::proxy::tests::StubTransport;
    use crate::proxy::{create_transport, RtcToNet};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn test_config() -> Config {
        let mut config = Config::default();
        config.socks.bind_addr = "127.0.0.1:0".to_string();
        config.net.allow_non_unicast = true;
        config.peer.negotiation_timeout = 5;
        config.signaling.batch_interval_ms = 10;
        config
    }

    async fn started_pair(config: &Config) -> (SocksToRtc, RtcToNet, SocketAddr) {
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

        let (endpoint, started) = tokio::join!(socks.start(), net.start());
        started.unwrap();
        let addr = endpoint.unwrap().to_socket_addr().unwrap();
        (socks, net, addr)
    }

    #[tokio::test]
    async fn test_negotiation_failure_releases_listener() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let mut config = test_config();
        config.socks.bind_addr = addr.to_string();
        config.peer.negotiation_timeout = 1;

        let transport = create_transport(PeerRole::Offerer, &config).await.unwrap();
        let socks = SocksToRtc::new(&config, transport.clone()).unwrap();
        let err = socks.start().await.unwrap_err();
        assert!(format!("{:#}", err).contains("negotiation failed"));
        assert_eq!(socks.state(), ProxyState::Failed);
        assert_eq!(transport.once_closed().await, CloseKind::NeverConnected);

        // the listener that did come up was shut down again
        TcpListener::bind(addr).await.unwrap();
        assert!(socks.start().await.is_err());
    }

    #[tokio::test]
    async fn test_listen_failure_closes_transport() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = test_config();
        config.socks.bind_addr = held.local_addr().unwrap().to_string();

        let transport = StubTransport::new(PeerRole::Offerer, CloseKind::WeClosedIt);
        let socks = SocksToRtc::new(&config, transport.clone()).unwrap();
        let err = socks.start().await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to start SOCKS server"));
        assert_eq!(socks.state(), ProxyState::Failed);
        assert_eq!(transport.once_closed().await, CloseKind::WeClosedIt);
    }

    #[tokio::test]
    async fn test_bad_batches_rejected_while_running() {
        let (socks, net, addr) = started_pair(&test_config()).await;

        for bad in [
            "not json",
            r#"{"version":2,"messages":[]}"#,
            r#"{"messages":["x"]}"#,
        ] {
            let result = socks.handle_signal_from_peer(bad);
            assert!(matches!(result, Err(SocksRtcError::Signaling(_))), "{}", bad);
        }
        // a bad message inside a good batch is skipped
        let handled = socks
            .handle_signal_from_peer(r#"{"version":1,"messages":["garbage"]}"#)
            .unwrap();
        assert_eq!(handled, 0);
        assert_eq!(socks.state(), ProxyState::Started);
        assert_eq!(net.state(), ProxyState::Started);

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        socks.stop().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), net.once_stopped())
            .await
            .expect("network side did not stop");
    }

    #[tokio::test]
    async fn test_stop_reports_transport_failure() {
        let transport = StubTransport::new(PeerRole::Offerer, CloseKind::Unknown);
        let socks = SocksToRtc::new(&test_config(), transport).unwrap();
        socks.start().await.unwrap();

        let err = socks.stop().await.unwrap_err();
        assert!(format!("{:#}", err).contains("Peer transport failed"));
        assert_eq!(socks.state(), ProxyState::Stopped);
        // already stopped
        socks.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let mut config = test_config();
        config.signaling.batch_interval_ms = 0;
        let transport = StubTransport::new(PeerRole::Offerer, CloseKind::WeClosedIt);
        let err = SocksToRtc::new(&config, transport)
            .err()
            .expect("zero signaling interval accepted");
        assert!(format!("{:#}", err).contains("batch_interval_ms"));
    }
}
