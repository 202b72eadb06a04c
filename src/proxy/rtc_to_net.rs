//! Network side of the proxy
//!
//! [`RtcToNet`] accepts sub-channels opened by the SOCKS side, reads the
//! requested destination, connects to it and relays bytes until either
//! end closes. Destinations outside public unicast space are refused
//! unless `net.allow_non_unicast` is set.

use super::handshake::{encode_message, read_message, ConnectRequest, ConnectResponse, PROTOCOL_TCP};
use super::policy::is_unicast;
use super::session::{ByteCounterSink, Session, SessionTable};
use super::signaling::PeerSignaling;
use super::{transport_outcome, Lifecycle, ProxyState};
use crate::config::Config;
use crate::connection::{Connection, HandlerQueue, SocketOpts};
use crate::error::{Socks5ReplyCode, SocksRtcError};
use crate::peer::PeerTransport;
use crate::socks::Endpoint;
use anyhow::{anyhow, Context, Result};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

struct Inner {
    allow_non_unicast: bool,
    connect_timeout: Duration,
    transport: Arc<dyn PeerTransport>,
    signaling: PeerSignaling,
    sessions: Arc<SessionTable>,
    bytes: Arc<ByteCounterSink>,
    lifecycle: Lifecycle,
}

/// Peer-facing half that makes the outbound connections
#[derive(Clone)]
pub struct RtcToNet {
    inner: Arc<Inner>,
}

impl RtcToNet {
    /// Create the network side; the transport's negotiation messages are
    /// collected from now on
    pub fn new(config: &Config, transport: Arc<dyn PeerTransport>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow!(e))
            .context("Invalid configuration")?;
        let signaling = PeerSignaling::attach(transport.clone(), config.signaling.batch_interval());
        if config.net.allow_non_unicast {
            warn!("Destinations outside public unicast space are allowed");
        }

        Ok(RtcToNet {
            inner: Arc::new(Inner {
                allow_non_unicast: config.net.allow_non_unicast,
                connect_timeout: config.net.connect_timeout(),
                transport,
                signaling,
                sessions: Arc::new(SessionTable::new()),
                bytes: Arc::new(ByteCounterSink::new()),
                lifecycle: Lifecycle::new(),
            }),
        })
    }

    /// Negotiate the peer transport and start serving its sub-channels
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        inner.lifecycle.begin_start()?;
        inner.signaling.start();

        if let Err(e) = inner.transport.negotiate().await {
            inner.transport.close();
            inner.signaling.close();
            inner.lifecycle.set(ProxyState::Failed);
            return Err(anyhow::Error::new(e).context("Peer transport negotiation failed"));
        }

        let handler = inner.clone();
        inner.transport.channels().set_handler(move |channel| {
            tokio::spawn(serve_channel(handler.clone(), channel));
        });
        inner.lifecycle.set(ProxyState::Started);

        let watcher = self.clone();
        tokio::spawn(async move {
            let kind = watcher.inner.transport.once_closed().await;
            if !watcher.inner.lifecycle.is_stopping() {
                warn!("Peer transport closed ({:?}), stopping network side", kind);
                if let Err(e) = watcher.stop().await {
                    warn!("Stop after transport loss failed: {:#}", e);
                }
            }
        });

        info!("Network side started");
        Ok(())
    }

    /// Close every session and the transport; idempotent
    ///
    /// Fails when the transport had already broken down rather than
    /// closing on request.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.lifecycle.begin_stop() {
            inner.lifecycle.stopped().await;
            return Ok(());
        }

        inner.signaling.close();
        inner.transport.channels().clear_handler();
        inner.sessions.close_all();
        inner.transport.close();
        let kind = inner.transport.once_closed().await;
        debug!("Peer transport finished: {:?}", kind);

        inner.lifecycle.finish_stop();
        info!("Network side stopped");
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

    /// Signaling batches to pass to the SOCKS side
    pub fn signals_for_peer(&self) -> &HandlerQueue<String> {
        self.inner.signaling.batches()
    }

    /// Handle a signaling batch from the SOCKS side
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

/// Answer the SOCKS side's request with a failure
async fn respond_failed(channel: &Connection, code: Socks5ReplyCode) {
    if let Ok(message) = encode_message(&ConnectResponse::failed(code)) {
        if channel.send(message).await.is_ok() {
            let _ = channel.flush().await;
        }
    }
    channel.close();
}

/// Resolve `destination`; every address must pass the destination policy
async fn candidate_addrs(
    destination: &Endpoint,
    allow_non_unicast: bool,
) -> Result<Vec<SocketAddr>, Socks5ReplyCode> {
    let addrs = destination.resolve().await.map_err(|e| {
        debug!("Failed to resolve {}: {}", destination, e);
        Socks5ReplyCode::HostUnreachable
    })?;
    if addrs.is_empty() {
        return Err(Socks5ReplyCode::HostUnreachable);
    }
    if allow_non_unicast {
        return Ok(addrs);
    }

    if let Some(denied) = addrs.iter().find(|a| !is_unicast(a.ip())) {
        debug!("{} resolves to non-unicast {}", destination, denied);
        return Err(Socks5ReplyCode::ConnectionNotAllowed);
    }
    Ok(addrs)
}

async fn serve_channel(inner: Arc<Inner>, channel: Connection) {
    let id = channel.id();
    if let Err(e) = connect_and_relay(&inner, channel.clone()).await {
        debug!("Channel {}: {}", id, e);
        channel.close();
    }
}

async fn connect_and_relay(inner: &Arc<Inner>, channel: Connection) -> Result<(), SocksRtcError> {
    let mut buf = BytesMut::new();
    let request: ConnectRequest = read_message(&channel, &mut buf).await?;
    if request.protocol != PROTOCOL_TCP {
        respond_failed(&channel, Socks5ReplyCode::CommandNotSupported).await;
        return Err(SocksRtcError::UnsupportedCommand(request.protocol));
    }

    let destination = request.endpoint();
    let addrs = match candidate_addrs(&destination, inner.allow_non_unicast).await {
        Ok(addrs) => addrs,
        Err(code) => {
            respond_failed(&channel, code).await;
            return Err(SocksRtcError::ConnectFailure(format!(
                "{} refused with {:?}",
                destination, code
            )));
        }
    };

    let outbound = Connection::dial(addrs, inner.connect_timeout, SocketOpts::default());
    let info = match outbound.once_connected().await {
        Ok(info) => info,
        Err(e) => {
            respond_failed(&channel, Socks5ReplyCode::from(&e)).await;
            return Err(SocksRtcError::ConnectFailure(format!("{}: {}", destination, e)));
        }
    };

    let bound = info.local.unwrap_or_else(Endpoint::unspecified);
    if let Err(e) = channel.send(encode_message(&ConnectResponse::connected(&bound))?).await {
        outbound.close();
        return Err(e);
    }
    if !buf.is_empty() {
        outbound.send(buf.split().freeze()).await?;
    }

    info!("Channel {} connected to {} from {}", channel.id(), destination, bound);
    Session::new(outbound, channel, &inner.sessions, &inner.bytes)
        .run()
        .await;
    Ok(())
}
