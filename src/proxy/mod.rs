//! Proxy halves
//!
//! [`SocksToRtc`] accepts SOCKS5 clients and forwards each one over its own
//! sub-channel of a peer transport. [`RtcToNet`] sits on the other end of
//! that transport, connects to the requested destinations and relays
//! bytes back. The two halves negotiate through [`SignalingBatch`]es that
//! the embedding application carries between them.

mod handshake;
mod policy;
mod rtc_to_net;
mod session;
mod signaling;
mod socks_to_rtc;

pub use handshake::{
    encode_message, read_message, ConnectRequest, ConnectResponse, MAX_HANDSHAKE_LEN, PROTOCOL_TCP,
};
pub use policy::is_unicast;
pub use rtc_to_net::RtcToNet;
pub use session::{ByteCounterSink, Direction, Session, SessionTable, TrafficEvent};
pub use signaling::{
    attach_signaling, deliver_batch, pack_batch, unpack_batch, PeerSignaling, SignalBatcher,
    SignalingBatch, SIGNALING_VERSION,
};
pub use socks_to_rtc::SocksToRtc;

use crate::churn::{ChurnRelay, ChurnSignaller, ChurnTransport};
use crate::config::{Config, PeerConfig};
use crate::connection::CloseKind;
use crate::error::SocksRtcError;
use crate::peer::{MuxPeer, PeerRole, PeerTransport};
use anyhow::{bail, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::info;

/// Lifecycle of a proxy half
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Created, not started
    Waiting,
    /// Listening and negotiating
    Starting,
    /// Relaying
    Started,
    /// Start failed; the half cannot be reused
    Failed,
    /// Shutting down
    Stopping,
    /// Shut down
    Stopped,
}

/// Shared state machine behind both halves
#[derive(Debug)]
pub(crate) struct Lifecycle {
    state: Mutex<ProxyState>,
    changes: watch::Sender<ProxyState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Lifecycle {
            state: Mutex::new(ProxyState::Waiting),
            changes: watch::channel(ProxyState::Waiting).0,
        }
    }

    /// Move from Waiting to Starting; a half can only be started once
    pub(crate) fn begin_start(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if *state != ProxyState::Waiting {
            bail!("Proxy cannot start from state {:?}", *state);
        }
        *state = ProxyState::Starting;
        self.changes.send_replace(ProxyState::Starting);
        Ok(())
    }

    pub(crate) fn set(&self, next: ProxyState) {
        let mut state = lock(&self.state);
        // a stop that began while starting wins
        if matches!(*state, ProxyState::Stopping | ProxyState::Stopped) && next != ProxyState::Stopped {
            return;
        }
        *state = next;
        self.changes.send_replace(next);
    }

    pub(crate) fn state(&self) -> ProxyState {
        *lock(&self.state)
    }

    pub(crate) fn is_stopping(&self) -> bool {
        matches!(self.state(), ProxyState::Stopping | ProxyState::Stopped)
    }

    /// True for the caller that should perform the stop
    pub(crate) fn begin_stop(&self) -> bool {
        let mut state = lock(&self.state);
        if matches!(*state, ProxyState::Stopping | ProxyState::Stopped) {
            return false;
        }
        *state = ProxyState::Stopping;
        self.changes.send_replace(ProxyState::Stopping);
        true
    }

    pub(crate) fn finish_stop(&self) {
        self.set(ProxyState::Stopped);
    }

    /// Wait for [`ProxyState::Stopped`]
    pub(crate) async fn stopped(&self) {
        let mut changes = self.changes.subscribe();
        // the sender lives in self, so this only ends on Stopped
        let _ = changes.wait_for(|state| *state == ProxyState::Stopped).await;
    }
}

/// How a stopping half reports the way its transport ended
///
/// Only a transport failure is an error; closing on request, a remote
/// close and a transport that never connected are not.
pub(crate) fn transport_outcome(kind: CloseKind) -> Result<()> {
    match kind {
        CloseKind::Unknown => bail!("Peer transport failed before it was closed"),
        CloseKind::WeClosedIt | CloseKind::RemotelyClosed | CloseKind::NeverConnected => Ok(()),
    }
}

fn loopback_like(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
    }
}

/// Build the peer transport for one half
///
/// Without churn this is a [`MuxPeer`] bound as configured. With churn the
/// mux binds to loopback behind a [`ChurnRelay`] whose obfuscated socket
/// takes the configured address and port, and negotiation is rewritten to
/// announce the relay.
pub async fn create_transport(
    role: PeerRole,
    config: &Config,
) -> Result<Arc<dyn PeerTransport>, SocksRtcError> {
    if !config.churn.enabled {
        let peer = MuxPeer::bind(role, &config.peer).await?;
        info!("Peer transport ({:?}) announcing {}", role, peer.candidate_addr());
        return Ok(Arc::new(peer));
    }

    let public_ip = config.churn.bind_addr.unwrap_or(config.peer.bind_addr);
    let relay = ChurnRelay::bind(
        SocketAddr::new(public_ip, config.peer.port),
        &config.churn.transformer,
    )
    .await?;

    let hidden = PeerConfig {
        bind_addr: loopback_like(public_ip),
        port: 0,
        advertised_addr: None,
        ..config.peer.clone()
    };
    let peer = MuxPeer::bind(role, &hidden).await?;

    let advertised = config.peer.advertised_addr.unwrap_or(public_ip);
    let signaller = ChurnSignaller::new(relay, advertised);
    info!(
        "Peer transport ({:?}) behind churn ({}), announcing {}",
        role,
        config.churn.transformer.name,
        signaller.public_endpoint()
    );
    Ok(Arc::new(ChurnTransport::new(Arc::new(peer), signaller)))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::TransformerConfig;
    use crate::connection::{Connection, ConnectionInfo, HandlerQueue};
    use crate::peer::PeerSignal;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::SinkExt;
    use std::io;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;
    use tokio_util::sync::PollSender;

    /// Transport that connects at once and ends with `close_kind` when
    /// closed; remote channels are injected through `channels()`
    pub(crate) struct StubTransport {
        role: PeerRole,
        close_kind: CloseKind,
        channels: HandlerQueue<Connection>,
        signals: HandlerQueue<PeerSignal>,
        closed: watch::Sender<Option<CloseKind>>,
    }

    impl StubTransport {
        pub(crate) fn new(role: PeerRole, close_kind: CloseKind) -> Arc<Self> {
            Arc::new(StubTransport {
                role,
                close_kind,
                channels: HandlerQueue::new(),
                signals: HandlerQueue::new(),
                closed: watch::channel(None).0,
            })
        }
    }

    #[async_trait]
    impl PeerTransport for StubTransport {
        fn role(&self) -> PeerRole {
            self.role
        }

        async fn negotiate(&self) -> Result<(), SocksRtcError> {
            Ok(())
        }

        async fn open_channel(&self) -> Result<Connection, SocksRtcError> {
            Err(SocksRtcError::Closed("stub transport".to_string()))
        }

        fn channels(&self) -> &HandlerQueue<Connection> {
            &self.channels
        }

        fn signals(&self) -> &HandlerQueue<PeerSignal> {
            &self.signals
        }

        fn handle_signal(&self, _signal: PeerSignal) -> Result<(), SocksRtcError> {
            Ok(())
        }

        fn close(&self) {
            let kind = self.close_kind;
            self.closed.send_if_modified(|closed| {
                if closed.is_none() {
                    *closed = Some(kind);
                    true
                } else {
                    false
                }
            });
            self.channels.close();
            self.signals.close();
        }

        async fn once_closed(&self) -> CloseKind {
            let mut rx = self.closed.subscribe();
            let kind = match rx.wait_for(|closed| closed.is_some()).await {
                Ok(kind) => *kind,
                Err(_) => None,
            };
            kind.unwrap_or(CloseKind::Unknown)
        }
    }

    /// A channel whose far end is driven by the test
    pub(crate) fn scripted_channel() -> (
        Connection,
        mpsc::UnboundedSender<io::Result<Bytes>>,
        mpsc::Receiver<Bytes>,
    ) {
        let (in_tx, in_rx) = mpsc::unbounded_channel::<io::Result<Bytes>>();
        let (out_tx, out_rx) = mpsc::channel::<Bytes>(16);
        let reader = UnboundedReceiverStream::new(in_rx);
        let writer =
            PollSender::new(out_tx).sink_map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe));
        let channel = Connection::from_parts(reader, writer, ConnectionInfo::default());
        (channel, in_tx, out_rx)
    }

    #[test]
    fn test_lifecycle_start_once() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), ProxyState::Waiting);
        assert!(lifecycle.begin_start().is_ok());
        assert_eq!(lifecycle.state(), ProxyState::Starting);
        assert!(lifecycle.begin_start().is_err());

        lifecycle.set(ProxyState::Started);
        assert!(!lifecycle.is_stopping());
        assert!(lifecycle.begin_stop());
        assert!(!lifecycle.begin_stop());
        assert!(lifecycle.is_stopping());

        lifecycle.set(ProxyState::Started);
        assert_eq!(lifecycle.state(), ProxyState::Stopping);
        lifecycle.finish_stop();
        assert_eq!(lifecycle.state(), ProxyState::Stopped);
    }

    #[test]
    fn test_transport_outcome() {
        assert!(transport_outcome(CloseKind::WeClosedIt).is_ok());
        assert!(transport_outcome(CloseKind::RemotelyClosed).is_ok());
        assert!(transport_outcome(CloseKind::NeverConnected).is_ok());
        assert!(transport_outcome(CloseKind::Unknown).is_err());
    }

    #[tokio::test]
    async fn test_lifecycle_stopped_wakes_waiters() {
        let lifecycle = Arc::new(Lifecycle::new());
        assert!(lifecycle.begin_stop());

        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.stopped().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        lifecycle.finish_stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        // already stopped
        lifecycle.stopped().await;
    }

    #[tokio::test]
    async fn test_create_plain_transport() {
        let transport = create_transport(PeerRole::Answerer, &Config::default())
            .await
            .unwrap();
        assert_eq!(transport.role(), PeerRole::Answerer);
        transport.close();
    }

    #[tokio::test]
    async fn test_create_churn_transport_announces_relay() {
        let mut config = Config::default();
        config.churn.enabled = true;
        config.churn.transformer = TransformerConfig::named("caesar").with_key(&[7]);

        let transport = create_transport(PeerRole::Offerer, &config).await.unwrap();
        let negotiating = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.negotiate().await })
        };

        let offer = transport.signals().next().await.unwrap();
        assert!(matches!(offer, PeerSignal::Offer { .. }));
        assert_eq!(crate::churn::candidate_lines(offer.sdp()).count(), 1);

        transport.close();
        assert!(negotiating.await.unwrap().is_err());
    }
}
