//! Negotiation rewriting for churn
//!
//! With churn enabled the peers must reach each other through their
//! relays' obfuscated endpoints, never through the raw transport sockets.
//! [`ChurnSignaller`] rewrites the host candidate in every description
//! that passes through it:
//!
//! - outgoing: the local transport's candidate is remembered as the
//!   relay's local peer, all candidates are removed and one pointing at
//!   the relay's public endpoint is appended;
//! - incoming: the remote candidate becomes the pipe's remote, and the
//!   local transport is pointed at the relay's plain endpoint instead.
//!
//! [`ChurnTransport`] applies this to any [`PeerTransport`].

use super::candidate::{
    append_line, extract_endpoint_from_candidate_line, filter_candidates_from_sdp,
    first_host_candidate, set_candidate_line_endpoint,
};
use super::relay::ChurnRelay;
use crate::connection::{CloseKind, Connection, HandlerQueue};
use crate::error::SocksRtcError;
use crate::peer::{PeerRole, PeerSignal, PeerTransport};
use crate::socks::Endpoint;
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, warn};

/// Rewrites descriptions so traffic flows through a [`ChurnRelay`]
#[derive(Debug)]
pub struct ChurnSignaller {
    relay: ChurnRelay,
    advertised: IpAddr,
}

fn host_candidate(sdp: &str) -> Result<(&str, SocketAddr), SocksRtcError> {
    let line = first_host_candidate(sdp).ok_or_else(|| {
        SocksRtcError::InvalidCandidate("description has no host candidate".to_string())
    })?;
    let endpoint = extract_endpoint_from_candidate_line(line)?;
    let addr = endpoint.to_socket_addr().ok_or_else(|| {
        SocksRtcError::InvalidCandidate(format!("candidate address is not an IP: {}", endpoint))
    })?;
    Ok((line, addr))
}

fn replace_candidates(sdp: &str, line: &str, endpoint: SocketAddr) -> Result<String, SocksRtcError> {
    let rewritten = set_candidate_line_endpoint(line, &Endpoint::from(endpoint))?;
    Ok(append_line(&filter_candidates_from_sdp(sdp), &rewritten))
}

impl ChurnSignaller {
    /// Rewrite through `relay`, announcing `advertised` as the public IP
    pub fn new(relay: ChurnRelay, advertised: IpAddr) -> Self {
        ChurnSignaller { relay, advertised }
    }

    /// The relay traffic is redirected through
    pub fn relay(&self) -> &ChurnRelay {
        &self.relay
    }

    /// Endpoint announced to the remote peer
    pub fn public_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.advertised, self.relay.public_endpoint().port())
    }

    /// Rewrite a description produced by the local transport
    pub fn rewrite_outgoing(&self, signal: &PeerSignal) -> Result<PeerSignal, SocksRtcError> {
        let sdp = signal.sdp();
        let (line, raw) = host_candidate(sdp)?;
        self.relay.set_local_peer(raw);

        let public = self.public_endpoint();
        debug!("Churn: announcing {} instead of {}", public, raw);
        Ok(signal.with_sdp(replace_candidates(sdp, line, public)?))
    }

    /// Rewrite a description received from the remote peer
    pub fn rewrite_incoming(&self, signal: &PeerSignal) -> Result<PeerSignal, SocksRtcError> {
        let sdp = signal.sdp();
        let (line, remote) = host_candidate(sdp)?;
        self.relay.set_remote(remote);

        let plain = self.relay.plain_endpoint();
        debug!("Churn: remote {} reached through {}", remote, plain);
        Ok(signal.with_sdp(replace_candidates(sdp, line, plain)?))
    }
}

/// Peer transport whose datagrams travel through a churn relay
pub struct ChurnTransport {
    inner: Arc<dyn PeerTransport>,
    signaller: Arc<ChurnSignaller>,
    signals: Arc<HandlerQueue<PeerSignal>>,
}

impl ChurnTransport {
    /// Wrap `inner`, rewriting its negotiation through `signaller`
    pub fn new(inner: Arc<dyn PeerTransport>, signaller: ChurnSignaller) -> Self {
        let signaller = Arc::new(signaller);
        let signals = Arc::new(HandlerQueue::new());

        let rewriter = signaller.clone();
        let outgoing = signals.clone();
        inner.signals().set_handler(move |signal| match rewriter.rewrite_outgoing(&signal) {
            Ok(rewritten) => {
                outgoing.handle(rewritten);
            }
            Err(e) => warn!("Churn: dropping outgoing signal: {}", e),
        });

        ChurnTransport {
            inner,
            signaller,
            signals,
        }
    }

    /// The rewriting signaller
    pub fn signaller(&self) -> &ChurnSignaller {
        &self.signaller
    }
}

#[async_trait]
impl PeerTransport for ChurnTransport {
    fn role(&self) -> PeerRole {
        self.inner.role()
    }

    async fn negotiate(&self) -> Result<(), SocksRtcError> {
        self.inner.negotiate().await
    }

    async fn open_channel(&self) -> Result<Connection, SocksRtcError> {
        self.inner.open_channel().await
    }

    fn channels(&self) -> &HandlerQueue<Connection> {
        self.inner.channels()
    }

    fn signals(&self) -> &HandlerQueue<PeerSignal> {
        &self.signals
    }

    fn handle_signal(&self, signal: PeerSignal) -> Result<(), SocksRtcError> {
        let rewritten = self.signaller.rewrite_incoming(&signal)?;
        self.inner.handle_signal(rewritten)
    }

    fn close(&self) {
        self.inner.close();
        self.signaller.relay().close();
        self.signals.close();
    }

    async fn once_closed(&self) -> CloseKind {
        self.inner.once_closed().await
    }
}
