//! Multiplexed peer transport over UDP
//!
//! [`MuxPeer`] advertises a single host candidate, learns the remote
//! peer's candidate from its description and then exchanges reliable,
//! ordered frames with it. Each sub-channel is surfaced as a
//! [`Connection`].
//!
//! The offerer allocates odd channel ids and the answerer even ones, so
//! both sides may open channels without coordinating.
//!
//! Frames are handed to their channel one at a time and acknowledged
//! only once the channel has taken them. A channel whose reader stops
//! consuming holds up delivery for the whole link until it reads again
//! or closes.

use super::link::{ChannelId, Frame, LinkPacket, MAX_FRAME_PAYLOAD};
use super::reliable::{ReceiveWindow, ReliabilityConfig, SendWindow};
use super::{PeerRole, PeerSignal, PeerTransport};
use crate::churn::{extract_endpoint_from_candidate_line, first_host_candidate};
use crate::config::PeerConfig;
use crate::connection::{CloseKind, Connection, ConnectionInfo, HandlerQueue};
use crate::error::SocksRtcError;
use crate::socks::Endpoint;
use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, info, trace, warn};

/// How often unacknowledged frames are checked for retransmission
const RETRANSMIT_TICK: Duration = Duration::from_millis(50);

/// Chunks buffered between a channel's writer and the link
const CHANNEL_OUTBOUND_CAPACITY: usize = 32;

/// Frames buffered between the link and a channel's reader
const CHANNEL_INBOUND_CAPACITY: usize = 32;

/// Largest datagram read from the socket
const MAX_DATAGRAM_SIZE: usize = 65536;

/// Priority announced for the host candidate
const HOST_CANDIDATE_PRIORITY: u32 = 2_122_260_223;

struct LinkState {
    send: SendWindow,
    receive: ReceiveWindow,
    established: bool,
}

struct Inner {
    role: PeerRole,
    socket: UdpSocket,
    candidate: SocketAddr,
    ufrag: String,
    session_id: u64,
    remote: Mutex<Option<SocketAddr>>,
    link: Mutex<LinkState>,
    window_space: Notify,
    delivery: mpsc::Sender<Bytes>,
    channels: Mutex<HashMap<ChannelId, mpsc::Sender<io::Result<Bytes>>>>,
    next_channel: tokio::sync::Mutex<ChannelId>,
    incoming: HandlerQueue<Connection>,
    signals: HandlerQueue<PeerSignal>,
    offered: AtomicBool,
    hello_received: watch::Sender<bool>,
    closed: watch::Sender<Option<CloseKind>>,
    negotiation_timeout: Duration,
    token: CancellationToken,
}

/// UDP peer transport with reliable multiplexed sub-channels
#[derive(Clone)]
pub struct MuxPeer {
    inner: Arc<Inner>,
}

impl MuxPeer {
    /// Bind the transport's socket and start its background tasks
    pub async fn bind(role: PeerRole, config: &PeerConfig) -> Result<Self, SocksRtcError> {
        Self::bind_with(role, config, ReliabilityConfig::default()).await
    }

    /// Bind with explicit retransmission settings
    pub async fn bind_with(
        role: PeerRole,
        config: &PeerConfig,
        reliability: ReliabilityConfig,
    ) -> Result<Self, SocksRtcError> {
        let socket = UdpSocket::bind(SocketAddr::new(config.bind_addr, config.port)).await?;
        let local = socket.local_addr()?;
        let candidate = SocketAddr::new(config.candidate_addr(), local.port());

        let first_channel = match role {
            PeerRole::Offerer => 1,
            PeerRole::Answerer => 2,
        };
        let ufrag: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let (delivery, ready) = mpsc::channel(reliability.window.max(1));

        let inner = Arc::new(Inner {
            role,
            socket,
            candidate,
            ufrag,
            session_id: rand::random::<u32>() as u64,
            remote: Mutex::new(None),
            link: Mutex::new(LinkState {
                send: SendWindow::new(reliability.clone()),
                receive: ReceiveWindow::new(reliability.window),
                established: false,
            }),
            window_space: Notify::new(),
            delivery,
            channels: Mutex::new(HashMap::new()),
            next_channel: tokio::sync::Mutex::new(first_channel),
            incoming: HandlerQueue::new(),
            signals: HandlerQueue::new(),
            offered: AtomicBool::new(false),
            hello_received: watch::channel(false).0,
            closed: watch::channel(None).0,
            negotiation_timeout: config.negotiation_timeout(),
            token: CancellationToken::new(),
        });

        tokio::spawn(receive_loop(inner.clone()));
        tokio::spawn(deliver_loop(inner.clone(), ready));
        tokio::spawn(retransmit_loop(inner.clone()));

        debug!("Peer transport ({:?}) bound on {}, candidate {}", role, local, candidate);
        Ok(MuxPeer { inner })
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    /// Address announced in this side's host candidate
    pub fn candidate_addr(&self) -> SocketAddr {
        self.inner.candidate
    }

    /// Remote peer address, once learned from its description
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.remote)
    }

    /// This side's session description
    pub fn description(&self) -> String {
        self.inner.description()
    }
}

impl Inner {
    fn description(&self) -> String {
        let ip = self.candidate.ip();
        let family = match ip {
            IpAddr::V4(_) => "IP4",
            IpAddr::V6(_) => "IP6",
        };
        let port = self.candidate.port();
        [
            "v=0".to_string(),
            format!("o=- {} 1 IN {} {}", self.session_id, family, ip),
            "s=-".to_string(),
            "t=0 0".to_string(),
            format!("m=application {} UDP/DTLS/SCTP webrtc-datachannel", port),
            format!("c=IN {} {}", family, ip),
            format!("a=ice-ufrag:{}", self.ufrag),
            format!(
                "a=candidate:1 1 udp {} {} {} typ host generation 0",
                HOST_CANDIDATE_PRIORITY, ip, port
            ),
        ]
        .iter()
        .map(|line| format!("{}\r\n", line))
        .collect()
    }

    fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    fn set_remote_from(&self, sdp: &str) -> Result<SocketAddr, SocksRtcError> {
        let line = first_host_candidate(sdp).ok_or_else(|| {
            SocksRtcError::InvalidCandidate("description has no host candidate".to_string())
        })?;
        let endpoint = extract_endpoint_from_candidate_line(line)?;
        let remote = endpoint.to_socket_addr().ok_or_else(|| {
            SocksRtcError::InvalidCandidate(format!("candidate address is not an IP: {}", endpoint))
        })?;

        *lock(&self.remote) = Some(remote);
        debug!("Peer transport remote set to {}", remote);
        Ok(remote)
    }

    async fn transmit(&self, packet: &LinkPacket) {
        let remote = *lock(&self.remote);
        if let Some(remote) = remote {
            if let Err(e) = self.socket.send_to(&packet.encode(), remote).await {
                trace!("Peer transport send to {} failed: {}", remote, e);
            }
        }
    }

    /// Queue a frame for reliable delivery, waiting for window space
    async fn send_frame(&self, frame: Frame) -> Result<(), SocksRtcError> {
        let payload = frame.encode();
        loop {
            let notified = self.window_space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return Err(SocksRtcError::Closed("peer transport".to_string()));
            }
            let packet = {
                let mut link = lock(&self.link);
                if link.send.has_room() {
                    Some(link.send.push(payload.clone(), Instant::now()))
                } else {
                    None
                }
            };
            if let Some(packet) = packet {
                self.transmit(&packet).await;
                return Ok(());
            }

            notified.await;
        }
    }

    fn say_hello(self: &Arc<Self>) {
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.send_frame(Frame::Hello).await {
                debug!("Peer transport hello not sent: {}", e);
            }
        });
    }

    fn add_channel(self: &Arc<Self>, id: ChannelId) -> Connection {
        let (inbound_tx, inbound_rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_INBOUND_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(CHANNEL_OUTBOUND_CAPACITY);

        let reader = ReceiverStream::new(inbound_rx);
        let writer = PollSender::new(outbound_tx)
            .sink_map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer channel closed"));
        let info = ConnectionInfo {
            local: Some(Endpoint::from(self.candidate)),
            remote: (*lock(&self.remote)).map(Endpoint::from),
        };

        lock(&self.channels).insert(id, inbound_tx);
        tokio::spawn(forward_channel(self.clone(), id, outbound_rx));
        Connection::from_parts(reader, writer, info)
    }

    /// Act on one in-order frame, waiting while its channel is full
    async fn dispatch(self: &Arc<Self>, payload: Bytes) {
        let frame = match Frame::decode(&payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Peer transport dropping frame: {}", e);
                return;
            }
        };

        match frame {
            Frame::Hello => {
                if !self.hello_received.send_replace(true) {
                    info!("Peer transport ({:?}) connected", self.role);
                }
            }
            Frame::Open(id) => {
                trace!("Peer opened channel {}", id);
                let channel = self.add_channel(id);
                if !self.incoming.handle(channel.clone()) {
                    channel.close();
                }
            }
            Frame::Data(id, data) => {
                let tx = lock(&self.channels).get(&id).cloned();
                if let Some(tx) = tx {
                    if tx.send(Ok(data)).await.is_err() {
                        // reader dropped
                        lock(&self.channels).remove(&id);
                    }
                }
            }
            Frame::Close(id) => {
                trace!("Peer closed channel {}", id);
                lock(&self.channels).remove(&id);
            }
        }
    }

    fn shutdown(&self, kind: CloseKind) {
        let first = self.closed.send_if_modified(|closed| {
            if closed.is_none() {
                *closed = Some(kind);
                true
            } else {
                false
            }
        });
        if !first {
            return;
        }

        if kind == CloseKind::WeClosedIt {
            if let Some(remote) = *lock(&self.remote) {
                let _ = self.socket.try_send_to(&LinkPacket::Close.encode(), remote);
            }
        }

        self.token.cancel();
        for (_, tx) in lock(&self.channels).drain() {
            let _ = tx.try_send(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "peer transport closed",
            )));
        }
        self.incoming.close();
        self.signals.close();
        self.window_space.notify_waiters();

        match kind {
            CloseKind::WeClosedIt => info!("Peer transport closed"),
            other => warn!("Peer transport closed: {:?}", other),
        }
    }
}

#[async_trait]
impl PeerTransport for MuxPeer {
    fn role(&self) -> PeerRole {
        self.inner.role
    }

    async fn negotiate(&self) -> Result<(), SocksRtcError> {
        let inner = &self.inner;
        if inner.role == PeerRole::Offerer && !inner.offered.swap(true, Ordering::SeqCst) {
            inner.signals.handle(PeerSignal::Offer {
                sdp: inner.description(),
            });
        }

        let mut hello = inner.hello_received.subscribe();
        let mut closed = inner.closed.subscribe();
        let connected = async {
            tokio::select! {
                result = async { hello.wait_for(|received| *received).await.is_ok() } => result,
                _ = async { closed.wait_for(|closed| closed.is_some()).await.is_ok() } => false,
            }
        };

        match tokio::time::timeout(inner.negotiation_timeout, connected).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(SocksRtcError::TransportNegotiation(
                "transport closed during negotiation".to_string(),
            )),
            Err(_) => {
                inner.shutdown(CloseKind::NeverConnected);
                Err(SocksRtcError::TransportNegotiation(format!(
                    "no answer from peer within {:?}",
                    inner.negotiation_timeout
                )))
            }
        }
    }

    async fn open_channel(&self) -> Result<Connection, SocksRtcError> {
        let mut next = self.inner.next_channel.lock().await;
        if self.inner.is_closed() {
            return Err(SocksRtcError::Closed("peer transport".to_string()));
        }
        let id = *next;
        *next = next.wrapping_add(2);

        let channel = self.inner.add_channel(id);
        if let Err(e) = self.inner.send_frame(Frame::Open(id)).await {
            channel.close();
            return Err(e);
        }
        trace!("Opened channel {}", id);
        Ok(channel)
    }

    fn channels(&self) -> &HandlerQueue<Connection> {
        &self.inner.incoming
    }

    fn signals(&self) -> &HandlerQueue<PeerSignal> {
        &self.inner.signals
    }

    fn handle_signal(&self, signal: PeerSignal) -> Result<(), SocksRtcError> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(SocksRtcError::Closed("peer transport".to_string()));
        }

        match (&signal, inner.role) {
            (PeerSignal::Offer { sdp }, PeerRole::Answerer) => {
                inner.set_remote_from(sdp)?;
                inner.signals.handle(PeerSignal::Answer {
                    sdp: inner.description(),
                });
            }
            (PeerSignal::Answer { sdp }, PeerRole::Offerer) => {
                inner.set_remote_from(sdp)?;
            }
            _ => {
                return Err(SocksRtcError::Signaling(format!(
                    "{:?} cannot handle this signal: {:?}",
                    inner.role, signal
                )))
            }
        }

        inner.say_hello();
        Ok(())
    }

    fn close(&self) {
        self.inner.shutdown(CloseKind::WeClosedIt);
    }

    async fn once_closed(&self) -> CloseKind {
        let mut rx = self.inner.closed.subscribe();
        let kind = match rx.wait_for(|closed| closed.is_some()).await {
            Ok(kind) => *kind,
            Err(_) => None,
        };
        kind.unwrap_or(CloseKind::Unknown)
    }
}

impl std::fmt::Debug for MuxPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxPeer")
            .field("role", &self.inner.role)
            .field("candidate", &self.inner.candidate)
            .field("remote", &self.remote_addr())
            .finish()
    }
}

/// Move a channel's outgoing bytes onto the link, then announce its close
async fn forward_channel(inner: Arc<Inner>, id: ChannelId, mut outbound: mpsc::Receiver<Bytes>) {
    while let Some(mut data) = outbound.recv().await {
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(MAX_FRAME_PAYLOAD));
            if inner.send_frame(Frame::Data(id, chunk)).await.is_err() {
                return;
            }
        }
    }

    lock(&inner.channels).remove(&id);
    if !inner.is_closed() {
        let _ = inner.send_frame(Frame::Close(id)).await;
    }
}

async fn receive_loop(inner: Arc<Inner>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = tokio::select! {
            _ = inner.token.cancelled() => break,
            result = inner.socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    trace!("Peer transport receive error: {}", e);
                    continue;
                }
            },
        };

        if *lock(&inner.remote) != Some(from) {
            trace!("Peer transport dropping datagram from unexpected {}", from);
            continue;
        }

        let packet = match LinkPacket::decode(&buf[..len]) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Peer transport dropping datagram: {}", e);
                continue;
            }
        };

        match packet {
            LinkPacket::Data { seq, payload } => {
                let (ready, ack) = {
                    let mut link = lock(&inner.link);
                    link.established = true;
                    let ready = link.receive.accept(seq, payload);
                    (ready, link.receive.ack())
                };
                // unreleased frames never exceed the delivery queue's capacity
                for payload in ready {
                    if inner.delivery.try_send(payload).is_err() {
                        warn!("Peer transport delivery queue overflow");
                    }
                }
                inner.transmit(&ack).await;
            }
            LinkPacket::Ack { next } => {
                let released = {
                    let mut link = lock(&inner.link);
                    link.established = true;
                    link.send.on_ack(next, Instant::now())
                };
                if released > 0 {
                    inner.window_space.notify_waiters();
                }
            }
            LinkPacket::Close => {
                inner.shutdown(CloseKind::RemotelyClosed);
                break;
            }
        }
    }
}

/// Hand in-order frames to their channels, acknowledging each once taken
async fn deliver_loop(inner: Arc<Inner>, mut ready: mpsc::Receiver<Bytes>) {
    loop {
        let payload = tokio::select! {
            _ = inner.token.cancelled() => break,
            payload = ready.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        tokio::select! {
            _ = inner.token.cancelled() => break,
            _ = inner.dispatch(payload) => {}
        }

        let ack = {
            let mut link = lock(&inner.link);
            link.receive.release(1);
            link.receive.ack()
        };
        inner.transmit(&ack).await;
    }
}

async fn retransmit_loop(inner: Arc<Inner>) {
    let mut tick = tokio::time::interval(RETRANSMIT_TICK);
    loop {
        tokio::select! {
            _ = inner.token.cancelled() => break,
            _ = tick.tick() => {}
        }

        if lock(&inner.remote).is_none() {
            continue;
        }

        let due = {
            let mut link = lock(&inner.link);
            let limit_retries = link.established;
            link.send.due(Instant::now(), limit_retries)
        };
        match due {
            Ok(packets) => {
                for packet in packets {
                    inner.transmit(&packet).await;
                }
            }
            Err(exhausted) => {
                warn!("Peer link lost: frame {} never acknowledged", exhausted.seq);
                inner.shutdown(CloseKind::Unknown);
                break;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn negotiated_pair() -> (MuxPeer, MuxPeer) {
        negotiated_pair_with(ReliabilityConfig::default()).await
    }

    async fn negotiated_pair_with(reliability: ReliabilityConfig) -> (MuxPeer, MuxPeer) {
        let config = PeerConfig::default();
        let offerer = MuxPeer::bind_with(PeerRole::Offerer, &config, reliability.clone())
            .await
            .unwrap();
        let answerer = MuxPeer::bind_with(PeerRole::Answerer, &config, reliability)
            .await
            .unwrap();

        let (a, b) = (offerer.clone(), answerer.clone());
        let negotiation = tokio::spawn(async move { tokio::join!(a.negotiate(), b.negotiate()) });

        let offer = offerer.signals().next().await.unwrap();
        answerer.handle_signal(offer).unwrap();
        let answer = answerer.signals().next().await.unwrap();
        offerer.handle_signal(answer).unwrap();

        let (r1, r2) = negotiation.await.unwrap();
        r1.unwrap();
        r2.unwrap();
        (offerer, answerer)
    }

    #[tokio::test]
    async fn test_description_has_host_candidate() {
        let peer = MuxPeer::bind(PeerRole::Offerer, &PeerConfig::default())
            .await
            .unwrap();
        let sdp = peer.description();
        assert!(sdp.starts_with("v=0\r\n"));
        let line = first_host_candidate(&sdp).unwrap();
        let endpoint = extract_endpoint_from_candidate_line(line).unwrap();
        assert_eq!(endpoint.to_socket_addr(), Some(peer.candidate_addr()));
    }

    #[tokio::test]
    async fn test_negotiate_and_exchange_channel_data() {
        let (offerer, answerer) = negotiated_pair().await;
        assert_eq!(offerer.remote_addr(), Some(answerer.candidate_addr()));

        let ours = offerer.open_channel().await.unwrap();
        let theirs = answerer.channels().next().await.unwrap();

        ours.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(&theirs.receive().await.unwrap()[..], b"ping");

        let large = Bytes::from(vec![7u8; MAX_FRAME_PAYLOAD * 3 + 10]);
        theirs.send(large.clone()).await.unwrap();
        let mut got = Vec::new();
        while got.len() < large.len() {
            got.extend_from_slice(&ours.receive().await.unwrap());
        }
        assert_eq!(got, large);

        ours.close();
        assert_eq!(theirs.once_closed().await, CloseKind::RemotelyClosed);
    }

    #[tokio::test]
    async fn test_channel_ids_by_role() {
        let (offerer, answerer) = negotiated_pair().await;

        offerer.open_channel().await.unwrap();
        offerer.open_channel().await.unwrap();
        answerer.open_channel().await.unwrap();

        assert_eq!(*offerer.inner.next_channel.lock().await, 5);
        assert_eq!(*answerer.inner.next_channel.lock().await, 4);

        answerer.channels().next().await.unwrap();
        answerer.channels().next().await.unwrap();
        offerer.channels().next().await.unwrap();
        let mut ids: Vec<ChannelId> = lock(&offerer.inner.channels).keys().copied().collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_wrong_signal_for_role() {
        let peer = MuxPeer::bind(PeerRole::Offerer, &PeerConfig::default())
            .await
            .unwrap();
        let err = peer
            .handle_signal(PeerSignal::Offer {
                sdp: peer.description(),
            })
            .unwrap_err();
        assert!(matches!(err, SocksRtcError::Signaling(_)));

        let answerer = MuxPeer::bind(PeerRole::Answerer, &PeerConfig::default())
            .await
            .unwrap();
        let err = answerer
            .handle_signal(PeerSignal::Offer {
                sdp: "v=0\r\n".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, SocksRtcError::InvalidCandidate(_)));
    }

    #[tokio::test]
    async fn test_negotiation_times_out() {
        let config = PeerConfig {
            negotiation_timeout: 1,
            ..Default::default()
        };
        let peer = MuxPeer::bind(PeerRole::Offerer, &config).await.unwrap();
        let err = peer.negotiate().await.unwrap_err();
        assert!(matches!(err, SocksRtcError::TransportNegotiation(_)));
        assert_eq!(peer.once_closed().await, CloseKind::NeverConnected);
    }

    #[tokio::test]
    async fn test_close_propagates_to_peer_and_channels() {
        let (offerer, answerer) = negotiated_pair().await;
        let ours = offerer.open_channel().await.unwrap();
        let theirs = answerer.channels().next().await.unwrap();

        offerer.close();
        assert_eq!(offerer.once_closed().await, CloseKind::WeClosedIt);
        assert_eq!(ours.once_closed().await, CloseKind::Unknown);
        assert_eq!(answerer.once_closed().await, CloseKind::RemotelyClosed);
        assert_eq!(theirs.once_closed().await, CloseKind::Unknown);
        assert!(offerer.open_channel().await.is_err());
    }

    #[tokio::test]
    async fn test_unread_channel_stalls_sender_window() {
        const CHUNK: usize = 4096;
        const CHUNKS: usize = 512;
        let reliability = ReliabilityConfig {
            window: 8,
            ..Default::default()
        };
        let (offerer, answerer) = negotiated_pair_with(reliability).await;
        let ours = offerer.open_channel().await.unwrap();
        let theirs = answerer.channels().next().await.unwrap();

        let writer = ours.clone();
        let writing = tokio::spawn(async move {
            for i in 0..CHUNKS {
                writer.send(Bytes::from(vec![i as u8; CHUNK])).await.unwrap();
            }
        });

        // nobody reads `theirs`, so the writer must stall
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!writing.is_finished());
        assert!(lock(&offerer.inner.link).send.in_flight() <= 8);
        assert!(lock(&answerer.inner.link).receive.unreleased() <= 8);

        let mut received = 0;
        while received < CHUNK * CHUNKS {
            let data = tokio::time::timeout(Duration::from_secs(10), theirs.receive())
                .await
                .expect("stalled channel did not resume")
                .unwrap();
            received += data.len();
        }
        tokio::time::timeout(Duration::from_secs(10), writing)
            .await
            .expect("writer still blocked")
            .unwrap();
        assert_eq!(received, CHUNK * CHUNKS);
        assert!(!offerer.inner.is_closed());
    }

    #[tokio::test]
    async fn test_dropped_reader_does_not_stall_link() {
        let (offerer, answerer) = negotiated_pair().await;
        let first = offerer.open_channel().await.unwrap();
        let dropped = answerer.channels().next().await.unwrap();
        dropped.close();

        for _ in 0..CHANNEL_INBOUND_CAPACITY * 4 {
            if first.send(Bytes::from_static(b"ignored")).await.is_err() {
                break;
            }
        }

        let second = offerer.open_channel().await.unwrap();
        let theirs = answerer.channels().next().await.unwrap();
        second.send(Bytes::from_static(b"still flowing")).await.unwrap();
        let data = tokio::time::timeout(Duration::from_secs(5), theirs.receive())
            .await
            .expect("link stalled behind a closed channel")
            .unwrap();
        assert_eq!(&data[..], b"still flowing");
    }
}
