//! Bidirectional byte-stream endpoint
//!
//! A [`Connection`] wraps a reader stream and a writer sink (a TCP socket
//! or a multiplexed sub-channel) behind bounded inbound and outbound
//! queues, with an explicit lifecycle:
//!
//! ```text
//! CONNECTING -> CONNECTED -> CLOSED
//!      |             |
//!      +-> ERROR <---+
//! ```
//!
//! Transitions are monotonic. Closing discards any outbound data that has
//! not reached the writer yet; inbound data already received stays
//! readable until drained.

use super::queue::HandlerQueue;
use super::socket::SocketOpts;
use crate::error::SocksRtcError;
use crate::socks::Endpoint;
use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt, TryStreamExt};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Chunks buffered between the reader and the consumer
const INBOUND_QUEUE_CAPACITY: usize = 64;

/// Chunks buffered between `send` and the writer
const OUTBOUND_QUEUE_CAPACITY: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the underlying transport
    Connecting,
    /// Data may flow
    Connected,
    /// Closed by either side
    Closed,
    /// Failed to connect or failed with an I/O error
    Error,
}

/// Why a connection closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// `close()` was called locally
    WeClosedIt,
    /// The other end finished the stream
    RemotelyClosed,
    /// The connection was never established
    NeverConnected,
    /// The transport failed
    Unknown,
}

/// Addresses reported once a connection is established
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Local side, when known
    pub local: Option<Endpoint>,
    /// Remote side, when known
    pub remote: Option<Endpoint>,
}

impl ConnectionInfo {
    fn from_tcp(stream: &TcpStream) -> Self {
        ConnectionInfo {
            local: stream.local_addr().ok().map(Endpoint::from),
            remote: stream.peer_addr().ok().map(Endpoint::from),
        }
    }
}

enum Outbound {
    Data(Bytes),
    Flush(oneshot::Sender<()>),
}

type ConnectResult = Result<ConnectionInfo, (io::ErrorKind, String)>;

struct Shared {
    id: u64,
    state: watch::Sender<ConnectionState>,
    connected: watch::Sender<Option<ConnectResult>>,
    closed: watch::Sender<Option<CloseKind>>,
    inbound: HandlerQueue<Bytes>,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    token: CancellationToken,
}

/// A single bidirectional byte stream
///
/// Cloning yields another handle to the same connection. Background tasks
/// keep the connection alive until it is closed by either side.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        Connection {
            shared: Arc::new(Shared {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                state: watch::channel(ConnectionState::Connecting).0,
                connected: watch::channel(None).0,
                closed: watch::channel(None).0,
                inbound: HandlerQueue::bounded(INBOUND_QUEUE_CAPACITY),
                outbound: Mutex::new(Some(tx)),
                outbound_rx: Mutex::new(Some(rx)),
                token: CancellationToken::new(),
            }),
        }
    }

    /// Wrap an established reader/writer pair
    pub fn from_parts<R, W>(reader: R, writer: W, info: ConnectionInfo) -> Self
    where
        R: Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static,
        W: Sink<Bytes, Error = io::Error> + Send + Unpin + 'static,
    {
        let conn = Connection::new();
        conn.attach(reader, writer, info);
        conn
    }

    /// Wrap an accepted or connected TCP stream
    pub fn from_tcp(stream: TcpStream, opts: &SocketOpts) -> Self {
        let conn = Connection::new();
        conn.attach_tcp(stream, opts);
        conn
    }

    /// Start connecting to the first reachable address
    ///
    /// Returns immediately in the CONNECTING state; observe the outcome
    /// with [`once_connected`](Self::once_connected).
    pub fn dial(addrs: Vec<SocketAddr>, connect_timeout: Duration, opts: SocketOpts) -> Self {
        let conn = Connection::new();
        let dialer = conn.clone();
        tokio::spawn(async move {
            let token = dialer.shared.token.clone();
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = connect_any(&addrs, connect_timeout) => result,
            };
            match result {
                Ok(stream) => dialer.attach_tcp(stream, &opts),
                Err(e) => dialer.fail(e),
            }
        });
        conn
    }

    fn attach_tcp(&self, stream: TcpStream, opts: &SocketOpts) {
        if let Err(e) = opts.apply(&stream) {
            debug!("Connection {}: failed to set socket options: {}", self.id(), e);
        }
        let info = ConnectionInfo::from_tcp(&stream);
        let (read_half, write_half) = stream.into_split();
        let reader = FramedRead::new(read_half, BytesCodec::new()).map_ok(BytesMut::freeze);
        let writer = FramedWrite::new(write_half, BytesCodec::new());
        self.attach(reader, writer, info);
    }

    fn attach<R, W>(&self, reader: R, writer: W, info: ConnectionInfo)
    where
        R: Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static,
        W: Sink<Bytes, Error = io::Error> + Send + Unpin + 'static,
    {
        let rx = lock(&self.shared.outbound_rx).take();
        let Some(rx) = rx else {
            // closed while connecting
            return;
        };

        let advanced = self.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
        if !advanced {
            return;
        }

        trace!(
            "Connection {} connected: local={:?} remote={:?}",
            self.id(),
            info.local,
            info.remote
        );
        self.shared.connected.send_replace(Some(Ok(info)));

        tokio::spawn(self.clone().read_loop(reader));
        tokio::spawn(self.clone().write_loop(writer, rx));
    }

    fn fail(&self, err: io::Error) {
        debug!("Connection {} failed to connect: {}", self.id(), err);
        self.shared.connected.send_if_modified(|connected| {
            if connected.is_none() {
                *connected = Some(Err((err.kind(), err.to_string())));
                true
            } else {
                false
            }
        });
        self.finish(CloseKind::NeverConnected);
    }

    fn finish(&self, kind: CloseKind) {
        let first = self.shared.closed.send_if_modified(|closed| {
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

        let terminal = match kind {
            CloseKind::WeClosedIt | CloseKind::RemotelyClosed => ConnectionState::Closed,
            CloseKind::NeverConnected | CloseKind::Unknown => ConnectionState::Error,
        };
        self.shared.state.send_if_modified(|state| match state {
            ConnectionState::Closed | ConnectionState::Error => false,
            _ => {
                *state = terminal;
                true
            }
        });
        self.shared.connected.send_if_modified(|connected| {
            if connected.is_none() {
                *connected = Some(Err((
                    io::ErrorKind::NotConnected,
                    "closed before connecting".to_string(),
                )));
                true
            } else {
                false
            }
        });

        self.shared.token.cancel();
        lock(&self.shared.outbound).take();
        lock(&self.shared.outbound_rx).take();
        self.shared.inbound.close();

        debug!("Connection {} closed: {:?}", self.id(), kind);
    }

    async fn read_loop<R>(self, mut reader: R)
    where
        R: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let token = self.shared.token.clone();
        loop {
            let item = tokio::select! {
                _ = token.cancelled() => break,
                item = reader.next() => item,
            };
            match item {
                Some(Ok(data)) => {
                    if data.is_empty() {
                        continue;
                    }
                    if !self.shared.inbound.push(data).await {
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!("Connection {} read error: {}", self.id(), e);
                    self.finish(CloseKind::Unknown);
                    break;
                }
                None => {
                    self.finish(CloseKind::RemotelyClosed);
                    break;
                }
            }
        }
    }

    async fn write_loop<W>(self, mut writer: W, mut rx: mpsc::Receiver<Outbound>)
    where
        W: Sink<Bytes, Error = io::Error> + Unpin,
    {
        let token = self.shared.token.clone();
        loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                item = rx.recv() => item,
            };
            let result = match item {
                Some(Outbound::Data(data)) => tokio::select! {
                    _ = token.cancelled() => break,
                    result = writer.send(data) => result,
                },
                Some(Outbound::Flush(done)) => writer.flush().await.map(|_| {
                    let _ = done.send(());
                }),
                None => {
                    let _ = writer.close().await;
                    break;
                }
            };
            if let Err(e) = result {
                debug!("Connection {} write error: {}", self.id(), e);
                self.finish(CloseKind::Unknown);
                break;
            }
        }
    }

    /// Process-unique id used in logs
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// True once closed or failed
    pub fn is_closed(&self) -> bool {
        self.shared.closed.borrow().is_some()
    }

    /// Wait until connected, or until connecting failed
    pub async fn once_connected(&self) -> io::Result<ConnectionInfo> {
        let mut rx = self.shared.connected.subscribe();
        let outcome = match rx.wait_for(|connected| connected.is_some()).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(info)) => Ok(info),
            Some(Err((kind, message))) => Err(io::Error::new(kind, message)),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "connection dropped")),
        }
    }

    /// Wait until the connection closes; resolves for every waiter
    pub async fn once_closed(&self) -> CloseKind {
        let mut rx = self.shared.closed.subscribe();
        let kind = match rx.wait_for(|closed| closed.is_some()).await {
            Ok(kind) => *kind,
            Err(_) => None,
        };
        kind.unwrap_or(CloseKind::Unknown)
    }

    /// Queue data for writing, waiting while the outbound queue is full
    pub async fn send(&self, data: Bytes) -> Result<(), SocksRtcError> {
        let tx = self.sender()?;
        tx.send(Outbound::Data(data))
            .await
            .map_err(|_| self.closed_error())
    }

    /// Wait until everything queued before this call has been written
    pub async fn flush(&self) -> Result<(), SocksRtcError> {
        let tx = self.sender()?;
        let (done_tx, done_rx) = oneshot::channel();
        tx.send(Outbound::Flush(done_tx))
            .await
            .map_err(|_| self.closed_error())?;
        done_rx.await.map_err(|_| self.closed_error())
    }

    /// Next inbound chunk; `None` once closed and drained
    pub async fn receive(&self) -> Option<Bytes> {
        self.shared.inbound.next().await
    }

    /// Inbound queue, for installing a handler
    pub fn received(&self) -> &HandlerQueue<Bytes> {
        &self.shared.inbound
    }

    /// Close the connection; idempotent
    pub fn close(&self) {
        self.finish(CloseKind::WeClosedIt);
    }

    fn sender(&self) -> Result<mpsc::Sender<Outbound>, SocksRtcError> {
        lock(&self.shared.outbound)
            .clone()
            .ok_or_else(|| self.closed_error())
    }

    fn closed_error(&self) -> SocksRtcError {
        SocksRtcError::Closed(format!("connection {}", self.id()))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn connect_any(addrs: &[SocketAddr], connect_timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "no address to connect to");
    for addr in addrs {
        match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                trace!("Connect to {} failed: {}", addr, e);
                last_err = e;
            }
            Err(_) => {
                last_err = io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                );
            }
        }
    }
    Err(last_err)
}
