//! Relay sessions and byte accounting
//!
//! A [`Session`] pairs one local connection with one peer sub-channel and
//! pumps bytes both ways until either side closes. Every relayed chunk is
//! counted in the session's totals and in the shared [`ByteCounterSink`].
//!
//! Half-close is not relayed. When one side finishes its stream, the data
//! it sent is flushed to the other side and then both are closed, so a
//! client that shuts down its write half gets no further response.

use crate::connection::Connection;
use crate::counter::Counter;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Traffic events retained for slow subscribers
const EVENT_CAPACITY: usize = 1024;

/// Direction of a relayed chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Written to the peer sub-channel
    Sent,
    /// Read from the peer sub-channel
    Received,
}

/// One relayed chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficEvent {
    /// Session the bytes belong to
    pub session: u64,
    /// Which way they went
    pub direction: Direction,
    /// Number of bytes
    pub bytes: u64,
}

/// Totals of every session plus a stream of per-chunk events
#[derive(Debug)]
pub struct ByteCounterSink {
    sent: AtomicU64,
    received: AtomicU64,
    events: broadcast::Sender<TrafficEvent>,
}

impl Default for ByteCounterSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteCounterSink {
    /// Create an empty sink
    pub fn new() -> Self {
        ByteCounterSink {
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            events: broadcast::channel(EVENT_CAPACITY).0,
        }
    }

    /// Account for a relayed chunk
    pub fn record(&self, session: u64, direction: Direction, bytes: u64) {
        match direction {
            Direction::Sent => self.sent.fetch_add(bytes, Ordering::Relaxed),
            Direction::Received => self.received.fetch_add(bytes, Ordering::Relaxed),
        };
        // no subscribers is fine
        let _ = self.events.send(TrafficEvent {
            session,
            direction,
            bytes,
        });
    }

    /// Bytes written to the peer so far
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Bytes read from the peer so far
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Subscribe to per-chunk events
    pub fn subscribe(&self) -> broadcast::Receiver<TrafficEvent> {
        self.events.subscribe()
    }
}

/// Open sessions, keyed by session id
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<u64, (Connection, Connection)>>,
}

impl SessionTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, id: u64, local: Connection, channel: Connection) {
        lock(&self.sessions).insert(id, (local, channel));
    }

    fn remove(&self, id: u64) {
        lock(&self.sessions).remove(&id);
    }

    /// Number of sessions still relaying
    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// True when no session is open
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close both connections of every session
    pub fn close_all(&self) {
        let sessions: Vec<(Connection, Connection)> = lock(&self.sessions).values().cloned().collect();
        for (local, channel) in sessions {
            local.close();
            channel.close();
        }
    }
}

#[derive(Debug, Default)]
struct Totals {
    sent: AtomicU64,
    received: AtomicU64,
}

/// A local connection relayed over one sub-channel
pub struct Session {
    id: u64,
    local: Connection,
    channel: Connection,
    totals: Arc<Totals>,
    counter: Counter,
    sink: Arc<ByteCounterSink>,
}

impl Session {
    /// Register a session; it starts relaying when [`run`](Self::run) is
    /// awaited and leaves `table` once finished
    pub fn new(
        local: Connection,
        channel: Connection,
        table: &Arc<SessionTable>,
        sink: &Arc<ByteCounterSink>,
    ) -> Self {
        let id = local.id();
        let totals = Arc::new(Totals::default());

        table.insert(id, local.clone(), channel.clone());
        let table = table.clone();
        let final_totals = totals.clone();
        let counter = Counter::new(move || {
            table.remove(id);
            info!(
                "Session {} finished: sent {} bytes, received {} bytes",
                id,
                final_totals.sent.load(Ordering::Relaxed),
                final_totals.received.load(Ordering::Relaxed)
            );
        });

        Session {
            id,
            local,
            channel,
            totals,
            counter,
            sink: sink.clone(),
        }
    }

    /// Session id, shared with the local connection
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Relay until both directions finish
    ///
    /// The first end of stream from either side finishes both directions.
    pub async fn run(self) {
        debug!(
            "Session {}: relaying local {} over channel {}",
            self.id,
            self.local.id(),
            self.channel.id()
        );
        tokio::join!(
            self.pump(&self.local, &self.channel, Direction::Sent),
            self.pump(&self.channel, &self.local, Direction::Received),
        );
        self.counter.discard();
    }

    async fn pump(&self, from: &Connection, to: &Connection, direction: Direction) {
        while let Some(data) = from.receive().await {
            let _in_flight = self.counter.enter();
            let len = data.len() as u64;
            if let Err(e) = to.send(data).await {
                trace!("Session {}: {:?} side gone: {}", self.id, direction, e);
                from.close();
                return;
            }
            let total = match direction {
                Direction::Sent => &self.totals.sent,
                Direction::Received => &self.totals.received,
            };
            total.fetch_add(len, Ordering::Relaxed);
            self.sink.record(self.id, direction, len);
        }

        // source finished; deliver what is queued, then close the other side
        let _ = to.flush().await;
        to.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{CloseKind, SocketOpts};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn tcp_pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Connection::from_tcp(server, &SocketOpts::default()), client)
    }

    #[test]
    fn test_sink_totals_and_events() {
        let sink = ByteCounterSink::new();
        let mut events = sink.subscribe();
        sink.record(1, Direction::Sent, 10);
        sink.record(1, Direction::Received, 4);
        sink.record(2, Direction::Sent, 5);

        assert_eq!(sink.sent(), 15);
        assert_eq!(sink.received(), 4);
        assert_eq!(
            events.try_recv().unwrap(),
            TrafficEvent {
                session: 1,
                direction: Direction::Sent,
                bytes: 10
            }
        );
    }

    #[tokio::test]
    async fn test_session_relays_and_counts() {
        let (local, mut client) = tcp_pair().await;
        let (channel, mut far) = tcp_pair().await;
        let table = Arc::new(SessionTable::new());
        let sink = Arc::new(ByteCounterSink::new());

        let session = Session::new(local.clone(), channel.clone(), &table, &sink);
        assert_eq!(table.len(), 1);
        let running = tokio::spawn(session.run());

        client.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        far.write_all(b"response!").await.unwrap();
        let mut buf = [0u8; 9];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response!");

        drop(client);
        running.await.unwrap();
        assert_eq!(local.once_closed().await, CloseKind::RemotelyClosed);
        assert_eq!(channel.once_closed().await, CloseKind::WeClosedIt);
        assert_eq!(sink.sent(), 7);
        assert_eq!(sink.received(), 9);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_close_all_ends_sessions() {
        let (local, _client) = tcp_pair().await;
        let (channel, _far) = tcp_pair().await;
        let table = Arc::new(SessionTable::new());
        let sink = Arc::new(ByteCounterSink::new());

        let running = tokio::spawn(Session::new(local, channel, &table, &sink).run());
        table.close_all();
        running.await.unwrap();
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_data_before_remote_close_is_delivered() {
        let (local, mut client) = tcp_pair().await;
        let (channel, mut far) = tcp_pair().await;
        let table = Arc::new(SessionTable::new());
        let sink = Arc::new(ByteCounterSink::new());
        let running = tokio::spawn(Session::new(local, channel, &table, &sink).run());

        far.write_all(b"last words").await.unwrap();
        drop(far);

        let mut got = Vec::new();
        client.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"last words");
        running.await.unwrap();
    }

    #[tokio::test]
    async fn test_half_close_ends_session() {
        let (local, mut client) = tcp_pair().await;
        let (channel, mut far) = tcp_pair().await;
        let table = Arc::new(SessionTable::new());
        let sink = Arc::new(ByteCounterSink::new());
        let running = tokio::spawn(Session::new(local, channel, &table, &sink).run());

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut got = Vec::new();
        far.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"request");
        running.await.unwrap();
        assert!(table.is_empty());

        // the far side can no longer answer
        let _ = far.write_all(b"too late").await;
        let mut rest = Vec::new();
        let _ = client.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
    }
}
