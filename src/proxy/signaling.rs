//! Signaling batches
//!
//! Negotiation messages produced by the local peer transport are buffered
//! and flushed on a fixed interval as one [`SignalingBatch`]:
//!
//! ```json
//! {"version": 1, "messages": ["{\"type\":\"offer\",\"sdp\":\"...\"}"]}
//! ```
//!
//! The receiving side unpacks each batch and hands the messages, in order,
//! to its peer transport.

use crate::connection::HandlerQueue;
use crate::error::SocksRtcError;
use crate::peer::{PeerSignal, PeerTransport};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Only batch version understood
pub const SIGNALING_VERSION: u32 = 1;

/// Shortest flush interval a batcher will run with
pub const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(1);

/// Envelope for a group of negotiation messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingBatch {
    /// Envelope version
    pub version: u32,
    /// Opaque negotiation messages, oldest first
    pub messages: Vec<String>,
}

/// Serialize messages into a batch
pub fn pack_batch(messages: Vec<String>) -> Result<String, SocksRtcError> {
    let batch = SignalingBatch {
        version: SIGNALING_VERSION,
        messages,
    };
    Ok(serde_json::to_string(&batch)?)
}

/// Parse a batch, rejecting malformed JSON and unknown versions
pub fn unpack_batch(batch: &str) -> Result<Vec<String>, SocksRtcError> {
    let batch: SignalingBatch = serde_json::from_str(batch)
        .map_err(|e| SocksRtcError::Signaling(format!("malformed batch: {}", e)))?;
    if batch.version != SIGNALING_VERSION {
        return Err(SocksRtcError::Signaling(format!(
            "unsupported batch version {}",
            batch.version
        )));
    }
    Ok(batch.messages)
}

/// Buffers outgoing messages and emits them as periodic batches
pub struct SignalBatcher {
    pending: Mutex<Vec<String>>,
    batches: HandlerQueue<String>,
    interval: Duration,
    token: CancellationToken,
}

impl SignalBatcher {
    /// Create a batcher flushing every `interval`, at least
    /// [`MIN_FLUSH_INTERVAL`]
    pub fn new(interval: Duration) -> Arc<Self> {
        if interval < MIN_FLUSH_INTERVAL {
            warn!("Signaling interval {:?} raised to {:?}", interval, MIN_FLUSH_INTERVAL);
        }
        Arc::new(SignalBatcher {
            pending: Mutex::new(Vec::new()),
            batches: HandlerQueue::new(),
            interval: interval.max(MIN_FLUSH_INTERVAL),
            token: CancellationToken::new(),
        })
    }

    /// Buffer one message
    pub fn push(&self, message: String) {
        lock(&self.pending).push(message);
    }

    /// Emit buffered messages as one batch; false if there was nothing
    pub fn flush(&self) -> bool {
        let messages = std::mem::take(&mut *lock(&self.pending));
        if messages.is_empty() {
            return false;
        }

        let count = messages.len();
        match pack_batch(messages) {
            Ok(batch) => {
                trace!("Flushing signaling batch of {} messages", count);
                self.batches.handle(batch)
            }
            Err(e) => {
                warn!("Failed to pack signaling batch: {}", e);
                false
            }
        }
    }

    /// Serialized batches ready for the remote peer
    pub fn batches(&self) -> &HandlerQueue<String> {
        &self.batches
    }

    /// Start flushing on the interval until [`close`](Self::close)
    pub fn spawn(self: &Arc<Self>) {
        let batcher = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(batcher.interval);
            loop {
                tokio::select! {
                    _ = batcher.token.cancelled() => break,
                    _ = tick.tick() => {
                        batcher.flush();
                    }
                }
            }
        });
    }

    /// Flush what is left and stop
    pub fn close(&self) {
        if self.token.is_cancelled() {
            return;
        }
        self.token.cancel();
        self.flush();
        self.batches.close();
    }
}

impl std::fmt::Debug for SignalBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBatcher")
            .field("interval", &self.interval)
            .field("pending", &lock(&self.pending).len())
            .finish()
    }
}

/// Route the transport's outgoing signals into `batcher`
pub fn attach_signaling(transport: &dyn PeerTransport, batcher: &Arc<SignalBatcher>) {
    let batcher = batcher.clone();
    transport
        .signals()
        .set_handler(move |signal: PeerSignal| match serde_json::to_string(&signal) {
            Ok(message) => batcher.push(message),
            Err(e) => warn!("Failed to encode signal: {}", e),
        });
}

/// Deliver every message of a batch to the transport
///
/// A bad batch is rejected as a whole. A single message that cannot be
/// parsed or handled is logged and skipped. Returns the number of
/// messages handled.
pub fn deliver_batch(transport: &dyn PeerTransport, batch: &str) -> Result<usize, SocksRtcError> {
    let messages = unpack_batch(batch)?;
    let mut handled = 0;
    for message in messages {
        let signal: PeerSignal = match serde_json::from_str(&message) {
            Ok(signal) => signal,
            Err(e) => {
                warn!("Ignoring malformed signaling message: {}", e);
                continue;
            }
        };
        match transport.handle_signal(signal) {
            Ok(()) => handled += 1,
            Err(e) => warn!("Peer transport rejected signal: {}", e),
        }
    }
    debug!("Delivered {} signaling messages", handled);
    Ok(handled)
}

/// Signaling endpoint of one proxy half
///
/// Collects the transport's outgoing signals into batches and feeds
/// batches from the remote peer back into the transport.
pub struct PeerSignaling {
    transport: Arc<dyn PeerTransport>,
    batcher: Arc<SignalBatcher>,
}

impl PeerSignaling {
    /// Start collecting `transport`'s signals
    pub fn attach(transport: Arc<dyn PeerTransport>, interval: Duration) -> Self {
        let batcher = SignalBatcher::new(interval);
        attach_signaling(transport.as_ref(), &batcher);
        PeerSignaling { transport, batcher }
    }

    /// Begin flushing batches on the interval
    pub fn start(&self) {
        self.batcher.spawn();
    }

    /// Batches for the remote peer
    pub fn batches(&self) -> &HandlerQueue<String> {
        self.batcher.batches()
    }

    /// Handle a batch from the remote peer
    pub fn handle_batch(&self, batch: &str) -> Result<usize, SocksRtcError> {
        deliver_batch(self.transport.as_ref(), batch).map_err(|e| {
            warn!("Dropping signaling batch: {}", e);
            e
        })
    }

    /// Flush pending messages and stop batching
    pub fn close(&self) {
        self.batcher.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_and_unpack() {
        let batch = pack_batch(vec!["a".to_string(), "b".to_string()]).unwrap();
        assert_eq!(batch, r#"{"version":1,"messages":["a","b"]}"#);
        assert_eq!(unpack_batch(&batch).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_unpack_rejects_bad_batches() {
        for bad in [
            r#"{"version":2,"messages":[]}"#,
            r#"{"messages":["a"]}"#,
            r#"{"version":1}"#,
            "not json",
        ] {
            let err = unpack_batch(bad).unwrap_err();
            assert!(matches!(err, SocksRtcError::Signaling(_)), "{}", bad);
        }
    }

    #[test]
    fn test_flush_emits_one_batch_in_order() {
        let batcher = SignalBatcher::new(Duration::from_secs(60));
        assert!(!batcher.flush());

        batcher.push("first".to_string());
        batcher.push("second".to_string());
        assert!(batcher.flush());
        assert!(!batcher.flush());

        assert_eq!(batcher.batches().len(), 1);
        let mut task = tokio_test::task::spawn(batcher.batches().next());
        let batch = match task.poll() {
            std::task::Poll::Ready(Some(batch)) => batch,
            other => panic!("expected a batch, got {:?}", other),
        };
        assert_eq!(unpack_batch(&batch).unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_interval_flush_and_close() {
        let batcher = SignalBatcher::new(Duration::from_millis(10));
        batcher.spawn();
        batcher.push("tick".to_string());

        let batch = batcher.batches().next().await.unwrap();
        assert_eq!(unpack_batch(&batch).unwrap(), vec!["tick"]);

        batcher.push("last".to_string());
        batcher.close();
        let batch = batcher.batches().next().await.unwrap();
        assert_eq!(unpack_batch(&batch).unwrap(), vec!["last"]);
        assert!(batcher.batches().next().await.is_none());
    }

    #[tokio::test]
    async fn test_zero_interval_is_raised() {
        let batcher = SignalBatcher::new(Duration::ZERO);
        assert_eq!(batcher.interval, MIN_FLUSH_INTERVAL);

        batcher.spawn();
        batcher.push("soon".to_string());
        let batch = tokio::time::timeout(Duration::from_secs(1), batcher.batches().next())
            .await
            .expect("flush task is not running")
            .unwrap();
        assert_eq!(unpack_batch(&batch).unwrap(), vec!["soon"]);
        batcher.close();
    }
}
