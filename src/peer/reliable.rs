//! Reliable, ordered delivery over datagrams
//!
//! [`SendWindow`] numbers outgoing frames and retransmits them until a
//! cumulative acknowledgment covers them. [`ReceiveWindow`] reorders
//! incoming frames, drops duplicates and produces the acknowledgment to
//! send back. Neither does I/O; the caller drives both with a clock.
//!
//! Acknowledgments only cover frames the receiver has released to its
//! consumer, so a consumer that stops reading fills the sender's window
//! and stalls it.

use super::link::LinkPacket;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Retransmission settings
#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    /// Frames sent but not yet acknowledged before senders must wait
    pub window: usize,
    /// Initial and minimum retransmission timeout
    pub min_rto: Duration,
    /// Upper bound for the backed-off retransmission timeout
    pub max_rto: Duration,
    /// Retransmissions of one frame before the link is declared dead
    pub max_retries: u32,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            window: 256,
            min_rto: Duration::from_millis(250),
            max_rto: Duration::from_secs(2),
            max_retries: 12,
        }
    }
}

/// A frame's retransmissions ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetriesExhausted {
    /// Sequence number of the frame that was never acknowledged
    pub seq: u64,
}

struct PendingFrame {
    payload: Bytes,
    sent_at: Instant,
    rto: Duration,
    retries: u32,
}

/// Sender half of the reliability layer
pub struct SendWindow {
    config: ReliabilityConfig,
    next_seq: u64,
    pending: BTreeMap<u64, PendingFrame>,
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    heard_at: Option<Instant>,
}

impl SendWindow {
    /// Create an empty window
    pub fn new(config: ReliabilityConfig) -> Self {
        let rto = config.min_rto;
        Self {
            config,
            next_seq: 0,
            pending: BTreeMap::new(),
            srtt: None,
            rttvar: Duration::ZERO,
            rto,
            heard_at: None,
        }
    }

    /// Whether another frame may be sent now
    pub fn has_room(&self) -> bool {
        self.pending.len() < self.config.window
    }

    /// Frames awaiting acknowledgment
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Current base retransmission timeout
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Number a frame and return the packet to transmit
    pub fn push(&mut self, payload: Bytes, now: Instant) -> LinkPacket {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(
            seq,
            PendingFrame {
                payload: payload.clone(),
                sent_at: now,
                rto: self.rto,
                retries: 0,
            },
        );
        LinkPacket::Data { seq, payload }
    }

    /// Drop every frame below `next`; returns how many were released
    ///
    /// An acknowledgment that releases nothing still shows the peer is
    /// alive, which keeps [`due`](Self::due) from giving up on a peer
    /// whose consumer is merely slow.
    pub fn on_ack(&mut self, next: u64, now: Instant) -> usize {
        self.heard_at = Some(now);
        let remaining = self.pending.split_off(&next);
        let acked = std::mem::replace(&mut self.pending, remaining);

        for frame in acked.values() {
            // Karn: retransmitted frames give ambiguous samples
            if frame.retries == 0 {
                self.update_rtt(now.saturating_duration_since(frame.sent_at));
            }
        }
        acked.len()
    }

    fn update_rtt(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let delta = if srtt > sample { srtt - sample } else { sample - srtt };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + sample) / 8);
            }
        }
        let srtt = self.srtt.unwrap_or(sample);
        self.rto = (srtt + self.rttvar * 4).clamp(self.config.min_rto, self.config.max_rto);
    }

    /// Packets whose timeout expired, backing off each one
    ///
    /// With `limit_retries` unset frames are retransmitted indefinitely,
    /// which is how the link behaves until the peer is first heard from.
    /// A frame out of retries only fails the link once the peer has also
    /// been silent for `max_rto`.
    pub fn due(&mut self, now: Instant, limit_retries: bool) -> Result<Vec<LinkPacket>, RetriesExhausted> {
        let silent = match self.heard_at {
            Some(heard_at) => now.saturating_duration_since(heard_at) >= self.config.max_rto,
            None => true,
        };
        let mut due = Vec::new();
        for (&seq, frame) in self.pending.iter_mut() {
            if now.saturating_duration_since(frame.sent_at) < frame.rto {
                continue;
            }
            if limit_retries && silent && frame.retries >= self.config.max_retries {
                return Err(RetriesExhausted { seq });
            }
            frame.retries += 1;
            frame.sent_at = now;
            frame.rto = (frame.rto * 2).min(self.config.max_rto);
            due.push(LinkPacket::Data {
                seq,
                payload: frame.payload.clone(),
            });
        }
        Ok(due)
    }
}

/// Receiver half of the reliability layer
pub struct ReceiveWindow {
    window: usize,
    next_expected: u64,
    released: u64,
    reorder: BTreeMap<u64, Bytes>,
}

impl ReceiveWindow {
    /// Create a window holding up to `window` frames that have not been
    /// released yet
    pub fn new(window: usize) -> Self {
        Self {
            window,
            next_expected: 0,
            released: 0,
            reorder: BTreeMap::new(),
        }
    }

    /// Record a data frame; returns the frames now deliverable in order
    ///
    /// Frames further than `window` ahead of the last released one are
    /// dropped.
    pub fn accept(&mut self, seq: u64, payload: Bytes) -> Vec<Bytes> {
        if seq < self.next_expected || seq >= self.released + self.window as u64 {
            return Vec::new();
        }
        self.reorder.entry(seq).or_insert(payload);

        let mut ready = Vec::new();
        while let Some(payload) = self.reorder.remove(&self.next_expected) {
            ready.push(payload);
            self.next_expected += 1;
        }
        ready
    }

    /// Mark `count` delivered frames as taken by their consumer
    pub fn release(&mut self, count: usize) {
        self.released = (self.released + count as u64).min(self.next_expected);
    }

    /// Frames delivered in order but not released yet
    pub fn unreleased(&self) -> usize {
        (self.next_expected - self.released) as usize
    }

    /// Cumulative acknowledgment for everything released so far
    pub fn ack(&self) -> LinkPacket {
        LinkPacket::Ack {
            next: self.released,
        }
    }
}
