//! Peer transport
//!
//! The two proxy halves talk over one negotiated peer transport carrying
//! many independent sub-channels. Negotiation is driven by opaque
//! [`PeerSignal`] messages that the application relays between the peers
//! by whatever means it has.

mod link;
mod mux;
mod reliable;

pub use link::{ChannelId, Frame, LinkPacket, MAX_FRAME_PAYLOAD};
pub use mux::MuxPeer;
pub use reliable::{ReceiveWindow, ReliabilityConfig, RetriesExhausted, SendWindow};

use crate::connection::{CloseKind, Connection, HandlerQueue};
use crate::error::SocksRtcError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Which side of the negotiation a transport plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Produces the offer
    Offerer,
    /// Waits for an offer and answers it
    Answerer,
}

/// Negotiation message exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PeerSignal {
    /// Session description from the offerer
    Offer {
        /// Line oriented description text
        sdp: String,
    },
    /// Session description from the answerer
    Answer {
        /// Line oriented description text
        sdp: String,
    },
}

impl PeerSignal {
    /// Description text carried by the signal
    pub fn sdp(&self) -> &str {
        match self {
            PeerSignal::Offer { sdp } | PeerSignal::Answer { sdp } => sdp,
        }
    }

    /// Same kind of signal carrying a different description
    pub fn with_sdp(&self, sdp: String) -> PeerSignal {
        match self {
            PeerSignal::Offer { .. } => PeerSignal::Offer { sdp },
            PeerSignal::Answer { .. } => PeerSignal::Answer { sdp },
        }
    }
}

/// A negotiated, multiplexed transport to one remote peer
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Negotiation role of this side
    fn role(&self) -> PeerRole;

    /// Run negotiation until the transport is usable
    ///
    /// Outgoing negotiation messages appear on [`signals`](Self::signals);
    /// messages from the remote peer go to
    /// [`handle_signal`](Self::handle_signal).
    async fn negotiate(&self) -> Result<(), SocksRtcError>;

    /// Open a new sub-channel to the remote peer
    ///
    /// Channel creation is serialized; data flow on each channel is not.
    async fn open_channel(&self) -> Result<Connection, SocksRtcError>;

    /// Sub-channels opened by the remote peer
    fn channels(&self) -> &HandlerQueue<Connection>;

    /// Outgoing negotiation messages
    fn signals(&self) -> &HandlerQueue<PeerSignal>;

    /// Deliver a negotiation message from the remote peer
    fn handle_signal(&self, signal: PeerSignal) -> Result<(), SocksRtcError>;

    /// Close the transport and every sub-channel; idempotent
    fn close(&self);

    /// Wait until the transport closes
    async fn once_closed(&self) -> CloseKind;
}
