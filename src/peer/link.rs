//! Wire formats of the peer link
//!
//! Every datagram between two peers is a link packet:
//!
//! ```text
//! +--------+-----------+-----------+
//! | kind 1 |  seq 8    |  payload  |
//! +--------+-----------+-----------+
//! ```
//!
//! Reliable `Data` packets carry one mux frame each:
//!
//! ```text
//! +--------+--------------+-----------+
//! | type 1 |  channel 4   |  payload  |
//! +--------+--------------+-----------+
//! ```

use crate::error::SocksRtcError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Sub-channel identifier
pub type ChannelId = u32;

/// Link packet header size
pub const LINK_HEADER_SIZE: usize = 9;

/// Mux frame header size
pub const FRAME_HEADER_SIZE: usize = 5;

/// Largest channel payload per frame, keeping datagrams under 1200 bytes
/// after the largest transformer overhead
pub const MAX_FRAME_PAYLOAD: usize = 1100;

const LINK_DATA: u8 = 0x01;
const LINK_ACK: u8 = 0x02;
const LINK_CLOSE: u8 = 0x03;

const FRAME_HELLO: u8 = 0x01;
const FRAME_OPEN: u8 = 0x02;
const FRAME_DATA: u8 = 0x03;
const FRAME_CLOSE: u8 = 0x04;

fn invalid(message: String) -> SocksRtcError {
    SocksRtcError::Serialization(message)
}

/// One datagram on the peer link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkPacket {
    /// Reliable, ordered payload
    Data {
        /// Sequence number
        seq: u64,
        /// Encoded mux frame
        payload: Bytes,
    },
    /// Cumulative acknowledgment: every sequence below `next` arrived
    Ack {
        /// Next sequence number expected
        next: u64,
    },
    /// The sender is shutting the link down
    Close,
}

impl LinkPacket {
    /// Encode for transmission
    pub fn encode(&self) -> Bytes {
        let (kind, seq, payload): (u8, u64, &[u8]) = match self {
            LinkPacket::Data { seq, payload } => (LINK_DATA, *seq, payload),
            LinkPacket::Ack { next } => (LINK_ACK, *next, &[]),
            LinkPacket::Close => (LINK_CLOSE, 0, &[]),
        };
        let mut buf = BytesMut::with_capacity(LINK_HEADER_SIZE + payload.len());
        buf.put_u8(kind);
        buf.put_u64(seq);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Decode a received datagram
    pub fn decode(data: &[u8]) -> Result<Self, SocksRtcError> {
        if data.len() < LINK_HEADER_SIZE {
            return Err(invalid(format!("link packet too short: {} bytes", data.len())));
        }

        let mut buf = data;
        let kind = buf.get_u8();
        let seq = buf.get_u64();
        match kind {
            LINK_DATA => Ok(LinkPacket::Data {
                seq,
                payload: Bytes::copy_from_slice(buf),
            }),
            LINK_ACK => Ok(LinkPacket::Ack { next: seq }),
            LINK_CLOSE => Ok(LinkPacket::Close),
            other => Err(invalid(format!("unknown link packet kind: 0x{:02x}", other))),
        }
    }
}

/// Multiplexing frame carried in a `Data` link packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Sent once by each side after learning the other's address
    Hello,
    /// Sender opened a new sub-channel
    Open(ChannelId),
    /// Bytes for a sub-channel
    Data(ChannelId, Bytes),
    /// Sender finished a sub-channel
    Close(ChannelId),
}

impl Frame {
    /// Encode the frame
    pub fn encode(&self) -> Bytes {
        let (kind, channel, payload): (u8, ChannelId, &[u8]) = match self {
            Frame::Hello => (FRAME_HELLO, 0, &[]),
            Frame::Open(id) => (FRAME_OPEN, *id, &[]),
            Frame::Data(id, data) => (FRAME_DATA, *id, data),
            Frame::Close(id) => (FRAME_CLOSE, *id, &[]),
        };
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_u8(kind);
        buf.put_u32(channel);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Decode a frame
    pub fn decode(data: &Bytes) -> Result<Self, SocksRtcError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(invalid(format!("frame too short: {} bytes", data.len())));
        }

        let kind = data[0];
        let channel = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        match kind {
            FRAME_HELLO => Ok(Frame::Hello),
            FRAME_OPEN => Ok(Frame::Open(channel)),
            FRAME_DATA => Ok(Frame::Data(channel, data.slice(FRAME_HEADER_SIZE..))),
            FRAME_CLOSE => Ok(Frame::Close(channel)),
            other => Err(invalid(format!("unknown frame type: 0x{:02x}", other))),
        }
    }
}
