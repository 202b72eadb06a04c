//! Error types for SocksRtc
//!
//! This module defines all custom error types used throughout the application.

use std::io;
use thiserror::Error;

/// Main error type for SocksRtc operations
#[derive(Error, Debug)]
pub enum SocksRtcError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// SOCKS5 protocol error
    #[error("SOCKS5 error: {0}")]
    Socks5(#[from] Socks5Error),

    /// A request was decoded but cannot be served
    #[error("Unsupported command: {0}")]
    UnsupportedCommand(String),

    /// Outbound connect failed or was refused by policy
    #[error("Connect failure: {0}")]
    ConnectFailure(String),

    /// Peer transport could not be negotiated
    #[error("Transport negotiation failed: {0}")]
    TransportNegotiation(String),

    /// Unknown or invalid obfuscation transformer
    #[error("Transformer configuration error: {0}")]
    TransformerConfig(String),

    /// Negotiation metadata line is not a usable host candidate
    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),

    /// Signaling batch or message could not be handled
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Operation on a closed connection, queue or transport
    #[error("Closed: {0}")]
    Closed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SocksRtcError {
    fn from(err: serde_json::Error) -> Self {
        SocksRtcError::Serialization(err.to_string())
    }
}

/// SOCKS5 wire format errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Socks5Error {
    /// Unsupported SOCKS version
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    /// Buffer ends before the message does
    #[error("Truncated message: need {needed} bytes, have {actual}")]
    Truncated {
        /// Minimum number of bytes required to make progress
        needed: usize,
        /// Number of bytes available
        actual: usize,
    },

    /// Structurally invalid message
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Command not supported
    #[error("Command not supported: {0}")]
    CommandNotSupported(u8),

    /// Address type not supported
    #[error("Address type not supported: {0}")]
    AddressTypeNotSupported(u8),

    /// Invalid domain name
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),

    /// UDP datagram fragmentation is not supported
    #[error("Fragmentation not supported: frag={0}")]
    FragmentationUnsupported(u8),

    /// Reserved field was not zero
    #[error("Invalid reserved field: {0}")]
    InvalidReserved(u16),

    /// Client offered no authentication methods
    #[error("No authentication methods offered")]
    NoAuthMethods,

    /// Remote answered with a failure reply
    #[error("Request failed: {0:?}")]
    Reply(Socks5ReplyCode),
}

impl Socks5Error {
    /// True when more input could turn this into a successful decode
    pub fn is_truncated(&self) -> bool {
        matches!(self, Socks5Error::Truncated { .. })
    }
}

/// Reply codes for SOCKS5 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Socks5ReplyCode {
    /// Command succeeded
    Succeeded = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddressTypeNotSupported = 0x08,
    /// Reserved
    Reserved = 0x09,
}

impl From<Socks5ReplyCode> for u8 {
    fn from(code: Socks5ReplyCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for Socks5ReplyCode {
    type Error = Socks5Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Socks5ReplyCode::Succeeded),
            0x01 => Ok(Socks5ReplyCode::GeneralFailure),
            0x02 => Ok(Socks5ReplyCode::ConnectionNotAllowed),
            0x03 => Ok(Socks5ReplyCode::NetworkUnreachable),
            0x04 => Ok(Socks5ReplyCode::HostUnreachable),
            0x05 => Ok(Socks5ReplyCode::ConnectionRefused),
            0x06 => Ok(Socks5ReplyCode::TtlExpired),
            0x07 => Ok(Socks5ReplyCode::CommandNotSupported),
            0x08 => Ok(Socks5ReplyCode::AddressTypeNotSupported),
            0x09 => Ok(Socks5ReplyCode::Reserved),
            other => Err(Socks5Error::Malformed(format!("unknown reply code {}", other))),
        }
    }
}

impl From<&io::Error> for Socks5ReplyCode {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Socks5ReplyCode::ConnectionRefused,
            io::ErrorKind::TimedOut => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::AddrNotAvailable => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::NotFound => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::PermissionDenied => Socks5ReplyCode::ConnectionNotAllowed,
            _ => Socks5ReplyCode::GeneralFailure,
        }
    }
}

impl From<&Socks5Error> for Socks5ReplyCode {
    fn from(err: &Socks5Error) -> Self {
        match err {
            Socks5Error::CommandNotSupported(_) => Socks5ReplyCode::CommandNotSupported,
            Socks5Error::AddressTypeNotSupported(_) => Socks5ReplyCode::AddressTypeNotSupported,
            Socks5Error::Reply(code) => *code,
            _ => Socks5ReplyCode::GeneralFailure,
        }
    }
}
