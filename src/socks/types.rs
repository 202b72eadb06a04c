//! SOCKS5 data model
//!
//! Value types produced and consumed by the codec.

use super::consts::*;
use crate::error::Socks5Error;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tokio::net::lookup_host;

/// A network endpoint: an IP literal or host name plus a port
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// IP address literal or DNS name
    pub address: String,
    /// Port number
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Endpoint {
            address: address.into(),
            port,
        }
    }

    /// The all-zero IPv4 endpoint used in failure replies
    pub fn unspecified() -> Self {
        Endpoint::new("0.0.0.0", 0)
    }

    /// Parse the address as an IP literal
    pub fn ip(&self) -> Option<IpAddr> {
        self.address.parse().ok()
    }

    /// Convert to a socket address when the address is an IP literal
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Resolve to every socket address the name maps to
    pub async fn resolve(&self) -> std::io::Result<Vec<SocketAddr>> {
        if let Some(addr) = self.to_socket_addr() {
            return Ok(vec![addr]);
        }
        let addrs: Vec<SocketAddr> = lookup_host((self.address.as_str(), self.port))
            .await?
            .collect();
        if addrs.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses for {}", self.address),
            ));
        }
        Ok(addrs)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip() {
            Some(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            _ => write!(f, "{}:{}", self.address, self.port),
        }
    }
}

/// Address type of a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    /// Four byte IPv4 address
    IpV4,
    /// Length-prefixed host name
    Dns,
    /// Sixteen byte IPv6 address
    IpV6,
}

impl AddressType {
    /// Convert from byte value
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            SOCKS5_ADDR_TYPE_IPV4 => Some(AddressType::IpV4),
            SOCKS5_ADDR_TYPE_DOMAIN => Some(AddressType::Dns),
            SOCKS5_ADDR_TYPE_IPV6 => Some(AddressType::IpV6),
            _ => None,
        }
    }

    /// Convert to byte value
    pub fn to_byte(self) -> u8 {
        match self {
            AddressType::IpV4 => SOCKS5_ADDR_TYPE_IPV4,
            AddressType::Dns => SOCKS5_ADDR_TYPE_DOMAIN,
            AddressType::IpV6 => SOCKS5_ADDR_TYPE_IPV6,
        }
    }
}

/// An endpoint together with how it is laid out on the wire
///
/// `address_byte_length` counts the address type byte, the address
/// and the two port bytes. It is always derived from the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    address_type: AddressType,
    endpoint: Endpoint,
    address_byte_length: usize,
}

impl Destination {
    /// Build a destination, choosing the address type from the endpoint
    pub fn new(endpoint: Endpoint) -> Result<Self, Socks5Error> {
        let address_type = match endpoint.ip() {
            Some(IpAddr::V4(_)) => AddressType::IpV4,
            Some(IpAddr::V6(_)) => AddressType::IpV6,
            None => AddressType::Dns,
        };
        Self::with_address_type(address_type, endpoint)
    }

    /// Build a destination with an explicit address type
    ///
    /// A DNS destination may carry any non-empty name, including one that
    /// looks like an IP literal. IP destinations must parse as that family.
    pub fn with_address_type(
        address_type: AddressType,
        endpoint: Endpoint,
    ) -> Result<Self, Socks5Error> {
        let address_len = match (address_type, endpoint.ip()) {
            (AddressType::IpV4, Some(IpAddr::V4(_))) => 4,
            (AddressType::IpV6, Some(IpAddr::V6(_))) => 16,
            (AddressType::Dns, _) => {
                let len = endpoint.address.len();
                if len == 0 || len > MAX_DOMAIN_LEN {
                    return Err(Socks5Error::InvalidDomain(endpoint.address));
                }
                1 + len
            }
            _ => {
                return Err(Socks5Error::Malformed(format!(
                    "{} is not a {:?} address",
                    endpoint.address, address_type
                )))
            }
        };

        Ok(Destination {
            address_type,
            endpoint,
            address_byte_length: 1 + address_len + 2,
        })
    }

    /// `0.0.0.0:0`, used when no bound address is available
    pub fn unspecified() -> Self {
        Destination {
            address_type: AddressType::IpV4,
            endpoint: Endpoint::unspecified(),
            address_byte_length: 7,
        }
    }

    /// Address type
    pub fn address_type(&self) -> AddressType {
        self.address_type
    }

    /// Host and port
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Encoded size of address type, address and port
    pub fn address_byte_length(&self) -> usize {
        self.address_byte_length
    }

    /// Consume into the endpoint
    pub fn into_endpoint(self) -> Endpoint {
        self.endpoint
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.endpoint.fmt(f)
    }
}

/// SOCKS5 command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCommand {
    /// TCP CONNECT - establish a TCP connection
    TcpConnect,
    /// TCP BIND - decodable, never honored
    TcpBind,
    /// UDP ASSOCIATE - decodable, never honored
    UdpAssociate,
}

impl SocksCommand {
    /// Convert from byte value
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            SOCKS5_CMD_TCP_CONNECT => Some(SocksCommand::TcpConnect),
            SOCKS5_CMD_TCP_BIND => Some(SocksCommand::TcpBind),
            SOCKS5_CMD_UDP_ASSOCIATE => Some(SocksCommand::UdpAssociate),
            _ => None,
        }
    }

    /// Convert to byte value
    pub fn to_byte(self) -> u8 {
        match self {
            SocksCommand::TcpConnect => SOCKS5_CMD_TCP_CONNECT,
            SocksCommand::TcpBind => SOCKS5_CMD_TCP_BIND,
            SocksCommand::UdpAssociate => SOCKS5_CMD_UDP_ASSOCIATE,
        }
    }
}

impl fmt::Display for SocksCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocksCommand::TcpConnect => write!(f, "CONNECT"),
            SocksCommand::TcpBind => write!(f, "BIND"),
            SocksCommand::UdpAssociate => write!(f, "UDP_ASSOCIATE"),
        }
    }
}

/// A decoded client request (version is always 5)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    /// Requested command
    pub command: SocksCommand,
    /// Requested destination
    pub destination: Destination,
}

impl SocksRequest {
    /// Number of bytes the request occupies on the wire
    pub fn wire_len(&self) -> usize {
        3 + self.destination.address_byte_length()
    }
}

/// A SOCKS5 UDP datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpMessage {
    /// Fragment number, always 0 once decoded
    pub frag: u8,
    /// Target or source of the datagram
    pub destination: Destination,
    /// Datagram payload
    pub data: Bytes,
}

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication
    NoAuth,
    /// GSSAPI
    Gssapi,
    /// Username and password
    UserPass,
    /// No acceptable method
    NoneAcceptable,
}

impl AuthMethod {
    /// Convert from byte value
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            SOCKS5_AUTH_METHOD_NONE => Some(AuthMethod::NoAuth),
            SOCKS5_AUTH_METHOD_GSSAPI => Some(AuthMethod::Gssapi),
            SOCKS5_AUTH_METHOD_PASSWORD => Some(AuthMethod::UserPass),
            SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE => Some(AuthMethod::NoneAcceptable),
            _ => None,
        }
    }

    /// Convert to byte value
    pub fn to_byte(self) -> u8 {
        match self {
            AuthMethod::NoAuth => SOCKS5_AUTH_METHOD_NONE,
            AuthMethod::Gssapi => SOCKS5_AUTH_METHOD_GSSAPI,
            AuthMethod::UserPass => SOCKS5_AUTH_METHOD_PASSWORD,
            AuthMethod::NoneAcceptable => SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE,
        }
    }
}
