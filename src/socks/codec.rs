//! SOCKS5 wire codec
//!
//! Pure functions that parse and build SOCKS5 messages. Nothing here does
//! I/O; callers that read from a stream accumulate bytes until a function
//! stops returning [`Socks5Error::Truncated`].
//!
//! # Request Format
//!
//! ```text
//! +----+-----+-------+------+----------+----------+
//! |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
//! +----+-----+-------+------+----------+----------+
//! | 1  |  1  | X'00' |  1   | Variable |    2     |
//! +----+-----+-------+------+----------+----------+
//! ```

use super::consts::*;
use super::types::{
    AddressType, AuthMethod, Destination, Endpoint, SocksCommand, SocksRequest, UdpMessage,
};
use crate::error::{Socks5Error, Socks5ReplyCode};
use bytes::{BufMut, Bytes};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

fn need(buf: &[u8], needed: usize) -> Result<(), Socks5Error> {
    if buf.len() < needed {
        return Err(Socks5Error::Truncated {
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Shift a truncation error produced for a sub-slice starting at `offset`
fn at_offset(err: Socks5Error, offset: usize) -> Socks5Error {
    match err {
        Socks5Error::Truncated { needed, actual } => Socks5Error::Truncated {
            needed: needed + offset,
            actual: actual + offset,
        },
        other => other,
    }
}

fn port_at(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

/// Parse `ATYP ADDR PORT` from the start of `buf`
pub fn interpret_destination(buf: &[u8]) -> Result<Destination, Socks5Error> {
    need(buf, 1)?;
    let address_type =
        AddressType::from_byte(buf[0]).ok_or(Socks5Error::AddressTypeNotSupported(buf[0]))?;

    let endpoint = match address_type {
        AddressType::IpV4 => {
            need(buf, 1 + 4 + 2)?;
            let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
            Endpoint::new(ip.to_string(), port_at(buf, 5))
        }
        AddressType::IpV6 => {
            need(buf, 1 + 16 + 2)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[1..17]);
            Endpoint::new(Ipv6Addr::from(octets).to_string(), port_at(buf, 17))
        }
        AddressType::Dns => {
            need(buf, 2)?;
            let len = buf[1] as usize;
            if len == 0 {
                return Err(Socks5Error::InvalidDomain(String::new()));
            }
            need(buf, 2 + len + 2)?;
            // names must be UTF-8 text
            let name = std::str::from_utf8(&buf[2..2 + len])
                .map_err(|_| Socks5Error::InvalidDomain("non UTF-8 name".to_string()))?;
            Endpoint::new(name, port_at(buf, 2 + len))
        }
    };

    Destination::with_address_type(address_type, endpoint)
}

fn put_destination(out: &mut Vec<u8>, destination: &Destination) {
    out.put_u8(destination.address_type().to_byte());
    match (destination.address_type(), destination.endpoint().ip()) {
        (AddressType::IpV4, Some(IpAddr::V4(ip))) => out.put_slice(&ip.octets()),
        (AddressType::IpV6, Some(IpAddr::V6(ip))) => out.put_slice(&ip.octets()),
        _ => {
            // Destination guarantees 1..=255 bytes here
            let name = destination.endpoint().address.as_bytes();
            out.put_u8(name.len() as u8);
            out.put_slice(name);
        }
    }
    out.put_u16(destination.endpoint().port);
}

/// Encode `ATYP ADDR PORT`
pub fn compose_destination(destination: &Destination) -> Vec<u8> {
    let mut out = Vec::with_capacity(destination.address_byte_length());
    put_destination(&mut out, destination);
    out
}

/// Parse a client request
///
/// BIND and UDP ASSOCIATE decode successfully; refusing them is up to
/// the caller.
pub fn interpret_request(buf: &[u8]) -> Result<SocksRequest, Socks5Error> {
    need(buf, SOCKS5_HEADER_LEN)?;

    if buf[0] != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(buf[0]));
    }

    let command = SocksCommand::from_byte(buf[1]).ok_or(Socks5Error::CommandNotSupported(buf[1]))?;

    if buf[2] != SOCKS5_RESERVED {
        return Err(Socks5Error::InvalidReserved(buf[2] as u16));
    }

    let destination = interpret_destination(&buf[3..]).map_err(|e| at_offset(e, 3))?;
    let request = SocksRequest {
        command,
        destination,
    };

    if request.wire_len() < SOCKS5_MIN_REQUEST_LEN {
        return Err(Socks5Error::Malformed(format!(
            "request of {} bytes is below the {} byte minimum",
            request.wire_len(),
            SOCKS5_MIN_REQUEST_LEN
        )));
    }

    Ok(request)
}

/// Encode a client request; exact inverse of [`interpret_request`]
pub fn compose_request(request: &SocksRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(request.wire_len());
    out.put_u8(SOCKS5_VERSION);
    out.put_u8(request.command.to_byte());
    out.put_u8(SOCKS5_RESERVED);
    put_destination(&mut out, &request.destination);
    out
}

/// Encode a reply with an arbitrary code
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// ```
pub fn compose_reply(code: Socks5ReplyCode, bound: &Endpoint) -> Vec<u8> {
    let destination = Destination::new(bound.clone()).unwrap_or_else(|_| Destination::unspecified());
    let mut out = Vec::with_capacity(3 + destination.address_byte_length());
    out.put_u8(SOCKS5_VERSION);
    out.put_u8(code.into());
    out.put_u8(SOCKS5_RESERVED);
    put_destination(&mut out, &destination);
    out
}

/// Encode a SUCCEEDED reply carrying the bound endpoint
pub fn compose_request_response(bound: &Endpoint) -> Vec<u8> {
    compose_reply(Socks5ReplyCode::Succeeded, bound)
}

/// Parse a reply; failure codes surface as [`Socks5Error::Reply`]
pub fn interpret_request_response(buf: &[u8]) -> Result<Endpoint, Socks5Error> {
    need(buf, SOCKS5_HEADER_LEN)?;

    if buf[0] != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(buf[0]));
    }

    let code = Socks5ReplyCode::try_from(buf[1])?;
    if code != Socks5ReplyCode::Succeeded {
        return Err(Socks5Error::Reply(code));
    }

    let destination = interpret_destination(&buf[3..]).map_err(|e| at_offset(e, 3))?;
    Ok(destination.into_endpoint())
}

/// Parse a UDP datagram
///
/// ```text
/// +----+------+------+----------+----------+----------+
/// |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
/// +----+------+------+----------+----------+----------+
/// | 2  |  1   |  1   | Variable |    2     | Variable |
/// +----+------+------+----------+----------+----------+
/// ```
pub fn interpret_udp_message(buf: &[u8]) -> Result<UdpMessage, Socks5Error> {
    need(buf, SOCKS5_UDP_MIN_LEN)?;

    let reserved = u16::from_be_bytes([buf[0], buf[1]]);
    if reserved != 0 {
        return Err(Socks5Error::InvalidReserved(reserved));
    }

    let frag = buf[2];
    if frag != 0 {
        return Err(Socks5Error::FragmentationUnsupported(frag));
    }

    let destination = interpret_destination(&buf[3..]).map_err(|e| at_offset(e, 3))?;
    let data = Bytes::copy_from_slice(&buf[3 + destination.address_byte_length()..]);

    Ok(UdpMessage {
        frag,
        destination,
        data,
    })
}

/// Encode a UDP datagram
pub fn compose_udp_message(message: &UdpMessage) -> Vec<u8> {
    let mut out =
        Vec::with_capacity(3 + message.destination.address_byte_length() + message.data.len());
    out.put_u16(0);
    out.put_u8(message.frag);
    put_destination(&mut out, &message.destination);
    out.put_slice(&message.data);
    out
}

/// Parse the method selection message `VER NMETHODS METHODS...`
///
/// Method bytes outside the known set are skipped. The message occupies
/// `2 + buf[1]` bytes.
pub fn interpret_auth_handshake(buf: &[u8]) -> Result<Vec<AuthMethod>, Socks5Error> {
    need(buf, 2)?;

    if buf[0] != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(buf[0]));
    }

    let count = buf[1] as usize;
    if count == 0 {
        return Err(Socks5Error::NoAuthMethods);
    }
    need(buf, 2 + count)?;

    Ok(buf[2..2 + count]
        .iter()
        .filter_map(|b| AuthMethod::from_byte(*b))
        .collect())
}

/// Encode a method selection message
///
/// The count is one byte, so 1..=255 methods may be offered.
pub fn compose_auth_handshake(methods: &[AuthMethod]) -> Result<Vec<u8>, Socks5Error> {
    let count = u8::try_from(methods.len())
        .ok()
        .filter(|count| *count > 0)
        .ok_or_else(|| Socks5Error::Malformed(format!("cannot offer {} auth methods", methods.len())))?;

    let mut out = Vec::with_capacity(2 + methods.len());
    out.put_u8(SOCKS5_VERSION);
    out.put_u8(count);
    out.extend(methods.iter().map(|m| m.to_byte()));
    Ok(out)
}

/// Encode the server's method choice
pub fn compose_auth_response(method: AuthMethod) -> Vec<u8> {
    vec![SOCKS5_VERSION, method.to_byte()]
}

/// Parse the server's method choice
pub fn interpret_auth_response(buf: &[u8]) -> Result<AuthMethod, Socks5Error> {
    need(buf, 2)?;

    if buf[0] != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(buf[0]));
    }

    AuthMethod::from_byte(buf[1])
        .ok_or_else(|| Socks5Error::Malformed(format!("unknown auth method {}", buf[1])))
}
