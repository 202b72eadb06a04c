//! SOCKS5 module for SocksRtc
//!
//! Stateless encoding and decoding of SOCKS5 messages: the method
//! selection handshake, requests, replies and UDP datagram headers.
//! All integers on the wire are big-endian.

mod codec;
mod consts;
mod types;

pub use codec::{
    compose_auth_handshake, compose_auth_response, compose_destination, compose_reply,
    compose_request, compose_request_response, compose_udp_message, interpret_auth_handshake,
    interpret_auth_response, interpret_destination, interpret_request,
    interpret_request_response, interpret_udp_message,
};
pub use consts::*;
pub use types::{
    AddressType, AuthMethod, Destination, Endpoint, SocksCommand, SocksRequest, UdpMessage,
};
