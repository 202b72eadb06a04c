//! Multiplexing handshake
//!
//! The first message on every sub-channel is a [`ConnectRequest`] from the
//! SOCKS side; the network side answers with a [`ConnectResponse`]. Both
//! are JSON objects terminated by a newline. Bytes after the newline
//! belong to the relayed stream.

use crate::connection::Connection;
use crate::error::{Socks5ReplyCode, SocksRtcError};
use crate::socks::Endpoint;
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Longest handshake message accepted
pub const MAX_HANDSHAKE_LEN: usize = 4096;

/// Protocol name for TCP streams
pub const PROTOCOL_TCP: &str = "tcp";

/// Destination requested by the SOCKS side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Transport protocol, currently always "tcp"
    pub protocol: String,
    /// Host name or IP literal
    pub address: String,
    /// Destination port
    pub port: u16,
}

impl ConnectRequest {
    /// TCP request for `endpoint`
    pub fn tcp(endpoint: &Endpoint) -> Self {
        ConnectRequest {
            protocol: PROTOCOL_TCP.to_string(),
            address: endpoint.address.clone(),
            port: endpoint.port,
        }
    }

    /// Requested destination
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.address.clone(), self.port)
    }
}

/// Outcome of the outbound connect
///
/// `address` and `port` are both present on success. On failure they are
/// absent and `reply` may say why.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    /// Local address of the outbound connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Local port of the outbound connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// SOCKS5 reply code for failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<u8>,
}

impl ConnectResponse {
    /// Successful connect bound at `endpoint`
    pub fn connected(endpoint: &Endpoint) -> Self {
        ConnectResponse {
            address: Some(endpoint.address.clone()),
            port: Some(endpoint.port),
            reply: None,
        }
    }

    /// Failed connect
    pub fn failed(code: Socks5ReplyCode) -> Self {
        ConnectResponse {
            reply: Some(code.into()),
            ..Default::default()
        }
    }

    /// Bound endpoint on success, or the reply code to send the client
    pub fn outcome(&self) -> Result<Endpoint, Socks5ReplyCode> {
        match (&self.address, self.port) {
            (Some(address), Some(port)) => Ok(Endpoint::new(address.clone(), port)),
            _ => Err(self
                .reply
                .and_then(|code| Socks5ReplyCode::try_from(code).ok())
                .filter(|code| *code != Socks5ReplyCode::Succeeded)
                .unwrap_or(Socks5ReplyCode::GeneralFailure)),
        }
    }
}

/// Encode a handshake message
pub fn encode_message<T: Serialize>(message: &T) -> Result<Bytes, SocksRtcError> {
    let mut out = serde_json::to_vec(message)?;
    out.push(b'\n');
    Ok(Bytes::from(out))
}

/// Read one handshake message from `conn`
///
/// `buf` holds bytes already received; on return it holds whatever
/// followed the message.
pub async fn read_message<T: DeserializeOwned>(
    conn: &Connection,
    buf: &mut BytesMut,
) -> Result<T, SocksRtcError> {
    loop {
        if let Some(end) = buf.iter().position(|b| *b == b'\n') {
            let line = buf.split_to(end + 1);
            return Ok(serde_json::from_slice(&line[..end])?);
        }
        if buf.len() > MAX_HANDSHAKE_LEN {
            return Err(SocksRtcError::Serialization(format!(
                "handshake message exceeds {} bytes",
                MAX_HANDSHAKE_LEN
            )));
        }
        match conn.receive().await {
            Some(data) => buf.extend_from_slice(&data),
            None => {
                return Err(SocksRtcError::Closed(format!(
                    "channel {} closed during handshake",
                    conn.id()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionInfo;
    use futures::{stream, SinkExt};
    use std::convert::Infallible;
    use std::io;

    fn connection_with(chunks: &[&'static str]) -> Connection {
        let reader = stream::iter(
            chunks
                .iter()
                .map(|c| Ok::<_, io::Error>(Bytes::from_static(c.as_bytes())))
                .collect::<Vec<_>>(),
        );
        let writer = futures::sink::drain::<Bytes>()
            .sink_map_err(|e: Infallible| -> io::Error { match e {} });
        Connection::from_parts(reader, writer, ConnectionInfo::default())
    }

    #[test]
    fn test_request_json_shape() {
        let request = ConnectRequest::tcp(&Endpoint::new("www.example.com", 80));
        let json = encode_message(&request).unwrap();
        assert_eq!(
            &json[..],
            b"{\"protocol\":\"tcp\",\"address\":\"www.example.com\",\"port\":80}\n"
        );
    }

    #[test]
    fn test_response_outcomes() {
        let ok = ConnectResponse::connected(&Endpoint::new("10.0.0.2", 5555));
        assert_eq!(ok.outcome(), Ok(Endpoint::new("10.0.0.2", 5555)));

        let empty: ConnectResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.outcome(), Err(Socks5ReplyCode::GeneralFailure));

        let refused = ConnectResponse::failed(Socks5ReplyCode::ConnectionRefused);
        assert_eq!(
            serde_json::to_string(&refused).unwrap(),
            r#"{"reply":5}"#
        );
        assert_eq!(refused.outcome(), Err(Socks5ReplyCode::ConnectionRefused));

        let bogus = ConnectResponse {
            reply: Some(0),
            ..Default::default()
        };
        assert_eq!(bogus.outcome(), Err(Socks5ReplyCode::GeneralFailure));
    }

    #[tokio::test]
    async fn test_read_message_split_and_leftover() {
        let conn = connection_with(&["{\"protocol\":\"tcp\",", "\"address\":\"a\",\"port\":1}\nGET"]);
        let mut buf = BytesMut::new();
        let request: ConnectRequest = read_message(&conn, &mut buf).await.unwrap();
        assert_eq!(request.endpoint(), Endpoint::new("a", 1));
        assert_eq!(&buf[..], b"GET");
    }

    #[tokio::test]
    async fn test_read_message_errors() {
        let conn = connection_with(&["{\"protocol\""]);
        let mut buf = BytesMut::new();
        let err = read_message::<ConnectRequest>(&conn, &mut buf).await.unwrap_err();
        assert!(matches!(err, SocksRtcError::Closed(_)));

        let conn = connection_with(&["not json\n"]);
        let mut buf = BytesMut::new();
        let err = read_message::<ConnectRequest>(&conn, &mut buf).await.unwrap_err();
        assert!(matches!(err, SocksRtcError::Serialization(_)));
    }
}
