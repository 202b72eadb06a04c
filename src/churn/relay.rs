//! Plain-to-obfuscated datagram relay
//!
//! A [`ChurnRelay`] sits between the local peer transport and the network.
//! The peer transport talks to the relay's plain loopback socket; the relay
//! forwards those datagrams through its [`ObfuscationPipe`] and hands
//! restored datagrams back to the peer transport.

use super::pipe::ObfuscationPipe;
use crate::config::TransformerConfig;
use crate::error::SocksRtcError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const MAX_DATAGRAM_SIZE: usize = 65536;

/// Relay between a local peer transport and an obfuscation pipe
pub struct ChurnRelay {
    pipe: Arc<ObfuscationPipe>,
    plain: Arc<UdpSocket>,
    plain_endpoint: SocketAddr,
    local_peer: Arc<Mutex<Option<SocketAddr>>>,
    token: CancellationToken,
}

impl ChurnRelay {
    /// Bind the public pipe on `public` and a plain socket on loopback
    pub async fn bind(public: SocketAddr, transformer: &TransformerConfig) -> Result<Self, SocksRtcError> {
        let pipe = Arc::new(ObfuscationPipe::bind(public, transformer).await?);
        let loopback = match public.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        };
        let plain = Arc::new(UdpSocket::bind(SocketAddr::new(loopback, 0)).await?);
        let plain_endpoint = plain.local_addr()?;

        let relay = ChurnRelay {
            pipe,
            plain,
            plain_endpoint,
            local_peer: Arc::new(Mutex::new(None)),
            token: CancellationToken::new(),
        };

        tokio::spawn(plain_to_pipe(
            relay.plain.clone(),
            relay.pipe.clone(),
            relay.local_peer.clone(),
            relay.token.clone(),
        ));
        tokio::spawn(pipe_to_plain(
            relay.plain.clone(),
            relay.pipe.clone(),
            relay.local_peer.clone(),
        ));

        debug!(
            "Churn relay: public {} ({}), plain {}",
            relay.pipe.local_endpoint(),
            relay.pipe.transformer_name(),
            plain_endpoint
        );
        Ok(relay)
    }

    /// Obfuscated, network facing endpoint
    pub fn public_endpoint(&self) -> SocketAddr {
        self.pipe.local_endpoint()
    }

    /// Endpoint the local peer transport should send to
    pub fn plain_endpoint(&self) -> SocketAddr {
        self.plain_endpoint
    }

    /// Address of the local peer transport; other senders are ignored
    pub fn set_local_peer(&self, addr: SocketAddr) {
        *lock(&self.local_peer) = Some(addr);
        trace!("Churn relay local peer {}", addr);
    }

    /// Address of the remote relay's public endpoint
    pub fn set_remote(&self, addr: SocketAddr) {
        self.pipe.set_remote(addr);
    }

    /// Stop relaying
    pub fn close(&self) {
        self.token.cancel();
        self.pipe.close();
    }
}

impl Drop for ChurnRelay {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ChurnRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChurnRelay")
            .field("pipe", &self.pipe)
            .field("plain", &self.plain_endpoint)
            .finish()
    }
}

async fn plain_to_pipe(
    plain: Arc<UdpSocket>,
    pipe: Arc<ObfuscationPipe>,
    local_peer: Arc<Mutex<Option<SocketAddr>>>,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = tokio::select! {
            _ = token.cancelled() => break,
            result = plain.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    trace!("Churn relay plain receive error: {}", e);
                    continue;
                }
            },
        };

        if *lock(&local_peer) != Some(from) {
            trace!("Churn relay ignoring plain datagram from {}", from);
            continue;
        }
        if let Err(e) = pipe.send(&buf[..len]).await {
            trace!("Churn relay could not forward: {}", e);
        }
    }
}

async fn pipe_to_plain(
    plain: Arc<UdpSocket>,
    pipe: Arc<ObfuscationPipe>,
    local_peer: Arc<Mutex<Option<SocketAddr>>>,
) {
    // ends when the pipe closes
    while let Some(datagram) = pipe.receive().await {
        let target = *lock(&local_peer);
        match target {
            Some(target) => {
                if let Err(e) = plain.send_to(&datagram, target).await {
                    trace!("Churn relay could not deliver: {}", e);
                }
            }
            None => trace!("Churn relay has no local peer yet, dropping datagram"),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
