//! Obfuscated datagram pipe
//!
//! An [`ObfuscationPipe`] owns a UDP socket and exchanges datagrams with a
//! single remote endpoint. Outgoing datagrams pass through the configured
//! transformer; incoming ones are restored before delivery.

use super::transformer::{create_transformer, Transformer};
use crate::config::TransformerConfig;
use crate::connection::HandlerQueue;
use crate::error::SocksRtcError;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Restored datagrams held for the consumer before new ones are dropped
const PIPE_QUEUE_CAPACITY: usize = 512;

/// Largest datagram read from the socket
const MAX_DATAGRAM_SIZE: usize = 65536;

/// Transforming UDP pipe to one remote endpoint
pub struct ObfuscationPipe {
    socket: Arc<UdpSocket>,
    transformer: Arc<dyn Transformer>,
    local: SocketAddr,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    received: Arc<HandlerQueue<Bytes>>,
    token: CancellationToken,
}

impl ObfuscationPipe {
    /// Select the transformer, then bind the socket
    ///
    /// An invalid transformer config fails before any socket is created.
    pub async fn bind(local: SocketAddr, config: &TransformerConfig) -> Result<Self, SocksRtcError> {
        let transformer = create_transformer(config)?;
        let socket = Arc::new(UdpSocket::bind(local).await?);
        let local = socket.local_addr()?;

        let pipe = ObfuscationPipe {
            socket,
            transformer,
            local,
            remote: Arc::new(Mutex::new(None)),
            received: Arc::new(HandlerQueue::bounded(PIPE_QUEUE_CAPACITY)),
            token: CancellationToken::new(),
        };

        tokio::spawn(receive_loop(
            pipe.socket.clone(),
            pipe.transformer.clone(),
            pipe.remote.clone(),
            pipe.received.clone(),
            pipe.token.clone(),
        ));

        debug!(
            "Obfuscation pipe bound on {} with transformer {}",
            local,
            pipe.transformer.name()
        );
        Ok(pipe)
    }

    /// Local socket address
    pub fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    /// Remote socket address, once known
    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        *lock(&self.remote)
    }

    /// Fix the remote endpoint; datagrams from anywhere else are ignored
    pub fn set_remote(&self, remote: SocketAddr) {
        let previous = lock(&self.remote).replace(remote);
        match previous {
            Some(previous) if previous != remote => {
                debug!("Pipe {} remote changed {} -> {}", self.local, previous, remote)
            }
            _ => trace!("Pipe {} remote set to {}", self.local, remote),
        }
    }

    /// Name of the active transformer
    pub fn transformer_name(&self) -> &'static str {
        self.transformer.name()
    }

    /// Transform and send one datagram to the remote endpoint
    pub async fn send(&self, data: &[u8]) -> Result<(), SocksRtcError> {
        let remote = self
            .remote_endpoint()
            .ok_or_else(|| SocksRtcError::Closed(format!("pipe {} has no remote", self.local)))?;
        let wire = self.transformer.transform(data)?;
        self.socket.send_to(&wire, remote).await?;
        Ok(())
    }

    /// Queue of restored inbound datagrams
    pub fn received(&self) -> &HandlerQueue<Bytes> {
        &self.received
    }

    /// Next restored datagram; `None` once closed
    pub async fn receive(&self) -> Option<Bytes> {
        self.received.next().await
    }

    /// Stop receiving and release the socket
    pub fn close(&self) {
        self.token.cancel();
        self.received.close();
    }
}

impl Drop for ObfuscationPipe {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ObfuscationPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObfuscationPipe")
            .field("local", &self.local)
            .field("remote", &self.remote_endpoint())
            .field("transformer", &self.transformer.name())
            .finish()
    }
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    transformer: Arc<dyn Transformer>,
    remote: Arc<Mutex<Option<SocketAddr>>>,
    received: Arc<HandlerQueue<Bytes>>,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, from) = tokio::select! {
            _ = token.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    // ICMP errors surface here on some platforms
                    trace!("Pipe receive error: {}", e);
                    continue;
                }
            },
        };

        if *lock(&remote) != Some(from) {
            trace!("Pipe dropping datagram from unexpected {}", from);
            continue;
        }

        match transformer.restore(&buf[..len]) {
            Ok(plain) => {
                if !received.offer(Bytes::from(plain)) {
                    trace!("Pipe queue full, dropping datagram");
                }
            }
            Err(e) => debug!("Pipe dropping datagram from {}: {}", from, e),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
