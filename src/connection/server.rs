//! TCP server producing [`Connection`]s

use super::connection::Connection;
use super::queue::HandlerQueue;
use super::socket::SocketOpts;
use crate::socks::Endpoint;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Shared {
    endpoint: Endpoint,
    accepted: HandlerQueue<Connection>,
    live: Mutex<Vec<Connection>>,
    max_connections: usize,
    token: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// Listening TCP server
///
/// Accepted connections are queued on [`connections`](Self::connections).
/// Once `max_connections` are live, further clients are accepted and
/// closed immediately.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    /// Bind and start accepting
    pub async fn listen(addr: SocketAddr, max_connections: usize) -> Result<Server> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to listen on {}", addr))?;
        let local = listener
            .local_addr()
            .with_context(|| "Failed to read listener address")?;

        let server = Server {
            shared: Arc::new(Shared {
                endpoint: Endpoint::from(local),
                accepted: HandlerQueue::new(),
                live: Mutex::new(Vec::new()),
                max_connections,
                token: CancellationToken::new(),
                accept_task: Mutex::new(None),
            }),
        };

        let task = tokio::spawn(server.clone().accept_loop(listener));
        *lock(&server.shared.accept_task) = Some(task);

        info!("Listening on {}", local);
        Ok(server)
    }

    async fn accept_loop(self, listener: TcpListener) {
        let token = self.shared.token.clone();
        let opts = SocketOpts::for_local_client();
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    continue;
                }
            };

            let conn = Connection::from_tcp(stream, &opts);
            let admitted = {
                let mut live = lock(&self.shared.live);
                live.retain(|c| !c.is_closed());
                if live.len() >= self.shared.max_connections {
                    false
                } else {
                    live.push(conn.clone());
                    true
                }
            };

            if !admitted {
                warn!(
                    "Rejecting {}: {} connections already open",
                    peer, self.shared.max_connections
                );
                conn.close();
                continue;
            }

            debug!("Accepted connection {} from {}", conn.id(), peer);
            if !self.shared.accepted.handle(conn.clone()) {
                conn.close();
            }
        }
    }

    /// The bound local endpoint
    pub fn endpoint(&self) -> &Endpoint {
        &self.shared.endpoint
    }

    /// Queue of newly accepted connections
    pub fn connections(&self) -> &HandlerQueue<Connection> {
        &self.shared.accepted
    }

    /// Wait for the next accepted connection; `None` after shutdown
    pub async fn accept(&self) -> Option<Connection> {
        self.shared.accepted.next().await
    }

    /// Number of accepted connections that are still open
    pub fn live_connections(&self) -> usize {
        let mut live = lock(&self.shared.live);
        live.retain(|c| !c.is_closed());
        live.len()
    }

    /// Stop accepting, close every connection and wait until all are closed
    pub async fn shutdown(&self) -> Result<()> {
        self.shared.token.cancel();
        self.shared.accepted.close();

        let task = lock(&self.shared.accept_task).take();
        if let Some(task) = task {
            task.await.with_context(|| "Accept task failed")?;
        }

        let live: Vec<Connection> = lock(&self.shared.live).drain(..).collect();
        for conn in &live {
            conn.close();
        }
        futures::future::join_all(live.iter().map(|c| c.once_closed())).await;

        info!("Server {} shut down", self.shared.endpoint);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
