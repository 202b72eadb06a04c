//! Connections, queues and the TCP server
//!
//! Every byte stream in the proxy, whether a local TCP socket or a
//! sub-channel of the peer transport, is handled as a [`Connection`].

#[allow(clippy::module_inception)]
mod connection;
mod queue;
mod server;
mod socket;

pub use connection::{CloseKind, Connection, ConnectionInfo, ConnectionState};
pub use queue::HandlerQueue;
pub use server::Server;
pub use socket::SocketOpts;
