//! # SocksRtc - SOCKS5 over a negotiated peer transport
//!
//! SocksRtc splits a SOCKS5 proxy in two halves that talk over a single
//! peer-to-peer transport. The SOCKS side accepts local clients; the
//! network side, on another machine, makes the outbound connections.
//! Every client connection gets its own sub-channel on the transport.
//!
//! ## Features
//!
//! - **SOCKS5 CONNECT**: NOAUTH, IPv4, IPv6 and domain destinations
//! - **Multiplexing**: one reliable, ordered sub-channel per client
//! - **Copy-paste signaling**: the halves negotiate through JSON batches
//!   carried by any out-of-band channel
//! - **Churn**: optional datagram obfuscation with pluggable transformers
//! - **Destination policy**: the network side refuses non-unicast targets
//!   unless configured otherwise
//!
//! ## Usage
//!
//! ```rust,ignore
//! use socksrtc::config::load_config;
//! use socksrtc::peer::PeerRole;
//! use socksrtc::proxy::{create_transport, SocksToRtc};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let transport = create_transport(PeerRole::Offerer, &config).await?;
//!     let socks = SocksToRtc::new(&config, transport)?;
//!
//!     socks.signals_for_peer().set_handler(|batch| println!("{}", batch));
//!     socks.start().await?;
//!     socks.once_stopped().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! SOCKS5 Client -> SocksToRtc =(peer transport)= RtcToNet -> Target
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod churn;
pub mod config;
pub mod connection;
pub mod counter;
pub mod error;
pub mod peer;
pub mod proxy;
pub mod socks;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use error::{Socks5Error, Socks5ReplyCode, SocksRtcError};
pub use proxy::{create_transport, ProxyState, RtcToNet, SocksToRtc};

/// Version of the SocksRtc library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
