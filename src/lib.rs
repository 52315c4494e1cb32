//! # meshtun
//!
//! An encrypted, multiplexed, self-healing tunnel between peers on an
//! unreliable network.
//!
//! ## Features
//!
//! - **Sessions**: many independent message streams over one connection
//! - **Encryption** of every message with AES-256-GCM keyed from a shared token
//! - **Keepalive** and dead-link detection
//! - **Reconnection** of lost seed nodes with a fixed backoff
//! - **Unicast and multicast** sessions, plus a small pub/sub broker
//! - **Pluggable transports**: TCP and in-memory
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │               Broker (publish / subscribe)           │
//! ├─────────────────────────────────────────────────────┤
//! │                    Tunnel Layer                      │
//! │     (dial, listen, routing, reconnect supervisor)    │
//! ├─────────────────────────────────────────────────────┤
//! │                  Session Layer                       │
//! │        (sessions, listeners, demultiplexing)         │
//! ├─────────────────────────────────────────────────────┤
//! │                    Link Layer                        │
//! │   (encryption, framing, keepalive, channel tracking) │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │                  (TCP, in-memory)                    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use meshtun::{Payload, Tunnel, TunnelOptions, DialOptions, ListenOptions};
//!
//! # async fn run() -> meshtun::Result<()> {
//! let tunnel = Tunnel::new(
//!     TunnelOptions::default()
//!         .with_address("0.0.0.0:8085")
//!         .with_nodes(["10.0.0.2:8085"])
//!         .with_token("secret"),
//! )?;
//! tunnel.connect().await?;
//!
//! let session = tunnel.dial("echo", DialOptions::default()).await?;
//! session.send(Payload::new("hello")).await?;
//! let reply = session.recv().await?;
//! # let _ = (reply, ListenOptions::default());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod protocol;
pub mod transport;
pub mod tunnel;

#[cfg(feature = "broker")]
pub mod broker;

mod signal;

pub use config::Config;
pub use tunnel::{
    DialOptions, LinkInfo, LinkOptions, ListenOptions, Listener, Mode, Payload, Session,
    SessionState, Tunnel, TunnelError, TunnelOptions,
};

#[cfg(feature = "broker")]
pub use broker::{Subscription, TunnelBroker};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
