//! Transport layer implementations
//!
//! The tunnel only needs an ordered, reliable, message-framed connection
//! between two nodes. Backends:
//! - TCP (length-prefixed frames)
//! - In-memory (single process, for tests and simulations)

mod memory;

#[cfg(feature = "tcp")]
mod tcp;

pub use memory::{MemoryListener, MemorySocket, MemoryTransport};

#[cfg(feature = "tcp")]
pub use tcp::{TcpSocket, TcpTransport, TcpTransportListener};

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Address in use: {0}")]
    AddressInUse(String),

    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// A point-to-point transport able to dial and listen
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to a remote endpoint
    async fn dial(&self, addr: &str) -> Result<Box<dyn Socket>, TransportError>;

    /// Start accepting connections on `addr`
    async fn listen(&self, addr: &str) -> Result<Box<dyn TransportListener>, TransportError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// One established, ordered, message-framed connection.
///
/// `send` and `recv` take `&self` so that a reader task and a writer task
/// can share the socket.
#[async_trait]
pub trait Socket: Send + Sync {
    /// Send one frame
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Receive one frame
    async fn recv(&self) -> Result<Bytes, TransportError>;

    /// Close the connection; pending and future calls fail with `Closed`
    async fn close(&self) -> Result<(), TransportError>;

    /// Local address
    fn local(&self) -> &str;

    /// Remote address
    fn remote(&self) -> &str;
}

/// Accepts inbound sockets
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// Wait for the next inbound connection
    async fn accept(&self) -> Result<Box<dyn Socket>, TransportError>;

    /// Address actually bound (useful when binding to port 0)
    fn addr(&self) -> &str;

    /// Stop accepting connections
    async fn close(&self) -> Result<(), TransportError>;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
    /// Largest frame accepted from the wire
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            nodelay: true,
            // Encoded message limit plus nonce and tag
            max_frame_size: crate::protocol::MAX_MESSAGE_SIZE
                + crate::crypto::NONCE_LEN
                + crate::crypto::TAG_LEN,
        }
    }
}
