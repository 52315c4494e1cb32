//! Protocol definitions and constants

use std::time::Duration;
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Truncated message: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
}

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum encoded message size (4 MB)
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Capacity of every bounded queue (link send queue, session receive queue,
/// listener accept queue)
pub const QUEUE_CAPACITY: usize = 128;

/// Session id shared by every sender on a multicast listener
pub const MULTICAST_SESSION: &str = "multicast";

/// Token used when none is configured. Every deployment should override it.
pub const DEFAULT_TOKEN: &str = "meshtun.default-token";

/// Default socket read deadline; the keepalive period is 9/10 of it
pub const READ_DEADLINE: Duration = Duration::from_secs(30);

/// Default socket write deadline
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// How often idle channels are pruned from a link
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// How long a channel may stay idle on a link before it is forgotten
pub const CHANNEL_TTL: Duration = Duration::from_secs(120);

/// Backoff before redialing a dead outbound link
pub const RECONNECT_TIME: Duration = Duration::from_secs(5);

/// How often listening channels are re-announced on every link
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30);

/// Default time a dial waits for the remote accept
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for the best-effort close notification of a session
pub const CLOSE_SEND_TIMEOUT: Duration = Duration::from_millis(10);
