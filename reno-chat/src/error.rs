//! Error and outcome types shared across the engine.
//!
//! Only [`FrameError`] and [`EngineError`] are returned as `Err`; the other
//! two enums describe *outcomes* that reach the session layer as events.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::envelope::Kind;
use crate::state::ConnectionId;

/// Failures while reading, writing or decoding a frame.
#[derive(Error, Debug)]
pub enum FrameError {
    /// Underlying transport I/O failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The length prefix announced a frame larger than the configured limit.
    #[error("frame of {len} bytes exceeds limit of {limit}")]
    TooLarge { len: usize, limit: usize },
    /// The frame body is not a valid envelope.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The peer closed the stream.
    #[error("transport closed by peer")]
    Eof,
}

/// Misuse of the [`crate::engine::Engine`] API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
    #[error("{0:?} frames are not sequenced")]
    Unsequenced(Kind),
    #[error("engine is shutting down")]
    ShuttingDown,
}

/// Why a connection was torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The session layer asked for the close.
    Local,
    /// The engine is shutting down.
    Shutdown,
    /// No traffic observed for the heartbeat timeout.
    HeartbeatTimeout(Duration),
    /// Too many protocol violations from the peer.
    ProtocolViolations(u32),
    /// The transport failed or the peer hung up.
    Transport(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "closed locally"),
            Self::Shutdown => write!(f, "engine shutdown"),
            Self::HeartbeatTimeout(after) => write!(f, "no heartbeat for {after:?}"),
            Self::ProtocolViolations(n) => write!(f, "{n} protocol violations"),
            Self::Transport(e) => write!(f, "transport failure: {e}"),
        }
    }
}

/// Why a message will never be acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// Every allowed retransmission timed out.
    RetriesExhausted { retransmissions: u32 },
    /// The encoded frame would exceed the peer's frame size limit.
    TooLarge { len: usize, limit: usize },
    /// The connection closed while the message was queued or in flight.
    ConnectionClosed(CloseReason),
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetriesExhausted { retransmissions } => {
                write!(f, "no ACK after {retransmissions} retransmissions")
            }
            Self::TooLarge { len, limit } => {
                write!(f, "frame of {len} bytes exceeds limit of {limit}")
            }
            Self::ConnectionClosed(reason) => write!(f, "connection closed ({reason})"),
        }
    }
}
