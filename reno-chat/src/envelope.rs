//! Wire envelope and its framing.
//!
//! Every frame exchanged between peers is an [`Envelope`].  This module is
//! responsible for:
//! - Defining the envelope fields and the ACK / heartbeat payload bodies.
//! - Computing and verifying the integrity checksum.
//! - Encoding an envelope into a length-prefixed frame and decoding a frame
//!   body back into an envelope.
//!
//! No I/O happens here — [`crate::transport`] owns the byte stream.
//!
//! # Frame layout
//!
//! ```text
//! +--------+--------+--------+--------+----------------------------+
//! |          body length (u32, BE)    |  JSON envelope body ...    |
//! +--------+--------+--------+--------+----------------------------+
//! ```
//!
//! The checksum is the first 16 hex digits of SHA-256 over the envelope's
//! canonical fields (everything except the checksum itself).  A frame whose
//! checksum does not verify still *decodes*; deciding what to do with it is
//! the receiver's business.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::FrameError;

/// Byte length of the frame length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Hex digits of SHA-256 kept as the checksum.
const CHECKSUM_LEN: usize = 16;

/// Heartbeat probe payload.
pub const PING: &str = "ping";
/// Heartbeat reply payload.
pub const PONG: &str = "pong";

/// Envelope priority levels.
pub mod priority {
    pub const NORMAL: u8 = 1;
    /// ACKs and heartbeats.
    pub const HIGH: u8 = 2;
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Identifier of one envelope, unique within an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// Shared, monotonically increasing [`MessageId`] source.
#[derive(Debug, Clone, Default)]
pub struct MessageIds(Arc<AtomicU64>);

impl MessageIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> MessageId {
        MessageId(self.0.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Frame classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// Chat payload.
    Data,
    Ack,
    Heartbeat,
    /// Session join announcement; sequenced like data.
    Join,
    /// Session leave announcement; sequenced like data.
    Leave,
}

impl Kind {
    /// `true` for kinds that are sequenced, acknowledged and retransmitted.
    pub fn is_reliable(self) -> bool {
        matches!(self, Kind::Data | Kind::Join | Kind::Leave)
    }

    fn as_str(self) -> &'static str {
        match self {
            Kind::Data => "data",
            Kind::Ack => "ack",
            Kind::Heartbeat => "heartbeat",
            Kind::Join => "join",
            Kind::Leave => "leave",
        }
    }
}

/// One protocol frame.
///
/// For reliable kinds `sequence_number` is the sender-assigned sequence; for
/// [`Kind::Ack`] it is the receiver's cumulative acknowledgement (highest
/// contiguous sequence received); heartbeats carry 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: MessageId,
    #[serde(rename = "type")]
    pub kind: Kind,
    pub sender: String,
    pub payload: String,
    /// Milliseconds since the Unix epoch at creation.
    pub timestamp: u64,
    pub checksum: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    pub sequence_number: u64,
}

fn default_priority() -> u8 {
    priority::NORMAL
}

impl Envelope {
    /// Build an envelope stamped with the current time and a valid checksum.
    pub fn new(
        message_id: MessageId,
        kind: Kind,
        sender: &str,
        payload: String,
        sequence_number: u64,
    ) -> Self {
        let priority = if kind.is_reliable() {
            priority::NORMAL
        } else {
            priority::HIGH
        };
        let mut env = Self {
            message_id,
            kind,
            sender: sender.to_string(),
            payload,
            timestamp: unix_millis(),
            checksum: String::new(),
            priority,
            sequence_number,
        };
        env.seal();
        env
    }

    /// Cumulative ACK advertising `body.window`.
    pub fn ack(message_id: MessageId, sender: &str, cumulative: u64, body: &AckBody) -> Self {
        Self::new(message_id, Kind::Ack, sender, body.to_payload(), cumulative)
    }

    /// Heartbeat probe or reply (`payload` is [`PING`] or [`PONG`]).
    pub fn heartbeat(message_id: MessageId, sender: &str, payload: &str) -> Self {
        Self::new(message_id, Kind::Heartbeat, sender, payload.to_string(), 0)
    }

    /// Recompute and store the checksum after editing fields.
    pub fn seal(&mut self) {
        self.checksum = checksum(&self.canonical_bytes());
    }

    /// `true` when the stored checksum matches the envelope's fields.
    pub fn is_valid(&self) -> bool {
        verify(&self.canonical_bytes(), &self.checksum)
    }

    /// Parse the payload of an ACK envelope.
    pub fn ack_body(&self) -> Result<AckBody, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }

    fn canonical_bytes(&self) -> Vec<u8> {
        format!(
            "{}{}{}{}{}{}{}",
            self.message_id.0,
            self.kind.as_str(),
            self.sender,
            self.payload,
            self.timestamp,
            self.priority,
            self.sequence_number
        )
        .into_bytes()
    }
}

/// Payload of a [`Kind::Ack`] envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckBody {
    /// Sequence of the data frame that triggered this ACK; `None` for a pure
    /// window update.
    pub ack_for: Option<u64>,
    /// Messages the ACK's sender is currently willing to accept.
    pub window: u32,
}

impl AckBody {
    fn to_payload(self) -> String {
        serde_json::json!({ "ack_for": self.ack_for, "window": self.window }).to_string()
    }
}

// ---------------------------------------------------------------------------
// Integrity
// ---------------------------------------------------------------------------

/// Truncated SHA-256 hex digest of `bytes`.
pub fn checksum(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = hex::encode(digest);
    hex.truncate(CHECKSUM_LEN);
    hex
}

/// `true` when `expected` is the checksum of `bytes`.
pub fn verify(bytes: &[u8], expected: &str) -> bool {
    checksum(bytes) == expected
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Serialise `env` into a length-prefixed frame.
pub fn encode(env: &Envelope) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(env)?;
    let len = u32::try_from(body.len()).map_err(|_| FrameError::TooLarge {
        len: body.len(),
        limit: u32::MAX as usize,
    })?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Size of `env` on the wire, length prefix included.
pub fn encoded_len(env: &Envelope) -> Result<usize, FrameError> {
    Ok(LENGTH_PREFIX + serde_json::to_vec(env)?.len())
}

/// Parse a frame body (without its length prefix).
pub fn decode(body: &[u8]) -> Result<Envelope, FrameError> {
    Ok(serde_json::from_slice(body)?)
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
