//! `reno-chat` — TCP-Reno-style reliability and congestion control for chat
//! messages carried over TCP.
//!
//! # Architecture
//!
//! ```text
//!   session layer ── enqueue / close ──▶ ┌──────────┐ ◀── Event ── (Delivered,
//!                                        │  Engine  │      DeliveryFailed, Closed)
//!                                        └────┬─────┘
//!                                             │ Command (one channel per connection)
//!                                        ┌────▼─────────────────────────────┐
//!   reader task ── Inbound ────────────▶ │  pump  (owns ConnectionState)    │ ──▶ writer task
//!   (simulator)                          │   ├── Sequencer                  │
//!                                        │   ├── RttEstimator               │
//!                                        │   ├── CongestionController       │
//!                                        │   ├── FlowController / Receiver  │
//!                                        │   ├── RetransmissionManager      │
//!                                        │   └── HeartbeatMonitor           │
//!                                        └──────────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`envelope`]    — wire envelope, checksum, length-prefixed JSON framing
//! - [`transport`]   — envelope reader / writer over async byte streams
//! - [`sequencer`]   — sequence assignment and cumulative-ACK classification
//! - [`rtt`]         — SRTT / RTTVAR estimation and the RTO
//! - [`congestion`]  — Reno congestion window and phase machine
//! - [`retransmit`]  — in-flight table and deadline heap
//! - [`flow`]        — advertised-window flow control
//! - [`receiver`]    — inbound resequencing
//! - [`heartbeat`]   — liveness probes
//! - [`state`]       — sans-I/O per-connection state machine
//! - [`pump`]        — per-connection actor driving [`state`]
//! - [`engine`]      — connection registry and session-layer API
//! - [`simulator`]   — optional inbound fault injection
//! - [`stats`]       — per-connection and aggregate statistics
//! - [`config`]      — tuning knobs
//! - [`error`]       — error and outcome types

pub mod config;
pub mod congestion;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod flow;
pub mod heartbeat;
pub mod pump;
pub mod receiver;
pub mod retransmit;
pub mod rtt;
pub mod sequencer;
pub mod simulator;
pub mod state;
pub mod stats;
pub mod transport;

pub use config::Config;
pub use engine::{Connection, Engine, Event};
pub use envelope::{Envelope, Kind, MessageId};
pub use error::{CloseReason, DeliveryFailure, EngineError, FrameError};
pub use state::ConnectionId;
pub use stats::{AggregateSnapshot, ConnectionStats};
