//! Connection and engine statistics.
//!
//! [`Counters`] is owned by a connection's pump and mutated in place;
//! [`ConnectionStats`] is the immutable snapshot published to readers.
//! [`AggregateStats`] sums lifetime totals across every connection the engine
//! has run.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::congestion::Phase;

/// Running per-connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,    // first transmissions of reliable frames
    pub messages_received: u64, // reliable frames released to the application
    pub acks_sent: u64,
    pub acks_received: u64,
    pub retransmissions: u64, // timeout + fast
    pub fast_retransmits: u64,
    pub timeouts: u64, // expiry sweeps that resent or abandoned something
    pub checksum_errors: u64,
    pub protocol_violations: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStats {
    pub cwnd: f64,
    pub ssthresh: f64,
    pub phase: Phase,
    /// Smoothed RTT in seconds, `None` before the first sample.
    pub srtt: Option<f64>,
    pub rttvar: f64,
    pub rto: Duration,
    pub in_flight_count: usize,
    pub queued_count: usize,
    /// Inbound frames held out of order.
    pub reorder_count: usize,
    /// Total retransmissions (timeout-driven and fast).
    pub retransmit_count: u64,
    /// Loss events: fast-retransmit triggers plus timeout sweeps.
    pub loss_count: u64,
    pub receive_window: u32,
    pub peer_window: u32,
    pub uptime: Duration,
    pub counters: Counters,
}

impl ConnectionStats {
    /// Share of first transmissions that needed a resend.
    pub fn retransmit_ratio(&self) -> f64 {
        if self.counters.messages_sent == 0 {
            0.0
        } else {
            self.retransmit_count as f64 / self.counters.messages_sent as f64
        }
    }
}

/// Engine-wide totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub delivered: u64,
    pub failed: u64,
    pub retransmissions: u64,
    pub checksum_errors: u64,
    pub protocol_violations: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl AggregateSnapshot {
    pub fn active_connections(&self) -> u64 {
        self.connections_opened
            .saturating_sub(self.connections_closed)
    }
}

/// Thread-safe accumulator behind the engine.
#[derive(Debug, Default)]
pub struct AggregateStats {
    inner: Mutex<AggregateSnapshot>,
}

impl AggregateStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.lock().connections_opened += 1;
    }

    /// Fold a closing connection's final counters into the totals.
    pub fn connection_closed(&self, last: &Counters) {
        let mut inner = self.lock();
        inner.connections_closed += 1;
        inner.delivered += last.delivered;
        inner.failed += last.failed;
        inner.retransmissions += last.retransmissions;
        inner.checksum_errors += last.checksum_errors;
        inner.protocol_violations += last.protocol_violations;
        inner.bytes_sent += last.bytes_sent;
        inner.bytes_received += last.bytes_received;
    }

    pub fn snapshot(&self) -> AggregateSnapshot {
        *self.lock()
    }

    // Counters stay meaningful even if a holder panicked mid-update.
    fn lock(&self) -> MutexGuard<'_, AggregateSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
