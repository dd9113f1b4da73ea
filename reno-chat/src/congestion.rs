//! Reno congestion control over message-sized segments.
//!
//! [`CongestionController`] owns the congestion window and the phase machine:
//!
//! ```text
//!                 cwnd ≥ ssthresh
//!   SlowStart ─────────────────────▶ CongestionAvoidance
//!      ▲  │                                 │
//!      │  │ 3 dup ACKs        3 dup ACKs    │
//!      │  ▼                                 ▼
//!      │  FastRecovery ◀────────────────────┘
//!      │      │ hca ≥ recover ──▶ CongestionAvoidance
//!      │
//!      └── timeout (from any phase)
//! ```
//!
//! The window is counted in messages, not bytes.  This module only tracks
//! state; deciding what to resend is [`crate::retransmit`]'s job.

use std::fmt;

use crate::config::Config;

/// Floor applied to `ssthresh` on every loss event.
const MIN_SSTHRESH: f64 = 2.0;

/// Duplicate ACKs already counted when fast recovery inflates the window.
const FAST_RECOVERY_INFLATION: f64 = 3.0;

/// Congestion-control phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    SlowStart,
    CongestionAvoidance,
    FastRecovery,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::SlowStart => "slow_start",
            Phase::CongestionAvoidance => "congestion_avoidance",
            Phase::FastRecovery => "fast_recovery",
        };
        f.write_str(name)
    }
}

/// Window / threshold / phase for one connection.
#[derive(Debug, Clone)]
pub struct CongestionController {
    initial_cwnd: f64,
    cwnd: f64,
    ssthresh: f64,
    phase: Phase,
    /// Highest sequence outstanding when the current loss episode started.
    recover: u64,
}

impl CongestionController {
    pub fn new(config: &Config) -> Self {
        Self {
            initial_cwnd: config.initial_cwnd,
            cwnd: config.initial_cwnd,
            ssthresh: config.slow_start_threshold,
            phase: Phase::SlowStart,
            recover: 0,
        }
    }

    pub fn cwnd(&self) -> f64 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> f64 {
        self.ssthresh
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// New messages the window allows on top of `in_flight`.
    pub fn available_quota(&self, in_flight: usize) -> usize {
        (self.cwnd.floor() as usize).saturating_sub(in_flight)
    }

    /// A cumulative ACK advanced the left edge by `newly_acked` messages,
    /// up to and including `highest_acked`.
    pub fn on_new_ack(&mut self, newly_acked: usize, highest_acked: u64) {
        match self.phase {
            Phase::SlowStart => {
                for _ in 0..newly_acked {
                    if self.phase == Phase::SlowStart {
                        self.cwnd += 1.0;
                        if self.cwnd >= self.ssthresh {
                            self.phase = Phase::CongestionAvoidance;
                        }
                    } else {
                        self.cwnd += 1.0 / self.cwnd;
                    }
                }
            }
            Phase::CongestionAvoidance => {
                for _ in 0..newly_acked {
                    self.cwnd += 1.0 / self.cwnd;
                }
            }
            Phase::FastRecovery => {
                if highest_acked >= self.recover {
                    self.cwnd = self.ssthresh;
                    self.phase = Phase::CongestionAvoidance;
                    log::debug!("[cc] recovery complete; cwnd={:.2}", self.cwnd);
                } else {
                    // Partial ACK: deflate by what left the network.
                    self.cwnd = (self.cwnd - newly_acked as f64).max(1.0);
                }
            }
        }
    }

    /// Third duplicate ACK.  Returns `true` when a loss episode starts and the
    /// oldest outstanding message should be resent; `false` while already in
    /// fast recovery.
    pub fn on_fast_retransmit(&mut self, highest_sent: u64) -> bool {
        if self.phase == Phase::FastRecovery {
            return false;
        }
        self.ssthresh = (self.cwnd / 2.0).max(MIN_SSTHRESH);
        self.cwnd = self.ssthresh + FAST_RECOVERY_INFLATION;
        self.phase = Phase::FastRecovery;
        self.recover = highest_sent;
        log::debug!(
            "[cc] fast retransmit; ssthresh={:.2} cwnd={:.2} recover={}",
            self.ssthresh,
            self.cwnd,
            self.recover
        );
        true
    }

    /// Retransmission timeout: collapse to the initial window and slow start.
    pub fn on_timeout(&mut self) {
        self.ssthresh = (self.cwnd / 2.0).max(MIN_SSTHRESH);
        self.cwnd = self.initial_cwnd;
        self.phase = Phase::SlowStart;
        log::debug!("[cc] timeout; ssthresh={:.2} cwnd={:.2}", self.ssthresh, self.cwnd);
    }
}
