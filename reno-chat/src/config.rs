//! Protocol tuning knobs.
//!
//! Every constant the engine uses lives in [`Config`].  The defaults match
//! the classic chat deployment (5 s ACK timeout, 3 retransmissions, 15 s
//! heartbeat); the binary overrides individual fields from CLI flags.

use std::time::Duration;

use thiserror::Error;

use crate::simulator::RateError;

/// Largest encoded frame accepted from a peer (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Upper bound for every configured timer, heartbeat timeout included.
pub const MAX_TIMER: Duration = Duration::from_secs(24 * 60 * 60);

/// Engine-wide configuration, copied into every connection at attach time.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name placed in the `sender` field of every outbound envelope.
    pub local_name: String,
    /// Congestion window at connection start and after a timeout.
    pub initial_cwnd: f64,
    /// Initial slow-start threshold.
    pub slow_start_threshold: f64,
    /// Lower bound for the computed RTO.
    pub min_rto: Duration,
    /// Upper bound for the computed and backed-off RTO.
    pub max_rto: Duration,
    /// SRTT gain.
    pub rtt_alpha: f64,
    /// RTTVAR gain.
    pub rtt_beta: f64,
    /// Retransmissions allowed before a message is abandoned.
    pub max_retransmissions: u32,
    /// RTO used before the first RTT sample.
    pub ack_timeout: Duration,
    /// Interval between heartbeat probes.
    pub heartbeat_interval: Duration,
    /// Silent intervals tolerated before the peer is declared dead.
    pub heartbeat_miss_limit: u32,
    /// Messages this endpoint is willing to buffer for its application.
    pub receive_window: u32,
    /// Protocol violations tolerated before the connection is torn down.
    pub max_protocol_violations: u32,
    /// Largest encoded frame accepted from the transport.
    pub max_frame_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_name: "server".to_string(),
            initial_cwnd: 1.0,
            slow_start_threshold: 64.0,
            min_rto: Duration::from_secs(1),
            max_rto: Duration::from_secs(60),
            rtt_alpha: 0.125,
            rtt_beta: 0.25,
            max_retransmissions: 3,
            ack_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_miss_limit: 2,
            receive_window: 64,
            max_protocol_violations: 10,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl Config {
    /// Time without any inbound traffic after which the peer is dead.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval
            .saturating_mul(self.heartbeat_miss_limit)
    }

    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_cwnd < 1.0 {
            return Err(ConfigError::InitialWindow(self.initial_cwnd));
        }
        if self.slow_start_threshold < 0.0 {
            return Err(ConfigError::Threshold(self.slow_start_threshold));
        }
        if self.min_rto.is_zero() || self.min_rto > self.max_rto {
            return Err(ConfigError::RtoBounds {
                min: self.min_rto,
                max: self.max_rto,
            });
        }
        for (name, gain) in [("rtt_alpha", self.rtt_alpha), ("rtt_beta", self.rtt_beta)] {
            if !(gain > 0.0 && gain <= 1.0) {
                return Err(ConfigError::Gain { name, value: gain });
            }
        }
        if self.ack_timeout.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if self.heartbeat_miss_limit == 0 {
            return Err(ConfigError::MissLimit);
        }
        for (name, value) in [
            ("max_rto", self.max_rto),
            ("ack_timeout", self.ack_timeout),
            ("heartbeat_timeout", self.heartbeat_timeout()),
        ] {
            if value > MAX_TIMER {
                return Err(ConfigError::TooLong {
                    name,
                    value,
                    limit: MAX_TIMER,
                });
            }
        }
        if self.receive_window == 0 {
            return Err(ConfigError::ReceiveWindow);
        }
        Ok(())
    }
}

/// Reasons [`Config::validate`] refuses a configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("initial cwnd must be at least 1, got {0}")]
    InitialWindow(f64),
    #[error("slow-start threshold must not be negative, got {0}")]
    Threshold(f64),
    #[error("invalid RTO bounds: min {min:?}, max {max:?}")]
    RtoBounds { min: Duration, max: Duration },
    #[error("{name} must be in (0, 1], got {value}")]
    Gain { name: &'static str, value: f64 },
    #[error("ack timeout and heartbeat interval must be non-zero")]
    ZeroInterval,
    #[error("heartbeat miss limit must be at least 1")]
    MissLimit,
    #[error("{name} of {value:?} exceeds {limit:?}")]
    TooLong {
        name: &'static str,
        value: Duration,
        limit: Duration,
    },
    #[error("receive window must be at least one message")]
    ReceiveWindow,
    #[error("simulator: {0}")]
    Simulator(#[from] RateError),
}
