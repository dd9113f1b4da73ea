//! Connection liveness.
//!
//! A `ping` goes out every interval whether or not data is flowing.  Any
//! valid inbound frame (a `pong`, an ACK, data) refreshes liveness; silence
//! for `interval × miss_limit` marks the peer dead.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::Config;

/// Heartbeat schedule and liveness clock for one connection.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    last_heartbeat_sent: Instant,
    last_heartbeat_ack: Instant,
}

impl HeartbeatMonitor {
    /// Start the clocks at `now` (connection establishment).
    pub fn new(config: &Config, now: Instant) -> Self {
        Self {
            interval: config.heartbeat_interval,
            timeout: config.heartbeat_timeout(),
            last_heartbeat_sent: now,
            last_heartbeat_ack: now,
        }
    }

    /// A probe should go out.
    pub fn probe_due(&self, now: Instant) -> bool {
        now >= self.next_probe()
    }

    pub fn record_probe(&mut self, now: Instant) {
        self.last_heartbeat_sent = now;
    }

    /// Any valid inbound traffic.
    pub fn record_traffic(&mut self, now: Instant) {
        self.last_heartbeat_ack = now;
    }

    /// No traffic for the whole timeout.
    pub fn is_dead(&self, now: Instant) -> bool {
        now >= self.expiry()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn last_heartbeat_sent(&self) -> Instant {
        self.last_heartbeat_sent
    }

    pub fn last_heartbeat_ack(&self) -> Instant {
        self.last_heartbeat_ack
    }

    /// Earliest moment this monitor needs attention.
    pub fn next_deadline(&self) -> Instant {
        self.next_probe().min(self.expiry())
    }

    fn next_probe(&self) -> Instant {
        self.last_heartbeat_sent + self.interval
    }

    fn expiry(&self) -> Instant {
        self.last_heartbeat_ack + self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_miss_limit: 3,
            ..Config::default()
        }
    }

    #[test]
    fn probe_every_interval() {
        let t0 = Instant::now();
        let mut hb = HeartbeatMonitor::new(&config(), t0);
        assert!(!hb.probe_due(t0 + Duration::from_secs(9)));
        assert!(hb.probe_due(t0 + Duration::from_secs(10)));
        hb.record_probe(t0 + Duration::from_secs(10));
        assert!(!hb.probe_due(t0 + Duration::from_secs(15)));
        assert_eq!(hb.next_deadline(), t0 + Duration::from_secs(20));
    }

    #[test]
    fn silence_kills_after_miss_limit() {
        let t0 = Instant::now();
        let hb = HeartbeatMonitor::new(&config(), t0);
        assert!(!hb.is_dead(t0 + Duration::from_secs(29)));
        assert!(hb.is_dead(t0 + Duration::from_secs(30)));
    }

    #[test]
    fn traffic_postpones_expiry() {
        let t0 = Instant::now();
        let mut hb = HeartbeatMonitor::new(&config(), t0);
        hb.record_traffic(t0 + Duration::from_secs(25));
        assert!(!hb.is_dead(t0 + Duration::from_secs(40)));
        assert!(hb.is_dead(t0 + Duration::from_secs(55)));
    }
}
