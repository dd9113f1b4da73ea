//! Round-trip time estimation and retransmission timeout.
//!
//! [`RttEstimator`] keeps the smoothed RTT (SRTT) and its variance (RTTVAR)
//! using Jacobson's algorithm (RFC 6298 §2):
//!
//! ```text
//! first sample:  SRTT = R,  RTTVAR = R/2
//! later:         RTTVAR = (1 − β)·RTTVAR + β·|SRTT − R|
//!                SRTT   = (1 − α)·SRTT   + α·R
//! RTO = clamp(SRTT + 4·RTTVAR, min_rto, max_rto)
//! ```
//!
//! Before the first sample the RTO is the configured ACK timeout.  On a
//! retransmission timeout the caller backs the RTO off exponentially; the next
//! clean sample recomputes it from the estimates.

use std::time::Duration;

use crate::config::Config;

/// RTT / RTO state for one connection.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    alpha: f64,
    beta: f64,
    min_rto: Duration,
    max_rto: Duration,
    /// Smoothed RTT in seconds; `None` until the first sample.
    srtt: Option<f64>,
    /// RTT variance in seconds.
    rttvar: f64,
    rto: Duration,
}

impl RttEstimator {
    pub fn new(config: &Config) -> Self {
        Self {
            alpha: config.rtt_alpha,
            beta: config.rtt_beta,
            min_rto: config.min_rto,
            max_rto: config.max_rto,
            srtt: None,
            rttvar: 0.0,
            rto: config.ack_timeout.min(config.max_rto),
        }
    }

    /// Fold a clean (never retransmitted) RTT sample into the estimate.
    pub fn on_sample(&mut self, sample: Duration) {
        let r = sample.as_secs_f64();
        match self.srtt {
            None => {
                self.srtt = Some(r);
                self.rttvar = r / 2.0;
            }
            Some(srtt) => {
                self.rttvar = (1.0 - self.beta) * self.rttvar + self.beta * (srtt - r).abs();
                self.srtt = Some((1.0 - self.alpha) * srtt + self.alpha * r);
            }
        }
        let srtt = self.srtt.unwrap_or(r);
        let rto = Duration::try_from_secs_f64(srtt + 4.0 * self.rttvar).unwrap_or(self.max_rto);
        self.rto = rto.clamp(self.min_rto, self.max_rto);
    }

    /// Double the RTO after a retransmission timeout, capped at `max_rto`.
    pub fn back_off(&mut self) {
        self.rto = self.rto.saturating_mul(2).min(self.max_rto);
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Smoothed RTT in seconds, if any sample has been taken.
    pub fn srtt(&self) -> Option<f64> {
        self.srtt
    }

    pub fn rttvar(&self) -> f64 {
        self.rttvar
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn rto_starts_at_ack_timeout() {
        let est = RttEstimator::new(&Config::default());
        assert_eq!(est.rto(), Duration::from_secs(5));
        assert_eq!(est.srtt(), None);
    }

    #[test]
    fn first_sample_is_floored_at_min_rto() {
        let mut est = RttEstimator::new(&Config::default());
        est.on_sample(Duration::from_millis(200));
        approx(est.srtt().unwrap(), 0.2);
        approx(est.rttvar(), 0.1);
        // 0.2 + 4 × 0.1 = 0.6 s, below the 1 s floor.
        assert_eq!(est.rto(), Duration::from_secs(1));
    }

    #[test]
    fn later_samples_use_gains() {
        let mut est = RttEstimator::new(&Config::default());
        est.on_sample(Duration::from_secs(2));
        est.on_sample(Duration::from_secs(4));
        // rttvar = 0.75 × 1 + 0.25 × |2 − 4| = 1.25; srtt = 0.875 × 2 + 0.125 × 4 = 2.25
        approx(est.rttvar(), 1.25);
        approx(est.srtt().unwrap(), 2.25);
        assert_eq!(est.rto(), Duration::from_secs_f64(2.25 + 5.0));
    }

    #[test]
    fn large_samples_are_capped_at_max_rto() {
        let mut est = RttEstimator::new(&Config::default());
        est.on_sample(Duration::from_secs(40));
        assert_eq!(est.rto(), Duration::from_secs(60));
    }

    #[test]
    fn back_off_doubles_until_cap() {
        let mut est = RttEstimator::new(&Config::default());
        est.back_off();
        assert_eq!(est.rto(), Duration::from_secs(10));
        for _ in 0..10 {
            est.back_off();
        }
        assert_eq!(est.rto(), Duration::from_secs(60));
    }

    #[test]
    fn back_off_saturates_instead_of_overflowing() {
        let mut est = RttEstimator::new(&Config {
            ack_timeout: Duration::MAX,
            max_rto: Duration::MAX,
            ..Config::default()
        });
        est.back_off();
        assert_eq!(est.rto(), Duration::MAX);
    }

    #[test]
    fn clean_sample_after_back_off_recomputes() {
        let mut est = RttEstimator::new(&Config::default());
        est.back_off();
        est.back_off();
        est.on_sample(Duration::from_millis(500));
        // 0.5 + 4 × 0.25 = 1.5 s
        assert_eq!(est.rto(), Duration::from_millis(1500));
    }
}
