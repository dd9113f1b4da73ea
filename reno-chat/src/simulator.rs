//! Inbound network-condition simulator.
//!
//! TCP never loses or corrupts data, so the recovery paths of the engine
//! would otherwise sit idle.  A [`Simulator`] sits between a connection's
//! frame reader and its pump and applies a configurable fault model to every
//! decoded inbound envelope:
//!
//! | Fault       | Description                                         |
//! |-------------|-----------------------------------------------------|
//! | Loss        | Drop the frame with probability `loss_rate`.        |
//! | Duplication | Deliver the frame twice.                            |
//! | Corruption  | Alter the payload so the checksum no longer holds.  |
//! | Delay       | Hold every frame for a fixed `delay` before use.    |
//!
//! The RNG is seedable so a failing run can be replayed exactly.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::envelope::Envelope;

/// Fault model.  All probabilities are in `[0.0, 1.0]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulatorConfig {
    /// Probability that a frame is silently dropped.
    pub loss_rate: f64,
    /// Probability that a surviving frame is delivered twice.
    pub duplicate_rate: f64,
    /// Probability that a surviving frame is corrupted.
    pub corrupt_rate: f64,
    /// Fixed delay applied to every inbound frame.
    pub delay: Duration,
    /// RNG seed; `None` seeds from the OS.
    pub seed: Option<u64>,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{name} must be within [0, 1], got {value}")]
pub struct RateError {
    pub name: &'static str,
    pub value: f64,
}

impl SimulatorConfig {
    /// `true` when the simulator would pass every frame through untouched.
    pub fn is_transparent(&self) -> bool {
        self.loss_rate == 0.0
            && self.duplicate_rate == 0.0
            && self.corrupt_rate == 0.0
            && self.delay.is_zero()
    }

    pub fn validate(&self) -> Result<(), RateError> {
        for (name, value) in [
            ("loss_rate", self.loss_rate),
            ("duplicate_rate", self.duplicate_rate),
            ("corrupt_rate", self.corrupt_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(RateError { name, value });
            }
        }
        Ok(())
    }
}

/// Fault injector for one connection's inbound stream.
#[derive(Debug)]
pub struct Simulator {
    config: SimulatorConfig,
    rng: StdRng,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self { config, rng }
    }

    /// Delay to wait before handing a frame on.
    pub fn delay(&self) -> Duration {
        self.config.delay
    }

    /// Apply the fault model to one frame; returns the copies that survive
    /// (none, one or two).
    pub fn apply(&mut self, mut envelope: Envelope) -> Vec<Envelope> {
        if self.roll(self.config.loss_rate) {
            log::debug!("[sim] dropping {}", envelope.message_id);
            return Vec::new();
        }
        if self.roll(self.config.corrupt_rate) {
            log::debug!("[sim] corrupting {}", envelope.message_id);
            self.corrupt(&mut envelope);
        }
        if self.roll(self.config.duplicate_rate) {
            log::debug!("[sim] duplicating {}", envelope.message_id);
            return vec![envelope.clone(), envelope];
        }
        vec![envelope]
    }

    fn roll(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.random::<f64>() < probability
    }

    // Insert a stray byte into the payload; the stored checksum goes stale.
    fn corrupt(&mut self, envelope: &mut Envelope) {
        let boundaries: Vec<usize> = envelope
            .payload
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(envelope.payload.len()))
            .collect();
        let at = boundaries[self.rng.random_range(0..boundaries.len())];
        envelope.payload.insert(at, '~');
    }
}
