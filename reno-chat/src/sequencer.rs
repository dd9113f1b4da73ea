//! Send-side sequence numbers and cumulative-ACK bookkeeping.
//!
//! # Sequence-number layout
//!
//! ```text
//!   highest_contiguous_acked        next
//!            │                       │
//!  ──────────┼───────────────────────┼──────────────▶ seq space
//!  acked     │ <── sent / queued ──▶ │ <── unassigned
//! ```
//!
//! Sequence numbers start at 1 and are never reused; `0` means "nothing
//! acknowledged yet".  ACKs are cumulative: an ACK carrying `n` tells us the
//! peer holds every message up to and including `n`.

/// Classification of one inbound cumulative ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckEvent {
    /// The left edge moved forward by `newly_acked` messages to `through`.
    New { newly_acked: u64, through: u64 },
    /// Repeat of the current left edge.  `fast_retransmit` is set on exactly
    /// the third duplicate of a loss episode.
    Duplicate { count: u32, fast_retransmit: bool },
    /// Repeat of the left edge that does not count as a duplicate (window
    /// update, or nothing outstanding).
    Update,
    /// Behind the current left edge.
    Stale,
}

/// Duplicate ACKs that trigger a fast retransmit.
pub const DUP_ACK_THRESHOLD: u32 = 3;

/// Sequence state for one connection.
#[derive(Debug, Clone)]
pub struct Sequencer {
    next: u64,
    highest_contiguous_acked: u64,
    duplicate_ack_count: u32,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Self {
            next: 1,
            highest_contiguous_acked: 0,
            duplicate_ack_count: 0,
        }
    }

    /// Hand out the next sequence number.
    pub fn assign(&mut self) -> u64 {
        let seq = self.next;
        self.next += 1;
        seq
    }

    /// The sequence number the next [`assign`](Self::assign) will return.
    pub fn sequence_next(&self) -> u64 {
        self.next
    }

    pub fn highest_contiguous_acked(&self) -> u64 {
        self.highest_contiguous_acked
    }

    pub fn duplicate_ack_count(&self) -> u32 {
        self.duplicate_ack_count
    }

    /// Process cumulative ACK `n`.
    ///
    /// `counts_as_duplicate` is `true` when the ACK was provoked by a data
    /// arrival while data is outstanding; window updates and heartbeat-era
    /// repeats must not feed the duplicate run.  The caller validates that `n`
    /// does not exceed the highest sequence ever sent.
    pub fn on_ack(&mut self, n: u64, counts_as_duplicate: bool) -> AckEvent {
        if n > self.highest_contiguous_acked {
            let newly_acked = n - self.highest_contiguous_acked;
            self.highest_contiguous_acked = n;
            self.duplicate_ack_count = 0;
            return AckEvent::New {
                newly_acked,
                through: n,
            };
        }
        if n < self.highest_contiguous_acked {
            return AckEvent::Stale;
        }
        if !counts_as_duplicate {
            return AckEvent::Update;
        }
        self.duplicate_ack_count = self.duplicate_ack_count.saturating_add(1);
        AckEvent::Duplicate {
            count: self.duplicate_ack_count,
            fast_retransmit: self.duplicate_ack_count == DUP_ACK_THRESHOLD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_is_strictly_increasing() {
        let mut s = Sequencer::new();
        assert_eq!(s.assign(), 1);
        assert_eq!(s.assign(), 2);
        assert_eq!(s.assign(), 3);
        assert_eq!(s.sequence_next(), 4);
    }

    #[test]
    fn in_order_ack_advances_edge() {
        let mut s = Sequencer::new();
        s.assign();
        assert_eq!(
            s.on_ack(1, true),
            AckEvent::New {
                newly_acked: 1,
                through: 1
            }
        );
        assert_eq!(s.highest_contiguous_acked(), 1);
    }

    #[test]
    fn cumulative_jump_covers_several() {
        let mut s = Sequencer::new();
        for _ in 0..5 {
            s.assign();
        }
        assert_eq!(
            s.on_ack(4, true),
            AckEvent::New {
                newly_acked: 4,
                through: 4
            }
        );
    }

    #[test]
    fn third_duplicate_triggers_once() {
        let mut s = Sequencer::new();
        for _ in 0..6 {
            s.assign();
        }
        s.on_ack(1, true);

        let triggers: Vec<bool> = (0..6)
            .map(|_| match s.on_ack(1, true) {
                AckEvent::Duplicate {
                    fast_retransmit, ..
                } => fast_retransmit,
                other => panic!("expected duplicate, got {other:?}"),
            })
            .collect();
        assert_eq!(triggers, [false, false, true, false, false, false]);
        assert_eq!(s.duplicate_ack_count(), 6);
    }

    #[test]
    fn new_ack_rearms_trigger() {
        let mut s = Sequencer::new();
        for _ in 0..6 {
            s.assign();
        }
        for _ in 0..3 {
            s.on_ack(0, true);
        }
        s.on_ack(2, true);
        assert_eq!(s.duplicate_ack_count(), 0);
        s.on_ack(2, true);
        s.on_ack(2, true);
        assert_eq!(
            s.on_ack(2, true),
            AckEvent::Duplicate {
                count: 3,
                fast_retransmit: true
            }
        );
    }

    #[test]
    fn window_update_is_not_a_duplicate() {
        let mut s = Sequencer::new();
        s.assign();
        assert_eq!(s.on_ack(0, false), AckEvent::Update);
        assert_eq!(s.duplicate_ack_count(), 0);
    }

    #[test]
    fn stale_ack_ignored() {
        let mut s = Sequencer::new();
        for _ in 0..3 {
            s.assign();
        }
        s.on_ack(3, true);
        assert_eq!(s.on_ack(2, true), AckEvent::Stale);
        assert_eq!(s.highest_contiguous_acked(), 3);
    }
}
