//! Unacknowledged-message tracking and retransmission scheduling.
//!
//! [`RetransmissionManager`] holds every message that has been sent but not
//! yet cumulatively acknowledged, keyed by sequence number.  Deadlines for all
//! entries share one min-heap; re-arming an entry pushes a fresh heap item and
//! bumps the entry's generation so the old item is skipped when it surfaces.
//!
//! # Contract
//!
//! - Entries leave only through [`acknowledge_through`] or abandonment.
//! - Timeout: `retry_count += 1`; past the limit the entry is abandoned,
//!   otherwise the caller resends the identical envelope via [`resend`].
//! - Fast retransmit resends the oldest entry without touching `retry_count`.
//!
//! This module only manages state; all transport I/O is the caller's
//! responsibility.
//!
//! [`acknowledge_through`]: RetransmissionManager::acknowledge_through
//! [`resend`]: RetransmissionManager::resend

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::time::Duration;

use tokio::time::Instant;

use crate::envelope::{Envelope, MessageId};

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// A message on the wire awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct InFlight {
    /// The frame exactly as first sent; retransmissions reuse it unchanged.
    pub envelope: Envelope,
    /// Time of the most recent transmission.
    pub sent_at: Instant,
    /// Timeout-driven retransmissions so far.
    pub retry_count: u32,
    /// Set after any retransmission; such entries give no RTT sample.
    pub retransmitted: bool,
    /// The peer reported holding this message out of order.
    pub selectively_acked: bool,
    deadline: Instant,
    generation: u64,
}

impl InFlight {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// A message removed by a cumulative ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acked {
    pub seq: u64,
    pub message_id: MessageId,
    /// Round-trip time, present only for never-retransmitted entries.
    pub sample: Option<Duration>,
}

/// A message given up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abandoned {
    pub seq: u64,
    pub message_id: MessageId,
    pub retransmissions: u32,
}

/// Outcome of one deadline sweep.
#[derive(Debug, Default)]
pub struct Expired {
    /// Sequences to resend via [`RetransmissionManager::resend`].
    pub retransmit: Vec<u64>,
    /// Entries that exceeded the retransmission limit and were removed.
    pub abandoned: Vec<Abandoned>,
}

// ---------------------------------------------------------------------------
// RetransmissionManager
// ---------------------------------------------------------------------------

/// In-flight table plus deadline heap for one connection.
#[derive(Debug)]
pub struct RetransmissionManager {
    in_flight: BTreeMap<u64, InFlight>,
    deadlines: BinaryHeap<Reverse<(Instant, u64, u64)>>,
    next_generation: u64,
    highest_sent: u64,
    max_retransmissions: u32,
}

impl RetransmissionManager {
    pub fn new(max_retransmissions: u32) -> Self {
        Self {
            in_flight: BTreeMap::new(),
            deadlines: BinaryHeap::new(),
            next_generation: 0,
            highest_sent: 0,
            max_retransmissions,
        }
    }

    /// Number of messages awaiting acknowledgement.
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Highest sequence ever registered (0 before the first send).
    pub fn highest_sent(&self) -> u64 {
        self.highest_sent
    }

    pub fn get(&self, seq: u64) -> Option<&InFlight> {
        self.in_flight.get(&seq)
    }

    /// Track a just-transmitted message with deadline `now + rto`.
    pub fn register(&mut self, envelope: Envelope, now: Instant, rto: Duration) {
        let seq = envelope.sequence_number;
        debug_assert!(seq > self.highest_sent, "sequence {seq} registered twice");
        self.highest_sent = self.highest_sent.max(seq);
        let generation = self.bump_generation();
        let deadline = now + rto;
        self.in_flight.insert(
            seq,
            InFlight {
                envelope,
                sent_at: now,
                retry_count: 0,
                retransmitted: false,
                selectively_acked: false,
                deadline,
                generation,
            },
        );
        self.deadlines.push(Reverse((deadline, seq, generation)));
    }

    /// Remove every entry with sequence ≤ `through`, oldest first.
    pub fn acknowledge_through(&mut self, through: u64, now: Instant) -> Vec<Acked> {
        let remaining = self.in_flight.split_off(&(through + 1));
        let acked = std::mem::replace(&mut self.in_flight, remaining);
        acked
            .into_iter()
            .map(|(seq, entry)| Acked {
                seq,
                message_id: entry.envelope.message_id,
                sample: (!entry.retransmitted).then(|| now.duration_since(entry.sent_at)),
            })
            .collect()
    }

    /// Record that the peer holds `seq` out of order.  Returns `false` if the
    /// sequence is not in flight.
    pub fn mark_selective(&mut self, seq: u64) -> bool {
        match self.in_flight.get_mut(&seq) {
            Some(entry) => {
                entry.selectively_acked = true;
                true
            }
            None => false,
        }
    }

    /// Earliest live deadline, discarding superseded heap items.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, seq, generation))) = self.deadlines.peek().copied() {
            if self.is_live(seq, generation) {
                return Some(deadline);
            }
            self.deadlines.pop();
        }
        None
    }

    /// Pop every deadline at or before `now`.
    ///
    /// Selectively acknowledged entries are re-armed with `rto` without
    /// counting a retry; the rest either become due for retransmission or are
    /// abandoned once `retry_count` exceeds the limit.
    pub fn expire(&mut self, now: Instant, rto: Duration) -> Expired {
        let mut expired = Expired::default();
        while let Some(Reverse((deadline, seq, generation))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            if !self.is_live(seq, generation) {
                continue;
            }
            let limit = self.max_retransmissions;
            let Some(entry) = self.in_flight.get_mut(&seq) else {
                continue;
            };
            if entry.selectively_acked {
                self.arm(seq, now + rto);
                continue;
            }
            entry.retry_count += 1;
            if entry.retry_count > limit {
                if let Some(entry) = self.in_flight.remove(&seq) {
                    expired.abandoned.push(Abandoned {
                        seq,
                        message_id: entry.envelope.message_id,
                        retransmissions: entry.retry_count - 1,
                    });
                }
            } else {
                expired.retransmit.push(seq);
            }
        }
        expired
    }

    /// Stamp `seq` as retransmitted now and return the frame to put back on
    /// the wire.
    pub fn resend(&mut self, seq: u64, now: Instant, rto: Duration) -> Option<Envelope> {
        let entry = self.in_flight.get_mut(&seq)?;
        entry.sent_at = now;
        entry.retransmitted = true;
        let envelope = entry.envelope.clone();
        self.arm(seq, now + rto);
        Some(envelope)
    }

    /// Resend the oldest entry the peer does not already hold.
    pub fn fast_retransmit(&mut self, now: Instant, rto: Duration) -> Option<(u64, Envelope)> {
        let seq = self
            .in_flight
            .iter()
            .find(|(_, e)| !e.selectively_acked)
            .map(|(seq, _)| *seq)?;
        self.resend(seq, now, rto).map(|env| (seq, env))
    }

    /// Drop every entry (connection teardown), oldest first.
    pub fn abandon_all(&mut self) -> Vec<Abandoned> {
        self.deadlines.clear();
        std::mem::take(&mut self.in_flight)
            .into_iter()
            .map(|(seq, entry)| Abandoned {
                seq,
                message_id: entry.envelope.message_id,
                retransmissions: entry.retry_count,
            })
            .collect()
    }

    fn arm(&mut self, seq: u64, deadline: Instant) {
        let generation = self.bump_generation();
        if let Some(entry) = self.in_flight.get_mut(&seq) {
            entry.deadline = deadline;
            entry.generation = generation;
            self.deadlines.push(Reverse((deadline, seq, generation)));
        }
    }

    fn is_live(&self, seq: u64, generation: u64) -> bool {
        self.in_flight
            .get(&seq)
            .is_some_and(|e| e.generation == generation)
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Kind;

    const RTO: Duration = Duration::from_secs(1);

    fn data(seq: u64) -> Envelope {
        Envelope::new(MessageId(100 + seq), Kind::Data, "a", format!("m{seq}"), seq)
    }

    fn loaded(n: u64, now: Instant) -> RetransmissionManager {
        let mut m = RetransmissionManager::new(3);
        for seq in 1..=n {
            m.register(data(seq), now, RTO);
        }
        m
    }

    #[test]
    fn register_tracks_highest_and_deadline() {
        let now = Instant::now();
        let mut m = loaded(3, now);
        assert_eq!(m.len(), 3);
        assert_eq!(m.highest_sent(), 3);
        assert_eq!(m.next_deadline(), Some(now + RTO));
    }

    #[test]
    fn cumulative_ack_removes_prefix_with_samples() {
        let now = Instant::now();
        let mut m = loaded(4, now);
        let acked = m.acknowledge_through(2, now + Duration::from_millis(300));
        assert_eq!(
            acked.iter().map(|a| a.seq).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(acked[0].message_id, MessageId(101));
        assert_eq!(acked[0].sample, Some(Duration::from_millis(300)));
        assert_eq!(m.len(), 2);
        assert!(m.get(3).is_some());
    }

    #[test]
    fn expiry_counts_retries_then_abandons() {
        let t0 = Instant::now();
        let mut m = loaded(1, t0);
        let mut now = t0;
        for attempt in 1..=3 {
            now += RTO;
            let expired = m.expire(now, RTO);
            assert_eq!(expired.retransmit, vec![1], "attempt {attempt}");
            assert!(expired.abandoned.is_empty());
            assert!(m.resend(1, now, RTO).is_some());
            assert_eq!(m.get(1).unwrap().retry_count, attempt);
        }
        now += RTO;
        let expired = m.expire(now, RTO);
        assert!(expired.retransmit.is_empty());
        assert_eq!(
            expired.abandoned,
            vec![Abandoned {
                seq: 1,
                message_id: MessageId(101),
                retransmissions: 3
            }]
        );
        assert!(m.is_empty());
        assert_eq!(m.next_deadline(), None);
    }

    #[test]
    fn nothing_expires_early() {
        let now = Instant::now();
        let mut m = loaded(2, now);
        let expired = m.expire(now + RTO - Duration::from_millis(1), RTO);
        assert!(expired.retransmit.is_empty());
        assert!(expired.abandoned.is_empty());
    }

    #[test]
    fn resend_supersedes_old_deadline() {
        let t0 = Instant::now();
        let mut m = loaded(1, t0);
        let later = t0 + Duration::from_millis(500);
        m.resend(1, later, RTO);
        assert_eq!(m.next_deadline(), Some(later + RTO));
        // The original deadline is stale and must not fire.
        assert!(m.expire(t0 + RTO, RTO).retransmit.is_empty());
    }

    #[test]
    fn retransmitted_entries_give_no_sample() {
        let now = Instant::now();
        let mut m = loaded(1, now);
        m.resend(1, now + RTO, RTO);
        let acked = m.acknowledge_through(1, now + RTO * 2);
        assert_eq!(acked[0].sample, None);
    }

    #[test]
    fn fast_retransmit_keeps_retry_count() {
        let now = Instant::now();
        let mut m = loaded(3, now);
        let (seq, env) = m.fast_retransmit(now, RTO).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(env, m.get(1).unwrap().envelope);
        assert_eq!(m.get(1).unwrap().retry_count, 0);
        assert!(m.get(1).unwrap().retransmitted);
    }

    #[test]
    fn fast_retransmit_skips_selectively_acked() {
        let now = Instant::now();
        let mut m = loaded(3, now);
        assert!(m.mark_selective(1));
        assert!(!m.mark_selective(9));
        let (seq, _) = m.fast_retransmit(now, RTO).unwrap();
        assert_eq!(seq, 2);
    }

    #[test]
    fn selectively_acked_entries_rearm_without_retry() {
        let t0 = Instant::now();
        let mut m = loaded(1, t0);
        m.mark_selective(1);
        let expired = m.expire(t0 + RTO, RTO);
        assert!(expired.retransmit.is_empty());
        assert_eq!(m.get(1).unwrap().retry_count, 0);
        assert_eq!(m.next_deadline(), Some(t0 + RTO * 2));
    }

    #[test]
    fn abandon_all_drains_everything() {
        let now = Instant::now();
        let mut m = loaded(3, now);
        let gone = m.abandon_all();
        assert_eq!(gone.len(), 3);
        assert!(m.is_empty());
        assert_eq!(m.next_deadline(), None);
    }
}
