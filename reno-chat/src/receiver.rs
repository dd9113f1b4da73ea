//! Inbound resequencing for reliable frames.
//!
//! [`Receiver`] accepts sequenced frames from the peer:
//!
//! - An **in-order** frame (seq == highest contiguous + 1) is released to the
//!   application together with any buffered successors it unblocks.
//! - An **out-of-order** frame is held until the gap fills.
//! - A **duplicate** (already released or already held) is dropped, but the
//!   caller still ACKs it so a sender that retransmitted spuriously moves on.
//! - A new frame that arrives while the advertised window is 0 is
//!   **refused**: dropped without an ACK, left to the sender's timeout.  An
//!   out-of-order frame is also refused when it would take the last free
//!   slot, which stays reserved for the frame that fills the gap.
//!
//! After every non-refused frame the caller sends a cumulative ACK carrying
//! [`Receiver::ack_number`] and the advertised window.

use std::collections::BTreeMap;

use crate::envelope::Envelope;
use crate::flow::ReceiveWindow;

/// What happened to one inbound reliable frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arrival {
    /// Frames now deliverable to the application, in sequence order.
    InOrder(Vec<Envelope>),
    /// Held out of order.
    Buffered,
    /// Already seen.
    Duplicate,
    /// No room; dropped without acknowledgement.
    Refused,
}

/// Receive-side sequencing state for one connection.
#[derive(Debug)]
pub struct Receiver {
    /// Highest sequence such that every sequence ≤ it has been released.
    highest_contiguous: u64,
    /// Out-of-order frames waiting for the gap below them to fill.
    reorder: BTreeMap<u64, Envelope>,
    window: ReceiveWindow,
}

impl Receiver {
    pub fn new(capacity: u32) -> Self {
        Self {
            highest_contiguous: 0,
            reorder: BTreeMap::new(),
            window: ReceiveWindow::new(capacity),
        }
    }

    /// Cumulative ACK value to place in the next ACK.
    pub fn ack_number(&self) -> u64 {
        self.highest_contiguous
    }

    /// Frames held out of order.
    pub fn buffered(&self) -> usize {
        self.reorder.len()
    }

    /// Window to advertise while the application has `backlog` undelivered
    /// frames.
    pub fn advertised_window(&self, backlog: usize) -> u32 {
        self.window.advertise(backlog + self.reorder.len())
    }

    /// Process one checksum-valid reliable frame.
    pub fn on_data(&mut self, envelope: Envelope, backlog: usize) -> Arrival {
        let seq = envelope.sequence_number;
        if seq <= self.highest_contiguous || self.reorder.contains_key(&seq) {
            return Arrival::Duplicate;
        }
        let in_order = seq == self.highest_contiguous + 1;
        let needed = if in_order { 1 } else { 2 };
        if self.advertised_window(backlog) < needed {
            return Arrival::Refused;
        }
        if !in_order {
            self.reorder.insert(seq, envelope);
            return Arrival::Buffered;
        }

        let mut ready = vec![envelope];
        self.highest_contiguous = seq;
        while let Some(next) = self.reorder.remove(&(self.highest_contiguous + 1)) {
            self.highest_contiguous += 1;
            ready.push(next);
        }
        Arrival::InOrder(ready)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
