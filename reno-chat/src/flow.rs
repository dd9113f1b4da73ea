//! Receiver-advertised flow control.
//!
//! Two halves live here:
//! - [`FlowController`] — send side: remembers the window the peer last
//!   advertised and combines it with the congestion quota.
//! - [`ReceiveWindow`] — receive side: turns local buffer occupancy into the
//!   window this endpoint advertises on every ACK.
//!
//! A window of 0 stalls the sender; it never closes the connection.

use crate::congestion::CongestionController;

/// Send-side view of the peer's receive window.
#[derive(Debug, Clone)]
pub struct FlowController {
    peer_window: u32,
}

impl FlowController {
    /// Start by assuming the peer offers `initial_window` until it says
    /// otherwise.
    pub fn new(initial_window: u32) -> Self {
        Self {
            peer_window: initial_window,
        }
    }

    /// Adopt the window carried by an inbound ACK.
    pub fn on_advertisement(&mut self, window: u32) {
        if window != self.peer_window {
            log::debug!("[flow] peer window {} → {}", self.peer_window, window);
        }
        self.peer_window = window;
    }

    pub fn peer_window(&self) -> u32 {
        self.peer_window
    }

    /// New messages the peer's window allows on top of `in_flight`.
    pub fn available(&self, in_flight: usize) -> usize {
        (self.peer_window as usize).saturating_sub(in_flight)
    }

    /// Combined admission quota: `min(congestion quota, window quota)`.
    pub fn send_quota(&self, congestion: &CongestionController, in_flight: usize) -> usize {
        congestion
            .available_quota(in_flight)
            .min(self.available(in_flight))
    }
}

/// Receive-side capacity advertisement.
#[derive(Debug, Clone)]
pub struct ReceiveWindow {
    capacity: u32,
}

impl ReceiveWindow {
    pub fn new(capacity: u32) -> Self {
        Self { capacity }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Window to advertise while `occupied` messages are buffered locally
    /// (undelivered application backlog plus out-of-order holdings).
    pub fn advertise(&self, occupied: usize) -> u32 {
        let occupied = u32::try_from(occupied).unwrap_or(u32::MAX);
        self.capacity.saturating_sub(occupied)
    }
}
