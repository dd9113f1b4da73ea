//! Per-connection protocol state machine.
//!
//! [`ConnectionState`] wires the sequencer, RTT estimator, congestion and
//! flow controllers, retransmission manager, receiver and heartbeat monitor
//! together.  It performs no I/O: every entry point takes the current time
//! and returns the [`Action`]s the owning pump must carry out, in order.
//!
//! ```text
//!  enqueue ──▶ pending ──admit──▶ in_flight ──ACK──▶ Delivered
//!                 ▲                   │ RTO / 3 dup ACKs
//!                 │                   ▼
//!            quota = 0            Transmit (resend)  ──▶ Failed after N tries
//! ```

use std::collections::VecDeque;
use std::fmt;

use tokio::time::Instant;

use crate::config::Config;
use crate::congestion::CongestionController;
use crate::envelope::{self, AckBody, Envelope, Kind, MessageId, MessageIds, PING, PONG};
use crate::error::{CloseReason, DeliveryFailure};
use crate::flow::FlowController;
use crate::heartbeat::HeartbeatMonitor;
use crate::receiver::{Arrival, Receiver};
use crate::retransmit::RetransmissionManager;
use crate::rtt::RttEstimator;
use crate::sequencer::{AckEvent, Sequencer};
use crate::stats::{ConnectionStats, Counters};

/// Engine-local connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Side effect requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Put this frame on the wire.
    Transmit(Envelope),
    /// Hand an in-order reliable frame to the local application.
    Deliver(Envelope),
    /// The peer acknowledged one of our messages.
    Delivered(MessageId),
    /// One of our messages will never be acknowledged.
    Failed(MessageId, DeliveryFailure),
    /// Tear the connection down.  Always the last action of a batch.
    Close(CloseReason),
}

/// All protocol state of one connection.
#[derive(Debug)]
pub struct ConnectionState {
    local_name: String,
    max_protocol_violations: u32,
    max_frame_size: usize,
    ids: MessageIds,
    sequencer: Sequencer,
    rtt: RttEstimator,
    congestion: CongestionController,
    flow: FlowController,
    retransmit: RetransmissionManager,
    receiver: Receiver,
    heartbeat: HeartbeatMonitor,
    /// Sequenced messages waiting for send quota.
    pending: VecDeque<Envelope>,
    /// Frames handed to the application but not yet consumed.
    app_backlog: usize,
    /// Window carried by the most recent ACK we sent.
    last_advertised: u32,
    counters: Counters,
    loss_count: u64,
    opened_at: Instant,
    closed: Option<CloseReason>,
}

impl ConnectionState {
    pub fn new(config: &Config, ids: MessageIds, now: Instant) -> Self {
        Self {
            local_name: config.local_name.clone(),
            max_protocol_violations: config.max_protocol_violations,
            max_frame_size: config.max_frame_size,
            ids,
            sequencer: Sequencer::new(),
            rtt: RttEstimator::new(config),
            congestion: CongestionController::new(config),
            // Until the peer says otherwise assume it offers what we offer.
            flow: FlowController::new(config.receive_window),
            retransmit: RetransmissionManager::new(config.max_retransmissions),
            receiver: Receiver::new(config.receive_window),
            heartbeat: HeartbeatMonitor::new(config, now),
            pending: VecDeque::new(),
            app_backlog: 0,
            last_advertised: config.receive_window,
            counters: Counters::default(),
            loss_count: 0,
            opened_at: now,
            closed: None,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.closed.as_ref()
    }

    pub fn in_flight(&self) -> usize {
        self.retransmit.len()
    }

    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn congestion(&self) -> &CongestionController {
        &self.congestion
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// The last ACK we sent advertised a zero window.
    pub fn window_closed(&self) -> bool {
        self.last_advertised == 0
    }

    /// Earliest instant at which [`on_tick`](Self::on_tick) has work to do.
    pub fn next_deadline(&mut self) -> Instant {
        let heartbeat = self.heartbeat.next_deadline();
        match self.retransmit.next_deadline() {
            Some(retx) => retx.min(heartbeat),
            None => heartbeat,
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    /// Sequence a reliable message and send it if quota allows.
    pub fn enqueue(
        &mut self,
        message_id: MessageId,
        kind: Kind,
        payload: String,
        now: Instant,
    ) -> Vec<Action> {
        if let Some(reason) = &self.closed {
            self.counters.failed += 1;
            return vec![Action::Failed(
                message_id,
                DeliveryFailure::ConnectionClosed(reason.clone()),
            )];
        }
        debug_assert!(kind.is_reliable(), "{kind:?} is not a sequenced kind");
        let seq = self.sequencer.sequence_next();
        let envelope = Envelope::new(message_id, kind, &self.local_name, payload, seq);
        // The peer would treat an oversized frame as a fatal stream error.
        let len = envelope::encoded_len(&envelope).unwrap_or(usize::MAX);
        if len > self.max_frame_size {
            log::warn!(
                "[state] refusing {message_id}: {len} byte frame exceeds {}",
                self.max_frame_size
            );
            self.counters.failed += 1;
            return vec![Action::Failed(
                message_id,
                DeliveryFailure::TooLarge {
                    len,
                    limit: self.max_frame_size,
                },
            )];
        }
        self.sequencer.assign();
        self.pending.push_back(envelope);
        self.admit(now)
    }

    /// Move as many pending messages onto the wire as the combined congestion
    /// and flow quota allows.
    pub fn admit(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.closed.is_some() {
            return actions;
        }
        let quota = self
            .flow
            .send_quota(&self.congestion, self.retransmit.len());
        for _ in 0..quota {
            let Some(envelope) = self.pending.pop_front() else {
                break;
            };
            self.retransmit
                .register(envelope.clone(), now, self.rtt.rto());
            self.counters.messages_sent += 1;
            actions.push(Action::Transmit(envelope));
        }
        if !self.pending.is_empty() && !actions.is_empty() {
            log::trace!(
                "[state] admitted {}, {} parked (cwnd={:.2} peer_window={})",
                actions.len(),
                self.pending.len(),
                self.congestion.cwnd(),
                self.flow.peer_window()
            );
        }
        actions
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Process one decoded inbound frame.
    pub fn on_frame(&mut self, envelope: Envelope, now: Instant) -> Vec<Action> {
        if self.closed.is_some() {
            return Vec::new();
        }
        if !envelope.is_valid() {
            self.counters.checksum_errors += 1;
            log::debug!(
                "[state] dropping {} ({:?} seq={}): checksum mismatch",
                envelope.message_id,
                envelope.kind,
                envelope.sequence_number
            );
            return Vec::new();
        }
        self.heartbeat.record_traffic(now);

        match envelope.kind {
            Kind::Ack => self.on_ack(&envelope, now),
            Kind::Heartbeat => self.on_heartbeat(&envelope),
            Kind::Data | Kind::Join | Kind::Leave => self.on_data(envelope),
        }
    }

    /// The transport delivered bytes that do not decode as an envelope.
    pub fn on_malformed(&mut self, detail: &str) -> Vec<Action> {
        if self.closed.is_some() {
            return Vec::new();
        }
        self.violation(format_args!("malformed frame: {detail}"))
    }

    fn on_ack(&mut self, ack: &Envelope, now: Instant) -> Vec<Action> {
        self.counters.acks_received += 1;
        let body = match ack.ack_body() {
            Ok(body) => body,
            Err(e) => return self.violation(format_args!("bad ACK body: {e}")),
        };
        let cumulative = ack.sequence_number;
        let highest_sent = self.retransmit.highest_sent();
        if cumulative > highest_sent || body.ack_for.is_some_and(|s| s > highest_sent) {
            return self.violation(format_args!(
                "ACK {cumulative} (for {:?}) beyond highest sent {highest_sent}",
                body.ack_for
            ));
        }

        self.flow.on_advertisement(body.window);
        let counts_as_duplicate = body.ack_for.is_some() && !self.retransmit.is_empty();
        let event = self.sequencer.on_ack(cumulative, counts_as_duplicate);
        if let Some(seq) = body.ack_for.filter(|&s| s > cumulative) {
            self.retransmit.mark_selective(seq);
        }

        let mut actions = Vec::new();
        match event {
            AckEvent::New { through, .. } => {
                let acked = self.retransmit.acknowledge_through(through, now);
                if let Some(sample) = acked
                    .iter()
                    .find(|a| Some(a.seq) == body.ack_for)
                    .and_then(|a| a.sample)
                {
                    self.rtt.on_sample(sample);
                }
                self.congestion.on_new_ack(acked.len(), through);
                self.counters.delivered += acked.len() as u64;
                actions.extend(acked.into_iter().map(|a| Action::Delivered(a.message_id)));
            }
            AckEvent::Duplicate {
                fast_retransmit: true,
                ..
            } => {
                if self.congestion.on_fast_retransmit(highest_sent) {
                    self.loss_count += 1;
                    if let Some((seq, envelope)) =
                        self.retransmit.fast_retransmit(now, self.rtt.rto())
                    {
                        log::debug!("[state] fast retransmit of seq {seq}");
                        self.counters.fast_retransmits += 1;
                        self.counters.retransmissions += 1;
                        actions.push(Action::Transmit(envelope));
                    }
                }
            }
            AckEvent::Duplicate { .. } | AckEvent::Update | AckEvent::Stale => {}
        }
        actions.extend(self.admit(now));
        actions
    }

    fn on_heartbeat(&mut self, heartbeat: &Envelope) -> Vec<Action> {
        match heartbeat.payload.as_str() {
            PING => {
                let mut actions = vec![Action::Transmit(Envelope::heartbeat(
                    self.ids.next(),
                    &self.local_name,
                    PONG,
                ))];
                // Repeat a window reopening the peer may have missed.
                let window = self.receiver.advertised_window(self.app_backlog);
                if window != self.last_advertised {
                    actions.push(Action::Transmit(self.make_ack(None, window)));
                }
                actions
            }
            PONG => Vec::new(),
            other => self.violation(format_args!("unknown heartbeat payload {other:?}")),
        }
    }

    fn on_data(&mut self, envelope: Envelope) -> Vec<Action> {
        let seq = envelope.sequence_number;
        let mut actions = Vec::new();
        match self.receiver.on_data(envelope, self.app_backlog) {
            Arrival::InOrder(frames) => {
                self.app_backlog += frames.len();
                self.counters.messages_received += frames.len() as u64;
                actions.extend(frames.into_iter().map(Action::Deliver));
            }
            Arrival::Buffered => log::trace!("[state] holding seq {seq} out of order"),
            Arrival::Duplicate => log::trace!("[state] duplicate seq {seq}"),
            Arrival::Refused => {
                log::debug!("[state] window full; refusing seq {seq}");
                return actions;
            }
        }
        let window = self.receiver.advertised_window(self.app_backlog);
        actions.push(Action::Transmit(self.make_ack(Some(seq), window)));
        actions
    }

    /// Record how many delivered frames the application still has to consume.
    pub fn set_app_backlog(&mut self, backlog: usize) {
        self.app_backlog = backlog;
    }

    /// After the application drained some of its backlog: announce the
    /// reopened window if the last ACK advertised zero.
    pub fn window_update(&mut self) -> Vec<Action> {
        if self.closed.is_some() || !self.window_closed() {
            return Vec::new();
        }
        let window = self.receiver.advertised_window(self.app_backlog);
        if window == 0 {
            return Vec::new();
        }
        log::debug!("[state] window reopened to {window}");
        vec![Action::Transmit(self.make_ack(None, window))]
    }

    fn make_ack(&mut self, ack_for: Option<u64>, window: u32) -> Envelope {
        self.last_advertised = window;
        self.counters.acks_sent += 1;
        Envelope::ack(
            self.ids.next(),
            &self.local_name,
            self.receiver.ack_number(),
            &AckBody { ack_for, window },
        )
    }

    fn violation(&mut self, detail: fmt::Arguments<'_>) -> Vec<Action> {
        self.counters.protocol_violations += 1;
        let count = u32::try_from(self.counters.protocol_violations).unwrap_or(u32::MAX);
        log::warn!("[state] protocol violation #{count}: {detail}");
        if count > self.max_protocol_violations {
            return self.close(CloseReason::ProtocolViolations(count));
        }
        Vec::new()
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Handle every deadline at or before `now`.
    pub fn on_tick(&mut self, now: Instant) -> Vec<Action> {
        if self.closed.is_some() {
            return Vec::new();
        }
        if self.heartbeat.is_dead(now) {
            return self.close(CloseReason::HeartbeatTimeout(self.heartbeat.timeout()));
        }

        let mut actions = Vec::new();
        let expired = self.retransmit.expire(now, self.rtt.rto());
        if !expired.retransmit.is_empty() || !expired.abandoned.is_empty() {
            // One loss event per sweep, however many entries expired.
            self.congestion.on_timeout();
            self.rtt.back_off();
            self.counters.timeouts += 1;
            self.loss_count += 1;
            log::debug!(
                "[state] RTO sweep: {} resend, {} abandoned, rto now {:?}",
                expired.retransmit.len(),
                expired.abandoned.len(),
                self.rtt.rto()
            );
        }
        let rto = self.rtt.rto();
        for seq in expired.retransmit {
            if let Some(envelope) = self.retransmit.resend(seq, now, rto) {
                self.counters.retransmissions += 1;
                actions.push(Action::Transmit(envelope));
            }
        }
        for lost in expired.abandoned {
            log::warn!(
                "[state] giving up on {} (seq {}) after {} retransmissions",
                lost.message_id,
                lost.seq,
                lost.retransmissions
            );
            self.counters.failed += 1;
            actions.push(Action::Failed(
                lost.message_id,
                DeliveryFailure::RetriesExhausted {
                    retransmissions: lost.retransmissions,
                },
            ));
        }

        if self.heartbeat.probe_due(now) {
            self.heartbeat.record_probe(now);
            actions.push(Action::Transmit(Envelope::heartbeat(
                self.ids.next(),
                &self.local_name,
                PING,
            )));
        }

        actions.extend(self.admit(now));
        actions
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Abandon everything in flight and queued, then close.  Idempotent.
    pub fn close(&mut self, reason: CloseReason) -> Vec<Action> {
        if self.closed.is_some() {
            return Vec::new();
        }
        log::info!("[state] closing: {reason}");
        self.closed = Some(reason.clone());

        let failure = DeliveryFailure::ConnectionClosed(reason.clone());
        let lost: Vec<MessageId> = self
            .retransmit
            .abandon_all()
            .into_iter()
            .map(|a| a.message_id)
            .chain(self.pending.drain(..).map(|e| e.message_id))
            .collect();
        self.counters.failed += lost.len() as u64;

        let mut actions: Vec<Action> = lost
            .into_iter()
            .map(|id| Action::Failed(id, failure.clone()))
            .collect();
        actions.push(Action::Close(reason));
        actions
    }

    // -----------------------------------------------------------------------
    // Statistics
    // -----------------------------------------------------------------------

    pub fn record_bytes_sent(&mut self, n: usize) {
        self.counters.bytes_sent += n as u64;
    }

    pub fn record_bytes_received(&mut self, n: usize) {
        self.counters.bytes_received += n as u64;
    }

    pub fn snapshot(&self, now: Instant) -> ConnectionStats {
        ConnectionStats {
            cwnd: self.congestion.cwnd(),
            ssthresh: self.congestion.ssthresh(),
            phase: self.congestion.phase(),
            srtt: self.rtt.srtt(),
            rttvar: self.rtt.rttvar(),
            rto: self.rtt.rto(),
            in_flight_count: self.retransmit.len(),
            queued_count: self.pending.len(),
            reorder_count: self.receiver.buffered(),
            retransmit_count: self.counters.retransmissions,
            loss_count: self.loss_count,
            receive_window: self.receiver.advertised_window(self.app_backlog),
            peer_window: self.flow.peer_window(),
            uptime: now.duration_since(self.opened_at),
            counters: self.counters,
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
