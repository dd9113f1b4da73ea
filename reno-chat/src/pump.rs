//! Per-connection actor: the single owner of a [`ConnectionState`].
//!
//! # Architecture
//!
//! ```text
//!   Engine ── Command ──────────────┐
//!                                   ▼
//!   transport ─▶ reader task ─▶ ┌────────┐ ─▶ writer task ─▶ transport
//!               (simulator)     │  pump  │
//!                  Inbound ───▶ │  loop  │ ─▶ inbox (application)
//!                               └────────┘ ─▶ Event (engine)
//!                      deadline ──▲    └────▶ watch<ConnectionStats>
//! ```
//!
//! The pump loop multiplexes engine commands, inbound frames, the nearest
//! protocol deadline and "application consumed a frame" notifications with
//! `tokio::select!`.  Every branch turns into a batch of [`Action`]s that is
//! executed before the next event is looked at, so all mutations of the
//! connection are serialized through this task.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};

use crate::engine::Event;
use crate::envelope::{self, Envelope, Kind, MessageId};
use crate::error::{CloseReason, FrameError};
use crate::simulator::Simulator;
use crate::state::{Action, ConnectionId, ConnectionState};
use crate::stats::{ConnectionStats, Counters};
use crate::transport::{Frame, FrameReader, FrameWriter};

/// Inbound frames buffered between the reader task and the pump.
const INBOUND_QUEUE: usize = 256;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Requests from the engine to a pump.
#[derive(Debug)]
pub(crate) enum Command {
    Enqueue {
        message_id: MessageId,
        kind: Kind,
        payload: String,
    },
    /// A frame obtained outside this connection's own reader.
    Frame(Envelope),
    Close(CloseReason),
}

/// Output of the reader task.
#[derive(Debug)]
enum Inbound {
    Frame { envelope: Envelope, wire_len: usize },
    Malformed { detail: String, wire_len: usize },
    Failed(FrameError),
}

/// How a pump ended.
#[derive(Debug)]
pub(crate) struct PumpExit {
    pub reason: CloseReason,
    pub counters: Counters,
}

// ---------------------------------------------------------------------------
// Application side
// ---------------------------------------------------------------------------

/// Receive side of a connection as seen by the application.
///
/// Frames arrive in sequence order.  Every frame taken out reopens one slot
/// of the advertised receive window.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<Envelope>,
    consumed: Arc<Notify>,
}

impl Inbox {
    /// Next in-order frame from the peer; `None` once the connection closed
    /// and everything delivered has been read.
    pub async fn recv(&mut self) -> Option<Envelope> {
        let envelope = self.rx.recv().await;
        if envelope.is_some() {
            self.consumed.notify_one();
        }
        envelope
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Envelope> {
        let envelope = self.rx.try_recv().ok();
        if envelope.is_some() {
            self.consumed.notify_one();
        }
        envelope
    }
}

// ---------------------------------------------------------------------------
// Pump
// ---------------------------------------------------------------------------

pub(crate) struct Pump {
    id: ConnectionId,
    state: ConnectionState,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::Receiver<Inbound>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbox: mpsc::Sender<Envelope>,
    consumed: Arc<Notify>,
    stats: watch::Sender<ConnectionStats>,
    events: mpsc::UnboundedSender<Event>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Everything [`Pump::spawn_io`] hands back to the engine.
pub(crate) struct PumpParts {
    pub pump: Pump,
    pub inbox: Inbox,
    pub stats: watch::Receiver<ConnectionStats>,
}

/// Wiring for a new pump.
pub(crate) struct PumpIo<R, W> {
    pub reader: R,
    pub writer: W,
    pub max_frame_size: usize,
    pub simulator: Option<Simulator>,
    pub receive_window: u32,
}

impl Pump {
    /// Spawn the reader and writer tasks for one transport and build the
    /// (not yet running) pump around `state`.
    pub(crate) fn spawn_io<R, W>(
        id: ConnectionId,
        state: ConnectionState,
        io: PumpIo<R, W>,
        commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<Event>,
    ) -> PumpParts
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::channel(io.receive_window.max(1) as usize);
        let consumed = Arc::new(Notify::new());
        let (stats_tx, stats_rx) = watch::channel(state.snapshot(Instant::now()));

        let reader = tokio::spawn(read_loop(
            id,
            FrameReader::new(io.reader, io.max_frame_size),
            io.simulator,
            inbound_tx,
        ));
        let writer = tokio::spawn(write_loop(id, FrameWriter::new(io.writer), outbound_rx));

        let pump = Pump {
            id,
            state,
            commands,
            inbound: inbound_rx,
            outbound: outbound_tx,
            inbox: inbox_tx,
            consumed: consumed.clone(),
            stats: stats_tx,
            events,
            reader,
            writer,
        };
        PumpParts {
            pump,
            inbox: Inbox {
                rx: inbox_rx,
                consumed,
            },
            stats: stats_rx,
        }
    }

    /// Drive the connection until it closes.
    pub(crate) async fn run(mut self) -> PumpExit {
        log::debug!("[pump:{}] started", self.id);
        let reason = loop {
            let deadline = self.state.next_deadline();
            let window_closed = self.state.window_closed();

            let actions = tokio::select! {
                command = self.commands.recv() => {
                    let now = Instant::now();
                    match command {
                        Some(Command::Enqueue { message_id, kind, payload }) => {
                            self.state.enqueue(message_id, kind, payload, now)
                        }
                        Some(Command::Frame(envelope)) => {
                            self.sync_backlog();
                            self.state.on_frame(envelope, now)
                        }
                        Some(Command::Close(reason)) => self.state.close(reason),
                        // The engine went away without a shutdown.
                        None => self.state.close(CloseReason::Shutdown),
                    }
                }
                inbound = self.inbound.recv() => {
                    let now = Instant::now();
                    match inbound {
                        Some(Inbound::Frame { envelope, wire_len }) => {
                            self.state.record_bytes_received(wire_len);
                            self.sync_backlog();
                            self.state.on_frame(envelope, now)
                        }
                        Some(Inbound::Malformed { detail, wire_len }) => {
                            self.state.record_bytes_received(wire_len);
                            self.state.on_malformed(&detail)
                        }
                        Some(Inbound::Failed(e)) => {
                            self.state.close(CloseReason::Transport(e.to_string()))
                        }
                        None => self.state.close(CloseReason::Transport("reader stopped".into())),
                    }
                }
                _ = sleep_until(deadline) => self.state.on_tick(Instant::now()),
                _ = self.consumed.notified(), if window_closed => {
                    self.sync_backlog();
                    self.state.window_update()
                }
            };

            if let Some(reason) = self.execute(actions) {
                break reason;
            }
            self.stats.send_replace(self.state.snapshot(Instant::now()));
        };

        self.fail_unprocessed();
        self.stats.send_replace(self.state.snapshot(Instant::now()));
        self.reader.abort();
        // Dropping the sender lets the writer flush what is queued, then exit.
        drop(self.outbound);
        let _ = self.writer.await;
        log::debug!("[pump:{}] stopped: {reason}", self.id);
        PumpExit {
            reason,
            counters: *self.state.counters(),
        }
    }

    /// Carry out a batch of actions; returns the close reason if one was
    /// among them.
    fn execute(&mut self, actions: Vec<Action>) -> Option<CloseReason> {
        let mut closing = None;
        for action in actions {
            match action {
                Action::Transmit(envelope) => self.transmit(&envelope),
                Action::Deliver(envelope) => self.deliver(envelope),
                Action::Delivered(message_id) => self.emit(Event::Delivered {
                    connection: self.id,
                    message_id,
                }),
                Action::Failed(message_id, reason) => self.emit(Event::DeliveryFailed {
                    connection: self.id,
                    message_id,
                    reason,
                }),
                Action::Close(reason) => closing = Some(reason),
            }
        }
        if closing.is_none() && !self.state.is_closed() && self.outbound.is_closed() {
            let actions = self
                .state
                .close(CloseReason::Transport("writer stopped".into()));
            return self.execute(actions);
        }
        closing
    }

    fn transmit(&mut self, envelope: &Envelope) {
        let frame = match envelope::encode(envelope) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("[pump:{}] cannot encode {}: {e}", self.id, envelope.message_id);
                return;
            }
        };
        log::trace!(
            "[pump:{}] → {:?} seq={} ({} bytes)",
            self.id,
            envelope.kind,
            envelope.sequence_number,
            frame.len()
        );
        self.state.record_bytes_sent(frame.len());
        // A closed writer is noticed at the end of the batch.
        let _ = self.outbound.send(frame);
    }

    fn deliver(&mut self, envelope: Envelope) {
        match self.inbox.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                // The advertised window keeps the inbox from filling up.
                log::warn!(
                    "[pump:{}] inbox full; dropping {}",
                    self.id,
                    envelope.message_id
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::trace!("[pump:{}] application stopped reading", self.id);
            }
        }
    }

    /// Stop accepting commands and fail every message the engine accepted
    /// but this pump never saw.
    fn fail_unprocessed(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Enqueue {
                message_id,
                kind,
                payload,
            } = command
            {
                let actions = self.state.enqueue(message_id, kind, payload, Instant::now());
                self.execute(actions);
            }
        }
    }

    fn emit(&self, event: Event) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn sync_backlog(&mut self) {
        let backlog = self.inbox.max_capacity() - self.inbox.capacity();
        self.state.set_app_backlog(backlog);
    }
}

// ---------------------------------------------------------------------------
// I/O tasks
// ---------------------------------------------------------------------------

async fn read_loop<R>(
    id: ConnectionId,
    mut reader: FrameReader<R>,
    mut simulator: Option<Simulator>,
    tx: mpsc::Sender<Inbound>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let inbound = match reader.read_frame().await {
            Ok(Frame {
                wire_len,
                envelope: Ok(envelope),
            }) => {
                let copies = match simulator.as_mut() {
                    Some(sim) => {
                        if !sim.delay().is_zero() {
                            sleep(sim.delay()).await;
                        }
                        sim.apply(envelope)
                    }
                    None => vec![envelope],
                };
                for envelope in copies {
                    if tx.send(Inbound::Frame { envelope, wire_len }).await.is_err() {
                        return;
                    }
                }
                continue;
            }
            Ok(Frame {
                wire_len,
                envelope: Err(e),
            }) => Inbound::Malformed {
                detail: e.to_string(),
                wire_len,
            },
            Err(e) => {
                log::debug!("[pump:{id}] reader: {e}");
                let _ = tx.send(Inbound::Failed(e)).await;
                return;
            }
        };
        if tx.send(inbound).await.is_err() {
            return;
        }
    }
}

async fn write_loop<W>(
    id: ConnectionId,
    mut writer: FrameWriter<W>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_raw(&frame).await {
            log::debug!("[pump:{id}] writer: {e}");
            return;
        }
    }
    let _ = writer.shutdown().await;
}
