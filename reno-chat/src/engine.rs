//! Engine: the connection registry and the session-layer API.
//!
//! An [`Engine`] is a cheaply clonable handle.  Each attached transport gets
//! its own pump task (see [`crate::pump`]); the engine keeps only a command
//! sender and a stats receiver per connection, plus aggregate counters.
//! Outcomes reach the session layer as [`Event`]s on the channel returned by
//! [`Engine::new`].
//!
//! ```ignore
//! let (engine, mut events) = Engine::new(Config::default())?;
//! let mut conn = engine.attach_tcp(stream)?;
//! let id = engine.enqueue(conn.id(), "hello")?;
//! while let Some(event) = events.recv().await { /* Delivered { .. } */ }
//! engine.shutdown().await;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{Config, ConfigError};
use crate::envelope::{Envelope, Kind, MessageId, MessageIds};
use crate::error::{CloseReason, DeliveryFailure, EngineError};
use crate::pump::{Command, Inbox, Pump, PumpExit, PumpIo, PumpParts};
use crate::simulator::{Simulator, SimulatorConfig};
use crate::state::{ConnectionId, ConnectionState};
use crate::stats::{AggregateSnapshot, AggregateStats, ConnectionStats};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Notification to the session layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The peer acknowledged `message_id`.
    Delivered {
        connection: ConnectionId,
        message_id: MessageId,
    },
    /// `message_id` will never be acknowledged.
    DeliveryFailed {
        connection: ConnectionId,
        message_id: MessageId,
        reason: DeliveryFailure,
    },
    /// The connection is gone; no further events carry its id.
    Closed {
        connection: ConnectionId,
        reason: CloseReason,
    },
}

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

/// Application-side handle for one attached transport.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    inbox: Inbox,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Next in-order message (data, join or leave) from the peer.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbox.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.inbox.try_recv()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct Handle {
    commands: mpsc::UnboundedSender<Command>,
    stats: watch::Receiver<ConnectionStats>,
    task: JoinHandle<()>,
}

struct Inner {
    config: Config,
    simulator: Option<SimulatorConfig>,
    ids: MessageIds,
    next_connection: AtomicU64,
    shutting_down: AtomicBool,
    connections: RwLock<HashMap<ConnectionId, Handle>>,
    aggregate: AggregateStats,
    events: mpsc::UnboundedSender<Event>,
}

/// Reliability engine shared by every connection of one process.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Build an engine with a validated configuration.
    pub fn new(config: Config) -> Result<(Self, mpsc::UnboundedReceiver<Event>), ConfigError> {
        Self::with_simulator(config, SimulatorConfig::default())
    }

    /// Like [`new`](Self::new), with inbound fault injection applied to every
    /// connection.  Each connection derives its own RNG stream from the seed.
    pub fn with_simulator(
        config: Config,
        simulator: SimulatorConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Event>), ConfigError> {
        config.validate()?;
        simulator.validate()?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Inner {
            config,
            simulator: (!simulator.is_transparent()).then_some(simulator),
            ids: MessageIds::new(),
            next_connection: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            connections: RwLock::new(HashMap::new()),
            aggregate: AggregateStats::new(),
            events,
        };
        Ok((
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        ))
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Attach
    // -----------------------------------------------------------------------

    /// Run the protocol over a TCP stream.
    pub fn attach_tcp(&self, stream: TcpStream) -> Result<Connection, EngineError> {
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[engine] set_nodelay: {e}");
        }
        let (reader, writer) = stream.into_split();
        self.attach(reader, writer)
    }

    /// Run the protocol over any byte stream split into halves.
    pub fn attach<R, W>(&self, reader: R, writer: W) -> Result<Connection, EngineError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        // Checked under the registry lock so a concurrent shutdown either
        // sees this connection or refuses it.
        let mut connections = self.inner.write_connections();
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(EngineError::ShuttingDown);
        }
        let id = ConnectionId(self.inner.next_connection.fetch_add(1, Ordering::Relaxed));
        let config = &self.inner.config;
        let state = ConnectionState::new(config, self.inner.ids.clone(), Instant::now());
        let simulator = self.inner.simulator.clone().map(|sim| {
            Simulator::new(SimulatorConfig {
                seed: sim.seed.map(|seed| seed.wrapping_add(id.0)),
                ..sim
            })
        });
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let PumpParts { pump, inbox, stats } = Pump::spawn_io(
            id,
            state,
            PumpIo {
                reader,
                writer,
                max_frame_size: config.max_frame_size,
                simulator,
                receive_window: config.receive_window,
            },
            commands_rx,
            self.inner.events.clone(),
        );

        // Counted before the task can retire itself.
        self.inner.aggregate.connection_opened();
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let exit = pump.run().await;
            inner.retire(id, exit);
        });
        connections.insert(
            id,
            Handle {
                commands: commands_tx,
                stats,
                task,
            },
        );
        drop(connections);
        log::info!("[engine] {id} attached");
        Ok(Connection { id, inbox })
    }

    // -----------------------------------------------------------------------
    // Session API
    // -----------------------------------------------------------------------

    /// Queue a chat message for reliable delivery.  Never blocks.
    pub fn enqueue(
        &self,
        connection: ConnectionId,
        payload: impl Into<String>,
    ) -> Result<MessageId, EngineError> {
        self.enqueue_kind(connection, Kind::Data, payload)
    }

    /// Queue a reliable frame of any sequenced kind (data, join, leave).
    pub fn enqueue_kind(
        &self,
        connection: ConnectionId,
        kind: Kind,
        payload: impl Into<String>,
    ) -> Result<MessageId, EngineError> {
        if !kind.is_reliable() {
            return Err(EngineError::Unsequenced(kind));
        }
        let message_id = self.inner.ids.next();
        self.send(
            connection,
            Command::Enqueue {
                message_id,
                kind,
                payload: payload.into(),
            },
        )?;
        Ok(message_id)
    }

    /// Feed a frame obtained outside the connection's own transport.
    pub fn on_frame_received(
        &self,
        connection: ConnectionId,
        envelope: Envelope,
    ) -> Result<(), EngineError> {
        self.send(connection, Command::Frame(envelope))
    }

    /// Latest published statistics of one connection.
    pub fn stats(&self, connection: ConnectionId) -> Result<ConnectionStats, EngineError> {
        self.inner
            .read_connections()
            .get(&connection)
            .map(|handle| handle.stats.borrow().clone())
            .ok_or(EngineError::UnknownConnection(connection))
    }

    /// Totals across every connection, open and closed.
    pub fn aggregate(&self) -> AggregateSnapshot {
        self.inner.aggregate.snapshot()
    }

    /// Ids of the open connections, oldest first.
    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.inner.read_connections().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Close one connection; its pending messages are reported as failed.
    pub fn close(&self, connection: ConnectionId) -> Result<(), EngineError> {
        self.send(connection, Command::Close(CloseReason::Local))
    }

    /// Close every connection and wait for their tasks to finish.  Attaching
    /// afterwards is refused.
    pub async fn shutdown(&self) {
        let handles: Vec<(ConnectionId, Handle)> = {
            let mut connections = self.inner.write_connections();
            self.inner.shutting_down.store(true, Ordering::Release);
            connections.drain().collect()
        };
        log::info!("[engine] shutting down {} connection(s)", handles.len());
        for (_, handle) in &handles {
            let _ = handle.commands.send(Command::Close(CloseReason::Shutdown));
        }
        for (id, handle) in handles {
            if let Err(e) = handle.task.await {
                log::warn!("[engine] {id} task ended abnormally: {e}");
            }
        }
    }

    fn send(&self, connection: ConnectionId, command: Command) -> Result<(), EngineError> {
        let connections = self.inner.read_connections();
        let handle = connections
            .get(&connection)
            .ok_or(EngineError::UnknownConnection(connection))?;
        handle
            .commands
            .send(command)
            .map_err(|_| EngineError::Closed(connection))
    }
}

impl Inner {
    /// Bookkeeping once a pump has stopped.
    fn retire(&self, id: ConnectionId, exit: PumpExit) {
        self.write_connections().remove(&id);
        self.aggregate.connection_closed(&exit.counters);
        log::info!("[engine] {id} closed: {}", exit.reason);
        let _ = self.events.send(Event::Closed {
            connection: id,
            reason: exit.reason,
        });
    }

    fn read_connections(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Handle>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_connections(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Handle>> {
        self.connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
