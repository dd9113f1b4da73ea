//! Entry point for `reno-chat`.
//!
//! Parses CLI arguments and dispatches into either **serve** or **connect**
//! mode.  All protocol work is delegated to the library; `main.rs` owns only
//! process setup (logging, argument parsing) and the demo session loops.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use reno_chat::simulator::SimulatorConfig;
use reno_chat::{Config, Connection, Engine, Event, Kind};

/// Chat messages with TCP-Reno congestion control and retransmission.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,

    #[command(flatten)]
    protocol: ProtocolArgs,

    #[command(flatten)]
    simulator: SimulatorArgs,
}

#[derive(Subcommand)]
enum Mode {
    /// Accept connections and log what arrives.
    Serve {
        /// Local address to bind (e.g. 0.0.0.0:9000).
        #[arg(short, long, default_value = "0.0.0.0:9000")]
        bind: String,
        /// Seconds between per-connection stats lines (0 disables).
        #[arg(long, default_value_t = 30)]
        stats_every: u64,
    },
    /// Connect, join, then send each stdin line as a chat message.
    Connect {
        /// Remote server address (e.g. 127.0.0.1:9000).
        #[arg(short, long)]
        server: String,
        /// Name announced in the join message.
        #[arg(short, long)]
        name: String,
    },
}

/// Protocol overrides; anything left out keeps its default.
#[derive(Args)]
struct ProtocolArgs {
    #[arg(long, global = true)]
    initial_cwnd: Option<f64>,
    #[arg(long, global = true)]
    ssthresh: Option<f64>,
    #[arg(long, global = true, value_name = "MS")]
    min_rto_ms: Option<u64>,
    #[arg(long, global = true, value_name = "MS")]
    max_rto_ms: Option<u64>,
    #[arg(long, global = true, value_name = "MS")]
    ack_timeout_ms: Option<u64>,
    #[arg(long, global = true)]
    max_retransmissions: Option<u32>,
    #[arg(long, global = true, value_name = "SECS")]
    heartbeat_interval: Option<u64>,
    #[arg(long, global = true)]
    receive_window: Option<u32>,
}

impl ProtocolArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(v) = self.initial_cwnd {
            config.initial_cwnd = v;
        }
        if let Some(v) = self.ssthresh {
            config.slow_start_threshold = v;
        }
        if let Some(ms) = self.min_rto_ms {
            config.min_rto = Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_rto_ms {
            config.max_rto = Duration::from_millis(ms);
        }
        if let Some(ms) = self.ack_timeout_ms {
            config.ack_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = self.max_retransmissions {
            config.max_retransmissions = v;
        }
        if let Some(secs) = self.heartbeat_interval {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(v) = self.receive_window {
            config.receive_window = v;
        }
    }
}

/// Inbound fault injection (testing only).
#[derive(Args)]
struct SimulatorArgs {
    #[arg(long, global = true, default_value_t = 0.0)]
    loss: f64,
    #[arg(long, global = true, default_value_t = 0.0)]
    duplicate: f64,
    #[arg(long, global = true, default_value_t = 0.0)]
    corrupt: f64,
    #[arg(long, global = true, default_value_t = 0, value_name = "MS")]
    delay_ms: u64,
    #[arg(long, global = true)]
    seed: Option<u64>,
}

impl From<&SimulatorArgs> for SimulatorConfig {
    fn from(args: &SimulatorArgs) -> Self {
        SimulatorConfig {
            loss_rate: args.loss,
            duplicate_rate: args.duplicate,
            corrupt_rate: args.corrupt,
            delay: Duration::from_millis(args.delay_ms),
            seed: args.seed,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Serve { bind, stats_every } => {
            let mut config = Config::default();
            cli.protocol.apply(&mut config);
            serve(config, (&cli.simulator).into(), &bind, stats_every).await
        }
        Mode::Connect { server, name } => {
            let mut config = Config {
                local_name: name,
                ..Config::default()
            };
            cli.protocol.apply(&mut config);
            connect(config, (&cli.simulator).into(), &server).await
        }
    }
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

async fn serve(
    config: Config,
    simulator: SimulatorConfig,
    bind: &str,
    stats_every: u64,
) -> anyhow::Result<()> {
    let (engine, events) = Engine::with_simulator(config, simulator)?;
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    log::info!("Listening on {}", listener.local_addr()?);

    tokio::spawn(log_events(events));
    if stats_every > 0 {
        tokio::spawn(log_stats(engine.clone(), Duration::from_secs(stats_every)));
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                match engine.attach_tcp(stream) {
                    Ok(conn) => {
                        log::info!("{} ← {peer}", conn.id());
                        tokio::spawn(log_inbound(conn));
                    }
                    Err(e) => log::warn!("rejecting {peer}: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.shutdown().await;
    let totals = engine.aggregate();
    log::info!(
        "served {} connection(s): {} delivered, {} failed, {} retransmitted",
        totals.connections_opened,
        totals.delivered,
        totals.failed,
        totals.retransmissions
    );
    Ok(())
}

async fn log_inbound(mut conn: Connection) {
    let id = conn.id();
    while let Some(envelope) = conn.recv().await {
        match envelope.kind {
            Kind::Join => log::info!("{id}: {} joined", envelope.sender),
            Kind::Leave => log::info!("{id}: {} left", envelope.sender),
            _ => log::info!("{id}: <{}> {}", envelope.sender, envelope.payload),
        }
    }
}

async fn log_events(mut events: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        match event {
            Event::Delivered { .. } => log::trace!("{event:?}"),
            Event::DeliveryFailed {
                connection,
                message_id,
                reason,
            } => log::warn!("{connection}: {message_id} failed: {reason}"),
            Event::Closed { connection, reason } => log::info!("{connection} closed: {reason}"),
        }
    }
}

async fn log_stats(engine: Engine, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        for id in engine.connections() {
            if let Ok(s) = engine.stats(id) {
                log::info!(
                    "{id}: phase={} cwnd={:.2} ssthresh={:.2} rto={:?} in_flight={} queued={} reorder={} retx={} losses={}",
                    s.phase,
                    s.cwnd,
                    s.ssthresh,
                    s.rto,
                    s.in_flight_count,
                    s.queued_count,
                    s.reorder_count,
                    s.retransmit_count,
                    s.loss_count
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// connect
// ---------------------------------------------------------------------------

async fn connect(config: Config, simulator: SimulatorConfig, server: &str) -> anyhow::Result<()> {
    let name = config.local_name.clone();
    let (engine, mut events) = Engine::with_simulator(config, simulator)?;
    let stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("connecting to {server}"))?;
    let mut conn = engine.attach_tcp(stream)?;
    let id = conn.id();
    log::info!("Connected to {server} as {name}");

    let mut outstanding = HashSet::new();
    outstanding.insert(engine.enqueue_kind(id, Kind::Join, name.as_str())?);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) if !line.trim().is_empty() => {
                    outstanding.insert(engine.enqueue(id, line)?);
                }
                Some(_) => {}
                None => {
                    stdin_open = false;
                    outstanding.insert(engine.enqueue_kind(id, Kind::Leave, name.as_str())?);
                }
            },
            inbound = conn.recv() => match inbound {
                Some(envelope) => println!("<{}> {}", envelope.sender, envelope.payload),
                None => break,
            },
            event = events.recv() => match event {
                Some(Event::Delivered { message_id, .. }) => {
                    outstanding.remove(&message_id);
                }
                Some(Event::DeliveryFailed { message_id, reason, .. }) => {
                    outstanding.remove(&message_id);
                    eprintln!("! {message_id} not delivered: {reason}");
                }
                Some(Event::Closed { reason, .. }) => {
                    eprintln!("! connection closed: {reason}");
                    break;
                }
                None => break,
            },
        }
        if !stdin_open && outstanding.is_empty() {
            break;
        }
    }

    if let Ok(s) = engine.stats(id) {
        log::info!(
            "sent {} message(s), {} retransmission(s), final cwnd {:.2}",
            s.counters.messages_sent,
            s.retransmit_count,
            s.cwnd
        );
    }
    engine.shutdown().await;
    Ok(())
}
