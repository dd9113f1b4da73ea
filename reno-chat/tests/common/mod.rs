//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::time::Duration;

use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc::UnboundedReceiver;

use reno_chat::envelope::AckBody;
use reno_chat::transport::{FrameReader, FrameWriter};
use reno_chat::{Config, Connection, Engine, Envelope, Event, Kind, MessageId};

pub type Half = (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>);

/// Two connected in-memory byte streams, already split into halves.
pub fn pipe() -> (Half, Half) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    (tokio::io::split(a), tokio::io::split(b))
}

pub fn engine(config: Config) -> (Engine, UnboundedReceiver<Event>) {
    Engine::new(config).expect("valid config")
}

/// Engine attached to one end of a pipe; the other end is returned raw.
pub fn engine_with_far_end(config: Config) -> (Engine, UnboundedReceiver<Event>, Connection, Half) {
    let (engine, events) = engine(config);
    let ((r, w), far) = pipe();
    let conn = engine.attach(r, w).expect("attach");
    (engine, events, conn, far)
}

/// Wait for the next event, failing the test after `limit`.
pub async fn next_event(events: &mut UnboundedReceiver<Event>, limit: Duration) -> Event {
    tokio::time::timeout(limit, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

// ---------------------------------------------------------------------------
// Hand-driven peer
// ---------------------------------------------------------------------------

/// The far end of a pipe, driven frame by frame by the test.
pub struct Peer {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: FrameWriter<WriteHalf<DuplexStream>>,
    next_id: u64,
}

impl Peer {
    pub fn new((r, w): Half) -> Self {
        Self {
            reader: FrameReader::new(r, 64 * 1024),
            writer: FrameWriter::new(w),
            next_id: 10_000,
        }
    }

    /// Next frame of `kind`, skipping anything else (heartbeats, ...).
    pub async fn next_of(&mut self, kind: Kind) -> Envelope {
        loop {
            let frame = self.reader.read_frame().await.expect("read frame");
            let envelope = frame.envelope.expect("decodable frame");
            if envelope.kind == kind {
                return envelope;
            }
        }
    }

    pub async fn send(&mut self, envelope: &Envelope) {
        self.writer.write_frame(envelope).await.expect("write frame");
    }

    pub async fn ack(&mut self, cumulative: u64, ack_for: Option<u64>, window: u32) {
        let ack = Envelope::ack(
            self.id(),
            "peer",
            cumulative,
            &AckBody { ack_for, window },
        );
        self.send(&ack).await;
    }

    pub async fn data(&mut self, seq: u64, payload: &str) {
        let data = Envelope::new(self.id(), Kind::Data, "peer", payload.to_string(), seq);
        self.send(&data).await;
    }

    fn id(&mut self) -> MessageId {
        self.next_id += 1;
        MessageId(self.next_id)
    }
}
