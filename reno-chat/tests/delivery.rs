//! Integration tests for engine-to-engine delivery.
//!
//! Each test runs two engines in one process, joined either by an in-memory
//! duplex pipe or by a loopback TCP connection.

mod common;

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use reno_chat::simulator::SimulatorConfig;
use reno_chat::{CloseReason, Config, DeliveryFailure, Engine, EngineError, Event, Kind};

use common::{engine, engine_with_far_end, next_event, pipe};

const LIMIT: Duration = Duration::from_secs(10);

fn named(name: &str) -> Config {
    Config {
        local_name: name.to_string(),
        ..Config::default()
    }
}

// ---------------------------------------------------------------------------
// Test 1: in-order delivery over a pipe
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_pipe_delivers_in_order() {
    const COUNT: usize = 20;

    let (alice, mut alice_events) = engine(named("alice"));
    let (bob, _bob_events) = engine(named("bob"));
    let ((ar, aw), (br, bw)) = pipe();
    let a = alice.attach(ar, aw).unwrap();
    let mut b = bob.attach(br, bw).unwrap();

    let mut sent = Vec::new();
    for i in 0..COUNT {
        sent.push(alice.enqueue(a.id(), format!("message {i}")).unwrap());
    }

    for i in 0..COUNT {
        let env = tokio::time::timeout(LIMIT, b.recv()).await.unwrap().unwrap();
        assert_eq!(env.kind, Kind::Data);
        assert_eq!(env.sender, "alice");
        assert_eq!(env.payload, format!("message {i}"));
        assert_eq!(env.sequence_number, i as u64 + 1);
    }

    let mut delivered = Vec::new();
    while delivered.len() < COUNT {
        match next_event(&mut alice_events, LIMIT).await {
            Event::Delivered { message_id, .. } => delivered.push(message_id),
            other => panic!("unexpected {other:?}"),
        }
    }
    delivered.sort();
    assert_eq!(delivered, sent);

    let stats = alice.stats(a.id()).unwrap();
    assert_eq!(stats.in_flight_count, 0);
    assert_eq!(stats.queued_count, 0);
    assert_eq!(stats.counters.delivered, COUNT as u64);
    assert!(stats.cwnd > 1.0);
}

// ---------------------------------------------------------------------------
// Test 2: both directions at once
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_bidirectional_traffic() {
    let (alice, _ae) = engine(named("alice"));
    let (bob, _be) = engine(named("bob"));
    let ((ar, aw), (br, bw)) = pipe();
    let mut a = alice.attach(ar, aw).unwrap();
    let mut b = bob.attach(br, bw).unwrap();

    alice.enqueue_kind(a.id(), Kind::Join, "alice").unwrap();
    bob.enqueue_kind(b.id(), Kind::Join, "bob").unwrap();
    alice.enqueue(a.id(), "hi bob").unwrap();
    bob.enqueue(b.id(), "hi alice").unwrap();

    let at_bob = [
        tokio::time::timeout(LIMIT, b.recv()).await.unwrap().unwrap(),
        tokio::time::timeout(LIMIT, b.recv()).await.unwrap().unwrap(),
    ];
    let at_alice = [
        tokio::time::timeout(LIMIT, a.recv()).await.unwrap().unwrap(),
        tokio::time::timeout(LIMIT, a.recv()).await.unwrap().unwrap(),
    ];
    assert_eq!(at_bob[0].kind, Kind::Join);
    assert_eq!(at_bob[1].payload, "hi bob");
    assert_eq!(at_alice[0].kind, Kind::Join);
    assert_eq!(at_alice[1].payload, "hi alice");
}

// ---------------------------------------------------------------------------
// Test 3: loopback TCP session
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_tcp_end_to_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (server, _server_events) = engine(named("server"));
    let server_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = server.attach_tcp(stream).unwrap();
        let mut seen = Vec::new();
        while seen.len() < 4 {
            seen.push(conn.recv().await.unwrap());
        }
        server.enqueue(conn.id(), "welcome").unwrap();
        // Keep the connection open until the client has the reply.
        tokio::time::sleep(Duration::from_millis(500)).await;
        seen
    });

    let (client, mut client_events) = engine(named("carol"));
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut conn = client.attach_tcp(stream).unwrap();
    client.enqueue_kind(conn.id(), Kind::Join, "carol").unwrap();
    for line in ["one", "two", "three"] {
        client.enqueue(conn.id(), line).unwrap();
    }

    let reply = tokio::time::timeout(LIMIT, conn.recv()).await.unwrap().unwrap();
    assert_eq!(reply.payload, "welcome");
    assert_eq!(reply.sender, "server");

    let seen = server_task.await.unwrap();
    let kinds: Vec<Kind> = seen.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, [Kind::Join, Kind::Data, Kind::Data, Kind::Data]);
    assert_eq!(seen[3].payload, "three");

    let mut delivered = 0;
    while delivered < 4 {
        if let Event::Delivered { .. } = next_event(&mut client_events, LIMIT).await {
            delivered += 1;
        }
    }
    assert_eq!(client.stats(conn.id()).unwrap().counters.messages_sent, 4);
}

// ---------------------------------------------------------------------------
// Test 4: lossy, duplicating, corrupting link still delivers everything
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_recovery_over_faulty_link() {
    const COUNT: usize = 30;

    // Enough slack that only the reliability machinery is under test.
    let patient = |name: &str| Config {
        max_retransmissions: 12,
        heartbeat_miss_limit: 20,
        ..named(name)
    };
    let faults = SimulatorConfig {
        loss_rate: 0.2,
        duplicate_rate: 0.1,
        corrupt_rate: 0.05,
        seed: Some(42),
        ..SimulatorConfig::default()
    };
    let (alice, mut alice_events) = Engine::with_simulator(patient("alice"), faults.clone()).unwrap();
    let (bob, _bob_events) = Engine::with_simulator(patient("bob"), faults).unwrap();
    let ((ar, aw), (br, bw)) = pipe();
    let a = alice.attach(ar, aw).unwrap();
    let mut b = bob.attach(br, bw).unwrap();

    for i in 0..COUNT {
        alice.enqueue(a.id(), format!("m{i}")).unwrap();
    }

    let reader = tokio::spawn(async move {
        let mut payloads = Vec::new();
        while payloads.len() < COUNT {
            payloads.push(b.recv().await.unwrap().payload);
        }
        payloads
    });

    let mut delivered = 0;
    while delivered < COUNT {
        match next_event(&mut alice_events, Duration::from_secs(600)).await {
            Event::Delivered { .. } => delivered += 1,
            other => panic!("unexpected {other:?}"),
        }
    }

    let payloads = reader.await.unwrap();
    let expected: Vec<String> = (0..COUNT).map(|i| format!("m{i}")).collect();
    assert_eq!(payloads, expected);

    let stats = alice.stats(a.id()).unwrap();
    assert!(stats.retransmit_count > 0);
    assert!(stats.loss_count > 0);
}

// ---------------------------------------------------------------------------
// Test 5: engine API misuse and lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_engine_lifecycle() {
    let (alice, mut events) = engine(named("alice"));
    let ((ar, aw), _far) = pipe();
    let a = alice.attach(ar, aw).unwrap();
    let id = a.id();

    assert_eq!(alice.connections(), vec![id]);
    assert_eq!(
        alice.enqueue_kind(id, Kind::Ack, "x"),
        Err(EngineError::Unsequenced(Kind::Ack))
    );

    alice.close(id).unwrap();
    loop {
        if let Event::Closed { connection, reason } = next_event(&mut events, LIMIT).await {
            assert_eq!(connection, id);
            assert_eq!(reason, CloseReason::Local);
            break;
        }
    }
    assert!(alice.connections().is_empty());
    assert_eq!(alice.enqueue(id, "late"), Err(EngineError::UnknownConnection(id)));
    assert!(alice.stats(id).is_err());

    let totals = alice.aggregate();
    assert_eq!(totals.connections_opened, 1);
    assert_eq!(totals.connections_closed, 1);

    alice.shutdown().await;
    let ((r, w), _far) = pipe();
    assert!(matches!(alice.attach(r, w), Err(EngineError::ShuttingDown)));
}

#[tokio::test]
async fn test_shutdown_fails_pending_messages() {
    let (alice, mut events) = engine(named("alice"));
    // Nobody answers on the far end.
    let ((ar, aw), _far) = pipe();
    let a = alice.attach(ar, aw).unwrap();
    let first = alice.enqueue(a.id(), "in flight").unwrap();
    let second = alice.enqueue(a.id(), "queued").unwrap();

    alice.shutdown().await;

    let mut failed = Vec::new();
    let mut closed = None;
    while closed.is_none() {
        match next_event(&mut events, LIMIT).await {
            Event::DeliveryFailed {
                message_id, reason, ..
            } => {
                assert_eq!(
                    reason,
                    DeliveryFailure::ConnectionClosed(CloseReason::Shutdown)
                );
                failed.push(message_id);
            }
            Event::Closed { reason, .. } => closed = Some(reason),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(failed, vec![first, second]);
    assert_eq!(closed, Some(CloseReason::Shutdown));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_accepted_message_always_gets_an_outcome() {
    for _ in 0..40 {
        let (engine, mut events, conn, far) = engine_with_far_end(Config::default());
        // Transport dies while the message may still sit in the command queue.
        drop(far);
        let accepted: Vec<_> = engine.enqueue(conn.id(), "hello").ok().into_iter().collect();

        let mut outcomes = Vec::new();
        loop {
            match next_event(&mut events, LIMIT).await {
                Event::Delivered { message_id, .. } => outcomes.push(message_id),
                Event::DeliveryFailed {
                    message_id, reason, ..
                } => {
                    assert!(matches!(reason, DeliveryFailure::ConnectionClosed(_)));
                    outcomes.push(message_id);
                }
                Event::Closed { .. } => break,
            }
        }
        assert_eq!(outcomes, accepted);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_closes_every_attached_connection() {
    let (alice, mut events) = engine(named("alice"));
    let attacher = {
        let alice = alice.clone();
        tokio::spawn(async move {
            let mut attached = Vec::new();
            // Far ends stay open so no pump closes on its own.
            let mut keep = Vec::new();
            while attached.len() < 500 {
                let ((r, w), far) = pipe();
                match alice.attach(r, w) {
                    Ok(conn) => {
                        attached.push(conn.id());
                        keep.push((conn, far));
                    }
                    Err(EngineError::ShuttingDown) => break,
                    Err(e) => panic!("unexpected {e}"),
                }
                tokio::task::yield_now().await;
            }
            (attached, keep)
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    alice.shutdown().await;
    let (attached, _keep) = attacher.await.unwrap();

    assert!(alice.connections().is_empty());
    let mut closed = Vec::new();
    while closed.len() < attached.len() {
        if let Event::Closed { connection, reason } = next_event(&mut events, LIMIT).await {
            assert_eq!(reason, CloseReason::Shutdown);
            closed.push(connection);
        }
    }
    closed.sort();
    assert_eq!(closed, attached);
}

// ---------------------------------------------------------------------------
// Test 6: oversized messages fail alone
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_oversized_message_fails_without_closing() {
    let (alice, mut alice_events) = engine(named("alice"));
    let (bob, mut bob_events) = engine(named("bob"));
    let ((ar, aw), (br, bw)) = pipe();
    let a = alice.attach(ar, aw).unwrap();
    let mut b = bob.attach(br, bw).unwrap();

    let big = alice.enqueue(a.id(), "x".repeat(70 * 1024)).unwrap();
    match next_event(&mut alice_events, LIMIT).await {
        Event::DeliveryFailed {
            message_id, reason, ..
        } => {
            assert_eq!(message_id, big);
            assert!(matches!(
                reason,
                DeliveryFailure::TooLarge { limit, .. } if limit == alice.config().max_frame_size
            ));
        }
        other => panic!("unexpected {other:?}"),
    }

    let small = alice.enqueue(a.id(), "still here").unwrap();
    let env = tokio::time::timeout(LIMIT, b.recv()).await.unwrap().unwrap();
    assert_eq!(env.payload, "still here");
    assert_eq!(env.sequence_number, 1);
    assert_eq!(
        next_event(&mut alice_events, LIMIT).await,
        Event::Delivered {
            connection: a.id(),
            message_id: small,
        }
    );
    assert!(bob_events.try_recv().is_err());
    assert_eq!(bob.connections(), vec![b.id()]);
}
