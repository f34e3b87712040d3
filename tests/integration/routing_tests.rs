//! Integration tests for message routing.
//!
//! Uses driven workers to check ordering, broadcast membership, the
//! worker-to-worker allow list, replay rejection, request/response
//! correlation, the frame limit and the handling of unknown destinations.

use std::time::Duration;

use bytes::Bytes;

use privsep_bus::errors::{ChannelError, RequestError, RouteError};
use privsep_bus::models::{
    BroadcastSet, Message, MessageKind, PriorityClass, ProcessId, ProcessRole, RouteTarget,
};
use privsep_bus::schema::HEADER_LEN;

use super::test_helpers::{
    assert_silent, next_message, spawn_driven, start_driven_bus, test_config, TestBus, WAIT,
};

const QUIET: Duration = Duration::from_millis(150);

fn renderer(site: &str) -> ProcessRole {
    ProcessRole::Renderer {
        site_key: site.into(),
    }
}

async fn next_inbox(bus: &mut TestBus) -> Message {
    tokio::time::timeout(WAIT, bus.inbox.recv())
        .await
        .expect("coordinator inbox within deadline")
        .expect("inbox open")
}

// ── Ordering and fan-out ──────────────────────────────────────────────────────

/// Messages from one sender to one destination arrive in send order.
#[tokio::test]
async fn pairwise_order_is_preserved() {
    let (bus, mut handoff) = start_driven_bus(test_config());
    let (id, mut worker) =
        spawn_driven(&bus, &mut handoff, renderer("https://a.test"), None).await;

    for index in 0..50 {
        bus.coordinator
            .send(
                RouteTarget::Process(id),
                MessageKind::DomUpdate,
                format!("update-{index}"),
            )
            .await
            .expect("route update");
    }

    let mut last_sequence = 0;
    for index in 0..50 {
        let message = next_message(&mut worker).await;
        assert_eq!(message.kind(), MessageKind::DomUpdate);
        assert_eq!(message.payload().as_ref(), format!("update-{index}").as_bytes());
        assert!(message.sequence() > last_sequence);
        last_sequence = message.sequence();
    }
}

/// A renderer broadcast reaches every Ready renderer and nothing else.
#[tokio::test]
async fn broadcast_reaches_renderers_only() {
    let (bus, mut handoff) = start_driven_bus(test_config());
    let (first_id, mut first) =
        spawn_driven(&bus, &mut handoff, renderer("https://a.test"), None).await;
    let (second_id, mut second) =
        spawn_driven(&bus, &mut handoff, renderer("https://b.test"), None).await;
    let (_, mut network) = spawn_driven(&bus, &mut handoff, ProcessRole::Network, None).await;

    bus.coordinator
        .send(
            RouteTarget::Broadcast(BroadcastSet::AllRenderers),
            MessageKind::SecurityEvent,
            "certificate revoked",
        )
        .await
        .expect("broadcast");

    for (id, worker) in [(first_id, &mut first), (second_id, &mut second)] {
        let message = next_message(worker).await;
        assert_eq!(message.kind(), MessageKind::SecurityEvent);
        assert_eq!(message.destination(), RouteTarget::Process(id));
        assert_eq!(message.priority(), PriorityClass::Critical);
    }
    assert_silent(&mut network, QUIET).await;
}

/// A broadcast with no Ready members is an unknown destination.
#[tokio::test]
async fn broadcast_without_members_fails() {
    let (bus, _handoff) = start_driven_bus(test_config());
    let err = bus
        .coordinator
        .send(
            RouteTarget::Broadcast(BroadcastSet::AllWorkers),
            MessageKind::SecurityEvent,
            Bytes::new(),
        )
        .await
        .expect_err("nobody to broadcast to");
    assert_eq!(
        err,
        RouteError::UnknownDestination(RouteTarget::Broadcast(BroadcastSet::AllWorkers))
    );
}

// ── Worker traffic ────────────────────────────────────────────────────────────

/// Workers may not broadcast or send kinds outside the allow list to peers.
#[tokio::test]
async fn forbidden_worker_traffic_is_dropped() {
    let (bus, mut handoff) = start_driven_bus(test_config());
    let (_, sender) = spawn_driven(&bus, &mut handoff, renderer("https://a.test"), None).await;
    let (peer_id, mut peer) =
        spawn_driven(&bus, &mut handoff, renderer("https://b.test"), None).await;

    sender
        .send(
            RouteTarget::Broadcast(BroadcastSet::AllRenderers),
            MessageKind::DomUpdate,
            "to everyone",
        )
        .expect("send broadcast");
    sender
        .send(
            RouteTarget::Process(peer_id),
            MessageKind::Navigate,
            "https://evil.test",
        )
        .expect("send navigate");

    assert_silent(&mut peer, QUIET).await;
}

/// Network requests may cross between workers and are answered in kind.
#[tokio::test]
async fn worker_request_to_network_process() {
    let (bus, mut handoff) = start_driven_bus(test_config());
    let (_, renderer_worker) =
        spawn_driven(&bus, &mut handoff, renderer("https://a.test"), None).await;
    let (network_id, mut network) =
        spawn_driven(&bus, &mut handoff, ProcessRole::Network, None).await;

    let serve = async {
        let request = next_message(&mut network).await;
        assert_eq!(request.kind(), MessageKind::NetworkRequest);
        assert_eq!(request.payload().as_ref(), b"GET https://a.test/");
        network
            .reply(&request, MessageKind::NetworkResponse, b"200 OK")
            .expect("reply");
    };
    let (response, ()) = tokio::join!(
        renderer_worker.request(
            RouteTarget::Process(network_id),
            MessageKind::NetworkRequest,
            "GET https://a.test/",
            WAIT,
        ),
        serve,
    );
    let response = response.expect("network response");
    assert_eq!(response.kind(), MessageKind::NetworkResponse);
    assert_eq!(response.sender(), network_id);
    assert_eq!(response.body().as_ref(), b"200 OK");
}

/// A worker's request to a process that does not exist fails fast.
#[tokio::test]
async fn worker_request_to_unknown_process_is_lost() {
    let (bus, mut handoff) = start_driven_bus(test_config());
    let (_, worker) = spawn_driven(&bus, &mut handoff, renderer("https://a.test"), None).await;

    let missing = ProcessId(42);
    let err = worker
        .request(
            RouteTarget::Process(missing),
            MessageKind::NetworkRequest,
            "GET /",
            WAIT,
        )
        .await
        .expect_err("no such process");
    assert_eq!(err, RequestError::ProcessLost(missing));
}

/// Duplicate sequences are dropped unless the kind is retry-safe.
#[tokio::test]
async fn replayed_sequences_are_dropped() {
    let (mut bus, mut handoff) = start_driven_bus(test_config());
    let (id, worker) = spawn_driven(&bus, &mut handoff, renderer("https://a.test"), None).await;
    let to_coordinator = RouteTarget::Process(ProcessId::COORDINATOR);
    let frame = |kind, sequence, payload: &'static str| {
        Message::new(id, to_coordinator, kind, sequence, payload)
    };

    for message in [
        frame(MessageKind::DomUpdate, 5, "first"),
        frame(MessageKind::DomUpdate, 5, "replayed"),
        frame(MessageKind::DomUpdate, 4, "stale"),
        frame(MessageKind::DomUpdate, 6, "next"),
        frame(MessageKind::Telemetry, 7, "sample"),
        frame(MessageKind::Telemetry, 7, "sample again"),
    ] {
        worker.send_message(&message).expect("send");
    }

    let mut received = Vec::new();
    for _ in 0..4 {
        let message = next_inbox(&mut bus).await;
        assert_eq!(message.sender(), id);
        received.push(message.payload().clone());
    }
    assert_eq!(
        received,
        vec![
            Bytes::from_static(b"first"),
            Bytes::from_static(b"next"),
            Bytes::from_static(b"sample"),
            Bytes::from_static(b"sample again"),
        ]
    );
    assert!(
        tokio::time::timeout(QUIET, bus.inbox.recv()).await.is_err(),
        "nothing else reaches the coordinator"
    );
}

// ── Coordinator requests ──────────────────────────────────────────────────────

/// Ping measures a round trip through the worker's channel.
#[tokio::test]
async fn ping_measures_round_trip() {
    let (bus, mut handoff) = start_driven_bus(test_config());
    let (id, _worker) = spawn_driven(&bus, &mut handoff, ProcessRole::Gpu, None).await;

    let rtt = bus.coordinator.ping(id).await.expect("pong");
    assert!(rtt < WAIT, "round trip took {rtt:?}");
}

/// Low-urgency traffic to an unknown process fails at once; urgent traffic
/// waits out the retry deadline first.
#[tokio::test]
async fn unknown_destination_by_priority() {
    let (bus, _handoff) = start_driven_bus(test_config());
    let missing = RouteTarget::Process(ProcessId(42));

    let started = tokio::time::Instant::now();
    let err = bus
        .coordinator
        .send(missing, MessageKind::DomUpdate, "update")
        .await
        .expect_err("normal to unknown");
    assert_eq!(err, RouteError::UnknownDestination(missing));
    assert!(started.elapsed() < Duration::from_millis(100));

    let started = tokio::time::Instant::now();
    let err = bus
        .coordinator
        .request(missing, MessageKind::Navigate, "https://a.test", None)
        .await
        .expect_err("navigate to unknown");
    assert_eq!(err, RequestError::Route(RouteError::UnknownDestination(missing)));
    assert!(started.elapsed() >= Duration::from_millis(100));
}

// ── Frame limit ───────────────────────────────────────────────────────────────

const FRAME_LIMIT: usize = 16 * 1024;

/// Messages that can never fit one frame are refused by the router itself,
/// and a coordinator request fails at once instead of timing out.
#[tokio::test]
async fn oversize_coordinator_traffic_is_refused() {
    let mut config = test_config();
    config.transport.max_frame_bytes = FRAME_LIMIT;
    let (bus, mut handoff) = start_driven_bus(config);
    let (id, mut worker) = spawn_driven(&bus, &mut handoff, renderer("https://a.test"), None).await;
    let destination = RouteTarget::Process(id);
    let oversized = Bytes::from(vec![0_u8; FRAME_LIMIT]);
    let too_large = ChannelError::FrameTooLarge {
        size: HEADER_LEN + FRAME_LIMIT,
        limit: FRAME_LIMIT,
    };

    let err = bus
        .coordinator
        .send(destination, MessageKind::DomUpdate, oversized.clone())
        .await
        .expect_err("frame too large");
    assert_eq!(err, RouteError::Channel(too_large.clone()));

    let started = tokio::time::Instant::now();
    let err = bus
        .coordinator
        .request(destination, MessageKind::Navigate, oversized, None)
        .await
        .expect_err("frame too large");
    assert_eq!(err, RequestError::Channel(too_large));
    assert!(started.elapsed() < Duration::from_millis(500));

    assert_silent(&mut worker, QUIET).await;
    bus.coordinator
        .send(destination, MessageKind::DomUpdate, "fits")
        .await
        .expect("small message still routes");
    let update = next_message(&mut worker).await;
    assert_eq!(update.payload().as_ref(), b"fits");
}

/// A worker request over the bus frame limit is answered with a timeout
/// notice right away and never reaches its target.
#[tokio::test]
async fn oversize_worker_request_fails_fast() {
    let mut config = test_config();
    config.transport.max_frame_bytes = FRAME_LIMIT;
    let (bus, mut handoff) = start_driven_bus(config);
    let (_, renderer_worker) =
        spawn_driven(&bus, &mut handoff, renderer("https://a.test"), None).await;
    let (network_id, mut network) =
        spawn_driven(&bus, &mut handoff, ProcessRole::Network, None).await;

    let started = tokio::time::Instant::now();
    let err = renderer_worker
        .request(
            RouteTarget::Process(network_id),
            MessageKind::NetworkRequest,
            vec![0_u8; FRAME_LIMIT],
            Duration::from_secs(3),
        )
        .await
        .expect_err("frame too large for the bus");
    assert_eq!(err, RequestError::Timeout);
    assert!(
        started.elapsed() < Duration::from_secs(1),
        "failed after {:?}",
        started.elapsed()
    );
    assert_silent(&mut network, QUIET).await;
}
