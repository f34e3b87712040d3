//! Integration tests for the starvation guard.
//!
//! The first scenarios drive [`ChannelQueues`] with explicit instants so the
//! latency boundary can be checked exactly; the last runs the real dispatcher
//! against a slow reader and checks that a Low message is not held behind a
//! long Critical burst.
//!
//! # Scenarios covered
//!
//! | Scenario | Expectation |
//! |----------|-------------|
//! | Low waits exactly the latency | Still behind Critical |
//! | Low waits past the latency | Dispatched once by the guard |
//! | Several starving Lows | Guard alternates with Critical |
//! | Normal and Low both starving | Older head goes first |
//! | Dispatcher under a Critical burst | Low arrives well before the burst ends |

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use privsep_bus::config::SchedulerConfig;
use privsep_bus::models::{Message, MessageKind, ProcessId, RouteTarget};
use privsep_bus::scheduler::{ChannelQueues, DispatchReason, QueueLimits, Scheduler};
use privsep_bus::schema::SchemaRegistry;
use privsep_bus::transport::{Channel, ChannelLimits};

use super::test_helpers::WAIT;

const LATENCY: Duration = Duration::from_millis(200);

fn queues() -> ChannelQueues {
    ChannelQueues::new(QueueLimits {
        class_caps: [1024, 1024, 512, 256],
        total_cap: 4096,
        starvation_max_latency: LATENCY,
    })
}

fn message(kind: MessageKind, sequence: u64, payload: impl Into<Bytes>) -> Message {
    Message::new(
        ProcessId::COORDINATOR,
        RouteTarget::Process(ProcessId(1)),
        kind,
        sequence,
        payload,
    )
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

fn pop(queues: &mut ChannelQueues, now: Instant) -> (MessageKind, DispatchReason) {
    let (queued, reason) = queues.pop_next(now).expect("message queued");
    (queued.message.kind(), reason)
}

// ── Latency boundary ──────────────────────────────────────────────────────────

/// Waiting exactly the latency is not starvation; one millisecond more is.
#[test]
fn guard_fires_strictly_after_latency() {
    let t0 = Instant::now();
    let mut queues = queues();
    queues
        .enqueue(message(MessageKind::Telemetry, 1, Bytes::new()), t0)
        .expect("low");
    for sequence in 1..=10 {
        queues
            .enqueue(message(MessageKind::InputEvent, sequence, Bytes::new()), t0)
            .expect("critical");
    }

    assert_eq!(
        pop(&mut queues, t0 + ms(199)),
        (MessageKind::InputEvent, DispatchReason::Priority)
    );
    assert_eq!(
        pop(&mut queues, t0 + ms(200)),
        (MessageKind::InputEvent, DispatchReason::Priority)
    );
    assert_eq!(
        pop(&mut queues, t0 + ms(201)),
        (MessageKind::Telemetry, DispatchReason::Starvation)
    );
    assert_eq!(
        pop(&mut queues, t0 + ms(201)),
        (MessageKind::InputEvent, DispatchReason::Priority)
    );
}

/// Starving messages are interleaved one at a time with Critical traffic.
#[test]
fn guard_alternates_with_critical() {
    let t0 = Instant::now();
    let mut queues = queues();
    for sequence in 1..=3 {
        queues
            .enqueue(message(MessageKind::Telemetry, sequence, Bytes::new()), t0)
            .expect("low");
    }
    for sequence in 1..=5 {
        queues
            .enqueue(message(MessageKind::InputEvent, sequence, Bytes::new()), t0)
            .expect("critical");
    }

    let now = t0 + ms(500);
    let order: Vec<MessageKind> = (0..8).map(|_| pop(&mut queues, now).0).collect();
    assert_eq!(
        order,
        vec![
            MessageKind::Telemetry,
            MessageKind::InputEvent,
            MessageKind::Telemetry,
            MessageKind::InputEvent,
            MessageKind::Telemetry,
            MessageKind::InputEvent,
            MessageKind::InputEvent,
            MessageKind::InputEvent,
        ]
    );
    assert!(queues.is_empty());
}

/// When Normal and Low both starve, the one that has waited longer goes.
#[test]
fn older_starving_head_wins() {
    let t0 = Instant::now();
    let mut queues = queues();
    queues
        .enqueue(message(MessageKind::Telemetry, 1, Bytes::new()), t0)
        .expect("low");
    queues
        .enqueue(message(MessageKind::DomUpdate, 1, Bytes::new()), t0 + ms(50))
        .expect("normal");
    queues
        .enqueue(message(MessageKind::InputEvent, 1, Bytes::new()), t0 + ms(300))
        .expect("critical");
    queues
        .enqueue(message(MessageKind::InputEvent, 2, Bytes::new()), t0 + ms(300))
        .expect("critical");

    let now = t0 + ms(400);
    assert_eq!(
        pop(&mut queues, now),
        (MessageKind::Telemetry, DispatchReason::Starvation)
    );
    assert_eq!(
        pop(&mut queues, now),
        (MessageKind::InputEvent, DispatchReason::Priority)
    );
    assert_eq!(
        pop(&mut queues, now),
        (MessageKind::DomUpdate, DispatchReason::Starvation)
    );
    assert_eq!(
        pop(&mut queues, now),
        (MessageKind::InputEvent, DispatchReason::Priority)
    );
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

/// A Low message queued ahead of a long Critical burst reaches a slow reader
/// long before the burst is over.
#[tokio::test]
async fn low_message_not_starved_by_critical_burst() {
    let scheduler = Scheduler::new(SchedulerConfig {
        overflow_retry_interval_ms: 1,
        ..SchedulerConfig::default()
    });
    let id = ProcessId(1);
    let (coordinator_end, worker_end) = Channel::pair(ChannelLimits {
        max_frame_bytes: 2048,
        buffer_bytes: 4096,
    });
    let parent = CancellationToken::new();
    let _dispatcher = scheduler.attach(id, coordinator_end, &parent);

    let body = Bytes::from(vec![0_u8; 1000]);
    scheduler
        .enqueue(id, message(MessageKind::Telemetry, 1, body.clone()))
        .expect("low admitted");
    for sequence in 1..=1000 {
        scheduler
            .enqueue(id, message(MessageKind::InputEvent, sequence, body.clone()))
            .expect("critical admitted");
    }

    let registry = SchemaRegistry::standard();
    let position = tokio::time::timeout(WAIT * 2, async {
        for position in 0..1001_usize {
            let frame = worker_end
                .recv()
                .await
                .expect("channel readable")
                .expect("frame");
            let message = registry.decode(&frame).expect("valid frame");
            if message.kind() == MessageKind::Telemetry {
                return position;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("low-priority message never arrived");
    })
    .await
    .expect("low-priority message within deadline");

    assert!(
        position < 900,
        "low-priority message arrived at position {position} of 1001"
    );
    parent.cancel();
}
