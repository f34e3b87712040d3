//! End-to-end tests for privileged operations requested by workers.
//!
//! Each scenario drives a worker through its own channel, so requests take
//! the full path: worker → reader → router diversion → broker → response
//! routed back to the requester.
//!
//! # Scenarios covered
//!
//! | Scenario | Expectation |
//! |----------|-------------|
//! | Renderer reads a file | `PermissionDenied` before any file-system access, audited |
//! | Utility reads inside its scope | File contents returned |
//! | Network process connects | Broker-held connection handle, closable once |
//! | Repeated denials | Termination at the violation threshold |
//! | Worker sends a coordinator-only kind | Impersonation audited |

use std::path::PathBuf;
use std::time::Duration;

use privsep_bus::audit::AuditEventType;
use privsep_bus::broker::{OpResult, PrivilegedOp};
use privsep_bus::errors::BrokerError;
use privsep_bus::models::{
    Capability, CapabilityKind, CapabilitySet, ExitStatus, MessageKind, ProcessRole, RouteTarget,
};
use privsep_bus::supervisor::SupervisorEvent;
use privsep_bus::{AppError, Worker};

use super::test_helpers::{
    assert_silent, eventually, spawn_driven, start_driven_bus, test_config, wait_for_event,
};

const TIMEOUT: Duration = Duration::from_secs(2);

fn renderer() -> ProcessRole {
    ProcessRole::Renderer {
        site_key: "https://a.test".into(),
    }
}

async fn broker_error(worker: &Worker, op: PrivilegedOp) -> BrokerError {
    match worker.broker(op, TIMEOUT).await {
        Err(AppError::Broker(err)) => err,
        other => panic!("expected a broker error, got {other:?}"),
    }
}

// ── Denials ───────────────────────────────────────────────────────────────────

/// A renderer's file read is refused on capability alone; the path does not
/// even exist, so any other answer would mean the broker touched the disk.
#[tokio::test]
async fn renderer_file_read_is_denied() {
    let (bus, mut handoff) = start_driven_bus(test_config());
    let (id, worker) = spawn_driven(&bus, &mut handoff, renderer(), None).await;

    let err = broker_error(
        &worker,
        PrivilegedOp::FileRead {
            path: PathBuf::from("/nonexistent/privsep-bus/secret.txt"),
            max_bytes: 64,
        },
    )
    .await;
    assert_eq!(
        err,
        BrokerError::PermissionDenied {
            requester: id,
            capability: CapabilityKind::FileRead,
        }
    );

    let denials = bus.audit.of_type(AuditEventType::BrokerDenied);
    assert_eq!(denials.len(), 1);
    assert_eq!(denials[0].process_id, Some(id));
    assert_eq!(denials[0].role.as_deref(), Some("renderer"));
    assert_eq!(denials[0].capability.as_deref(), Some("file_read"));
    assert_eq!(bus.coordinator.broker().violations(id), 1);
}

/// A helper granted a directory reads files inside it.
#[tokio::test]
async fn scoped_utility_reads_granted_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().canonicalize().expect("canonical root");
    let file = root.join("notes.txt");
    std::fs::write(&file, "scoped contents").expect("write file");

    let grant: CapabilitySet = [Capability::FileRead {
        scope: format!("{}/**", root.display()),
    }]
    .into_iter()
    .collect();

    let (bus, mut handoff) = start_driven_bus(test_config());
    let (_, worker) = spawn_driven(
        &bus,
        &mut handoff,
        ProcessRole::Utility {
            kind: "indexer".into(),
        },
        Some(grant),
    )
    .await;

    let result = worker
        .broker(
            PrivilegedOp::FileRead {
                path: file,
                max_bytes: 1024,
            },
            TIMEOUT,
        )
        .await
        .expect("read granted file");
    assert_eq!(
        result,
        OpResult::Data {
            bytes: b"scoped contents".to_vec(),
            truncated: false,
        }
    );
    assert_eq!(bus.audit.of_type(AuditEventType::BrokerGranted).len(), 1);
}

// ── Broker-held resources ─────────────────────────────────────────────────────

/// The network process gets a handle to a connection the broker holds.
#[tokio::test]
async fn network_connect_returns_handle() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();
    let accept = tokio::spawn(async move { listener.accept().await.map(|(_, peer)| peer) });

    let (bus, mut handoff) = start_driven_bus(test_config());
    let (id, worker) = spawn_driven(&bus, &mut handoff, ProcessRole::Network, None).await;

    let result = worker
        .broker(
            PrivilegedOp::NetworkConnect {
                host: "127.0.0.1".into(),
                port,
            },
            TIMEOUT,
        )
        .await
        .expect("connect");
    let OpResult::Connected { token, peer } = result else {
        panic!("expected a connection handle, got {result:?}");
    };
    assert!(peer.ends_with(&format!(":{port}")), "{peer}");
    accept.await.expect("accept task").expect("accepted");

    let closed = worker
        .broker(
            PrivilegedOp::HandleClose {
                token: token.clone(),
            },
            TIMEOUT,
        )
        .await
        .expect("close handle");
    assert_eq!(closed, OpResult::Done);

    let err = broker_error(&worker, PrivilegedOp::HandleClose { token }).await;
    assert_eq!(err, BrokerError::InvalidHandle);
    assert_eq!(bus.coordinator.broker().violations(id), 0);
}

// ── Violations ────────────────────────────────────────────────────────────────

/// Reaching the violation threshold terminates the offender.
#[tokio::test]
async fn repeated_denials_terminate_the_process() {
    let mut config = test_config();
    config.broker.violation_threshold = 2;
    let (bus, mut handoff) = start_driven_bus(config);
    let mut events = bus.coordinator.subscribe();
    let (id, worker) = spawn_driven(&bus, &mut handoff, renderer(), None).await;

    let err = broker_error(&worker, PrivilegedOp::ClipboardRead).await;
    assert!(matches!(err, BrokerError::PermissionDenied { .. }));
    // The second answer may never arrive once the process is draining.
    let _ = worker
        .broker(PrivilegedOp::ClipboardRead, Duration::from_millis(500))
        .await;

    let exited = wait_for_event(&mut events, |event| {
        matches!(event, SupervisorEvent::Exited { id: exited, .. } if *exited == id)
    })
    .await;
    let SupervisorEvent::Exited {
        status: ExitStatus::Terminated { reason },
        ..
    } = exited
    else {
        panic!("expected a termination, got {exited:?}");
    };
    assert!(reason.starts_with("2 privilege violations"), "{reason}");

    let thresholds = bus.audit.of_type(AuditEventType::ViolationThreshold);
    assert_eq!(thresholds.len(), 1);
    assert_eq!(thresholds[0].process_id, Some(id));
    assert!(
        bus.coordinator.table().renderer_for_site("https://a.test").is_none(),
        "terminated renderer is not restarted"
    );
}

/// A worker sending a coordinator-only kind is caught by the broker.
#[tokio::test]
async fn coordinator_only_kind_is_impersonation() {
    let (bus, mut handoff) = start_driven_bus(test_config());
    let (id, worker) = spawn_driven(&bus, &mut handoff, renderer(), None).await;
    let (_, mut peer) = spawn_driven(&bus, &mut handoff, ProcessRole::Network, None).await;

    worker
        .send(
            RouteTarget::Process(peer.id()),
            MessageKind::Shutdown,
            "pretend to be the coordinator",
        )
        .expect("send");

    let audit = &bus.audit;
    eventually("impersonation audit", || {
        !audit.of_type(AuditEventType::Impersonation).is_empty()
    })
    .await;
    let entry = &audit.of_type(AuditEventType::Impersonation)[0];
    assert_eq!(entry.process_id, Some(id));
    assert_eq!(entry.operation.as_deref(), Some("shutdown"));
    assert_eq!(bus.coordinator.broker().violations(id), 1);

    assert_silent(&mut peer, Duration::from_millis(100)).await;
    assert!(bus.coordinator.table().ready(id).is_some());
}
