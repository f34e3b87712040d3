//! Integration tests for the process lifecycle.
//!
//! Spawns in-process workers through the coordinator and validates the
//! Starting → Ready → Draining → Terminated path, launch failures, forced
//! termination after the drain window, record pruning, and shutdown.
//!
//! # Scenarios covered
//!
//! | Scenario | Expectation |
//! |----------|-------------|
//! | Cooperative worker terminated | Exit carries the drain reason, audit written |
//! | Unknown identifier terminated | `UnknownProcess` |
//! | Coordinator role spawned | `LaunchFailed`, no record |
//! | Launcher error | `LaunchFailed`, record Terminated with `Crashed` |
//! | Worker ignores `Shutdown` | Killed after the drain timeout |
//! | Zero retention | Terminated record pruned |
//! | Coordinator shutdown | Every worker Terminated |

use std::sync::Arc;
use std::time::Duration;

use privsep_bus::audit::AuditEventType;
use privsep_bus::errors::SupervisorError;
use privsep_bus::models::{ExitStatus, MessageKind, ProcessId, ProcessRole, ProcessState};
use privsep_bus::supervisor::{LaunchFuture, LaunchRequest, Launcher, SupervisorEvent};

use super::test_helpers::{
    eventually, next_seen, start_bus, start_bus_with, start_echo_bus, test_config, wait_for_event,
};

fn renderer(site: &str) -> ProcessRole {
    ProcessRole::Renderer {
        site_key: site.into(),
    }
}

struct FailingLauncher;

impl Launcher for FailingLauncher {
    fn launch(&self, _request: LaunchRequest) -> LaunchFuture<'_> {
        Box::pin(async { Err("executable missing".to_owned()) })
    }
}

// ── Spawn and drain ───────────────────────────────────────────────────────────

/// A worker that honours `Shutdown` exits with the drain reason.
#[tokio::test]
async fn spawn_then_terminate_drains_worker() {
    let (bus, mut seen) = start_echo_bus(test_config());
    let mut events = bus.coordinator.subscribe();

    let id = bus
        .coordinator
        .spawn(ProcessRole::Network, None)
        .await
        .expect("spawn network");
    let record = bus.coordinator.table().get(id).cloned().expect("record");
    assert_eq!(record.state, ProcessState::Ready);
    assert_eq!(record.role(), &ProcessRole::Network);

    bus.coordinator
        .terminate(id, "test done")
        .await
        .expect("terminate");

    let (receiver, shutdown) = next_seen(&mut seen).await;
    assert_eq!(receiver, id);
    assert_eq!(shutdown.kind(), MessageKind::Shutdown);
    assert_eq!(shutdown.payload().as_ref(), b"test done");

    let record = bus.coordinator.table().get(id).cloned().expect("record kept");
    assert_eq!(record.state, ProcessState::Terminated);
    assert_eq!(
        record.exit,
        Some(ExitStatus::Terminated {
            reason: "test done".into()
        })
    );

    let exited = wait_for_event(&mut events, |event| {
        matches!(event, SupervisorEvent::Exited { id: exited, .. } if *exited == id)
    })
    .await;
    assert!(matches!(exited, SupervisorEvent::Exited { status, .. } if !status.is_crash()));

    let history = bus.audit.history(id);
    let types: Vec<AuditEventType> = history.iter().map(|entry| entry.event_type).collect();
    assert_eq!(
        types,
        vec![AuditEventType::ProcessReady, AuditEventType::ProcessExited]
    );
    assert_eq!(history[1].reason.as_deref(), Some("terminated: test done"));
    assert!(!bus.coordinator.scheduler().is_attached(id));
}

/// Identifiers are allocated in spawn order and never reused.
#[tokio::test]
async fn identifiers_increase_across_spawns() {
    let (bus, _seen) = start_echo_bus(test_config());
    let first = bus
        .coordinator
        .spawn(renderer("https://a.test"), None)
        .await
        .expect("first");
    bus.coordinator.terminate(first, "done").await.expect("terminate");
    let second = bus
        .coordinator
        .spawn(renderer("https://a.test"), None)
        .await
        .expect("second");
    assert!(second > first, "{second} should follow {first}");
    assert!(!second.is_coordinator());
}

/// Terminating an identifier nobody owns is an error.
#[tokio::test]
async fn terminate_unknown_process() {
    let (bus, _seen) = start_echo_bus(test_config());
    let err = bus
        .coordinator
        .terminate(ProcessId(99), "nothing")
        .await
        .expect_err("unknown");
    assert_eq!(err, SupervisorError::UnknownProcess(ProcessId(99)));
}

/// The coordinator role is never launched.
#[tokio::test]
async fn coordinator_role_cannot_be_spawned() {
    let (bus, _seen) = start_echo_bus(test_config());
    let err = bus
        .coordinator
        .spawn(ProcessRole::Coordinator, None)
        .await
        .expect_err("coordinator role");
    assert!(matches!(
        err,
        SupervisorError::LaunchFailed {
            role: ProcessRole::Coordinator,
            ..
        }
    ));
    assert!(bus.coordinator.table().is_empty());
}

// ── Launch failures ───────────────────────────────────────────────────────────

/// A launcher error surfaces to the caller and leaves a crashed record.
#[tokio::test]
async fn launch_failure_is_reported() {
    let bus = start_bus_with(test_config(), Arc::new(FailingLauncher));
    let err = bus
        .coordinator
        .spawn(ProcessRole::Gpu, None)
        .await
        .expect_err("launch fails");
    assert_eq!(
        err,
        SupervisorError::LaunchFailed {
            role: ProcessRole::Gpu,
            reason: "executable missing".into()
        }
    );

    let table = bus.coordinator.table();
    let record = table.iter().next().expect("record for failed launch");
    assert_eq!(record.state, ProcessState::Terminated);
    assert_eq!(
        record.exit,
        Some(ExitStatus::Crashed {
            reason: "launch failed: executable missing".into()
        })
    );
    assert_eq!(bus.audit.of_type(AuditEventType::ProcessReady).len(), 0);
    assert_eq!(bus.audit.of_type(AuditEventType::ProcessExited).len(), 1);
}

// ── Forced termination ────────────────────────────────────────────────────────

/// A worker that never reads its channel is killed once the drain window
/// closes.
#[tokio::test]
async fn stubborn_worker_killed_after_drain_timeout() {
    let bus = start_bus(test_config(), |worker| async move {
        let _held = worker;
        std::future::pending::<()>().await;
    });
    let decoder = ProcessRole::Utility {
        kind: "decoder".into(),
    };
    let id = bus.coordinator.spawn(decoder, None).await.expect("spawn");

    let started = tokio::time::Instant::now();
    bus.coordinator.terminate(id, "idle").await.expect("terminate");
    assert!(
        started.elapsed() >= Duration::from_millis(300),
        "terminated before the drain window closed"
    );

    let record = bus.coordinator.table().get(id).cloned().expect("record");
    assert_eq!(
        record.exit,
        Some(ExitStatus::Terminated {
            reason: "idle (killed after drain timeout)".into()
        })
    );
}

/// Terminated records disappear after the retention window.
#[tokio::test]
async fn terminated_records_are_pruned() {
    let mut config = test_config();
    config.supervisor.terminated_retention_secs = 0;
    config.supervisor.prune_interval_secs = 1;
    let (bus, _seen) = start_echo_bus(config);

    let id = bus
        .coordinator
        .spawn(ProcessRole::Network, None)
        .await
        .expect("spawn");
    bus.coordinator.terminate(id, "done").await.expect("terminate");

    let coordinator = &bus.coordinator;
    eventually("pruned record", || coordinator.table().get(id).is_none()).await;
}

// ── Shutdown ──────────────────────────────────────────────────────────────────

/// Shutdown drains every worker before returning.
#[tokio::test]
async fn shutdown_terminates_every_worker() {
    let (bus, _seen) = start_echo_bus(test_config());
    let mut ids = Vec::new();
    for role in [
        ProcessRole::Network,
        ProcessRole::Gpu,
        renderer("https://a.test"),
    ] {
        ids.push(bus.coordinator.spawn(role, None).await.expect("spawn"));
    }

    bus.coordinator.shutdown().await;

    let table = bus.coordinator.table();
    for id in ids {
        let record = table.get(id).expect("record");
        assert_eq!(record.state, ProcessState::Terminated, "{id}");
        assert_eq!(
            record.exit,
            Some(ExitStatus::Terminated {
                reason: "coordinator shutdown".into()
            })
        );
    }
    assert!(
        bus.coordinator
            .spawn(ProcessRole::Network, None)
            .await
            .is_err(),
        "spawn after shutdown must fail"
    );
}
