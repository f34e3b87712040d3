//! Unit tests for the domain models: capabilities, roles, message kinds and
//! the process table.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use privsep_bus::broker::scope;
use privsep_bus::errors::BrokerError;
use privsep_bus::models::capability::ANY_PATH_SCOPE;
use privsep_bus::models::{
    Capability, CapabilityKind, CapabilitySet, ExitStatus, MessageKind, PriorityClass, ProcessId,
    ProcessRecord, ProcessRole, ProcessState, ProcessTable,
};

fn renderer(site: &str) -> ProcessRole {
    ProcessRole::Renderer {
        site_key: site.into(),
    }
}

// ── Capabilities ──────────────────────────────────────────────────────────────

/// Renderers start with nothing; other roles get only their own resource.
#[test]
fn role_default_grants() {
    assert!(CapabilitySet::default_for(&renderer("https://a.test")).is_empty());

    let network = CapabilitySet::default_for(&ProcessRole::Network);
    assert!(network.grants(CapabilityKind::NetworkConnect));
    assert!(!network.grants(CapabilityKind::FileRead));

    let gpu = CapabilitySet::default_for(&ProcessRole::Gpu);
    assert!(gpu.grants(CapabilityKind::GraphicsDeviceAccess));
    assert!(!gpu.grants(CapabilityKind::ClipboardRead));

    let utility = CapabilitySet::default_for(&ProcessRole::Utility {
        kind: "decoder".into(),
    });
    assert!(utility.grants(CapabilityKind::SystemInfo));

    let coordinator = CapabilitySet::default_for(&ProcessRole::Coordinator);
    assert!(coordinator.permits_path(CapabilityKind::FileWrite, Path::new("/etc/hosts")));
}

/// A single `*` stays inside one directory; `**` crosses directories.
#[test]
fn scope_globs_respect_separators() {
    let caps: CapabilitySet = [
        Capability::FileRead {
            scope: "/data/*.txt".into(),
        },
        Capability::FileWrite {
            scope: "/out/**".into(),
        },
    ]
    .into_iter()
    .collect();

    assert!(caps.permits_path(CapabilityKind::FileRead, Path::new("/data/a.txt")));
    assert!(!caps.permits_path(CapabilityKind::FileRead, Path::new("/data/sub/a.txt")));
    assert!(!caps.permits_path(CapabilityKind::FileWrite, Path::new("/data/a.txt")));
    assert!(caps.permits_path(CapabilityKind::FileWrite, Path::new("/out/x/y/z.bin")));
    assert!(!caps.permits_path(CapabilityKind::FileRead, Path::new("/out/x")));
}

/// Sets print as a sorted, comma separated list.
#[test]
fn capability_set_display() {
    assert_eq!(CapabilitySet::none().to_string(), "none");
    let caps: CapabilitySet = [
        Capability::SystemInfo,
        Capability::FileRead {
            scope: ANY_PATH_SCOPE.into(),
        },
    ]
    .into_iter()
    .collect();
    assert_eq!(caps.to_string(), "file_read(/**),system_info");
}

/// Grants serialize with a capability tag so configuration can carry them.
#[test]
fn capability_serialization() {
    let cap = Capability::FileRead {
        scope: "/srv/**".into(),
    };
    let json = serde_json::to_value(&cap).expect("serialize");
    assert_eq!(json["capability"], "file_read");
    assert_eq!(json["scope"], "/srv/**");
    let back: Capability = serde_json::from_value(json).expect("deserialize");
    assert_eq!(back, cap);
}

// ── Path normalization ────────────────────────────────────────────────────────

/// `.` and `..` fold lexically; climbing above the root is refused.
#[test]
fn normalize_folds_dot_segments() {
    assert_eq!(
        scope::normalize(Path::new("/a/./b/../c")).expect("normalize"),
        Path::new("/a/c")
    );
    assert!(matches!(
        scope::normalize(Path::new("/../etc/passwd")),
        Err(BrokerError::InvalidRequest(_))
    ));
    assert!(matches!(
        scope::normalize(Path::new("a/b")),
        Err(BrokerError::InvalidRequest(_))
    ));
}

/// The scope check applies to the folded path.
#[test]
fn authorize_path_checks_folded_path() {
    let caps: CapabilitySet = [Capability::FileRead {
        scope: "/granted/**".into(),
    }]
    .into_iter()
    .collect();
    let id = ProcessId(4);
    assert!(matches!(
        scope::authorize_path(
            &caps,
            CapabilityKind::FileRead,
            id,
            Path::new("/granted/../secret")
        ),
        Err(BrokerError::PermissionDenied { requester, .. }) if requester == id
    ));
}

// ── Roles and exits ───────────────────────────────────────────────────────────

/// Labels are stable; display includes the site or helper kind.
#[test]
fn role_labels_and_display() {
    assert_eq!(renderer("https://a.test").label(), "renderer");
    assert_eq!(renderer("https://a.test").to_string(), "renderer[https://a.test]");
    assert_eq!(
        ProcessRole::Utility {
            kind: "unzip".into()
        }
        .to_string(),
        "utility[unzip]"
    );
    assert_eq!(ProcessRole::Gpu.to_string(), "gpu");
    assert!(renderer("x").is_renderer());
    assert!(!ProcessRole::Network.is_renderer());
}

/// Only crashes count towards restarts.
#[test]
fn exit_status_crash_classification() {
    assert!(!ExitStatus::Exited { code: 0 }.is_crash());
    assert!(ExitStatus::Exited { code: 1 }.is_crash());
    assert!(ExitStatus::Crashed {
        reason: "SIGSEGV".into()
    }
    .is_crash());
    assert!(ExitStatus::ChannelLost.is_crash());
    assert!(!ExitStatus::Terminated {
        reason: "drained".into()
    }
    .is_crash());
    assert_eq!(ExitStatus::ChannelLost.to_string(), "channel lost");
}

/// Starting may only become Ready or Terminated.
#[test]
fn starting_transitions() {
    assert!(ProcessState::Starting.can_transition_to(ProcessState::Ready));
    assert!(ProcessState::Starting.can_transition_to(ProcessState::Terminated));
    assert!(!ProcessState::Ready.can_transition_to(ProcessState::Starting));
}

// ── Message kinds ─────────────────────────────────────────────────────────────

/// Wire codes and names are unique and resolve back to their kind.
#[test]
fn kind_codes_and_names_round_trip() {
    let mut codes: Vec<u32> = MessageKind::ALL.iter().map(|kind| kind.code()).collect();
    codes.sort_unstable();
    codes.dedup();
    assert_eq!(codes.len(), MessageKind::ALL.len());

    for kind in MessageKind::ALL {
        assert_eq!(MessageKind::from_code(kind.code()), Some(kind));
        assert_eq!(MessageKind::from_name(kind.name()), Some(kind));
    }
    assert_eq!(MessageKind::from_code(0), None);
    assert_eq!(MessageKind::from_name("teleport"), None);
}

/// Input and security traffic is Critical and never expires; frames are Low
/// and short-lived.
#[test]
fn kind_defaults() {
    assert_eq!(
        MessageKind::InputEvent.default_priority(),
        PriorityClass::Critical
    );
    assert_eq!(MessageKind::InputEvent.default_ttl(), None);
    assert_eq!(MessageKind::FrameData.default_priority(), PriorityClass::Low);
    assert_eq!(
        MessageKind::FrameData.default_ttl(),
        Some(Duration::from_millis(500))
    );
    assert_eq!(MessageKind::Navigate.default_priority(), PriorityClass::High);
    assert_eq!(MessageKind::DomUpdate.default_priority(), PriorityClass::Normal);
}

/// Every request kind has a matching response shape.
#[test]
fn kind_roles() {
    for kind in MessageKind::ALL {
        assert!(
            !(kind.is_request() && kind.is_response()),
            "{kind} cannot be both request and response"
        );
    }
    assert!(MessageKind::BrokerResponse.is_coordinator_only());
    assert!(MessageKind::BrokerRequest.is_privileged());
    assert!(!MessageKind::BrokerRequest.is_coordinator_only());
    assert!(MessageKind::Telemetry.is_retry_safe());
    assert!(!MessageKind::Navigate.is_retry_safe());
}

/// Priority classes order Low < Normal < High < Critical.
#[test]
fn priority_ordering() {
    assert!(PriorityClass::Low < PriorityClass::Normal);
    assert!(PriorityClass::High < PriorityClass::Critical);
    for class in PriorityClass::DESCENDING {
        assert_eq!(PriorityClass::from_u8(class.as_u8()), Some(class));
    }
    assert_eq!(PriorityClass::from_u8(4), None);
}

// ── Process table ─────────────────────────────────────────────────────────────

/// Site lookup only returns Ready renderers.
#[test]
fn table_finds_ready_renderer_for_site() {
    let mut starting = ProcessRecord::new(ProcessId(1), renderer("https://a.test"), CapabilitySet::none());
    starting.state = ProcessState::Starting;
    let mut ready = ProcessRecord::new(ProcessId(2), renderer("https://a.test"), CapabilitySet::none());
    ready.state = ProcessState::Ready;
    let mut other = ProcessRecord::new(ProcessId(3), renderer("https://b.test"), CapabilitySet::none());
    other.state = ProcessState::Ready;

    let table = ProcessTable::new(BTreeMap::from([
        (ProcessId(1), starting),
        (ProcessId(2), ready),
        (ProcessId(3), other),
    ]));

    assert_eq!(
        table.renderer_for_site("https://a.test").map(ProcessRecord::id),
        Some(ProcessId(2))
    );
    assert!(table.renderer_for_site("https://c.test").is_none());
    assert!(table.ready(ProcessId(1)).is_none());
    assert!(table.get(ProcessId(1)).is_some());
    assert_eq!(table.ready_records().count(), 2);
    assert_eq!(table.len(), 3);
}

/// The coordinator identifier is reserved and displayed with a prefix.
#[test]
fn coordinator_id() {
    assert!(ProcessId::COORDINATOR.is_coordinator());
    assert!(!ProcessId(1).is_coordinator());
    assert_eq!(ProcessId(12).to_string(), "p12");
}
