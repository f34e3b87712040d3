//! Process identity, roles, and lifecycle records.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::models::capability::CapabilitySet;

/// Process-wide unique identifier assigned by the supervisor at spawn time.
///
/// Identifiers are allocated monotonically and never reused while the
/// coordinator is running. `0` is reserved for the coordinator itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub u64);

impl ProcessId {
    /// Reserved identifier of the privileged coordinator process.
    pub const COORDINATOR: Self = Self(0);

    /// Whether this identifier names the coordinator.
    #[must_use]
    pub fn is_coordinator(self) -> bool {
        self == Self::COORDINATOR
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Role of a process; decides the capability set granted at spawn time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "role")]
pub enum ProcessRole {
    /// The single privileged process.
    Coordinator,
    /// Sandboxed content process bound to one site.
    Renderer {
        /// Site the renderer is isolated to (scheme + registrable domain).
        site_key: String,
    },
    /// Network service process.
    Network,
    /// GPU / compositor process.
    Gpu,
    /// Short-lived helper process (decoders, unpackers, ...).
    Utility {
        /// Helper kind, e.g. `audio-decoder`.
        kind: String,
    },
}

impl ProcessRole {
    /// Stable role label used in logs, configuration keys and audit entries.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::Renderer { .. } => "renderer",
            Self::Network => "network",
            Self::Gpu => "gpu",
            Self::Utility { .. } => "utility",
        }
    }

    /// Whether this role is a renderer.
    #[must_use]
    pub fn is_renderer(&self) -> bool {
        matches!(self, Self::Renderer { .. })
    }
}

impl Display for ProcessRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Renderer { site_key } => write!(f, "renderer[{site_key}]"),
            Self::Utility { kind } => write!(f, "utility[{kind}]"),
            other => f.write_str(other.label()),
        }
    }
}

/// Lifecycle state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Spawn requested; channel not yet established.
    Starting,
    /// Channel established; routable.
    Ready,
    /// Graceful shutdown in progress; no new traffic is routed.
    Draining,
    /// Exited, crashed, or killed. Terminal.
    Terminated,
}

impl ProcessState {
    /// Whether `self -> next` is a legal supervisor transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::Ready | Self::Terminated)
                | (Self::Ready, Self::Draining | Self::Terminated)
                | (Self::Draining, Self::Terminated)
        )
    }
}

/// How a process left the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExitStatus {
    /// Process exited on its own with the given code.
    Exited {
        /// OS exit code.
        code: i32,
    },
    /// Process was killed by a signal or crashed without a code.
    Crashed {
        /// Human-readable description (signal name, launcher error, ...).
        reason: String,
    },
    /// The coordinator lost the channel (peer EOF or fatal transport error).
    ChannelLost,
    /// The supervisor terminated the process on request.
    Terminated {
        /// Reason passed to `terminate`.
        reason: String,
    },
}

impl ExitStatus {
    /// Whether the exit counts as a crash for restart purposes.
    #[must_use]
    pub fn is_crash(&self) -> bool {
        match self {
            Self::Exited { code } => *code != 0,
            Self::Crashed { .. } | Self::ChannelLost => true,
            Self::Terminated { .. } => false,
        }
    }
}

impl Display for ExitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited { code } => write!(f, "exited with code {code}"),
            Self::Crashed { reason } => write!(f, "crashed: {reason}"),
            Self::ChannelLost => f.write_str("channel lost"),
            Self::Terminated { reason } => write!(f, "terminated: {reason}"),
        }
    }
}

/// Supervisor view of one process.
///
/// `role` and `capabilities` are fixed at construction; only the supervisor
/// changes `state`.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    id: ProcessId,
    role: ProcessRole,
    capabilities: CapabilitySet,
    /// Current lifecycle state.
    pub state: ProcessState,
    /// Number of restarts that led to this incarnation of the role.
    pub restarts: u32,
    /// When the spawn was requested.
    pub spawned_at: Instant,
    /// When the record reached `Terminated`.
    pub terminated_at: Option<Instant>,
    /// Exit status once terminated.
    pub exit: Option<ExitStatus>,
}

impl ProcessRecord {
    /// Create a record in the `Starting` state.
    #[must_use]
    pub fn new(id: ProcessId, role: ProcessRole, capabilities: CapabilitySet) -> Self {
        Self {
            id,
            role,
            capabilities,
            state: ProcessState::Starting,
            restarts: 0,
            spawned_at: Instant::now(),
            terminated_at: None,
            exit: None,
        }
    }

    /// Process identifier.
    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Role assigned at spawn.
    #[must_use]
    pub fn role(&self) -> &ProcessRole {
        &self.role
    }

    /// Capabilities assigned at spawn.
    #[must_use]
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Whether the record can currently receive routed traffic.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == ProcessState::Ready
    }
}

/// Read-only snapshot of the supervisor's process table.
///
/// Published through a `watch` channel; readers never observe a partially
/// applied transition.
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    records: Arc<BTreeMap<ProcessId, ProcessRecord>>,
}

impl ProcessTable {
    /// Wrap a table built by the supervisor.
    #[must_use]
    pub fn new(records: BTreeMap<ProcessId, ProcessRecord>) -> Self {
        Self {
            records: Arc::new(records),
        }
    }

    /// Record for `id`, in any state.
    #[must_use]
    pub fn get(&self, id: ProcessId) -> Option<&ProcessRecord> {
        self.records.get(&id)
    }

    /// Record for `id` only if it is Ready.
    #[must_use]
    pub fn ready(&self, id: ProcessId) -> Option<&ProcessRecord> {
        self.get(id).filter(|record| record.is_ready())
    }

    /// All records, ordered by identifier.
    pub fn iter(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.records.values()
    }

    /// Ready records, ordered by identifier.
    pub fn ready_records(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.iter().filter(|record| record.is_ready())
    }

    /// Ready renderer bound to `site_key`, if any.
    #[must_use]
    pub fn renderer_for_site(&self, site_key: &str) -> Option<&ProcessRecord> {
        self.ready_records().find(|record| {
            matches!(record.role(), ProcessRole::Renderer { site_key: key } if key == site_key)
        })
    }

    /// Number of records, including terminated ones not yet pruned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<'a> IntoIterator for &'a ProcessTable {
    type Item = &'a ProcessRecord;
    type IntoIter = std::collections::btree_map::Values<'a, ProcessId, ProcessRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.values()
    }
}
