//! Structured audit logging for security-relevant bus events.
//!
//! Provides the [`AuditLogger`] trait and associated types. Two
//! implementations ship with the crate: [`JsonlAuditWriter`] appends JSONL
//! records to daily-rotating files, and [`MemoryAuditLog`] keeps entries in
//! memory for embedding hosts and tests.

pub mod writer;

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::ProcessId;

/// What a bus audit entry records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Broker performed an operation.
    BrokerGranted,
    /// Broker refused an operation for lack of capability.
    BrokerDenied,
    /// Broker performed an operation that failed.
    BrokerFailed,
    /// A process crossed the violation threshold.
    ViolationThreshold,
    /// A worker sent a privileged or coordinator-only kind it may not send.
    Impersonation,
    /// A structurally invalid frame arrived on a channel.
    MalformedFrame,
    /// A frame carried a kind or version the registry does not accept.
    VersionSkew,
    /// A process reached Ready.
    ProcessReady,
    /// A process reached Terminated.
    ProcessExited,
    /// A replacement was spawned for a crashed process.
    ProcessRestarted,
}

/// A structured record of a bus event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the event happened (UTC).
    pub timestamp: DateTime<Utc>,
    /// Event classification.
    pub event_type: AuditEventType,
    /// Process the event concerns.
    pub process_id: Option<ProcessId>,
    /// Role label of that process.
    pub role: Option<String>,
    /// Operation or message kind involved.
    pub operation: Option<String>,
    /// Capability required by the operation.
    pub capability: Option<String>,
    /// Brief outcome description.
    pub result_summary: Option<String>,
    /// Reason for a denial, failure, or exit.
    pub reason: Option<String>,
    /// Request sequence, when the event stems from a request.
    pub sequence: Option<u64>,
}

impl AuditEntry {
    /// Entry stamped now with only the event type set.
    #[must_use]
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            process_id: None,
            role: None,
            operation: None,
            capability: None,
            result_summary: None,
            reason: None,
            sequence: None,
        }
    }

    /// Set the process this entry concerns.
    #[must_use]
    pub fn with_process(mut self, id: ProcessId) -> Self {
        self.process_id = Some(id);
        self
    }

    /// Set the role label.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Set the operation or kind name.
    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Set the required capability.
    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }

    /// Set the result summary.
    #[must_use]
    pub fn with_result(mut self, summary: impl Into<String>) -> Self {
        self.result_summary = Some(summary.into());
        self
    }

    /// Set the reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Set the request sequence.
    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

/// Sink for bus audit entries.
///
/// Components hold it as `Arc<dyn AuditLogger>`.
pub trait AuditLogger: Send + Sync {
    /// Append one entry.
    ///
    /// # Errors
    ///
    /// Fails when the sink cannot persist the entry.
    fn log_entry(&self, entry: AuditEntry) -> crate::Result<()>;
}

/// In-memory audit log; doubles as the broker's request history.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every entry recorded so far.
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Entries of one event type.
    #[must_use]
    pub fn of_type(&self, event_type: AuditEventType) -> Vec<AuditEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.event_type == event_type)
            .collect()
    }

    /// Entries concerning one process, oldest first.
    #[must_use]
    pub fn history(&self, id: ProcessId) -> Vec<AuditEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.process_id == Some(id))
            .collect()
    }
}

impl AuditLogger for MemoryAuditLog {
    fn log_entry(&self, entry: AuditEntry) -> crate::Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        Ok(())
    }
}

/// Record `entry`, logging instead of failing when the sink is broken.
pub(crate) fn record(logger: &dyn AuditLogger, entry: AuditEntry) {
    let event_type = entry.event_type;
    if let Err(err) = logger.log_entry(entry) {
        tracing::warn!(?event_type, %err, "failed to write audit entry");
    }
}

pub use writer::JsonlAuditWriter;
