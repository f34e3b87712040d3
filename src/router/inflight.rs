//! Worker requests the coordinator has relayed to another worker.
//!
//! The requester's own pending table lives in the worker, so the coordinator
//! keeps this lighter record instead: enough to tell the requester its target
//! is gone when the target exits before answering. An entry is settled by
//! a response from the target, or a coordinator notice, addressed back to
//! the requester with its sequence in the reply prefix.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::models::ProcessId;
use crate::router::pending::RequestId;

struct Relayed {
    target: ProcessId,
    relayed_at: Instant,
}

/// Router-owned table of relayed worker requests.
#[derive(Default)]
pub struct InFlightTable {
    entries: Mutex<HashMap<RequestId, Relayed>>,
}

impl InFlightTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that `request` was admitted for delivery to `target`.
    pub fn record(&self, request: RequestId, target: ProcessId, now: Instant) {
        self.lock().insert(
            request,
            Relayed {
                target,
                relayed_at: now,
            },
        );
    }

    /// Forget `request` once `responder` answered it. Only the target or the
    /// coordinator can settle a request. Returns whether it was outstanding.
    pub fn settle(&self, request: RequestId, responder: ProcessId) -> bool {
        let mut entries = self.lock();
        let answered = entries
            .get(&request)
            .is_some_and(|relayed| responder.is_coordinator() || relayed.target == responder);
        if answered {
            entries.remove(&request);
        }
        answered
    }

    /// Drop `request` without an answer, e.g. when it was never delivered.
    pub fn forget(&self, request: RequestId) {
        self.lock().remove(&request);
    }

    /// Remove and return every request still waiting on `lost`, and drop
    /// the requests `lost` itself had outstanding.
    pub fn take_target(&self, lost: ProcessId) -> Vec<RequestId> {
        let mut entries = self.lock();
        let mut waiting: Vec<RequestId> = entries
            .iter()
            .filter(|(_, relayed)| relayed.target == lost)
            .map(|(request, _)| *request)
            .collect();
        entries.retain(|request, relayed| relayed.target != lost && request.requester != lost);
        waiting.sort_by_key(|request| (request.requester, request.sequence));
        waiting
    }

    /// Drop entries relayed longer than `retention` ago. Their requesters
    /// have given up on them by now.
    pub fn prune(&self, now: Instant, retention: Duration) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, relayed| now.saturating_duration_since(relayed.relayed_at) < retention);
        before - entries.len()
    }

    /// Whether `request` is still outstanding.
    #[must_use]
    pub fn contains(&self, request: RequestId) -> bool {
        self.lock().contains_key(&request)
    }

    /// Number of outstanding relayed requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, Relayed>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
