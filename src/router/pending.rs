//! Correlation table for outstanding requests.
//!
//! A request is identified by `(requester, sequence)`. The router registers
//! an entry before routing the request; the entry is resolved exactly once,
//! by a response, a local deadline, loss of the target process, or the
//! owner cancelling it. Whatever arrives after resolution is dropped.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::RequestError;
use crate::models::{Message, ProcessId, RouteTarget};

/// Identity of a request: who sent it and with which sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    /// Requesting process.
    pub requester: ProcessId,
    /// Sequence of the request message.
    pub sequence: u64,
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.requester, self.sequence)
    }
}

/// Lifecycle of a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// No outcome yet.
    Waiting,
    /// A response arrived.
    Completed,
    /// The deadline passed first.
    TimedOut,
    /// The target process went away.
    Lost,
    /// The owner gave up.
    Cancelled,
}

type Outcome = Result<Message, RequestError>;

struct Entry {
    target: RouteTarget,
    deadline: Instant,
    reply: oneshot::Sender<Outcome>,
}

/// Router-owned table of waiting requests.
#[derive(Clone, Default)]
pub struct PendingTable {
    entries: Arc<Mutex<HashMap<RequestId, Entry>>>,
}

impl PendingTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and get the handle its owner waits on.
    #[must_use]
    pub fn register(&self, id: RequestId, target: RouteTarget, timeout: Duration) -> PendingReply {
        let (reply, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        self.lock().insert(
            id,
            Entry {
                target,
                deadline,
                reply,
            },
        );
        PendingReply {
            id,
            deadline,
            rx,
            table: self.clone(),
        }
    }

    /// Deliver a response. Returns `false` for late or unknown responses.
    pub fn complete(&self, id: RequestId, response: Message) -> bool {
        self.resolve(id, PendingState::Completed, Ok(response))
    }

    /// Deliver a response only if `responder` is the process the request
    /// was sent to. Answers from anyone else are dropped.
    pub fn complete_from(&self, id: RequestId, responder: ProcessId, response: Message) -> bool {
        let expected = self.lock().get(&id).map(|entry| entry.target);
        let Some(target) = expected else {
            debug!(request = %id, %responder, "no pending entry; dropping response");
            return false;
        };
        let genuine = match target {
            RouteTarget::Process(expected) => expected == responder,
            RouteTarget::Broker => responder.is_coordinator(),
            RouteTarget::Broadcast(_) => false,
        };
        if !genuine {
            warn!(request = %id, %responder, %target, "response from unexpected process dropped");
            return false;
        }
        self.complete(id, response)
    }

    /// Fail a request with `Timeout`.
    pub fn expire(&self, id: RequestId) -> bool {
        self.resolve(id, PendingState::TimedOut, Err(RequestError::Timeout))
    }

    /// Fail a request because its route was rejected.
    pub fn fail(&self, id: RequestId, error: RequestError) -> bool {
        self.resolve(id, PendingState::Lost, Err(error))
    }

    /// Fail every request targeting `lost` with `ProcessLost`.
    ///
    /// Returns the identifiers that were failed.
    pub fn fail_target(&self, lost: ProcessId) -> Vec<RequestId> {
        let failed: Vec<(RequestId, Entry)> = {
            let mut entries = self.lock();
            let ids: Vec<RequestId> = entries
                .iter()
                .filter(|(_, entry)| entry.target == RouteTarget::Process(lost))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        failed
            .into_iter()
            .map(|(id, entry)| {
                debug!(request = %id, %lost, "failing pending request: target lost");
                let _ = entry.reply.send(Err(RequestError::ProcessLost(lost)));
                id
            })
            .collect()
    }

    /// Drop entries owned by `requester` (the waiter is gone).
    pub fn forget_requester(&self, requester: ProcessId) {
        self.lock().retain(|id, _| id.requester != requester);
    }

    /// Expire every entry whose deadline is at or before `now`.
    pub fn expire_due(&self, now: Instant) -> Vec<RequestId> {
        let due: Vec<RequestId> = self
            .lock()
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        due.into_iter().filter(|id| self.expire(*id)).collect()
    }

    /// Drop every entry; their owners observe `Cancelled`.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Whether `id` is still waiting.
    #[must_use]
    pub fn contains(&self, id: RequestId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Number of waiting requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn resolve(&self, id: RequestId, state: PendingState, outcome: Outcome) -> bool {
        let Some(entry) = self.lock().remove(&id) else {
            debug!(request = %id, ?state, "no pending entry; dropping outcome");
            return false;
        };
        debug!(request = %id, ?state, "pending request resolved");
        // The owner may have dropped its handle without cancelling.
        let _ = entry.reply.send(outcome);
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owner's handle on one pending request.
pub struct PendingReply {
    id: RequestId,
    deadline: Instant,
    rx: oneshot::Receiver<Outcome>,
    table: PendingTable,
}

impl PendingReply {
    /// Identity of the request.
    #[must_use]
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the outcome. Expiry is local: when the deadline passes the
    /// entry is removed and `Timeout` is returned without peer involvement.
    ///
    /// # Errors
    ///
    /// [`RequestError::Timeout`], [`RequestError::ProcessLost`],
    /// [`RequestError::Cancelled`], or a routing failure.
    pub async fn recv(self) -> Outcome {
        let Self {
            id,
            deadline,
            rx,
            table,
        } = self;
        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_closed)) => Err(RequestError::Cancelled),
            Err(_elapsed) => {
                table.expire(id);
                Err(RequestError::Timeout)
            }
        }
    }

    /// Cancel the request. A response that still arrives is dropped; the
    /// request itself is not retracted.
    pub fn cancel(self) {
        if self.table.lock().remove(&self.id).is_some() {
            debug!(request = %self.id, "pending request cancelled");
        }
    }
}
