//! Router: destination resolution, classification, and broker diversion.
//!
//! Every message entering the bus passes through [`Router::route`], which
//! applies these checks in order:
//!
//! 1. Replay check per (sender, destination) for worker traffic; duplicates
//!    and out-of-order copies are dropped unless the kind is retry-safe.
//!    Coordinator sequences come from [`Router::next_sequence`] and may be
//!    routed out of allocation order by concurrent tasks; they are not
//!    re-checked.
//! 2. Privileged diversion: anything addressed to the broker, and any
//!    privileged or coordinator-only kind sent by a worker, goes to the
//!    broker queue whatever its destination field says.
//! 3. Classification: a worker's declared priority is replaced by the kind
//!    default (or the configured override); coordinator-originated messages
//!    keep their declared priority.
//! 4. Resolution against the latest process-table snapshot and admission
//!    into the destination's scheduler queues.
//!
//! Messages that could never be written as one frame are refused up front,
//! so a caller learns about it instead of the dispatcher dropping them.

pub mod inflight;
pub mod pending;
pub mod sequence;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RouterConfig;
use crate::errors::{BackpressureError, ChannelError, RequestError, RouteError};
use crate::models::{
    BroadcastSet, Message, MessageKind, PriorityClass, ProcessId, ProcessTable, RouteTarget,
};
use crate::scheduler::Scheduler;
use crate::schema::HEADER_LEN;

pub use inflight::InFlightTable;
pub use pending::{PendingReply, PendingState, PendingTable, RequestId};
pub use sequence::SequenceTracker;

/// Router shared by reader tasks, the broker, and the coordinator.
pub struct Router {
    config: RouterConfig,
    table: watch::Receiver<ProcessTable>,
    scheduler: Arc<Scheduler>,
    broker_tx: mpsc::Sender<Message>,
    inbox_tx: mpsc::Sender<Message>,
    pending: PendingTable,
    relayed: InFlightTable,
    frame_limit: usize,
    sequences: Mutex<SequenceTracker>,
    outgoing: Mutex<HashMap<RouteTarget, u64>>,
}

impl Router {
    /// Assemble a router.
    ///
    /// `broker_tx` feeds the privilege broker; `inbox_tx` receives messages
    /// addressed to the coordinator that do not complete a pending request.
    /// `frame_limit` is the largest encoded message a channel accepts.
    #[must_use]
    pub fn new(
        config: RouterConfig,
        table: watch::Receiver<ProcessTable>,
        scheduler: Arc<Scheduler>,
        broker_tx: mpsc::Sender<Message>,
        inbox_tx: mpsc::Sender<Message>,
        frame_limit: usize,
    ) -> Self {
        Self {
            config,
            table,
            scheduler,
            broker_tx,
            inbox_tx,
            pending: PendingTable::new(),
            relayed: InFlightTable::new(),
            frame_limit,
            sequences: Mutex::new(SequenceTracker::new()),
            outgoing: Mutex::new(HashMap::new()),
        }
    }

    /// Pending-request table.
    #[must_use]
    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Worker requests relayed to other workers and not yet answered.
    #[must_use]
    pub fn relayed(&self) -> &InFlightTable {
        &self.relayed
    }

    /// Router settings.
    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Next sequence for a coordinator-originated message to `destination`.
    pub fn next_sequence(&self, destination: RouteTarget) -> u64 {
        let mut outgoing = self.outgoing.lock().unwrap_or_else(PoisonError::into_inner);
        let next = outgoing.entry(destination).or_insert(0);
        *next += 1;
        *next
    }

    /// Route one message.
    ///
    /// # Errors
    ///
    /// - [`RouteError::Replayed`] for a stale worker sequence on a
    ///   non-retry-safe kind.
    /// - [`RouteError::Channel`] when the encoded message exceeds the frame
    ///   limit.
    /// - [`RouteError::Forbidden`] for worker traffic the bus does not carry.
    /// - [`RouteError::UnknownDestination`] when the target is not Ready.
    /// - [`RouteError::Backpressure`] when the destination queue is full.
    /// - [`RouteError::BrokerUnavailable`] when the broker queue is closed.
    pub async fn route(&self, message: Message) -> Result<(), RouteError> {
        let sender = message.sender();
        let kind = message.kind();
        let destination = message.destination();

        let from_worker = !sender.is_coordinator();
        if from_worker {
            self.sequences
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .observe(sender, destination, message.sequence(), kind.is_retry_safe())
                .inspect_err(|err| warn!(%sender, %kind, %err, "dropping replayed message"))?;
        }

        let size = HEADER_LEN + message.payload().len();
        if size > self.frame_limit {
            warn!(%sender, %kind, size, limit = self.frame_limit, "message exceeds the frame limit");
            return Err(RouteError::Channel(ChannelError::FrameTooLarge {
                size,
                limit: self.frame_limit,
            }));
        }

        if let (Some(in_reply_to), RouteTarget::Process(requester)) =
            (message.in_reply_to(), destination)
        {
            if !requester.is_coordinator() {
                let request = RequestId {
                    requester,
                    sequence: in_reply_to,
                };
                self.relayed.settle(request, sender);
            }
        }

        if destination == RouteTarget::Broker
            || (from_worker && (kind.is_privileged() || kind.is_coordinator_only()))
        {
            return self.divert_to_broker(message);
        }

        let message = self.classify(message);

        match destination {
            RouteTarget::Process(id) if id.is_coordinator() => self.deliver_local(message).await,
            RouteTarget::Process(id) => {
                if from_worker && !self.config.allows_cross_worker(kind) {
                    warn!(%sender, %id, %kind, "worker-to-worker kind not allowed");
                    return Err(RouteError::Forbidden { sender, kind });
                }
                let relay = (from_worker && kind.is_request()).then(|| RequestId {
                    requester: sender,
                    sequence: message.sequence(),
                });
                // The answer may arrive before delivery returns.
                if let Some(request) = relay {
                    self.relayed.record(request, id, Instant::now());
                }
                let delivered = self.deliver_to(id, message).await;
                if let (Err(_), Some(request)) = (&delivered, relay) {
                    self.relayed.forget(request);
                }
                delivered
            }
            RouteTarget::Broadcast(set) => {
                if from_worker {
                    warn!(%sender, %kind, "worker attempted broadcast");
                    return Err(RouteError::Forbidden { sender, kind });
                }
                self.broadcast(set, &message)
            }
            RouteTarget::Broker => self.divert_to_broker(message),
        }
    }

    /// Register a pending request, then route it.
    ///
    /// Routing failures resolve the returned handle immediately.
    pub async fn request(&self, message: Message, timeout: Duration) -> PendingReply {
        let id = RequestId {
            requester: message.sender(),
            sequence: message.sequence(),
        };
        let reply = self.pending.register(id, message.destination(), timeout);
        if let Err(err) = self.route(message).await {
            debug!(request = %id, %err, "request could not be routed");
            let error = match err {
                RouteError::Channel(err) => RequestError::Channel(err),
                err => RequestError::Route(err),
            };
            self.pending.fail(id, error);
        }
        reply
    }

    /// Fail everything waiting on `id` and forget its sequence state.
    pub fn fail_process(&self, id: ProcessId) -> Vec<RequestId> {
        let failed = self.pending.fail_target(id);
        self.sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .forget(id);
        self.outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&RouteTarget::Process(id));
        if !failed.is_empty() {
            info!(%id, failed = failed.len(), "failed pending requests for lost process");
        }
        failed
    }

    /// Take the worker requests relayed to `lost` that it never answered.
    ///
    /// Requests `lost` had outstanding itself are forgotten.
    pub fn take_relayed(&self, lost: ProcessId) -> Vec<RequestId> {
        self.relayed.take_target(lost)
    }

    /// Forget relayed requests older than the configured retention.
    pub fn prune_relayed(&self, now: Instant) -> usize {
        self.relayed.prune(now, self.config.relayed_retention())
    }

    /// Snapshot of the process table the router resolves against.
    #[must_use]
    pub fn table(&self) -> ProcessTable {
        self.table.borrow().clone()
    }

    fn classify(&self, message: Message) -> Message {
        if message.sender().is_coordinator() {
            return message;
        }
        let kind = message.kind();
        let class = self
            .config
            .priority_override(kind)
            .unwrap_or_else(|| kind.default_priority());
        if class == message.priority() {
            message
        } else {
            message.with_priority(class)
        }
    }

    fn divert_to_broker(&self, message: Message) -> Result<(), RouteError> {
        debug!(sender = %message.sender(), kind = %message.kind(), "diverting to broker");
        self.broker_tx.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => RouteError::Backpressure(BackpressureError::QueueFull {
                class: PriorityClass::High,
                capacity: self.broker_tx.max_capacity(),
            }),
            mpsc::error::TrySendError::Closed(_) => RouteError::BrokerUnavailable,
        })
    }

    async fn deliver_local(&self, message: Message) -> Result<(), RouteError> {
        if let Some(in_reply_to) = message.in_reply_to() {
            let id = RequestId {
                requester: ProcessId::COORDINATOR,
                sequence: in_reply_to,
            };
            if !self.pending.complete_from(id, message.sender(), message) {
                debug!(request = %id, "late or unsolicited response dropped");
            }
            return Ok(());
        }
        self.inbox_tx
            .send(message)
            .await
            .map_err(|_| RouteError::UnknownDestination(RouteTarget::Process(ProcessId::COORDINATOR)))
    }

    async fn deliver_to(&self, id: ProcessId, message: Message) -> Result<(), RouteError> {
        let target = RouteTarget::Process(id);
        if self.table.borrow().ready(id).is_some() {
            return self.scheduler.enqueue(id, message);
        }

        if message.priority() < PriorityClass::High {
            info!(
                %id,
                kind = %message.kind(),
                sender = %message.sender(),
                "dropping message for destination that is not ready"
            );
            return Err(RouteError::UnknownDestination(target));
        }

        let deadline = Instant::now() + self.config.route_retry_deadline();
        let mut table = self.table.clone();
        loop {
            if table.borrow_and_update().ready(id).is_some() {
                return self.scheduler.enqueue(id, message);
            }
            let terminal = table
                .borrow()
                .get(id)
                .is_some_and(|record| record.exit.is_some());
            if terminal {
                break;
            }
            match tokio::time::timeout_at(deadline, table.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => break,
            }
        }
        warn!(%id, kind = %message.kind(), "destination not ready before retry deadline");
        Err(RouteError::UnknownDestination(target))
    }

    fn broadcast(&self, set: BroadcastSet, message: &Message) -> Result<(), RouteError> {
        let members: Vec<ProcessId> = self
            .table
            .borrow()
            .ready_records()
            .filter(|record| match set {
                BroadcastSet::AllRenderers => record.role().is_renderer(),
                BroadcastSet::AllWorkers => true,
            })
            .map(|record| record.id())
            .collect();
        if members.is_empty() {
            return Err(RouteError::UnknownDestination(RouteTarget::Broadcast(set)));
        }

        let mut delivered = 0_usize;
        let mut last_err = None;
        for id in members {
            match self
                .scheduler
                .enqueue(id, message.readdressed(RouteTarget::Process(id)))
            {
                Ok(()) => delivered += 1,
                Err(err) => {
                    debug!(%id, %err, "broadcast copy rejected");
                    last_err = Some(err);
                }
            }
        }
        match (delivered, last_err) {
            (0, Some(err)) => Err(err),
            _ => Ok(()),
        }
    }
}

/// Convenience for building a coordinator-originated message with a fresh
/// sequence.
#[must_use]
pub fn coordinator_message(
    router: &Router,
    destination: RouteTarget,
    kind: MessageKind,
    payload: impl Into<bytes::Bytes>,
) -> Message {
    let sequence = router.next_sequence(destination);
    Message::new(ProcessId::COORDINATOR, destination, kind, sequence, payload)
}
