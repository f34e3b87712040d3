//! Priority scheduler and backpressure controller.
//!
//! The scheduler owns one [`ChannelQueues`] per attached destination and one
//! dispatcher task draining it. The router enqueues; the sweep loop expires;
//! the supervisor attaches on spawn and detaches on exit.

pub mod dispatcher;
pub mod queue;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::config::SchedulerConfig;
use crate::errors::RouteError;
use crate::models::{Message, ProcessId, RouteTarget};
use crate::transport::Channel;

pub use queue::{Admission, ChannelQueues, DispatchReason, QueueLimits, QueuedMessage};

/// Queues and wake-up signal shared by the router and one dispatcher.
pub(crate) struct ChannelSlot {
    queues: Mutex<ChannelQueues>,
    notify: Notify,
    cancel: CancellationToken,
}

impl ChannelSlot {
    fn lock(&self) -> MutexGuard<'_, ChannelQueues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A message removed by the TTL sweep.
#[derive(Debug, Clone)]
pub struct Expired {
    /// Channel it was queued for.
    pub destination: ProcessId,
    /// The expired message.
    pub message: Message,
}

/// Per-destination queues plus their dispatcher tasks.
pub struct Scheduler {
    config: SchedulerConfig,
    slots: Mutex<HashMap<ProcessId, Arc<ChannelSlot>>>,
}

impl Scheduler {
    /// Create a scheduler with no attached channels.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Scheduler settings.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Create queues for `id` and start its dispatcher on `channel`.
    ///
    /// The dispatcher stops when `parent` is cancelled, the channel closes,
    /// or the destination is detached.
    pub fn attach(&self, id: ProcessId, channel: Channel, parent: &CancellationToken) -> JoinHandle<()> {
        let slot = Arc::new(ChannelSlot {
            queues: Mutex::new(ChannelQueues::new(QueueLimits::from(&self.config))),
            notify: Notify::new(),
            cancel: parent.child_token(),
        });
        if let Some(previous) = self.lock().insert(id, Arc::clone(&slot)) {
            warn!(%id, "replacing existing scheduler slot");
            previous.cancel.cancel();
        }
        let cancel = slot.cancel.clone();
        let retry = self.config.overflow_retry_interval();
        tokio::spawn(
            dispatcher::run_dispatcher(id, slot, channel, retry, cancel)
                .instrument(info_span!("dispatcher", %id)),
        )
    }

    /// Stop dispatching to `id` and hand back whatever was still queued.
    pub fn detach(&self, id: ProcessId) -> Vec<QueuedMessage> {
        let Some(slot) = self.lock().remove(&id) else {
            return Vec::new();
        };
        slot.cancel.cancel();
        let drained = slot.lock().drain();
        debug!(%id, drained = drained.len(), "scheduler slot detached");
        drained
    }

    /// Admit `message` into the queues of `id`.
    ///
    /// # Errors
    ///
    /// - [`RouteError::UnknownDestination`] if `id` has no attached queues.
    /// - [`RouteError::Backpressure`] if the queue policy rejects it.
    pub fn enqueue(&self, id: ProcessId, message: Message) -> Result<(), RouteError> {
        let slot = self
            .lock()
            .get(&id)
            .cloned()
            .ok_or(RouteError::UnknownDestination(RouteTarget::Process(id)))?;
        let admission = slot.lock().enqueue(message, Instant::now())?;
        if let Admission::Evicted(evicted) = admission {
            debug!(
                %id,
                kind = %evicted.message.kind(),
                sender = %evicted.message.sender(),
                "evicted oldest low-priority message"
            );
        }
        slot.notify.notify_one();
        Ok(())
    }

    /// Expire stale messages across every channel.
    pub fn sweep(&self, now: Instant) -> Vec<Expired> {
        let slots: Vec<(ProcessId, Arc<ChannelSlot>)> = self
            .lock()
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect();
        let mut expired = Vec::new();
        for (id, slot) in slots {
            let removed = slot.lock().sweep(now, |kind| self.config.ttl_for(kind));
            expired.extend(removed.into_iter().map(|queued| Expired {
                destination: id,
                message: queued.message,
            }));
        }
        expired
    }

    /// Messages currently queued for `id`.
    #[must_use]
    pub fn queued(&self, id: ProcessId) -> Option<usize> {
        self.lock().get(&id).map(|slot| slot.lock().len())
    }

    /// Whether `id` has attached queues.
    #[must_use]
    pub fn is_attached(&self, id: ProcessId) -> bool {
        self.lock().contains_key(&id)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ProcessId, Arc<ChannelSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
