//! Per-channel priority queues with admission control and starvation guard.
//!
//! [`ChannelQueues`] is a plain data structure driven with explicit
//! timestamps so its policy can be exercised without a runtime:
//!
//! - **Admission.** Critical is always admitted; when the channel's total
//!   buffer is full the oldest Low message is evicted to make room (and
//!   Critical goes over the total cap if there is no Low to evict). High is
//!   rejected at its own cap and otherwise admitted with the same eviction.
//!   Normal and Low are rejected when their class queue or the total buffer
//!   is full.
//! - **Dispatch.** Strict priority, except that the oldest Normal or Low
//!   message that has waited longer than the starvation latency is dispatched
//!   once between higher-class dispatches.
//! - **Expiry.** [`ChannelQueues::sweep`] removes messages older than their
//!   kind's TTL.
//!
//! Within one class, dispatch order equals admission order.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::SchedulerConfig;
use crate::errors::BackpressureError;
use crate::models::{Message, MessageKind, PriorityClass};

/// A message waiting in a class queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// The routed message.
    pub message: Message,
    /// When it was admitted.
    pub admitted_at: Instant,
}

/// Capacity and latency limits for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    /// Cap per class, indexed by [`PriorityClass::index`].
    pub class_caps: [usize; 4],
    /// Cap across all classes.
    pub total_cap: usize,
    /// Wait that makes a Normal or Low message eligible for the guard.
    pub starvation_max_latency: Duration,
}

impl From<&SchedulerConfig> for QueueLimits {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            class_caps: [
                config.class_cap(PriorityClass::Low),
                config.class_cap(PriorityClass::Normal),
                config.class_cap(PriorityClass::High),
                config.class_cap(PriorityClass::Critical),
            ],
            total_cap: config.total_cap,
            starvation_max_latency: config.starvation_max_latency(),
        }
    }
}

/// Outcome of a successful enqueue.
#[derive(Debug)]
pub enum Admission {
    /// Admitted without side effects.
    Admitted,
    /// Admitted after evicting the oldest Low message.
    Evicted(QueuedMessage),
}

/// How a message left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchReason {
    /// Highest non-empty class.
    Priority,
    /// Starvation guard.
    Starvation,
}

/// Bounded per-class FIFOs for one destination channel.
#[derive(Debug)]
pub struct ChannelQueues {
    queues: [VecDeque<QueuedMessage>; 4],
    limits: QueueLimits,
    last_was_guard: bool,
}

impl ChannelQueues {
    /// Create empty queues with `limits`.
    #[must_use]
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            queues: Default::default(),
            limits,
            last_was_guard: false,
        }
    }

    /// Limits in force.
    #[must_use]
    pub fn limits(&self) -> QueueLimits {
        self.limits
    }

    /// Messages queued across all classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    /// Messages queued in `class`.
    #[must_use]
    pub fn class_len(&self, class: PriorityClass) -> usize {
        self.queues[class.index()].len()
    }

    /// Admit `message` at `now` according to the class policy.
    ///
    /// # Errors
    ///
    /// Returns [`BackpressureError::QueueFull`] when the message cannot be
    /// admitted. Critical never fails.
    pub fn enqueue(&mut self, message: Message, now: Instant) -> Result<Admission, BackpressureError> {
        let class = message.priority();
        let class_cap = self.limits.class_caps[class.index()];
        let total_full = self.len() >= self.limits.total_cap;

        let admission = match class {
            PriorityClass::Critical => match total_full.then(|| self.evict_oldest_low()).flatten() {
                Some(evicted) => Admission::Evicted(evicted),
                None => Admission::Admitted,
            },
            PriorityClass::High => {
                if self.class_len(class) >= class_cap {
                    return Err(BackpressureError::QueueFull {
                        class,
                        capacity: class_cap,
                    });
                }
                if total_full {
                    let evicted = self.evict_oldest_low().ok_or(BackpressureError::QueueFull {
                        class,
                        capacity: self.limits.total_cap,
                    })?;
                    Admission::Evicted(evicted)
                } else {
                    Admission::Admitted
                }
            }
            PriorityClass::Normal | PriorityClass::Low => {
                if self.class_len(class) >= class_cap {
                    return Err(BackpressureError::QueueFull {
                        class,
                        capacity: class_cap,
                    });
                }
                if total_full {
                    return Err(BackpressureError::QueueFull {
                        class,
                        capacity: self.limits.total_cap,
                    });
                }
                Admission::Admitted
            }
        };

        self.queues[class.index()].push_back(QueuedMessage {
            message,
            admitted_at: now,
        });
        Ok(admission)
    }

    /// Put a message back at the head of its class queue, bypassing caps.
    ///
    /// Used when the channel refused a dispatched message; the original
    /// admission time is kept.
    pub fn requeue_front(&mut self, queued: QueuedMessage) {
        self.queues[queued.message.priority().index()].push_front(queued);
    }

    /// Take the next message to dispatch at `now`.
    pub fn pop_next(&mut self, now: Instant) -> Option<(QueuedMessage, DispatchReason)> {
        let top = PriorityClass::DESCENDING
            .into_iter()
            .find(|class| !self.queues[class.index()].is_empty())?;

        if !self.last_was_guard {
            if let Some(starving) = self.starving_class(now).filter(|starving| *starving < top) {
                self.last_was_guard = true;
                return self.queues[starving.index()]
                    .pop_front()
                    .map(|queued| (queued, DispatchReason::Starvation));
            }
        }

        self.last_was_guard = false;
        self.queues[top.index()]
            .pop_front()
            .map(|queued| (queued, DispatchReason::Priority))
    }

    /// Remove every message older than its TTL at `now`.
    pub fn sweep(
        &mut self,
        now: Instant,
        ttl_for: impl Fn(MessageKind) -> Option<Duration>,
    ) -> Vec<QueuedMessage> {
        let mut expired = Vec::new();
        for queue in &mut self.queues {
            let mut kept = VecDeque::with_capacity(queue.len());
            for queued in queue.drain(..) {
                let stale = ttl_for(queued.message.kind())
                    .is_some_and(|ttl| now.saturating_duration_since(queued.admitted_at) > ttl);
                if stale {
                    expired.push(queued);
                } else {
                    kept.push_back(queued);
                }
            }
            *queue = kept;
        }
        expired
    }

    /// Remove everything, highest class first.
    pub fn drain(&mut self) -> Vec<QueuedMessage> {
        PriorityClass::DESCENDING
            .into_iter()
            .flat_map(|class| std::mem::take(&mut self.queues[class.index()]))
            .collect()
    }

    /// The lower class whose head has waited longer than the starvation latency;
    /// the older head wins when both qualify.
    fn starving_class(&self, now: Instant) -> Option<PriorityClass> {
        [PriorityClass::Normal, PriorityClass::Low]
            .into_iter()
            .filter_map(|class| {
                self.queues[class.index()]
                    .front()
                    .map(|queued| (class, queued.admitted_at))
            })
            .filter(|(_, admitted_at)| {
                now.saturating_duration_since(*admitted_at) > self.limits.starvation_max_latency
            })
            .min_by_key(|(_, admitted_at)| *admitted_at)
            .map(|(class, _)| class)
    }

    fn evict_oldest_low(&mut self) -> Option<QueuedMessage> {
        self.queues[PriorityClass::Low.index()].pop_front()
    }
}
