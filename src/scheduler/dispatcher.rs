//! Per-channel dispatcher task.
//!
//! One task per destination channel pops messages in scheduler order and
//! writes them to the channel. Backpressure from one channel therefore never
//! delays delivery to another.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::errors::ChannelError;
use crate::models::ProcessId;
use crate::scheduler::queue::DispatchReason;
use crate::scheduler::ChannelSlot;
use crate::schema;
use crate::transport::Channel;

/// Drive `slot` onto `channel` until cancelled or the channel closes.
///
/// On [`ChannelError::Overflow`] the message goes back to the head of its
/// class queue and the dispatcher retries after `retry_interval`. On
/// [`ChannelError::Closed`] the message is requeued and the task stops; the
/// supervisor drains what is left. Oversize messages are refused by the
/// router before they are queued; one that still fails the channel's own
/// limit is dropped with a warning.
pub(crate) async fn run_dispatcher(
    id: ProcessId,
    slot: Arc<ChannelSlot>,
    channel: Channel,
    retry_interval: Duration,
    cancel: CancellationToken,
) {
    debug!(%id, "dispatcher started");
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let next = slot.lock().pop_next(Instant::now());
        let Some((queued, reason)) = next else {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = channel.closed() => break,
                () = slot.notify.notified() => continue,
            }
        };

        if reason == DispatchReason::Starvation {
            debug!(
                %id,
                kind = %queued.message.kind(),
                waited_ms = queued.admitted_at.elapsed().as_millis(),
                "starvation guard dispatch"
            );
        }

        let frame = schema::encode(&queued.message);
        match channel.send(frame) {
            Ok(()) => {
                trace!(
                    %id,
                    kind = %queued.message.kind(),
                    sequence = queued.message.sequence(),
                    "dispatched"
                );
            }
            Err(ChannelError::Overflow { buffered, capacity, .. }) => {
                debug!(%id, buffered, capacity, "channel overflow; retrying");
                slot.lock().requeue_front(queued);
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(retry_interval) => {}
                }
            }
            Err(ChannelError::FrameTooLarge { size, limit }) => {
                warn!(
                    %id,
                    kind = %queued.message.kind(),
                    size,
                    limit,
                    "dropping message larger than the frame limit"
                );
            }
            Err(err) => {
                debug!(%id, %err, "channel unusable; dispatcher stopping");
                slot.lock().requeue_front(queued);
                break;
            }
        }
    }
    debug!(%id, "dispatcher stopped");
}
