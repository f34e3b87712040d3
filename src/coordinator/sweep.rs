//! TTL sweep service.
//!
//! Runs as a background task that expires stale queued messages and
//! overdue pending requests. Expired request-shaped messages are answered
//! with a timeout: coordinator requests fail locally, worker requests get a
//! `RequestTimeout` routed back to the sender. Relayed worker requests past
//! their retention are forgotten.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::models::{MessageKind, RouteTarget};
use crate::router::{RequestId, Router};
use crate::scheduler::{Expired, Scheduler};
use crate::schema;

/// Spawn the sweep background task, ticking every `sweep_interval` of the
/// scheduler configuration.
#[must_use]
pub fn spawn_sweep_task(
    scheduler: Arc<Scheduler>,
    router: Arc<Router>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(scheduler.config().sweep_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("sweep task shutting down");
                    break;
                }
                _ = interval.tick() => sweep(&scheduler, &router, Instant::now()).await,
            }
        }
    })
}

/// One sweep pass at `now`.
pub async fn sweep(scheduler: &Scheduler, router: &Router, now: Instant) {
    let expired = scheduler.sweep(now);
    if !expired.is_empty() {
        debug!(expired = expired.len(), "expired queued messages");
    }
    for item in expired {
        notify_expired(router, item).await;
    }

    let overdue = router.pending().expire_due(now);
    if !overdue.is_empty() {
        debug!(overdue = overdue.len(), "expired pending requests");
    }

    let forgotten = router.prune_relayed(now);
    if forgotten > 0 {
        debug!(forgotten, "forgot unanswered relayed requests");
    }
}

async fn notify_expired(router: &Router, item: Expired) {
    let Expired {
        destination,
        message,
    } = item;
    if !message.kind().is_request() {
        return;
    }
    let requester = message.sender();
    let request = RequestId {
        requester,
        sequence: message.sequence(),
    };
    if requester.is_coordinator() {
        router.pending().expire(request);
        return;
    }
    if requester == destination {
        return;
    }

    let timeout = schema::undelivered(
        MessageKind::RequestTimeout,
        requester,
        router.next_sequence(RouteTarget::Process(requester)),
        request.sequence,
        destination,
    );
    if let Err(err) = router.route(timeout).await {
        debug!(%request, %err, "request timeout not delivered");
    }
}
