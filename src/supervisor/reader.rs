//! Per-channel reader task.
//!
//! Decodes every inbound frame from one worker and hands it to the router.
//! Frames from the same channel are routed one after another, which keeps
//! per-(sender, destination) order intact.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::audit::{self, AuditEntry, AuditEventType, AuditLogger};
use crate::errors::{RouteError, SchemaError};
use crate::models::{Message, MessageKind, ProcessId, RouteTarget};
use crate::router::Router;
use crate::schema::{self, SchemaRegistry};
use crate::supervisor::Command;
use crate::transport::Channel;

pub(crate) struct ReaderContext {
    pub(crate) id: ProcessId,
    pub(crate) role: &'static str,
    pub(crate) registry: Arc<SchemaRegistry>,
    pub(crate) router: Arc<Router>,
    pub(crate) audit: Arc<dyn AuditLogger>,
    pub(crate) reports: mpsc::Sender<Command>,
}

impl ReaderContext {
    fn entry(&self, event_type: AuditEventType) -> AuditEntry {
        AuditEntry::new(event_type)
            .with_process(self.id)
            .with_role(self.role)
    }

    async fn report_malformed(&self) {
        let _ = self.reports.send(Command::Malformed { id: self.id }).await;
    }
}

/// Read frames until the channel ends or `cancel` fires.
pub(crate) async fn run_reader(context: ReaderContext, channel: Channel, cancel: CancellationToken) {
    let id = context.id;
    debug!(%id, "reader started");
    let frames = channel.frames();
    tokio::pin!(frames);
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = frames.next() => next,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                warn!(%id, %err, "channel read failed");
                break;
            }
            None => {
                debug!(%id, "channel closed by peer");
                break;
            }
        };

        match context.registry.decode(&frame) {
            Ok(message) => accept(&context, message).await,
            Err(SchemaError::Malformed(reason)) => {
                warn!(%id, %reason, "malformed frame");
                audit::record(
                    context.audit.as_ref(),
                    context.entry(AuditEventType::MalformedFrame).with_reason(reason),
                );
                context.report_malformed().await;
            }
            Err(err) => {
                warn!(%id, %err, "frame outside the supported schema; dropped");
                audit::record(
                    context.audit.as_ref(),
                    context
                        .entry(AuditEventType::VersionSkew)
                        .with_reason(err.to_string()),
                );
            }
        }
    }
    debug!(%id, "reader stopped");
}

async fn accept(context: &ReaderContext, message: Message) {
    let id = context.id;
    let sender = message.sender();
    if sender != id {
        warn!(%id, claimed = %sender, kind = %message.kind(), "frame claims another sender");
        audit::record(
            context.audit.as_ref(),
            context
                .entry(AuditEventType::Impersonation)
                .with_operation(message.kind().name())
                .with_reason(format!("claimed to be {sender}")),
        );
        context.report_malformed().await;
        return;
    }
    if message.kind() == MessageKind::Hello {
        debug!(%id, "duplicate hello ignored");
        return;
    }

    trace!(%id, kind = %message.kind(), sequence = message.sequence(), "routing inbound message");
    let kind = message.kind();
    let sequence = message.sequence();
    let destination = message.destination();
    let Err(err) = context.router.route(message).await else {
        return;
    };
    if !kind.is_request() {
        debug!(%id, %kind, %err, "inbound message not routed");
        return;
    }

    // The requester is waiting on an answer that will never come; say so now.
    let (notice, target) = match err {
        RouteError::UnknownDestination(RouteTarget::Process(target)) => {
            debug!(%id, %target, %kind, "request for unavailable process");
            (MessageKind::ProcessLost, target)
        }
        RouteError::Channel(_) | RouteError::Backpressure(_) | RouteError::BrokerUnavailable => {
            debug!(%id, %kind, %err, "request could not be admitted");
            let target = match destination {
                RouteTarget::Process(target) => target,
                RouteTarget::Broadcast(_) | RouteTarget::Broker => ProcessId::COORDINATOR,
            };
            (MessageKind::RequestTimeout, target)
        }
        err => {
            debug!(%id, %kind, %err, "inbound request not routed");
            return;
        }
    };
    let undelivered = schema::undelivered(
        notice,
        id,
        context.router.next_sequence(RouteTarget::Process(id)),
        sequence,
        target,
    );
    if let Err(err) = context.router.route(undelivered).await {
        debug!(%id, %err, "undelivered notification not routed");
    }
}
