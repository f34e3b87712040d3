//! Privilege broker.
//!
//! Workers hold no capabilities of their own beyond what the coordinator
//! granted at spawn. Every access to a file, socket, resolver, device or the
//! clipboard arrives here as a [`PrivilegedOp`], is checked against the
//! requester's immutable grant, executed on a bounded pool, and audited.
//!
//! Each request moves through [`RequestState`]:
//! `Received → CapabilityChecked → Granted → Executing → Completed | Failed`,
//! or `Received → Denied`.

pub mod handles;
pub mod ops;
pub mod provider;
pub mod scope;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::audit::{self, AuditEntry, AuditEventType, AuditLogger};
use crate::config::BrokerConfig;
use crate::errors::BrokerError;
use crate::models::{
    CapabilityKind, CapabilitySet, Message, MessageKind, ProcessId, ProcessRole, ProcessTable,
    RouteTarget,
};
use crate::router::Router;

pub use handles::{HandleResource, HandleTable};
pub use ops::{
    BrokerRequestBody, BrokerResponseBody, DirEntry, HandleToken, OpResult, PrivilegedOp,
    SystemInfo, BROKER_CATALOGUE_VERSION,
};
pub use provider::{HostProvider, ProviderFuture, ResourceProvider};

/// Lifecycle of one broker request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Parsed and attributed to a requester.
    Received,
    /// The requester's grant covers the operation.
    CapabilityChecked,
    /// Admitted for execution.
    Granted,
    /// Running against the host.
    Executing,
    /// Finished successfully.
    Completed,
    /// Ran and failed.
    Failed,
    /// Refused before execution.
    Denied,
}

impl RequestState {
    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Received, Self::CapabilityChecked | Self::Denied)
                | (Self::CapabilityChecked, Self::Granted)
                | (Self::Granted, Self::Executing)
                | (Self::Executing, Self::Completed | Self::Failed)
        )
    }

    /// Whether the request has reached an outcome.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Denied)
    }
}

struct Lifecycle {
    requester: ProcessId,
    operation: &'static str,
    state: RequestState,
}

impl Lifecycle {
    fn new(requester: ProcessId, operation: &'static str) -> Self {
        trace!(%requester, operation, "broker request received");
        Self {
            requester,
            operation,
            state: RequestState::Received,
        }
    }

    fn advance(&mut self, next: RequestState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal broker transition {:?} -> {next:?}",
            self.state
        );
        trace!(
            requester = %self.requester,
            operation = self.operation,
            from = ?self.state,
            to = ?next,
            "broker request transition"
        );
        self.state = next;
    }
}

/// What the capability check resolved for execution.
enum Authorized {
    Path(PathBuf),
    Handle(HandleResource),
    Plain,
}

/// Request from the broker to terminate a misbehaving process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationRequest {
    /// Offending process.
    pub process: ProcessId,
    /// Why it should go.
    pub reason: String,
}

/// The privilege broker.
pub struct Broker {
    config: BrokerConfig,
    table: watch::Receiver<ProcessTable>,
    audit: Arc<dyn AuditLogger>,
    provider: Arc<dyn ResourceProvider>,
    handles: HandleTable,
    violations: Mutex<HashMap<ProcessId, u32>>,
    terminations: mpsc::UnboundedSender<TerminationRequest>,
    pool: Arc<Semaphore>,
}

impl Broker {
    /// Assemble a broker reading grants from `table`.
    ///
    /// Termination requests for processes that cross the violation threshold
    /// are sent on `terminations`.
    #[must_use]
    pub fn new(
        config: BrokerConfig,
        table: watch::Receiver<ProcessTable>,
        audit: Arc<dyn AuditLogger>,
        provider: Arc<dyn ResourceProvider>,
        terminations: mpsc::UnboundedSender<TerminationRequest>,
    ) -> Self {
        let pool = Arc::new(Semaphore::new(config.pool_size.max(1)));
        Self {
            config,
            table,
            audit,
            provider,
            handles: HandleTable::new(),
            violations: Mutex::new(HashMap::new()),
            terminations,
            pool,
        }
    }

    /// Live handle table.
    #[must_use]
    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Violations counted against `id` so far.
    #[must_use]
    pub fn violations(&self, id: ProcessId) -> u32 {
        self.violations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    /// Check, execute, and audit one operation on behalf of `requester`.
    ///
    /// Waits for a pool slot before executing.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::PermissionDenied`] when the requester is unknown, not
    ///   Ready, or lacks the capability, whatever the arguments; also for
    ///   another process's handle.
    /// - [`BrokerError::InvalidHandle`] for unknown tokens.
    /// - [`BrokerError::InvalidRequest`] for malformed arguments.
    /// - [`BrokerError::OperationFailed`] when execution fails.
    pub async fn handle(
        &self,
        requester: ProcessId,
        op: PrivilegedOp,
    ) -> Result<OpResult, BrokerError> {
        let _permit = Arc::clone(&self.pool)
            .acquire_owned()
            .await
            .map_err(|_| BrokerError::OperationFailed("broker pool closed".into()))?;
        self.process(requester, op, None).await
    }

    /// Drop handles and violation counts held for an exited process.
    pub fn release_process(&self, id: ProcessId) {
        let released = self.handles.release_owner(id);
        self.violations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if released > 0 {
            debug!(%id, released, "released broker handles of exited process");
        }
    }

    /// Consume diverted messages until cancelled or the queue closes.
    ///
    /// `BrokerRequest` messages run on the pool and are answered with a
    /// `BrokerResponse` routed back to the requester. Any other kind that
    /// reaches the broker from a worker is an impersonation attempt.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Message>,
        router: Arc<Router>,
        cancel: CancellationToken,
    ) {
        info!(pool_size = self.config.pool_size, "broker started");
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => break,
                next = inbound.recv() => match next {
                    Some(message) => message,
                    None => break,
                },
            };

            if message.kind() != MessageKind::BrokerRequest {
                self.reject_impersonation(&message);
                continue;
            }

            let permit = tokio::select! {
                () = cancel.cancelled() => break,
                permit = Arc::clone(&self.pool).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let broker = Arc::clone(&self);
            let router = Arc::clone(&router);
            let span = info_span!(
                "broker_request",
                requester = %message.sender(),
                sequence = message.sequence()
            );
            tokio::spawn(
                async move {
                    let _permit = permit;
                    broker.serve(&router, message).await;
                }
                .instrument(span),
            );
        }
        info!("broker stopped");
    }

    async fn serve(&self, router: &Router, request: Message) {
        let requester = request.sender();
        let outcome = match serde_json::from_slice::<BrokerRequestBody>(request.payload()) {
            Ok(body) => {
                if body.catalogue > BROKER_CATALOGUE_VERSION {
                    debug!(
                        %requester,
                        catalogue = body.catalogue,
                        "request from a newer operation catalogue"
                    );
                }
                self.process(requester, body.op, Some(request.sequence()))
                    .await
            }
            Err(err) => {
                let error = BrokerError::InvalidRequest(format!("undecodable request: {err}"));
                self.audit_outcome(requester, "unknown", None, Some(request.sequence()), Err(&error));
                Err(error)
            }
        };

        let body = BrokerResponseBody {
            outcome,
            catalogue: BROKER_CATALOGUE_VERSION,
        };
        let encoded = match serde_json::to_vec(&body) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(%requester, %err, "failed to encode broker response");
                return;
            }
        };
        let destination = RouteTarget::Process(requester);
        let response = Message::reply(
            ProcessId::COORDINATOR,
            destination,
            MessageKind::BrokerResponse,
            router.next_sequence(destination),
            request.sequence(),
            &encoded,
        );
        if let Err(err) = router.route(response).await {
            warn!(%requester, %err, "broker response could not be delivered");
        }
    }

    async fn process(
        &self,
        requester: ProcessId,
        op: PrivilegedOp,
        sequence: Option<u64>,
    ) -> Result<OpResult, BrokerError> {
        let operation = op.name();
        let capability = op.required_capability();
        let mut lifecycle = Lifecycle::new(requester, operation);

        let authorized = match self.authorize(requester, &op) {
            Ok(authorized) => authorized,
            Err(err) => {
                lifecycle.advance(RequestState::Denied);
                if matches!(err, BrokerError::PermissionDenied { .. }) {
                    warn!(%requester, operation, %err, "broker request denied");
                } else {
                    debug!(%requester, operation, %err, "broker request rejected");
                }
                self.audit_outcome(requester, operation, capability, sequence, Err(&err));
                if matches!(err, BrokerError::PermissionDenied { .. }) {
                    self.record_violation(requester, &err.to_string());
                }
                return Err(err);
            }
        };
        lifecycle.advance(RequestState::CapabilityChecked);
        lifecycle.advance(RequestState::Granted);
        lifecycle.advance(RequestState::Executing);

        let result = self.execute(requester, op, authorized).await;
        match &result {
            Ok(_) => {
                lifecycle.advance(RequestState::Completed);
                debug!(%requester, operation, "broker request completed");
            }
            Err(err) => {
                lifecycle.advance(RequestState::Failed);
                warn!(%requester, operation, %err, "broker request failed");
            }
        }
        self.audit_outcome(requester, operation, capability, sequence, result.as_ref());
        result
    }

    fn grant_for(&self, requester: ProcessId) -> Option<CapabilitySet> {
        if requester.is_coordinator() {
            return Some(CapabilitySet::default_for(&ProcessRole::Coordinator));
        }
        self.table
            .borrow()
            .ready(requester)
            .map(|record| record.capabilities().clone())
    }

    fn authorize(&self, requester: ProcessId, op: &PrivilegedOp) -> Result<Authorized, BrokerError> {
        let grant = self.grant_for(requester);
        // The grant is checked before any argument is looked at.
        if let Some(capability) = op.required_capability() {
            if !grant.as_ref().is_some_and(|grant| grant.grants(capability)) {
                return Err(BrokerError::PermissionDenied {
                    requester,
                    capability,
                });
            }
        }

        let scoped = |kind: CapabilityKind, path: &Path| match &grant {
            Some(grant) => {
                scope::authorize_path(grant, kind, requester, path).map(Authorized::Path)
            }
            None => Err(BrokerError::PermissionDenied {
                requester,
                capability: kind,
            }),
        };

        match op {
            PrivilegedOp::FileOpenScoped { path }
            | PrivilegedOp::FileRead { path, .. }
            | PrivilegedOp::FileInfo { path }
            | PrivilegedOp::ListDirectory { path } => {
                scoped(CapabilityKind::FileRead, path.as_path())
            }
            PrivilegedOp::FileWrite { path, .. }
            | PrivilegedOp::FileDelete { path }
            | PrivilegedOp::CreateDirectory { path } => {
                scoped(CapabilityKind::FileWrite, path.as_path())
            }
            PrivilegedOp::FileReadHandle { token, .. } | PrivilegedOp::HandleClose { token } => {
                self.handles.resolve(requester, token).map(Authorized::Handle)
            }
            _ => Ok(Authorized::Plain),
        }
    }

    async fn execute(
        &self,
        requester: ProcessId,
        op: PrivilegedOp,
        authorized: Authorized,
    ) -> Result<OpResult, BrokerError> {
        match (op, authorized) {
            (PrivilegedOp::FileOpenScoped { .. }, Authorized::Path(path)) => {
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|err| failed(&path, &err))?;
                let token = self.handles.issue(
                    requester,
                    HandleResource::File {
                        path,
                        file: Arc::new(tokio::sync::Mutex::new(file)),
                    },
                );
                Ok(OpResult::Handle { token })
            }
            (PrivilegedOp::FileRead { max_bytes, .. }, Authorized::Path(path)) => {
                let limit = max_bytes.min(self.config.max_read_bytes);
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|err| failed(&path, &err))?;
                let mut bytes = Vec::new();
                file.take(limit.saturating_add(1))
                    .read_to_end(&mut bytes)
                    .await
                    .map_err(|err| failed(&path, &err))?;
                let truncated = bytes.len() as u64 > limit;
                bytes.truncate(limit as usize);
                Ok(OpResult::Data { bytes, truncated })
            }
            (
                PrivilegedOp::FileReadHandle { max_bytes, .. },
                Authorized::Handle(HandleResource::File { path, file }),
            ) => {
                let limit = max_bytes.min(self.config.max_read_bytes);
                let mut file = file.lock().await;
                let mut bytes = Vec::new();
                (&mut *file)
                    .take(limit)
                    .read_to_end(&mut bytes)
                    .await
                    .map_err(|err| failed(&path, &err))?;
                let position = file
                    .stream_position()
                    .await
                    .map_err(|err| failed(&path, &err))?;
                let length = file
                    .metadata()
                    .await
                    .map_err(|err| failed(&path, &err))?
                    .len();
                Ok(OpResult::Data {
                    bytes,
                    truncated: position < length,
                })
            }
            (PrivilegedOp::FileReadHandle { .. }, Authorized::Handle(_)) => Err(
                BrokerError::InvalidRequest("handle does not refer to a file".into()),
            ),
            (PrivilegedOp::FileWrite { data, .. }, Authorized::Path(path)) => {
                tokio::fs::write(&path, &data)
                    .await
                    .map_err(|err| failed(&path, &err))?;
                Ok(OpResult::Written {
                    bytes: data.len() as u64,
                })
            }
            (PrivilegedOp::FileInfo { .. }, Authorized::Path(path)) => {
                let metadata = tokio::fs::metadata(&path)
                    .await
                    .map_err(|err| failed(&path, &err))?;
                Ok(OpResult::FileInfo {
                    size: metadata.len(),
                    is_dir: metadata.is_dir(),
                    readonly: metadata.permissions().readonly(),
                    modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                })
            }
            (PrivilegedOp::ListDirectory { .. }, Authorized::Path(path)) => {
                let mut listing = tokio::fs::read_dir(&path)
                    .await
                    .map_err(|err| failed(&path, &err))?;
                let mut entries = Vec::new();
                while let Some(entry) = listing
                    .next_entry()
                    .await
                    .map_err(|err| failed(&path, &err))?
                {
                    let is_dir = entry
                        .file_type()
                        .await
                        .map_err(|err| failed(&entry.path(), &err))?
                        .is_dir();
                    entries.push(DirEntry {
                        name: entry.file_name().to_string_lossy().into_owned(),
                        is_dir,
                    });
                }
                entries.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(OpResult::Entries { entries })
            }
            (PrivilegedOp::FileDelete { .. }, Authorized::Path(path)) => {
                let metadata = tokio::fs::symlink_metadata(&path)
                    .await
                    .map_err(|err| failed(&path, &err))?;
                let removed = if metadata.is_dir() {
                    tokio::fs::remove_dir(&path).await
                } else {
                    tokio::fs::remove_file(&path).await
                };
                removed.map_err(|err| failed(&path, &err))?;
                Ok(OpResult::Done)
            }
            (PrivilegedOp::CreateDirectory { .. }, Authorized::Path(path)) => {
                tokio::fs::create_dir_all(&path)
                    .await
                    .map_err(|err| failed(&path, &err))?;
                Ok(OpResult::Done)
            }
            (PrivilegedOp::HandleClose { token }, _) => {
                self.handles.close(requester, &token)?;
                Ok(OpResult::Done)
            }
            (PrivilegedOp::NetworkConnect { host, port }, Authorized::Plain) => {
                let stream = self
                    .provider
                    .connect(&host, port)
                    .await
                    .map_err(BrokerError::OperationFailed)?;
                let peer = stream
                    .peer_addr()
                    .map_or_else(|_| format!("{host}:{port}"), |addr| addr.to_string());
                let token = self
                    .handles
                    .issue(requester, HandleResource::Socket(Arc::new(stream)));
                Ok(OpResult::Connected { token, peer })
            }
            (PrivilegedOp::DnsResolve { host }, Authorized::Plain) => {
                let addresses = self
                    .provider
                    .resolve(&host)
                    .await
                    .map_err(BrokerError::OperationFailed)?;
                Ok(OpResult::Addresses {
                    addresses: addresses.iter().map(ToString::to_string).collect(),
                })
            }
            (PrivilegedOp::GraphicsDeviceOpen { adapter }, Authorized::Plain) => {
                let adapter = self
                    .provider
                    .open_graphics_device(&adapter)
                    .map_err(BrokerError::OperationFailed)?;
                let token = self
                    .handles
                    .issue(requester, HandleResource::Device(adapter.clone()));
                Ok(OpResult::DeviceOpened { token, adapter })
            }
            (PrivilegedOp::ClipboardRead, Authorized::Plain) => self
                .provider
                .clipboard_read()
                .map(|text| OpResult::Text { text })
                .map_err(BrokerError::OperationFailed),
            (PrivilegedOp::ClipboardWrite { text }, Authorized::Plain) => self
                .provider
                .clipboard_write(text)
                .map(|()| OpResult::Done)
                .map_err(BrokerError::OperationFailed),
            (PrivilegedOp::ClipboardClear, Authorized::Plain) => self
                .provider
                .clipboard_clear()
                .map(|()| OpResult::Done)
                .map_err(BrokerError::OperationFailed),
            (PrivilegedOp::SystemInfo, Authorized::Plain) => {
                Ok(OpResult::SystemInfo(self.provider.system_info()))
            }
            (op, _) => Err(BrokerError::InvalidRequest(format!(
                "{} arguments did not resolve",
                op.name()
            ))),
        }
    }

    fn reject_impersonation(&self, message: &Message) {
        let sender = message.sender();
        let kind = message.kind();
        if sender.is_coordinator() {
            debug!(%kind, "coordinator message reached the broker; dropped");
            return;
        }
        warn!(%sender, %kind, "worker sent a kind reserved for the coordinator");
        audit::record(
            self.audit.as_ref(),
            self.entry(AuditEventType::Impersonation, sender)
                .with_operation(kind.name())
                .with_sequence(message.sequence())
                .with_reason("privileged kind sent by a worker"),
        );
        self.record_violation(sender, &format!("sent {kind}"));
    }

    fn record_violation(&self, id: ProcessId, reason: &str) {
        if id.is_coordinator() {
            return;
        }
        let count = {
            let mut violations = self.violations.lock().unwrap_or_else(PoisonError::into_inner);
            let count = violations.entry(id).or_insert(0);
            *count += 1;
            *count
        };
        if count != self.config.violation_threshold {
            return;
        }

        warn!(%id, count, "violation threshold reached; requesting termination");
        audit::record(
            self.audit.as_ref(),
            self.entry(AuditEventType::ViolationThreshold, id)
                .with_result(format!("{count} violations"))
                .with_reason(reason),
        );
        let request = TerminationRequest {
            process: id,
            reason: format!("{count} privilege violations; last: {reason}"),
        };
        if self.terminations.send(request).is_err() {
            warn!(%id, "supervisor gone; termination request dropped");
        }
    }

    fn audit_outcome(
        &self,
        requester: ProcessId,
        operation: &str,
        capability: Option<CapabilityKind>,
        sequence: Option<u64>,
        outcome: Result<&OpResult, &BrokerError>,
    ) {
        let mut entry = match outcome {
            Ok(result) => self
                .entry(AuditEventType::BrokerGranted, requester)
                .with_result(summarize(result)),
            Err(err @ BrokerError::OperationFailed(_)) => self
                .entry(AuditEventType::BrokerFailed, requester)
                .with_reason(err.to_string()),
            Err(err) => self
                .entry(AuditEventType::BrokerDenied, requester)
                .with_reason(err.to_string()),
        }
        .with_operation(operation);
        if let Some(capability) = capability {
            entry = entry.with_capability(capability.to_string());
        }
        if let Some(sequence) = sequence {
            entry = entry.with_sequence(sequence);
        }
        audit::record(self.audit.as_ref(), entry);
    }

    fn entry(&self, event_type: AuditEventType, id: ProcessId) -> AuditEntry {
        let entry = AuditEntry::new(event_type).with_process(id);
        if id.is_coordinator() {
            return entry.with_role(ProcessRole::Coordinator.label());
        }
        match self.table.borrow().get(id) {
            Some(record) => entry.with_role(record.role().label()),
            None => entry,
        }
    }
}

fn failed(path: &std::path::Path, err: &std::io::Error) -> BrokerError {
    BrokerError::OperationFailed(format!("{}: {err}", path.display()))
}

fn summarize(result: &OpResult) -> String {
    match result {
        OpResult::Handle { token } => format!("handle {token}"),
        OpResult::Data { bytes, truncated } => {
            format!("{} bytes{}", bytes.len(), if *truncated { " (truncated)" } else { "" })
        }
        OpResult::Written { bytes } => format!("{bytes} bytes written"),
        OpResult::FileInfo { size, is_dir, .. } => {
            format!("{} of {size} bytes", if *is_dir { "directory" } else { "file" })
        }
        OpResult::Entries { entries } => format!("{} entries", entries.len()),
        OpResult::Addresses { addresses } => format!("{} addresses", addresses.len()),
        OpResult::Connected { peer, .. } => format!("connected to {peer}"),
        OpResult::DeviceOpened { adapter, .. } => format!("opened {adapter}"),
        OpResult::Text { text } => format!("{} chars", text.chars().count()),
        OpResult::SystemInfo(info) => format!("{} {}", info.os, info.arch),
        OpResult::Done => "done".into(),
    }
}
