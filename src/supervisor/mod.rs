//! Process supervisor.
//!
//! A single actor task owns every [`ProcessRecord`]. It allocates
//! identifiers, drives launches, attaches channels to the scheduler and a
//! reader task, reacts to exits, and restarts crashed processes when the
//! policy allows. Each change is published as a [`ProcessTable`] snapshot
//! through a `watch` channel; the router and broker only ever read those.

pub mod launcher;
pub(crate) mod reader;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::audit::{self, AuditEntry, AuditEventType, AuditLogger};
use crate::config::SupervisorConfig;
use crate::errors::SupervisorError;
use crate::models::{
    CapabilitySet, ExitStatus, MessageKind, ProcessId, ProcessRecord, ProcessRole, ProcessState,
    ProcessTable, RouteTarget,
};
use crate::router::{coordinator_message, RequestId, Router};
use crate::scheduler::{QueuedMessage, Scheduler};
use crate::schema::{self, SchemaRegistry};
use crate::transport::Channel;

pub use launcher::{
    CommandLauncher, InProcessLauncher, LaunchFuture, LaunchRequest, LaunchedProcess, Launcher,
    ProcessHandle, WorkerFuture, BASE_ENV_ALLOWLIST,
};

use reader::ReaderContext;

/// Time allowed between a channel ending and the process reporting its exit
/// status before the exit is recorded as a lost channel.
const EXIT_GRACE: Duration = Duration::from_millis(200);

const COMMAND_DEPTH: usize = 256;
const EVENT_DEPTH: usize = 256;

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A process completed its handshake and is routable.
    Ready {
        /// Process.
        id: ProcessId,
        /// Its role.
        role: ProcessRole,
    },
    /// A process reached `Terminated`.
    Exited {
        /// Process.
        id: ProcessId,
        /// Its role.
        role: ProcessRole,
        /// How it ended.
        status: ExitStatus,
    },
    /// A crashed process was replaced.
    Restarted {
        /// Crashed process.
        previous: ProcessId,
        /// Its replacement.
        replacement: ProcessId,
        /// Role of both.
        role: ProcessRole,
    },
}

type SpawnReply = oneshot::Sender<Result<ProcessId, SupervisorError>>;
type TerminateReply = oneshot::Sender<Result<(), SupervisorError>>;

pub(crate) enum Command {
    Spawn {
        role: ProcessRole,
        capabilities: Option<CapabilitySet>,
        reply: SpawnReply,
    },
    Launched {
        id: ProcessId,
        result: Result<LaunchedProcess, String>,
    },
    Terminate {
        id: ProcessId,
        reason: String,
        reply: Option<TerminateReply>,
    },
    DrainExpired {
        id: ProcessId,
    },
    Exited {
        id: ProcessId,
        status: ExitStatus,
    },
    Malformed {
        id: ProcessId,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Shared components the supervisor wires each process into.
pub struct SupervisorContext {
    /// Scheduler that owns outbound queues.
    pub scheduler: Arc<Scheduler>,
    /// Router inbound frames are handed to.
    pub router: Arc<Router>,
    /// Registry reader tasks decode with.
    pub registry: Arc<SchemaRegistry>,
    /// Audit sink for lifecycle and channel events.
    pub audit: Arc<dyn AuditLogger>,
}

/// Cloneable handle to the supervisor actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
    table: watch::Receiver<ProcessTable>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl SupervisorHandle {
    /// Start a process for `role`.
    ///
    /// `capabilities` defaults to the role's standard grant. Resolves once
    /// the process is Ready.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::LaunchFailed`] if the launcher fails or the
    /// process ends before it is Ready; [`SupervisorError::Stopped`] if the
    /// supervisor is gone.
    pub async fn spawn(
        &self,
        role: ProcessRole,
        capabilities: Option<CapabilitySet>,
    ) -> Result<ProcessId, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Spawn {
            role,
            capabilities,
            reply,
        })
        .await?;
        rx.await.map_err(|_| SupervisorError::Stopped)?
    }

    /// Drain and stop a process. Resolves once it is Terminated.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::UnknownProcess`] for an unknown identifier;
    /// [`SupervisorError::Stopped`] if the supervisor is gone.
    pub async fn terminate(
        &self,
        id: ProcessId,
        reason: impl Into<String>,
    ) -> Result<(), SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Terminate {
            id,
            reason: reason.into(),
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| SupervisorError::Stopped)?
    }

    /// Ask for termination without waiting for it.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::Stopped`] if the supervisor is gone.
    pub async fn request_termination(
        &self,
        id: ProcessId,
        reason: impl Into<String>,
    ) -> Result<(), SupervisorError> {
        self.send(Command::Terminate {
            id,
            reason: reason.into(),
            reply: None,
        })
        .await
    }

    /// Report that a process has exited.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::Stopped`] if the supervisor is gone.
    pub async fn on_exit(&self, id: ProcessId, status: ExitStatus) -> Result<(), SupervisorError> {
        self.send(Command::Exited { id, status }).await
    }

    /// Terminate every process and stop the actor.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Latest process table.
    #[must_use]
    pub fn table(&self) -> ProcessTable {
        self.table.borrow().clone()
    }

    /// Receiver for table snapshots.
    #[must_use]
    pub fn watch_table(&self) -> watch::Receiver<ProcessTable> {
        self.table.clone()
    }

    /// Subscribe to lifecycle events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Wait until `id` reaches `state`, or until it is pruned.
    ///
    /// Returns whether the state was observed.
    pub async fn wait_for_state(&self, id: ProcessId, state: ProcessState) -> bool {
        let mut table = self.table.clone();
        loop {
            match table.borrow_and_update().get(id).map(|record| record.state) {
                Some(current) if current == state => return true,
                Some(ProcessState::Terminated) | None => return false,
                Some(_) => {}
            }
            if table.changed().await.is_err() {
                return false;
            }
        }
    }

    async fn send(&self, command: Command) -> Result<(), SupervisorError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SupervisorError::Stopped)
    }
}

struct Starting {
    reply: Option<SpawnReply>,
    restart_of: Option<ProcessId>,
}

struct Live {
    channel: Channel,
    handle: ProcessHandle,
    cancel: CancellationToken,
    malformed: u32,
    drain_reason: Option<String>,
}

/// The supervisor actor.
pub struct Supervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn Launcher>,
    context: SupervisorContext,
    records: BTreeMap<ProcessId, ProcessRecord>,
    starting: HashMap<ProcessId, Starting>,
    live: HashMap<ProcessId, Live>,
    waiting: HashMap<ProcessId, Vec<TerminateReply>>,
    next_id: u64,
    table: watch::Sender<ProcessTable>,
    events: broadcast::Sender<SupervisorEvent>,
    commands: mpsc::Sender<Command>,
    shutdown: Option<oneshot::Sender<()>>,
    stopped: bool,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Start the actor. Snapshots are published on `table`.
    ///
    /// The actor stops on [`SupervisorHandle::shutdown`] or when `cancel`
    /// fires.
    #[must_use]
    pub fn start(
        config: SupervisorConfig,
        launcher: Arc<dyn Launcher>,
        context: SupervisorContext,
        table: watch::Sender<ProcessTable>,
        cancel: CancellationToken,
    ) -> (SupervisorHandle, JoinHandle<()>) {
        let (commands, rx) = mpsc::channel(COMMAND_DEPTH);
        let (events, _) = broadcast::channel(EVENT_DEPTH);
        let handle = SupervisorHandle {
            commands: commands.clone(),
            table: table.subscribe(),
            events: events.clone(),
        };
        let actor = Self {
            config,
            launcher,
            context,
            records: BTreeMap::new(),
            starting: HashMap::new(),
            live: HashMap::new(),
            waiting: HashMap::new(),
            next_id: 1,
            table,
            events,
            commands,
            shutdown: None,
            stopped: false,
            cancel,
        };
        let task = tokio::spawn(actor.run(rx).instrument(info_span!("supervisor")));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut prune = tokio::time::interval(self.config.prune_interval());
        prune.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("supervisor started");
        while !self.stopped {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = prune.tick() => self.prune(Instant::now()),
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }
        self.stop_all();
        info!("supervisor stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Spawn {
                role,
                capabilities,
                reply,
            } => {
                let capabilities = capabilities.unwrap_or_else(|| CapabilitySet::default_for(&role));
                self.spawn_process(role, capabilities, 0, Some(reply), None);
            }
            Command::Launched { id, result } => self.on_launched(id, result),
            Command::Terminate { id, reason, reply } => self.terminate(id, reason, reply),
            Command::DrainExpired { id } => self.on_drain_expired(id),
            Command::Exited { id, status } => self.on_exit(id, status),
            Command::Malformed { id } => self.on_malformed(id),
            Command::Shutdown { reply } => self.begin_shutdown(reply),
        }
    }

    fn spawn_process(
        &mut self,
        role: ProcessRole,
        capabilities: CapabilitySet,
        restarts: u32,
        reply: Option<SpawnReply>,
        restart_of: Option<ProcessId>,
    ) {
        if role == ProcessRole::Coordinator || self.shutdown.is_some() {
            let reason = if self.shutdown.is_some() {
                "supervisor is shutting down"
            } else {
                "the coordinator role cannot be spawned"
            };
            if let Some(reply) = reply {
                let _ = reply.send(Err(SupervisorError::LaunchFailed {
                    role,
                    reason: reason.into(),
                }));
            }
            return;
        }

        let id = ProcessId(self.next_id);
        self.next_id += 1;
        let mut record = ProcessRecord::new(id, role.clone(), capabilities.clone());
        record.restarts = restarts;
        self.records.insert(id, record);
        self.starting.insert(id, Starting { reply, restart_of });
        self.publish();
        info!(%id, %role, grant = %capabilities, restarts, "spawning process");

        let launcher = Arc::clone(&self.launcher);
        let commands = self.commands.clone();
        let timeout = self.config.startup_timeout();
        let request = LaunchRequest {
            id,
            role,
            capabilities,
        };
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, launcher.launch(request)).await {
                Ok(result) => result,
                Err(_) => Err(format!("startup timeout after {timeout:?}")),
            };
            let _ = commands.send(Command::Launched { id, result }).await;
        });
    }

    fn on_launched(&mut self, id: ProcessId, result: Result<LaunchedProcess, String>) {
        let starting = self.starting.remove(&id);
        let Some(record) = self.records.get(&id) else {
            return;
        };
        let role = record.role().clone();
        let still_starting = record.state == ProcessState::Starting;

        let launched = match result {
            Ok(launched) if still_starting => launched,
            Ok(launched) => {
                debug!(%id, "process ended during launch; discarding it");
                launched.channel.close();
                launched.handle.kill();
                return;
            }
            Err(reason) => {
                warn!(%id, %role, %reason, "launch failed");
                self.finalize(
                    id,
                    ExitStatus::Crashed {
                        reason: format!("launch failed: {reason}"),
                    },
                );
                if let Some(reply) = starting.and_then(|starting| starting.reply) {
                    let _ = reply.send(Err(SupervisorError::LaunchFailed { role, reason }));
                }
                return;
            }
        };
        self.activate(id, role, launched, starting);
    }

    fn activate(
        &mut self,
        id: ProcessId,
        role: ProcessRole,
        launched: LaunchedProcess,
        starting: Option<Starting>,
    ) {
        let LaunchedProcess { channel, mut handle } = launched;
        let cancel = self.cancel.child_token();
        let _dispatcher = self.context.scheduler.attach(id, channel.clone(), &cancel);
        // Readers route as this process, so the table must show it Ready first.
        if let Some(record) = self.records.get_mut(&id) {
            record.state = ProcessState::Ready;
        }
        self.publish();

        let reader = tokio::spawn(
            reader::run_reader(
                ReaderContext {
                    id,
                    role: role.label(),
                    registry: Arc::clone(&self.context.registry),
                    router: Arc::clone(&self.context.router),
                    audit: Arc::clone(&self.context.audit),
                    reports: self.commands.clone(),
                },
                channel.clone(),
                cancel.clone(),
            )
            .instrument(info_span!("reader", %id)),
        );
        tokio::spawn(watch_exit(id, handle.take_exit(), reader, self.commands.clone()));

        self.live.insert(
            id,
            Live {
                channel,
                handle,
                cancel,
                malformed: 0,
                drain_reason: None,
            },
        );
        info!(%id, %role, "process ready");
        self.record_audit(
            AuditEntry::new(AuditEventType::ProcessReady)
                .with_process(id)
                .with_role(role.label()),
        );
        let _ = self.events.send(SupervisorEvent::Ready {
            id,
            role: role.clone(),
        });

        let Some(starting) = starting else {
            return;
        };
        if let Some(previous) = starting.restart_of {
            info!(%previous, replacement = %id, %role, "process restarted");
            self.record_audit(
                AuditEntry::new(AuditEventType::ProcessRestarted)
                    .with_process(id)
                    .with_role(role.label())
                    .with_reason(format!("replaces {previous}")),
            );
            let _ = self.events.send(SupervisorEvent::Restarted {
                previous,
                replacement: id,
                role,
            });
        }
        if let Some(reply) = starting.reply {
            let _ = reply.send(Ok(id));
        }
    }

    fn terminate(&mut self, id: ProcessId, reason: String, reply: Option<TerminateReply>) {
        let Some(state) = self.records.get(&id).map(|record| record.state) else {
            if let Some(reply) = reply {
                let _ = reply.send(Err(SupervisorError::UnknownProcess(id)));
            }
            return;
        };

        match state {
            ProcessState::Terminated => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(()));
                }
            }
            ProcessState::Starting => {
                info!(%id, %reason, "terminating process before it became ready");
                self.waiting.entry(id).or_default().extend(reply);
                self.finalize(id, ExitStatus::Terminated { reason });
            }
            ProcessState::Draining => {
                self.waiting.entry(id).or_default().extend(reply);
            }
            ProcessState::Ready => {
                info!(%id, %reason, "draining process");
                self.waiting.entry(id).or_default().extend(reply);
                if let Some(record) = self.records.get_mut(&id) {
                    record.state = ProcessState::Draining;
                }
                self.publish();

                let shutdown = coordinator_message(
                    &self.context.router,
                    RouteTarget::Process(id),
                    MessageKind::Shutdown,
                    Bytes::from(reason.clone().into_bytes()),
                );
                if let Err(err) = self.context.scheduler.enqueue(id, shutdown) {
                    debug!(%id, %err, "shutdown message not queued");
                }
                if let Some(live) = self.live.get_mut(&id) {
                    live.drain_reason = Some(reason);
                    live.handle.interrupt();
                }

                let commands = self.commands.clone();
                let drain = self.config.drain_timeout();
                tokio::spawn(async move {
                    tokio::time::sleep(drain).await;
                    let _ = commands.send(Command::DrainExpired { id }).await;
                });
            }
        }
    }

    fn on_drain_expired(&mut self, id: ProcessId) {
        let draining = self
            .records
            .get(&id)
            .is_some_and(|record| record.state == ProcessState::Draining);
        if !draining {
            return;
        }
        warn!(%id, "drain timeout elapsed; killing process");
        let reason = self
            .live
            .get(&id)
            .and_then(|live| live.drain_reason.clone())
            .unwrap_or_default();
        if let Some(live) = self.live.get(&id) {
            live.handle.kill();
        }
        self.finalize(
            id,
            ExitStatus::Terminated {
                reason: format!("{reason} (killed after drain timeout)"),
            },
        );
    }

    fn on_exit(&mut self, id: ProcessId, status: ExitStatus) {
        let Some(state) = self.records.get(&id).map(|record| record.state) else {
            return;
        };
        match state {
            ProcessState::Terminated => {
                debug!(%id, %status, "exit of already terminated process");
            }
            ProcessState::Draining => {
                let reason = self
                    .live
                    .get(&id)
                    .and_then(|live| live.drain_reason.clone())
                    .unwrap_or_else(|| status.to_string());
                self.finalize(id, ExitStatus::Terminated { reason });
            }
            ProcessState::Ready | ProcessState::Starting => self.finalize(id, status),
        }
    }

    fn on_malformed(&mut self, id: ProcessId) {
        let Some(live) = self.live.get_mut(&id) else {
            return;
        };
        live.malformed += 1;
        let count = live.malformed;
        if count != self.config.malformed_threshold {
            debug!(%id, count, "malformed frame counted");
            return;
        }
        warn!(%id, count, "channel is suspect; terminating process");
        live.handle.kill();
        self.finalize(
            id,
            ExitStatus::Terminated {
                reason: format!("suspect channel: {count} malformed frames"),
            },
        );
    }

    fn begin_shutdown(&mut self, reply: oneshot::Sender<()>) {
        info!("supervisor shutting down");
        self.shutdown = Some(reply);
        let active: Vec<ProcessId> = self
            .records
            .values()
            .filter(|record| matches!(record.state, ProcessState::Starting | ProcessState::Ready))
            .map(ProcessRecord::id)
            .collect();
        for id in active {
            self.terminate(id, "coordinator shutdown".into(), None);
        }
        self.check_shutdown();
    }

    fn check_shutdown(&mut self) {
        if self.shutdown.is_none() {
            return;
        }
        let active = self
            .records
            .values()
            .any(|record| record.state != ProcessState::Terminated);
        if active {
            return;
        }
        if let Some(reply) = self.shutdown.take() {
            let _ = reply.send(());
        }
        self.stopped = true;
    }

    fn finalize(&mut self, id: ProcessId, status: ExitStatus) {
        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        if record.state == ProcessState::Terminated {
            return;
        }
        let previous = record.state;
        record.state = ProcessState::Terminated;
        record.terminated_at = Some(Instant::now());
        record.exit = Some(status.clone());
        let role = record.role().clone();
        let capabilities = record.capabilities().clone();
        let restarts = record.restarts;

        if let Some(live) = self.live.remove(&id) {
            live.cancel.cancel();
            live.channel.close();
            live.handle.kill();
        }
        self.publish();

        self.context.router.fail_process(id);
        let relayed = self.context.router.take_relayed(id);
        let drained = self.context.scheduler.detach(id);
        self.notify_lost(id, drained, relayed);

        if status.is_crash() {
            warn!(%id, %role, %status, "process crashed");
        } else {
            info!(%id, %role, %status, "process terminated");
        }
        self.record_audit(
            AuditEntry::new(AuditEventType::ProcessExited)
                .with_process(id)
                .with_role(role.label())
                .with_reason(status.to_string()),
        );
        let _ = self.events.send(SupervisorEvent::Exited {
            id,
            role: role.clone(),
            status: status.clone(),
        });

        for reply in self.waiting.remove(&id).unwrap_or_default() {
            let _ = reply.send(Ok(()));
        }
        if let Some(reply) = self.starting.remove(&id).and_then(|starting| starting.reply) {
            let _ = reply.send(Err(SupervisorError::LaunchFailed {
                role: role.clone(),
                reason: status.to_string(),
            }));
        }

        let restartable = previous == ProcessState::Ready
            && status.is_crash()
            && self.config.restart.restarts(&role);
        if restartable {
            if restarts < self.config.restart.max_restarts {
                self.spawn_process(role, capabilities, restarts + 1, None, Some(id));
            } else {
                warn!(%id, %role, restarts, "restart limit reached; not restarting");
            }
        }
        self.check_shutdown();
    }

    /// Tell workers whose requests to `lost` can no longer be answered:
    /// those still queued and those already relayed to it.
    fn notify_lost(
        &self,
        lost: ProcessId,
        drained: Vec<QueuedMessage>,
        relayed: Vec<RequestId>,
    ) {
        let router = Arc::clone(&self.context.router);
        let queued = drained
            .into_iter()
            .map(|queued| queued.message)
            .filter(|message| message.kind().is_request())
            .map(|message| RequestId {
                requester: message.sender(),
                sequence: message.sequence(),
            });
        let unanswered: BTreeSet<(ProcessId, u64)> = queued
            .chain(relayed)
            .filter(|request| !request.requester.is_coordinator() && request.requester != lost)
            .map(|request| (request.requester, request.sequence))
            .collect();
        let notices: Vec<_> = unanswered
            .into_iter()
            .map(|(requester, sequence)| {
                schema::undelivered(
                    MessageKind::ProcessLost,
                    requester,
                    router.next_sequence(RouteTarget::Process(requester)),
                    sequence,
                    lost,
                )
            })
            .collect();
        if notices.is_empty() {
            return;
        }
        debug!(%lost, notices = notices.len(), "notifying requesters of lost process");
        tokio::spawn(async move {
            for notice in notices {
                if let Err(err) = router.route(notice).await {
                    debug!(%err, "process-lost notification not delivered");
                }
            }
        });
    }

    fn prune(&mut self, now: Instant) {
        let retention = self.config.terminated_retention();
        let before = self.records.len();
        self.records.retain(|_, record| {
            !record
                .terminated_at
                .is_some_and(|at| now.saturating_duration_since(at) >= retention)
        });
        let pruned = before - self.records.len();
        if pruned > 0 {
            debug!(pruned, "pruned terminated process records");
            self.publish();
        }
    }

    fn stop_all(&mut self) {
        for (id, live) in self.live.drain() {
            debug!(%id, "stopping process with supervisor");
            live.cancel.cancel();
            live.channel.close();
            live.handle.kill();
        }
    }

    fn publish(&self) {
        self.table.send_replace(ProcessTable::new(self.records.clone()));
    }

    fn record_audit(&self, entry: AuditEntry) {
        audit::record(self.context.audit.as_ref(), entry);
    }
}

/// Wait for a process to end and report how.
///
/// The process's own exit status wins; if only the channel ends, the
/// status gets [`EXIT_GRACE`] to arrive before the exit is recorded as
/// [`ExitStatus::ChannelLost`].
async fn watch_exit(
    id: ProcessId,
    exit: Option<oneshot::Receiver<ExitStatus>>,
    mut reader: JoinHandle<()>,
    commands: mpsc::Sender<Command>,
) {
    let status = match exit {
        Some(mut exit) => tokio::select! {
            status = &mut exit => status.unwrap_or(ExitStatus::ChannelLost),
            _ = &mut reader => match tokio::time::timeout(EXIT_GRACE, exit).await {
                Ok(Ok(status)) => status,
                Ok(Err(_)) | Err(_) => ExitStatus::ChannelLost,
            },
        },
        None => {
            let _ = reader.await;
            ExitStatus::ChannelLost
        }
    };
    let _ = commands.send(Command::Exited { id, status }).await;
}
