//! Composition root.
//!
//! [`Coordinator::start`] wires the scheduler, router, broker and supervisor
//! together and spawns the long-running tasks: the broker loop, the TTL
//! sweep, termination forwarding from the broker to the supervisor, and the
//! lifecycle listener that releases broker state of exited processes.

pub mod sweep;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::audit::AuditLogger;
use crate::broker::{Broker, ResourceProvider, TerminationRequest};
use crate::config::BusConfig;
use crate::errors::{RequestError, RouteError, SupervisorError};
use crate::models::{
    CapabilitySet, Message, MessageKind, ProcessId, ProcessRole, ProcessTable, RouteTarget,
};
use crate::router::{coordinator_message, Router};
use crate::scheduler::Scheduler;
use crate::schema::SchemaRegistry;
use crate::supervisor::{
    CommandLauncher, Launcher, Supervisor, SupervisorContext, SupervisorEvent, SupervisorHandle,
};
use crate::transport::{ChannelLimits, ChannelListener};
use crate::Result;

/// Depth of the coordinator inbox.
const INBOX_DEPTH: usize = 1024;

/// The running bus, as seen from the privileged process.
pub struct Coordinator {
    config: BusConfig,
    router: Arc<Router>,
    scheduler: Arc<Scheduler>,
    broker: Arc<Broker>,
    supervisor: SupervisorHandle,
    sites: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Coordinator {
    /// Build every component and start the background tasks.
    ///
    /// Returns the coordinator and its inbox: messages workers address to
    /// the coordinator that do not answer one of its requests. Dropping the
    /// inbox makes such messages undeliverable.
    #[must_use]
    pub fn start(
        config: BusConfig,
        launcher: Arc<dyn Launcher>,
        audit: Arc<dyn AuditLogger>,
        provider: Arc<dyn ResourceProvider>,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Message>) {
        let (table_tx, table_rx) = watch::channel(ProcessTable::default());
        let scheduler = Arc::new(Scheduler::new(config.scheduler.clone()));
        let (broker_tx, broker_rx) = mpsc::channel(config.broker.queue_depth);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_DEPTH);
        let router = Arc::new(Router::new(
            config.router.clone(),
            table_rx.clone(),
            Arc::clone(&scheduler),
            broker_tx,
            inbox_tx,
            config.transport.max_frame_bytes,
        ));

        let (terminations_tx, terminations_rx) = mpsc::unbounded_channel();
        let broker = Arc::new(Broker::new(
            config.broker.clone(),
            table_rx,
            Arc::clone(&audit),
            provider,
            terminations_tx,
        ));

        let (supervisor, supervisor_task) = Supervisor::start(
            config.supervisor.clone(),
            launcher,
            SupervisorContext {
                scheduler: Arc::clone(&scheduler),
                router: Arc::clone(&router),
                registry: Arc::new(SchemaRegistry::standard()),
                audit,
            },
            table_tx,
            cancel.child_token(),
        );

        let broker_task = tokio::spawn(
            Arc::clone(&broker)
                .run(broker_rx, Arc::clone(&router), cancel.child_token())
                .instrument(info_span!("broker")),
        );
        let sweep_task = sweep::spawn_sweep_task(
            Arc::clone(&scheduler),
            Arc::clone(&router),
            cancel.child_token(),
        );
        let termination_task = spawn_termination_forwarder(
            terminations_rx,
            supervisor.clone(),
            cancel.child_token(),
        );
        let lifecycle_task = spawn_lifecycle_listener(
            supervisor.clone(),
            Arc::clone(&broker),
            cancel.child_token(),
        );

        info!("coordinator started");
        let coordinator = Self {
            config,
            router,
            scheduler,
            broker,
            supervisor,
            sites: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(vec![
                supervisor_task,
                broker_task,
                sweep_task,
                termination_task,
                lifecycle_task,
            ]),
            cancel,
        };
        (coordinator, inbox_rx)
    }

    /// Bind the configured local socket and build a launcher that starts
    /// the executables listed under `[launch]`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Channel` if the socket cannot be bound.
    pub fn local_launcher(config: &BusConfig, cancel: &CancellationToken) -> Result<CommandLauncher> {
        let transport = &config.transport;
        let listener = ChannelListener::bind(
            &transport.ipc_name,
            ChannelLimits::from(transport),
            transport.handshake_timeout(),
            cancel.child_token(),
        )?;
        Ok(CommandLauncher::new(
            config.launch.clone(),
            Arc::new(listener),
            config.supervisor.startup_timeout(),
        ))
    }

    /// Configuration the bus was started with.
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Router shared with reader tasks.
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Scheduler owning outbound queues.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Privilege broker.
    #[must_use]
    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Supervisor handle.
    #[must_use]
    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    /// Latest process table.
    #[must_use]
    pub fn table(&self) -> ProcessTable {
        self.supervisor.table()
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.supervisor.subscribe()
    }

    /// Spawn a worker, optionally with an explicit grant.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError`] if the launch fails.
    pub async fn spawn(
        &self,
        role: ProcessRole,
        capabilities: Option<CapabilitySet>,
    ) -> std::result::Result<ProcessId, SupervisorError> {
        self.supervisor.spawn(role, capabilities).await
    }

    /// Drain and stop a worker.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::UnknownProcess`] for unknown identifiers.
    pub async fn terminate(
        &self,
        id: ProcessId,
        reason: impl Into<String>,
    ) -> std::result::Result<(), SupervisorError> {
        self.supervisor.terminate(id, reason).await
    }

    /// Ready renderer for `site_key`, spawning one when none exists.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError`] if a renderer has to be spawned and the
    /// launch fails.
    pub async fn renderer_for_site(
        &self,
        site_key: &str,
    ) -> std::result::Result<ProcessId, SupervisorError> {
        let _guard = self.sites.lock().await;
        if let Some(record) = self.table().renderer_for_site(site_key) {
            return Ok(record.id());
        }
        debug!(site_key, "no renderer for site; spawning one");
        self.supervisor
            .spawn(
                ProcessRole::Renderer {
                    site_key: site_key.to_owned(),
                },
                None,
            )
            .await
    }

    /// Route a coordinator-originated message with the kind's default
    /// priority.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError`] when the destination is unknown or full.
    pub async fn send(
        &self,
        destination: RouteTarget,
        kind: MessageKind,
        payload: impl Into<Bytes>,
    ) -> std::result::Result<(), RouteError> {
        let message = coordinator_message(&self.router, destination, kind, payload);
        self.router.route(message).await
    }

    /// Send a request and wait for the response.
    ///
    /// `timeout` defaults to the router's configured request deadline.
    ///
    /// # Errors
    ///
    /// [`RequestError::Timeout`], [`RequestError::ProcessLost`],
    /// [`RequestError::Cancelled`], or a routing failure.
    pub async fn request(
        &self,
        destination: RouteTarget,
        kind: MessageKind,
        payload: impl Into<Bytes>,
        timeout: Option<Duration>,
    ) -> std::result::Result<Message, RequestError> {
        let timeout = timeout.unwrap_or_else(|| self.router.config().default_request_timeout());
        let message = coordinator_message(&self.router, destination, kind, payload);
        self.router.request(message, timeout).await.recv().await
    }

    /// Liveness check. Returns the round-trip time of a `Ping`.
    ///
    /// # Errors
    ///
    /// Same as [`Coordinator::request`].
    pub async fn ping(&self, id: ProcessId) -> std::result::Result<Duration, RequestError> {
        let started = Instant::now();
        let timeout = MessageKind::Ping
            .default_ttl()
            .unwrap_or_else(|| self.router.config().default_request_timeout());
        let pong = self
            .request(
                RouteTarget::Process(id),
                MessageKind::Ping,
                Bytes::new(),
                Some(timeout),
            )
            .await?;
        let rtt = started.elapsed();
        debug!(%id, sequence = pong.sequence(), rtt_us = rtt.as_micros(), "pong received");
        Ok(rtt)
    }

    /// Terminate every worker and stop the background tasks.
    pub async fn shutdown(&self) {
        info!("coordinator shutting down");
        self.supervisor.shutdown().await;
        self.cancel.cancel();
        self.router.pending().clear();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(%err, "background task ended abnormally");
            }
        }
        info!("coordinator stopped");
    }
}

fn spawn_termination_forwarder(
    mut requests: mpsc::UnboundedReceiver<TerminationRequest>,
    supervisor: SupervisorHandle,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let request = tokio::select! {
                () = cancel.cancelled() => break,
                next = requests.recv() => match next {
                    Some(request) => request,
                    None => break,
                },
            };
            warn!(process = %request.process, reason = %request.reason, "terminating process on broker request");
            if supervisor
                .request_termination(request.process, request.reason)
                .await
                .is_err()
            {
                break;
            }
        }
    })
}

fn spawn_lifecycle_listener(
    supervisor: SupervisorHandle,
    broker: Arc<Broker>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut events = supervisor.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(SupervisorEvent::Exited { id, .. }) => broker.release_process(id),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "lifecycle listener lagged; releasing from the table");
                    supervisor
                        .table()
                        .iter()
                        .filter(|record| record.exit.is_some())
                        .for_each(|record| broker.release_process(record.id()));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
