//! Process launchers.
//!
//! A [`Launcher`] starts the executable (or task) for one role and returns
//! the established channel plus a [`ProcessHandle`] the supervisor uses to
//! observe exit and to stop the process.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LaunchConfig;
use crate::models::{CapabilitySet, ExitStatus, ProcessId, ProcessRole};
use crate::schema::SchemaRegistry;
use crate::transport::{Channel, ChannelLimits, ChannelListener};
use crate::worker::{Worker, ENV_BUS_NAME, ENV_LAUNCH_TOKEN, ENV_PROCESS_ID, ENV_ROLE};

/// Environment variables every launched worker inherits.
///
/// Everything else is stripped with `env_clear()` before the child starts.
pub const BASE_ENV_ALLOWLIST: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    "TMPDIR",
    // Windows-specific variables.
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERPROFILE",
];

/// What the supervisor asks a launcher to start.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Identifier allocated for the process.
    pub id: ProcessId,
    /// Role to start.
    pub role: ProcessRole,
    /// Grant recorded for the process.
    pub capabilities: CapabilitySet,
}

/// Boxed launch future.
pub type LaunchFuture<'a> =
    Pin<Box<dyn Future<Output = Result<LaunchedProcess, String>> + Send + 'a>>;

/// Starts worker processes.
pub trait Launcher: Send + Sync {
    /// Start the process described by `request` and wait for its channel.
    ///
    /// # Errors
    ///
    /// Returns a description of the failure; the supervisor records the
    /// process as terminated.
    fn launch(&self, request: LaunchRequest) -> LaunchFuture<'_>;
}

/// A started process.
pub struct LaunchedProcess {
    /// Coordinator end of the process's channel.
    pub channel: Channel,
    /// Exit observation and control.
    pub handle: ProcessHandle,
}

/// Supervisor's grip on a running process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    exit: Option<oneshot::Receiver<ExitStatus>>,
    kill: CancellationToken,
}

impl ProcessHandle {
    /// Handle whose monitor reports on `exit` and kills when `kill` fires.
    #[must_use]
    pub fn new(
        pid: Option<u32>,
        exit: oneshot::Receiver<ExitStatus>,
        kill: CancellationToken,
    ) -> Self {
        Self {
            pid,
            exit: Some(exit),
            kill,
        }
    }

    /// OS process id, when the process is a real child.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the exit receiver; only the first caller gets it.
    pub fn take_exit(&mut self) -> Option<oneshot::Receiver<ExitStatus>> {
        self.exit.take()
    }

    /// Ask the process to stop on its own (SIGTERM on unix).
    pub fn interrupt(&self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                debug!(pid, %err, "SIGTERM not delivered");
            }
        }
    }

    /// Stop the process immediately.
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

fn exit_status(status: std::io::Result<std::process::ExitStatus>) -> ExitStatus {
    match status {
        Ok(status) => match status.code() {
            Some(code) => ExitStatus::Exited { code },
            None => ExitStatus::Crashed {
                reason: "terminated by signal".into(),
            },
        },
        Err(err) => ExitStatus::Crashed {
            reason: format!("wait failed: {err}"),
        },
    }
}

/// Watch `child` until it exits or `kill` fires.
fn monitor_child(id: ProcessId, mut child: Child, kill: CancellationToken) -> oneshot::Receiver<ExitStatus> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => exit_status(status),
            () = kill.cancelled() => {
                if let Err(err) = child.kill().await {
                    warn!(%id, %err, "failed to kill child process");
                }
                ExitStatus::Terminated { reason: "killed".into() }
            }
        };
        debug!(%id, %status, "child process exited");
        let _ = tx.send(status);
    });
    rx
}

/// Launches worker executables that connect back over the local socket.
pub struct CommandLauncher {
    programs: HashMap<String, LaunchConfig>,
    listener: Arc<ChannelListener>,
    startup_timeout: Duration,
}

impl CommandLauncher {
    /// Launcher resolving executables by role label.
    #[must_use]
    pub fn new(
        programs: HashMap<String, LaunchConfig>,
        listener: Arc<ChannelListener>,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            programs,
            listener,
            startup_timeout,
        }
    }

    async fn start(&self, request: LaunchRequest) -> Result<LaunchedProcess, String> {
        let label = request.role.label();
        let config = self
            .programs
            .get(label)
            .ok_or_else(|| format!("no launch configuration for role '{label}'"))?;
        let role_json = serde_json::to_string(&request.role)
            .map_err(|err| format!("cannot encode role: {err}"))?;

        let token = uuid::Uuid::new_v4().to_string();
        let connected = self.listener.expect(token.clone(), request.id).await;

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args);
        cmd.env_clear();
        for key in BASE_ENV_ALLOWLIST
            .iter()
            .copied()
            .chain(config.env_allowlist.iter().map(String::as_str))
        {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.env(ENV_BUS_NAME, self.listener.name())
            .env(ENV_PROCESS_ID, request.id.0.to_string())
            .env(ENV_LAUNCH_TOKEN, &token)
            .env(ENV_ROLE, role_json)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                self.listener.forget(&token).await;
                return Err(format!("failed to spawn {}: {err}", config.program.display()));
            }
        };
        let pid = child.id();

        let outcome = tokio::select! {
            connected = connected => connected.map_err(|_| "listener stopped before handshake".to_owned()),
            status = child.wait() => Err(format!("exited before handshake: {}", exit_status(status))),
            () = tokio::time::sleep(self.startup_timeout) => Err(format!(
                "startup timeout: no handshake within {:?}",
                self.startup_timeout
            )),
        };
        let channel = match outcome {
            Ok(channel) => channel,
            Err(reason) => {
                self.listener.forget(&token).await;
                // kill_on_drop reaps the child if it is still running.
                let _ = child.start_kill();
                return Err(reason);
            }
        };

        info!(id = %request.id, role = %request.role, pid = pid.unwrap_or(0), "worker process connected");
        let kill = CancellationToken::new();
        let exit = monitor_child(request.id, child, kill.clone());
        Ok(LaunchedProcess {
            channel,
            handle: ProcessHandle::new(pid, exit, kill),
        })
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, request: LaunchRequest) -> LaunchFuture<'_> {
        Box::pin(self.start(request))
    }
}

/// Boxed worker body future.
pub type WorkerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

type WorkerBody = Arc<dyn Fn(Worker) -> WorkerFuture + Send + Sync>;

/// Runs worker bodies as tasks over in-memory channel pairs.
///
/// Used by embedding hosts that do not need OS isolation, and by tests.
pub struct InProcessLauncher {
    limits: ChannelLimits,
    body: WorkerBody,
}

impl InProcessLauncher {
    /// Launcher running `body` for every spawned process.
    pub fn new<F, Fut>(limits: ChannelLimits, body: F) -> Self
    where
        F: Fn(Worker) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            limits,
            body: Arc::new(move |worker| Box::pin(body(worker))),
        }
    }
}

impl Launcher for InProcessLauncher {
    fn launch(&self, request: LaunchRequest) -> LaunchFuture<'_> {
        let (coordinator_end, worker_end) = Channel::pair(self.limits);
        let worker = Worker::new(
            request.id,
            request.role,
            worker_end,
            SchemaRegistry::standard(),
        );
        let body = (self.body)(worker);
        let kill = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let id = request.id;
        let task = tokio::spawn(body);
        let stop = kill.clone();
        tokio::spawn(async move {
            let abort = task.abort_handle();
            let status = tokio::select! {
                joined = task => match joined {
                    Ok(()) => ExitStatus::Exited { code: 0 },
                    Err(err) if err.is_panic() => ExitStatus::Crashed { reason: "worker panicked".into() },
                    Err(_) => ExitStatus::Crashed { reason: "worker task aborted".into() },
                },
                () = stop.cancelled() => {
                    abort.abort();
                    ExitStatus::Terminated { reason: "killed".into() }
                }
            };
            debug!(%id, %status, "in-process worker finished");
            let _ = tx.send(status);
        });
        Box::pin(async move {
            Ok(LaunchedProcess {
                channel: coordinator_end,
                handle: ProcessHandle::new(None, rx, kill),
            })
        })
    }
}
