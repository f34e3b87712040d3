//! Bus configuration parsing and validation.
//!
//! Every numeric threshold the bus relies on (queue caps, starvation latency,
//! TTLs, violation and malformed thresholds) is a configuration value with a
//! documented default so it can be tuned and boundary-tested.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::{MessageKind, PriorityClass, ProcessRole};
use crate::{AppError, Result};

fn default_ipc_name() -> String {
    "privsep-bus".into()
}

fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_channel_buffer_bytes() -> usize {
    32 * 1024 * 1024
}

fn default_handshake_timeout_ms() -> u64 {
    5_000
}

/// Channel transport settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TransportConfig {
    /// Namespaced local socket name the coordinator listens on.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Largest frame accepted or sent on a channel.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Cap on bytes buffered for the writer before `send` reports overflow.
    #[serde(default = "default_channel_buffer_bytes")]
    pub channel_buffer_bytes: usize,
    /// Time an accepted connection has to deliver its `Hello` frame.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ipc_name: default_ipc_name(),
            max_frame_bytes: default_max_frame_bytes(),
            channel_buffer_bytes: default_channel_buffer_bytes(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl TransportConfig {
    /// Handshake timeout as a [`Duration`].
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn default_critical_cap() -> usize {
    256
}

fn default_high_cap() -> usize {
    512
}

fn default_normal_cap() -> usize {
    1024
}

fn default_low_cap() -> usize {
    1024
}

fn default_total_cap() -> usize {
    2048
}

fn default_starvation_max_latency_ms() -> u64 {
    200
}

fn default_sweep_interval_ms() -> u64 {
    100
}

fn default_overflow_retry_interval_ms() -> u64 {
    10
}

/// Per-channel queue limits and dispatch timing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SchedulerConfig {
    /// Soft cap of the Critical queue. Critical is admitted past it.
    #[serde(default = "default_critical_cap")]
    pub critical_cap: usize,
    /// Cap of the High queue.
    #[serde(default = "default_high_cap")]
    pub high_cap: usize,
    /// Cap of the Normal queue.
    #[serde(default = "default_normal_cap")]
    pub normal_cap: usize,
    /// Cap of the Low queue.
    #[serde(default = "default_low_cap")]
    pub low_cap: usize,
    /// Cap on messages queued for one channel across all classes.
    #[serde(default = "default_total_cap")]
    pub total_cap: usize,
    /// Wait after which a Low or Normal message triggers the starvation guard.
    #[serde(default = "default_starvation_max_latency_ms")]
    pub starvation_max_latency_ms: u64,
    /// Period of the TTL sweep.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// Delay before a dispatcher retries after channel overflow.
    #[serde(default = "default_overflow_retry_interval_ms")]
    pub overflow_retry_interval_ms: u64,
    /// TTL overrides keyed by kind name, in milliseconds. `0` disables expiry.
    #[serde(default)]
    pub ttl_overrides_ms: HashMap<String, u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            critical_cap: default_critical_cap(),
            high_cap: default_high_cap(),
            normal_cap: default_normal_cap(),
            low_cap: default_low_cap(),
            total_cap: default_total_cap(),
            starvation_max_latency_ms: default_starvation_max_latency_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            overflow_retry_interval_ms: default_overflow_retry_interval_ms(),
            ttl_overrides_ms: HashMap::new(),
        }
    }
}

impl SchedulerConfig {
    /// Capacity of one class queue.
    #[must_use]
    pub fn class_cap(&self, class: PriorityClass) -> usize {
        match class {
            PriorityClass::Critical => self.critical_cap,
            PriorityClass::High => self.high_cap,
            PriorityClass::Normal => self.normal_cap,
            PriorityClass::Low => self.low_cap,
        }
    }

    /// Starvation guard threshold.
    #[must_use]
    pub fn starvation_max_latency(&self) -> Duration {
        Duration::from_millis(self.starvation_max_latency_ms)
    }

    /// Sweep period.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Overflow retry delay.
    #[must_use]
    pub fn overflow_retry_interval(&self) -> Duration {
        Duration::from_millis(self.overflow_retry_interval_ms)
    }

    /// Effective TTL for `kind`, honouring overrides.
    #[must_use]
    pub fn ttl_for(&self, kind: MessageKind) -> Option<Duration> {
        match self.ttl_overrides_ms.get(kind.name()) {
            Some(0) => None,
            Some(&ms) => Some(Duration::from_millis(ms)),
            None => kind.default_ttl(),
        }
    }
}

fn default_route_retry_deadline_ms() -> u64 {
    250
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_relayed_retention_ms() -> u64 {
    60_000
}

fn default_cross_worker_kinds() -> Vec<String> {
    vec![
        "network_request".into(),
        "network_response".into(),
        "frame_data".into(),
    ]
}

/// Router settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RouterConfig {
    /// How long Critical/High messages wait for a not-yet-Ready destination.
    #[serde(default = "default_route_retry_deadline_ms")]
    pub route_retry_deadline_ms: u64,
    /// Deadline applied to coordinator requests that do not pass one.
    #[serde(default = "default_request_timeout_ms")]
    pub default_request_timeout_ms: u64,
    /// How long a relayed worker-to-worker request is remembered, so its
    /// requester can be told when the target exits.
    #[serde(default = "default_relayed_retention_ms")]
    pub relayed_retention_ms: u64,
    /// Per-kind priority overrides applied to worker-originated messages.
    #[serde(default)]
    pub priority_overrides: HashMap<String, PriorityClass>,
    /// Kinds a worker may address directly to another worker.
    #[serde(default = "default_cross_worker_kinds")]
    pub cross_worker_kinds: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            route_retry_deadline_ms: default_route_retry_deadline_ms(),
            default_request_timeout_ms: default_request_timeout_ms(),
            relayed_retention_ms: default_relayed_retention_ms(),
            priority_overrides: HashMap::new(),
            cross_worker_kinds: default_cross_worker_kinds(),
        }
    }
}

impl RouterConfig {
    /// Retry window for not-ready destinations.
    #[must_use]
    pub fn route_retry_deadline(&self) -> Duration {
        Duration::from_millis(self.route_retry_deadline_ms)
    }

    /// Default request deadline.
    #[must_use]
    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }

    /// Retention of relayed worker requests.
    #[must_use]
    pub fn relayed_retention(&self) -> Duration {
        Duration::from_millis(self.relayed_retention_ms)
    }

    /// Priority override for worker-originated messages of `kind`.
    #[must_use]
    pub fn priority_override(&self, kind: MessageKind) -> Option<PriorityClass> {
        self.priority_overrides.get(kind.name()).copied()
    }

    /// Whether a worker may send `kind` straight to another worker.
    #[must_use]
    pub fn allows_cross_worker(&self, kind: MessageKind) -> bool {
        self.cross_worker_kinds.iter().any(|name| name == kind.name())
    }
}

fn default_pool_size() -> usize {
    4
}

fn default_violation_threshold() -> u32 {
    5
}

fn default_max_read_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_broker_queue_depth() -> usize {
    1024
}

/// Privilege broker settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BrokerConfig {
    /// Number of operations that may execute concurrently.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Denials after which the offending process is terminated.
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: u32,
    /// Upper bound for any single read, whatever the requester asks for.
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: u64,
    /// Depth of the broker's inbound queue.
    #[serde(default = "default_broker_queue_depth")]
    pub queue_depth: usize,
    /// Directory for JSONL audit files. Audit stays in memory when unset.
    #[serde(default)]
    pub audit_dir: Option<PathBuf>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            violation_threshold: default_violation_threshold(),
            max_read_bytes: default_max_read_bytes(),
            queue_depth: default_broker_queue_depth(),
            audit_dir: None,
        }
    }
}

fn default_restart_roles() -> Vec<String> {
    vec!["renderer".into()]
}

fn default_max_restarts() -> u32 {
    3
}

/// Auto-restart policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RestartConfig {
    /// Role labels restarted after a crash.
    #[serde(default = "default_restart_roles")]
    pub roles: Vec<String>,
    /// Maximum restarts along one chain of replacements.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            roles: default_restart_roles(),
            max_restarts: default_max_restarts(),
        }
    }
}

impl RestartConfig {
    /// Whether crashed processes of `role` are restarted.
    #[must_use]
    pub fn restarts(&self, role: &ProcessRole) -> bool {
        self.roles.iter().any(|label| label == role.label())
    }
}

fn default_drain_timeout_ms() -> u64 {
    2_000
}

fn default_startup_timeout_ms() -> u64 {
    10_000
}

fn default_terminated_retention_secs() -> u64 {
    60
}

fn default_prune_interval_secs() -> u64 {
    10
}

fn default_malformed_threshold() -> u32 {
    3
}

/// Process supervisor settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SupervisorConfig {
    /// Grace period between `Shutdown` and a forced kill.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Time a launched process has to complete its handshake.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// How long terminated records stay visible for diagnostics.
    #[serde(default = "default_terminated_retention_secs")]
    pub terminated_retention_secs: u64,
    /// Period of the record pruning task.
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
    /// Malformed frames after which a channel's process is terminated.
    #[serde(default = "default_malformed_threshold")]
    pub malformed_threshold: u32,
    /// Auto-restart policy.
    #[serde(default)]
    pub restart: RestartConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: default_drain_timeout_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            terminated_retention_secs: default_terminated_retention_secs(),
            prune_interval_secs: default_prune_interval_secs(),
            malformed_threshold: default_malformed_threshold(),
            restart: RestartConfig::default(),
        }
    }
}

impl SupervisorConfig {
    /// Drain grace period.
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Handshake window for launched processes.
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    /// Retention of terminated records.
    #[must_use]
    pub fn terminated_retention(&self) -> Duration {
        Duration::from_secs(self.terminated_retention_secs)
    }

    /// Pruning period.
    #[must_use]
    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

/// How to start the executable for one role.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LaunchConfig {
    /// Worker executable.
    pub program: PathBuf,
    /// Arguments passed before the bus-provided environment.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables inherited on top of the base allowlist.
    #[serde(default)]
    pub env_allowlist: Vec<String>,
}

/// A process spawned when the host starts.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StartupEntry {
    /// Role label (`renderer`, `network`, `gpu`, `utility`).
    pub role: String,
    /// Site key, required for renderers.
    #[serde(default)]
    pub site_key: Option<String>,
    /// Helper kind, required for utility processes.
    #[serde(default)]
    pub kind: Option<String>,
}

impl StartupEntry {
    /// Resolve the entry into a concrete role.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for unknown labels or missing role fields.
    pub fn to_role(&self) -> Result<ProcessRole> {
        match self.role.as_str() {
            "renderer" => {
                let site_key = self.site_key.clone().ok_or_else(|| {
                    AppError::Config("startup renderer requires site_key".into())
                })?;
                Ok(ProcessRole::Renderer { site_key })
            }
            "network" => Ok(ProcessRole::Network),
            "gpu" => Ok(ProcessRole::Gpu),
            "utility" => {
                let kind = self
                    .kind
                    .clone()
                    .ok_or_else(|| AppError::Config("startup utility requires kind".into()))?;
                Ok(ProcessRole::Utility { kind })
            }
            other => Err(AppError::Config(format!(
                "startup role '{other}' is not a worker role"
            ))),
        }
    }
}

const WORKER_ROLE_LABELS: &[&str] = &["renderer", "network", "gpu", "utility"];

/// Top-level configuration parsed from `privsep-bus.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BusConfig {
    /// Channel transport settings.
    #[serde(default)]
    pub transport: TransportConfig,
    /// Queue and dispatch settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Routing settings.
    #[serde(default)]
    pub router: RouterConfig,
    /// Broker settings.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Supervisor settings.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Executables per role label.
    #[serde(default)]
    pub launch: HashMap<String, LaunchConfig>,
    /// Processes spawned at startup.
    #[serde(default)]
    pub startup: Vec<StartupEntry>,
}

impl BusConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let scheduler = &self.scheduler;
        for class in PriorityClass::DESCENDING {
            if scheduler.class_cap(class) == 0 {
                return Err(AppError::Config(format!(
                    "scheduler.{class}_cap must be greater than zero"
                )));
            }
        }
        if scheduler.total_cap == 0 {
            return Err(AppError::Config(
                "scheduler.total_cap must be greater than zero".into(),
            ));
        }
        if scheduler.starvation_max_latency_ms == 0 || scheduler.sweep_interval_ms == 0 {
            return Err(AppError::Config(
                "scheduler latency and sweep interval must be greater than zero".into(),
            ));
        }
        for name in scheduler.ttl_overrides_ms.keys() {
            if MessageKind::from_name(name).is_none() {
                return Err(AppError::Config(format!(
                    "scheduler.ttl_overrides_ms: unknown message kind '{name}'"
                )));
            }
        }
        for name in self
            .router
            .priority_overrides
            .keys()
            .chain(self.router.cross_worker_kinds.iter())
        {
            if MessageKind::from_name(name).is_none() {
                return Err(AppError::Config(format!(
                    "router: unknown message kind '{name}'"
                )));
            }
        }

        if self.transport.max_frame_bytes == 0
            || self.transport.max_frame_bytes > self.transport.channel_buffer_bytes
        {
            return Err(AppError::Config(
                "transport.max_frame_bytes must be in 1..=channel_buffer_bytes".into(),
            ));
        }

        if self.broker.pool_size == 0 || self.broker.queue_depth == 0 {
            return Err(AppError::Config(
                "broker.pool_size and broker.queue_depth must be greater than zero".into(),
            ));
        }
        if self.broker.violation_threshold == 0 {
            return Err(AppError::Config(
                "broker.violation_threshold must be greater than zero".into(),
            ));
        }

        if self.supervisor.malformed_threshold == 0 {
            return Err(AppError::Config(
                "supervisor.malformed_threshold must be greater than zero".into(),
            ));
        }
        if self.supervisor.prune_interval_secs == 0 {
            return Err(AppError::Config(
                "supervisor.prune_interval_secs must be greater than zero".into(),
            ));
        }
        for label in self
            .supervisor
            .restart
            .roles
            .iter()
            .chain(self.launch.keys())
        {
            if !WORKER_ROLE_LABELS.contains(&label.as_str()) {
                return Err(AppError::Config(format!(
                    "'{label}' is not a worker role label"
                )));
            }
        }

        for entry in &self.startup {
            entry.to_role()?;
        }

        Ok(())
    }
}
