#![forbid(unsafe_code)]

//! `privsep-bus`: coordinator host binary.
//!
//! Loads configuration, binds the local socket workers connect back to,
//! starts the coordinator, spawns the configured startup processes, and
//! shuts everything down on Ctrl-C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use privsep_bus::audit::{AuditLogger, JsonlAuditWriter, MemoryAuditLog};
use privsep_bus::broker::HostProvider;
use privsep_bus::models::Message;
use privsep_bus::{AppError, BusConfig, Coordinator, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "privsep-bus", about = "Privilege-separated message bus coordinator", version, long_about = None)]
struct Cli {
    /// Bus configuration (TOML).
    #[arg(long)]
    config: PathBuf,

    /// Format of log lines written to stderr.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("privsep-bus bootstrap");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("privsep-bus")
        .build()
        .map_err(|err| AppError::Config(format!("tokio runtime: {err}")))?;
    runtime.block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = BusConfig::load_from_path(&args.config)?;
    info!(ipc_name = %config.transport.ipc_name, "configuration loaded");

    let audit: Arc<dyn AuditLogger> = match &config.broker.audit_dir {
        Some(dir) => Arc::new(JsonlAuditWriter::new(dir)?),
        None => {
            info!("no audit directory configured; keeping audit in memory");
            Arc::new(MemoryAuditLog::new())
        }
    };

    let cancel = CancellationToken::new();
    let launcher = Coordinator::local_launcher(&config, &cancel)?;
    let startup = config.startup.clone();
    let (coordinator, inbox) = Coordinator::start(
        config,
        Arc::new(launcher),
        audit,
        Arc::new(HostProvider::default()),
        cancel.clone(),
    );
    let inbox_task = tokio::spawn(drain_inbox(inbox, cancel.clone()));

    for entry in &startup {
        let role = entry.to_role()?;
        match coordinator.spawn(role.clone(), None).await {
            Ok(id) => info!(%id, %role, "startup process ready"),
            Err(err) => error!(%role, %err, "startup process failed to launch"),
        }
    }

    info!("coordinator ready");

    shutdown_signal().await;
    info!("shutdown signal received");

    coordinator.shutdown().await;
    cancel.cancel();
    if let Err(err) = inbox_task.await {
        debug!(%err, "inbox task ended abnormally");
    }
    info!("privsep-bus shut down");

    Ok(())
}

/// Log messages workers address to the coordinator.
async fn drain_inbox(mut inbox: mpsc::Receiver<Message>, cancel: CancellationToken) {
    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => break,
            next = inbox.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };
        debug!(
            sender = %message.sender(),
            kind = %message.kind(),
            sequence = message.sequence(),
            bytes = message.payload().len(),
            "coordinator inbox message"
        );
    }
}

/// Resolves on Ctrl-C, or on SIGTERM where the platform has it.
async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(%err, "SIGTERM handler unavailable; waiting for ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(%err, "ctrl-c handler failed");
            }
        }
        () = terminate => {}
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter.
fn init_tracing(log_format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,privsep_bus=info"));
    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);

    let installed = match log_format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|err| AppError::Config(format!("tracing subscriber: {err}")))
}
