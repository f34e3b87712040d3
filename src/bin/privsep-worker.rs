#![forbid(unsafe_code)]

//! `privsep-worker`: minimal worker executable.
//!
//! Connects back to the coordinator with the variables the launcher sets,
//! answers liveness pings, logs whatever else arrives, and exits cleanly on
//! `Shutdown`. Useful as a launch target while wiring real workers.

use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use privsep_bus::config::TransportConfig;
use privsep_bus::models::MessageKind;
use privsep_bus::transport::ChannelLimits;
use privsep_bus::{AppError, Result, Worker};

fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?;

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run())
}

async fn run() -> Result<()> {
    let limits = ChannelLimits::from(&TransportConfig::default());
    let mut worker = Worker::from_env(limits).await?;
    info!(id = %worker.id(), role = %worker.role(), "worker started");

    while let Some(message) = worker.recv().await {
        if message.kind() == MessageKind::Shutdown {
            info!(reason = %String::from_utf8_lossy(message.payload()), "shutdown requested");
            break;
        }
        debug!(
            sender = %message.sender(),
            kind = %message.kind(),
            sequence = message.sequence(),
            "message received"
        );
    }

    worker.close();
    info!("worker stopped");
    Ok(())
}
