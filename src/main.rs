//! Flotilla daemon - boots the lifecycle engine and relays health records
//! to the log until interrupted.
//!
//! A control surface (GUI, CLI, or API server) attaches to the engine and
//! subscribes to the monitor channel; this binary is the thinnest possible
//! consumer of both.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flotilla::core::{Config, ContainerRuntime, DockerRuntime, Engine, HealthMonitor};
use flotilla::persistence::Database;

pub const APP_NAME: &str = "flotilla";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    info!("{} v{} starting...", APP_NAME, APP_VERSION);

    let config = match std::env::var_os("FLOTILLA_CONFIG") {
        Some(path) => Config::load(&PathBuf::from(path))?,
        None => Config::default(),
    };
    config.validate()?;

    let database = Database::open(&config.database.resolve_path())?;
    database.initialize()?;
    let database = Arc::new(database);

    let runtime = Arc::new(DockerRuntime::connect(&config.docker).await?);
    info!("container daemon v{}", runtime.version().await?);

    let engine = Arc::new(Engine::new(
        config.clone(),
        runtime.clone(),
        database.clone(),
    )?);
    info!(
        "lifecycle engine ready, managing {} instances on ports {}-{}",
        engine.list_instances()?.len(),
        config.ports.start,
        config.ports.end
    );

    let monitor = HealthMonitor::new(database, runtime, config.monitor.clone())?;
    let mut health = monitor.subscribe();
    let monitor = monitor.spawn();

    let relay = tokio::spawn(async move {
        loop {
            match health.recv().await {
                Ok(record) => info!(
                    instance = %record.name,
                    status = record.status.label(),
                    cpu = record.usage.as_ref().map(|u| u.cpu_percent),
                    "health observation"
                ),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("consumer lagged, {missed} health records dropped")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    monitor.shutdown(Duration::from_secs(5)).await;
    relay.abort();

    info!("{} stopped", APP_NAME);
    Ok(())
}

/// Initialize the logging system
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flotilla=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
