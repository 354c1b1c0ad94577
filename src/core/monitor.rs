//! Health monitoring - Background polling of running instances

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, warn};

use super::config::MonitorConfig;
use super::instance::{Instance, InstanceId, InstanceStatus};
use super::resource::ResourceUsage;
use super::runtime::ContainerRuntime;
use crate::error::{Error, Result};
use crate::persistence::Database;

/// Observed liveness of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// Probe could not reach the service; it may still be starting
    Unknown,
}

impl HealthStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

/// One point-in-time observation, published on the monitor's channel
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub instance_id: InstanceId,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    /// Resource snapshot, absent when the stats query failed
    pub usage: Option<ResourceUsage>,
    pub detail: Option<String>,
}

/// Background poller producing health observations for every running
/// instance.
///
/// The monitor holds a read-only view: it reads committed records from the
/// store and never mutates lifecycle state. Results flow through a single
/// bounded broadcast channel; a slow consumer lags and loses the oldest
/// records rather than ever stalling the polling loop.
pub struct HealthMonitor {
    db: Arc<Database>,
    runtime: Arc<dyn ContainerRuntime>,
    http: reqwest::Client,
    config: MonitorConfig,
    tx: broadcast::Sender<HealthRecord>,
}

impl HealthMonitor {
    pub fn new(
        db: Arc<Database>,
        runtime: Arc<dyn ContainerRuntime>,
        config: MonitorConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.probe_timeout_secs))
            .build()
            .map_err(|e| Error::Unknown(format!("failed to build probe client: {e}")))?;
        let (tx, _) = broadcast::channel(config.channel_capacity);
        Ok(Self {
            db,
            runtime,
            http,
            config,
            tx,
        })
    }

    /// Subscribe to the delivery channel. Consumers must drain on their own
    /// schedule; delivery never blocks the poller.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthRecord> {
        self.tx.subscribe()
    }

    /// Start the polling loop on a background task.
    pub fn spawn(self) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(self.run(shutdown_rx));
        MonitorHandle {
            shutdown: shutdown_tx,
            handle,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.run_cycle().await,
            }
        }
        debug!("health monitor stopped");
    }

    /// One polling cycle. Probes run concurrently under a worker bound so
    /// a single slow or failing instance never delays the others.
    pub(crate) async fn run_cycle(&self) {
        let running = match self.db.list_by_status(InstanceStatus::Running) {
            Ok(list) => list,
            Err(e) => {
                warn!("health cycle skipped, cannot read instances: {e}");
                return;
            }
        };
        if running.is_empty() {
            return;
        }

        stream::iter(running)
            .for_each_concurrent(self.config.worker_limit, |record| async move {
                let observation = self.probe(&record).await;
                // Send only fails when nobody is subscribed.
                let _ = self.tx.send(observation);
            })
            .await;
    }

    async fn probe(&self, record: &Instance) -> HealthRecord {
        let url = format!(
            "http://127.0.0.1:{}{}",
            record.port, self.config.probe_path
        );
        let (status, detail) = match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => (HealthStatus::Healthy, None),
            Ok(response) => (
                HealthStatus::Unhealthy,
                Some(format!("probe returned HTTP {}", response.status().as_u16())),
            ),
            Err(e) if e.is_timeout() => {
                (HealthStatus::Unhealthy, Some("probe timed out".to_string()))
            }
            Err(e) if e.is_connect() => (
                HealthStatus::Unknown,
                Some("connection refused; service may still be starting".to_string()),
            ),
            Err(e) => (HealthStatus::Unknown, Some(e.to_string())),
        };

        let usage = match record.container_id.as_deref() {
            Some(container_id) => match self.runtime.stats(container_id).await {
                Ok(usage) => Some(usage),
                Err(e) => {
                    debug!("stats unavailable for '{}': {e}", record.name);
                    None
                }
            },
            None => None,
        };

        HealthRecord {
            instance_id: record.id,
            name: record.name.clone(),
            timestamp: Utc::now(),
            status,
            usage,
            detail,
        }
    }
}

/// Handle to a running monitor task.
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop scheduling new cycles and wait up to `wait` for in-flight
    /// probes to finish; the task is aborted if they do not.
    pub async fn shutdown(self, wait: Duration) {
        let _ = self.shutdown.send(true);
        let mut handle = self.handle;
        if timeout(wait, &mut handle).await.is_err() {
            warn!("health monitor did not stop within {wait:?}, aborting");
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::core::instance::InstanceConfig;
    use crate::core::resource::ResourceLimits;
    use crate::core::runtime::ContainerSpec;
    use crate::core::testsupport::MockRuntime;

    fn seeded_db(instances: &[(&str, u16, Option<&str>)]) -> Arc<Database> {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.initialize().unwrap();
        for (name, port, container) in instances {
            let record = Instance::new(*name, InstanceConfig::new("nginx:alpine"), *port);
            db.with_transaction(|tx| {
                Database::insert_instance(tx, &record)?;
                match container {
                    Some(container_id) => Database::attach_container(
                        tx,
                        record.id,
                        container_id,
                        InstanceStatus::Running,
                    ),
                    None => Database::update_status(tx, record.id, InstanceStatus::Running),
                }
            })
            .unwrap();
        }
        db
    }

    fn quick_config() -> MonitorConfig {
        MonitorConfig {
            interval_secs: 1,
            probe_timeout_secs: 1,
            ..Default::default()
        }
    }

    /// Minimal HTTP responder standing in for a healthy service.
    async fn serve_ok() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(
                            b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                        )
                        .await;
                });
            }
        });
        port
    }

    /// A port with nothing listening on it.
    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn probe_failure_for_one_instance_does_not_suppress_others() {
        let healthy_port = serve_ok().await;
        let dead_port = closed_port();

        let db = seeded_db(&[("alive", healthy_port, None), ("dead", dead_port, None)]);
        let runtime = Arc::new(MockRuntime::new());
        let monitor = HealthMonitor::new(db, runtime, quick_config()).unwrap();
        let mut rx = monitor.subscribe();

        monitor.run_cycle().await;

        let mut by_name = HashMap::new();
        for _ in 0..2 {
            let record = rx.recv().await.unwrap();
            by_name.insert(record.name.clone(), record);
        }
        assert_eq!(by_name["alive"].status, HealthStatus::Healthy);
        assert_ne!(by_name["dead"].status, HealthStatus::Healthy);
        assert!(by_name["dead"].detail.is_some());
    }

    #[tokio::test]
    async fn records_carry_stats_when_the_runtime_has_them() {
        let runtime = Arc::new(MockRuntime::new());
        let container_id = runtime
            .create_container(&ContainerSpec {
                name: "statful".to_string(),
                image: "nginx:alpine".to_string(),
                env: Vec::new(),
                binds: Vec::new(),
                host_port: closed_port(),
                container_port: 80,
                network: "flotilla".to_string(),
                limits: ResourceLimits::default(),
            })
            .await
            .unwrap();

        let db = seeded_db(&[("statful", closed_port(), Some(container_id.as_str()))]);
        let monitor = HealthMonitor::new(db, runtime.clone(), quick_config()).unwrap();
        let mut rx = monitor.subscribe();

        monitor.run_cycle().await;
        let record = rx.recv().await.unwrap();
        let usage = record.usage.expect("stats should be attached");
        assert!(usage.cpu_percent > 0.0);

        // A stats failure degrades to a record without usage, not a
        // missing record.
        runtime.fail_stats.store(true, Ordering::SeqCst);
        monitor.run_cycle().await;
        let record = rx.recv().await.unwrap();
        assert!(record.usage.is_none());
    }

    #[tokio::test]
    async fn cycle_with_no_running_instances_publishes_nothing() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.initialize().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let monitor = HealthMonitor::new(db, runtime, quick_config()).unwrap();
        let mut rx = monitor.subscribe();

        monitor.run_cycle().await;
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop_within_the_bound() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.initialize().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let monitor = HealthMonitor::new(db, runtime, quick_config()).unwrap();

        let handle = monitor.spawn();
        // Must return promptly rather than waiting for the next tick.
        tokio::time::timeout(Duration::from_secs(3), handle.shutdown(Duration::from_secs(2)))
            .await
            .expect("shutdown must complete within the bound");
    }
}
