//! Container runtime adapter - Facade over the container daemon API

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    RestartContainerOptions, Stats, StatsOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::{StreamExt, TryStreamExt};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{DockerConfig, DockerEndpoint};
use super::resource::{ResourceLimits, ResourceUsage};
use crate::error::{Error, Result};

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Image used for short-lived maintenance containers (volume copies)
const HELPER_IMAGE: &str = "alpine:latest";

/// Everything needed to realize one instance as a container
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `KEY=VALUE` pairs
    pub env: Vec<String>,
    /// `volume:target[:ro]` bind strings
    pub binds: Vec<String>,
    pub host_port: u16,
    pub container_port: u16,
    pub network: String,
    pub limits: ResourceLimits,
}

/// Observed container state from the runtime's point of view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub running: bool,
    pub state: String,
}

/// Uniform interface to the container runtime.
///
/// Implementations report typed errors upward and never perform
/// cross-component compensation; `remove_container` and `remove_volume`
/// treat "already removed" as success so deletion is retryable.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Liveness probe against the daemon
    async fn ping(&self) -> Result<()>;

    /// Daemon version string, for startup diagnostics
    async fn version(&self) -> Result<String>;

    /// Create a container; the caller owns cleanup of partial artifacts,
    /// since creation is not idempotent at the runtime level
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    async fn stop_container(&self, container_id: &str) -> Result<()>;

    async fn restart_container(&self, container_id: &str) -> Result<()>;

    /// Remove a container, tolerating one that is already gone
    async fn remove_container(&self, container_id: &str, remove_volumes: bool) -> Result<()>;

    /// Current container state, `None` when the container does not exist
    async fn container_status(&self, container_id: &str) -> Result<Option<ContainerStatus>>;

    /// One-shot resource usage snapshot
    async fn stats(&self, container_id: &str) -> Result<ResourceUsage>;

    /// Tail of the container log
    async fn logs(&self, container_id: &str, tail: usize) -> Result<String>;

    async fn ensure_network(&self, name: &str) -> Result<()>;

    async fn ensure_image(&self, image: &str) -> Result<()>;

    async fn ensure_volume(&self, name: &str) -> Result<()>;

    /// Remove a named volume, tolerating one that is already gone
    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Copy the contents of one named volume into another
    async fn copy_volume(&self, source: &str, target: &str) -> Result<()>;
}

/// Production adapter over the Docker Engine API.
pub struct DockerRuntime {
    docker: Docker,
    op_timeout: Duration,
    stop_timeout_secs: u32,
}

impl DockerRuntime {
    /// Connect to the daemon, retrying the liveness probe with exponential
    /// backoff before giving up.
    pub async fn connect(config: &DockerConfig) -> Result<Self> {
        let docker = match &config.endpoint {
            DockerEndpoint::Local => Docker::connect_with_local_defaults(),
            DockerEndpoint::Socket(path) => Docker::connect_with_socket(
                &path.to_string_lossy(),
                CONNECT_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            ),
        }
        .map_err(|e| Error::RuntimeUnavailable(e.to_string()))?;

        let runtime = Self {
            docker,
            op_timeout: Duration::from_secs(config.op_timeout_secs),
            stop_timeout_secs: config.stop_timeout_secs,
        };

        let mut delay = CONNECT_BASE_DELAY;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match runtime.ping().await {
                Ok(()) => {
                    info!("connected to container daemon (attempt {attempt})");
                    return Ok(runtime);
                }
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    warn!("daemon connection attempt {attempt} failed, retrying in {delay:?}: {e}");
                    sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    return Err(Error::RuntimeUnavailable(format!(
                        "daemon unreachable after {CONNECT_ATTEMPTS} attempts: {e}"
                    )));
                }
            }
        }
        unreachable!("connect loop always returns on the final attempt")
    }

    fn map_err(&self, err: BollardError) -> Error {
        match err {
            BollardError::DockerResponseServerError {
                status_code: 404,
                message,
            } => Error::NotFound(message),
            BollardError::DockerResponseServerError {
                status_code: 409,
                message,
            } => Error::Conflict(message),
            BollardError::DockerResponseServerError {
                status_code,
                message,
            } => Error::Unknown(format!("daemon returned {status_code}: {message}")),
            BollardError::RequestTimeoutError => Error::OperationTimeout(self.op_timeout),
            BollardError::IOError { err } => Error::RuntimeUnavailable(err.to_string()),
            BollardError::DockerContainerWaitError { error, code } => {
                Error::Unknown(format!("container exited with status {code}: {error}"))
            }
            other => Error::Unknown(other.to_string()),
        }
    }

    /// Apply the per-call deadline to a daemon request.
    async fn deadline<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, BollardError>>,
    {
        match timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(|e| self.map_err(e)),
            Err(_) => Err(Error::OperationTimeout(self.op_timeout)),
        }
    }
}

fn http_status(err: &BollardError) -> Option<u16> {
    match err {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.deadline(self.docker.ping()).await.map(|_| ())
    }

    async fn version(&self) -> Result<String> {
        let version = self.deadline(self.docker.version()).await?;
        Ok(version.version.unwrap_or_else(|| "unknown".to_string()))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let port_key = format!("{}/tcp", spec.container_port);

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let host_config = HostConfig {
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            port_bindings: Some(port_bindings),
            network_mode: Some(spec.network.clone()),
            memory: spec.limits.memory_bytes(),
            nano_cpus: spec.limits.nano_cpus(),
            pids_limit: (spec.limits.pids > 0).then(|| spec.limits.pids as i64),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .deadline(self.docker.create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            ))
            .await?;

        info!("created container {} for '{}'", created.id, spec.name);
        Ok(created.id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        match timeout(
            self.op_timeout,
            self.docker.start_container::<String>(container_id, None),
        )
        .await
        {
            Err(_) => Err(Error::OperationTimeout(self.op_timeout)),
            Ok(Ok(())) => Ok(()),
            // 304: already started
            Ok(Err(e)) if http_status(&e) == Some(304) => Ok(()),
            Ok(Err(e)) => Err(self.map_err(e)),
        }
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        let options = StopContainerOptions {
            t: self.stop_timeout_secs as i64,
        };
        match timeout(
            self.op_timeout,
            self.docker.stop_container(container_id, Some(options)),
        )
        .await
        {
            Err(_) => Err(Error::OperationTimeout(self.op_timeout)),
            Ok(Ok(())) => Ok(()),
            // 304: already stopped
            Ok(Err(e)) if http_status(&e) == Some(304) => Ok(()),
            Ok(Err(e)) => Err(self.map_err(e)),
        }
    }

    async fn restart_container(&self, container_id: &str) -> Result<()> {
        let options = RestartContainerOptions {
            t: self.stop_timeout_secs as isize,
        };
        self.deadline(self.docker.restart_container(container_id, Some(options)))
            .await
    }

    async fn remove_container(&self, container_id: &str, remove_volumes: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: remove_volumes,
            ..Default::default()
        };
        match self
            .deadline(self.docker.remove_container(container_id, Some(options)))
            .await
        {
            Ok(()) => Ok(()),
            Err(Error::NotFound(_)) => {
                debug!("container {container_id} already removed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn container_status(&self, container_id: &str) -> Result<Option<ContainerStatus>> {
        match self
            .deadline(
                self.docker
                    .inspect_container(container_id, None::<InspectContainerOptions>),
            )
            .await
        {
            Ok(details) => {
                let state = details.state.unwrap_or_default();
                Ok(Some(ContainerStatus {
                    running: state.running.unwrap_or(false),
                    state: state
                        .status
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                }))
            }
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn stats(&self, container_id: &str) -> Result<ResourceUsage> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut stream = self.docker.stats(container_id, Some(options));
        match timeout(self.op_timeout, stream.next()).await {
            Err(_) => Err(Error::OperationTimeout(self.op_timeout)),
            Ok(None) => Err(Error::Unknown(format!(
                "no stats returned for container {container_id}"
            ))),
            Ok(Some(result)) => {
                let stats = result.map_err(|e| self.map_err(e))?;
                Ok(parse_stats(&stats))
            }
        }
    }

    async fn logs(&self, container_id: &str, tail: usize) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let stream = self.docker.logs(container_id, Some(options));
        let chunks: Vec<_> = match timeout(self.op_timeout, stream.try_collect()).await {
            Err(_) => return Err(Error::OperationTimeout(self.op_timeout)),
            Ok(result) => result.map_err(|e| self.map_err(e))?,
        };

        let mut out = String::new();
        for chunk in chunks {
            out.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        Ok(out)
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        match self
            .deadline(
                self.docker
                    .inspect_network(name, None::<InspectNetworkOptions<String>>),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::NotFound(_)) => {
                let options = CreateNetworkOptions {
                    name: name.to_string(),
                    driver: "bridge".to_string(),
                    ..Default::default()
                };
                match self.deadline(self.docker.create_network(options)).await {
                    Ok(_) => {
                        info!("created network {name}");
                        Ok(())
                    }
                    // Lost the race with a concurrent creator
                    Err(Error::Conflict(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        match self.deadline(self.docker.inspect_image(image)).await {
            Ok(_) => {
                debug!("image {image} already available");
                Ok(())
            }
            Err(Error::NotFound(_)) => {
                info!("pulling image {image}");
                let options = CreateImageOptions::<String> {
                    from_image: image.to_string(),
                    ..Default::default()
                };
                // Pulls may legitimately exceed the per-call deadline, so
                // the stream is drained without one.
                let stream = self.docker.create_image(Some(options), None, None);
                let _progress: Vec<_> = stream
                    .try_collect()
                    .await
                    .map_err(|e| self.map_err(e))?;
                info!("pulled image {image}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn ensure_volume(&self, name: &str) -> Result<()> {
        match self.deadline(self.docker.inspect_volume(name)).await {
            Ok(_) => Ok(()),
            Err(Error::NotFound(_)) => {
                let options = CreateVolumeOptions {
                    name: name.to_string(),
                    ..Default::default()
                };
                self.deadline(self.docker.create_volume(options))
                    .await
                    .map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let options = RemoveVolumeOptions { force: true };
        match self
            .deadline(self.docker.remove_volume(name, Some(options)))
            .await
        {
            Ok(()) => Ok(()),
            Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn copy_volume(&self, source: &str, target: &str) -> Result<()> {
        self.ensure_image(HELPER_IMAGE).await?;
        self.ensure_volume(target).await?;

        let name = format!("volcopy-{}", Uuid::new_v4());
        let config = Config {
            image: Some(HELPER_IMAGE.to_string()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "cp -a /from/. /to/".to_string(),
            ]),
            host_config: Some(HostConfig {
                binds: Some(vec![
                    format!("{source}:/from:ro"),
                    format!("{target}:/to"),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .deadline(self.docker.create_container(
                Some(CreateContainerOptions {
                    name,
                    platform: None,
                }),
                config,
            ))
            .await?;

        self.start_container(&created.id).await?;

        let mut wait = self
            .docker
            .wait_container(&created.id, None::<WaitContainerOptions<String>>);
        let outcome = timeout(self.op_timeout, wait.next()).await;

        // Always clean the helper up, whatever the copy did.
        if let Err(e) = self.remove_container(&created.id, false).await {
            warn!("failed to remove volume-copy helper: {e}");
        }

        match outcome {
            Err(_) => Err(Error::OperationTimeout(self.op_timeout)),
            Ok(None) => Err(Error::Unknown(
                "volume copy wait ended without a result".to_string(),
            )),
            Ok(Some(Ok(response))) if response.status_code == 0 => {
                debug!("copied volume {source} into {target}");
                Ok(())
            }
            Ok(Some(Ok(response))) => Err(Error::Unknown(format!(
                "volume copy exited with status {}",
                response.status_code
            ))),
            Ok(Some(Err(e))) => Err(self.map_err(e)),
        }
    }
}

/// Reduce a raw stats sample to the usage snapshot.
///
/// Older daemons omit `online_cpus`; fall back to the per-CPU breakdown
/// length, and to a single CPU when neither is reported, rather than
/// failing the whole call.
fn parse_stats(stats: &Stats) -> ResourceUsage {
    let cpu = &stats.cpu_stats;
    let pre = &stats.precpu_stats;

    let mut cpu_percent = 0.0;
    let cpu_delta = cpu.cpu_usage.total_usage as f64 - pre.cpu_usage.total_usage as f64;
    let system_delta =
        cpu.system_cpu_usage.unwrap_or(0) as f64 - pre.system_cpu_usage.unwrap_or(0) as f64;
    if system_delta > 0.0 && cpu_delta >= 0.0 {
        let num_cpus = match cpu.online_cpus {
            Some(n) if n > 0 => n as f64,
            _ => cpu
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map(|per| per.len())
                .filter(|len| *len > 0)
                .unwrap_or(1) as f64,
        };
        cpu_percent = cpu_delta / system_delta * num_cpus * 100.0;
    }

    let memory_bytes = stats.memory_stats.usage.unwrap_or(0);
    let memory_limit_bytes = stats.memory_stats.limit.unwrap_or(0);
    let memory_percent = if memory_limit_bytes > 0 {
        memory_bytes as f64 / memory_limit_bytes as f64 * 100.0
    } else {
        0.0
    };

    let (network_rx_bytes, network_tx_bytes) = stats
        .networks
        .as_ref()
        .map(|nets| {
            nets.values()
                .fold((0, 0), |(rx, tx), net| (rx + net.rx_bytes, tx + net.tx_bytes))
        })
        .unwrap_or((0, 0));

    let (block_read_bytes, block_write_bytes) = stats
        .blkio_stats
        .io_service_bytes_recursive
        .as_ref()
        .map(|entries| {
            entries.iter().fold((0, 0), |(read, write), entry| {
                if entry.op.eq_ignore_ascii_case("read") {
                    (read + entry.value, write)
                } else if entry.op.eq_ignore_ascii_case("write") {
                    (read, write + entry.value)
                } else {
                    (read, write)
                }
            })
        })
        .unwrap_or((0, 0));

    ResourceUsage {
        cpu_percent,
        memory_bytes,
        memory_limit_bytes,
        memory_percent,
        network_rx_bytes,
        network_tx_bytes,
        block_read_bytes,
        block_write_bytes,
        pids: stats.pids_stats.current.unwrap_or(0),
    }
}
