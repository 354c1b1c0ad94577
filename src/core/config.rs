//! Startup configuration - typed, validated, immutable for the process lifetime

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How to reach the container daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DockerEndpoint {
    /// Platform default (unix socket or named pipe)
    #[default]
    Local,
    /// Explicit unix socket path
    Socket(PathBuf),
}

/// Container runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DockerConfig {
    /// Daemon endpoint
    pub endpoint: DockerEndpoint,
    /// Image used when an instance does not override it
    pub default_image: String,
    /// Bridge network all instances are attached to
    pub network_name: String,
    /// Default memory limit in MB (0 = unlimited)
    pub default_memory_mb: u64,
    /// Default CPU limit in cores (0.0 = unlimited)
    pub default_cpu_cores: f64,
    /// Port the service listens on inside the container
    pub service_port: u16,
    /// Path the managed service persists its data under
    pub data_path: String,
    /// Environment every instance starts from; per-instance values are
    /// merged on top
    pub default_environment: BTreeMap<String, String>,
    /// Grace period for container stop, in seconds
    pub stop_timeout_secs: u32,
    /// Per-call deadline for runtime API operations, in seconds
    pub op_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            endpoint: DockerEndpoint::Local,
            default_image: "nginx:alpine".to_string(),
            network_name: "flotilla".to_string(),
            default_memory_mb: 512,
            default_cpu_cores: 0.5,
            service_port: 80,
            data_path: "/data".to_string(),
            default_environment: BTreeMap::new(),
            stop_timeout_secs: 10,
            op_timeout_secs: 30,
        }
    }
}

/// Inclusive host port range instances are bound from
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PortsConfig {
    pub start: u16,
    pub end: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            start: 5678,
            end: 5700,
        }
    }
}

/// Persistence settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DatabaseConfig {
    /// Database file location; platform data dir when unset
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    /// Resolve the database file path, using the platform data directory
    /// as the default location.
    pub fn resolve_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("flotilla")
                .join("flotilla.db")
        })
    }
}

/// Health monitor cadence and delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MonitorConfig {
    /// Seconds between polling cycles
    pub interval_secs: u64,
    /// Per-probe HTTP deadline in seconds
    pub probe_timeout_secs: u64,
    /// Path probed on each instance (joined to its host port)
    pub probe_path: String,
    /// Maximum probes in flight at once
    pub worker_limit: usize,
    /// Capacity of the outbound health-record channel
    pub channel_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            probe_timeout_secs: 2,
            probe_path: "/".to_string(),
            worker_limit: 8,
            channel_capacity: 256,
        }
    }
}

/// Top-level configuration, constructed once at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub docker: DockerConfig,
    pub ports: PortsConfig,
    pub database: DatabaseConfig,
    pub monitor: MonitorConfig,
}

impl Config {
    /// Load configuration from a JSON file. Unknown keys are rejected at
    /// load time rather than sanitized at use time.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Validation(format!("cannot read config {}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| Error::Validation(format!("invalid config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.ports.start > self.ports.end {
            return Err(Error::Validation(format!(
                "port range start {} exceeds end {}",
                self.ports.start, self.ports.end
            )));
        }
        if self.ports.start < 1024 {
            return Err(Error::Validation(format!(
                "port range must start at 1024 or above, got {}",
                self.ports.start
            )));
        }
        if self.docker.default_image.is_empty() {
            return Err(Error::Validation("default_image cannot be empty".into()));
        }
        if self.docker.default_cpu_cores < 0.0 {
            return Err(Error::Validation("default_cpu_cores cannot be negative".into()));
        }
        if self.monitor.interval_secs == 0 {
            return Err(Error::Validation("monitor interval must be at least 1s".into()));
        }
        if self.monitor.worker_limit == 0 {
            return Err(Error::Validation("monitor worker limit must be at least 1".into()));
        }
        if self.monitor.channel_capacity == 0 {
            return Err(Error::Validation("monitor channel capacity must be at least 1".into()));
        }
        Ok(())
    }
}
