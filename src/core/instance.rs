//! Instance management - Represents a single managed service instance

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::resource::ResourceLimits;
use crate::error::{Error, Result};

/// Unique identifier for an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub Uuid);

impl InstanceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Result<Self> {
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|_| Error::Validation(format!("invalid instance id: {raw}")))
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatus {
    /// Record inserted, container not yet created
    Pending,
    /// Container creation in flight
    Creating,
    /// Container created and started
    Running,
    /// Container stopped by request
    Stopped,
    /// Restart in flight
    Restarting,
    /// A start or restart failed
    Failed,
    /// Deletion in flight; safe to retry
    Deleting,
    /// Container and volumes confirmed removed
    Deleted,
}

impl InstanceStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Restarting => "restarting",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "pending" => Ok(Self::Pending),
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "restarting" => Ok(Self::Restarting),
            "failed" => Ok(Self::Failed),
            "deleting" => Ok(Self::Deleting),
            "deleted" => Ok(Self::Deleted),
            other => Err(Error::Unknown(format!("unrecognized instance status '{other}'"))),
        }
    }

    pub fn can_start(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    pub fn can_stop(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn can_restart(&self) -> bool {
        matches!(self, Self::Running | Self::Stopped | Self::Failed)
    }

    pub fn can_delete(&self) -> bool {
        matches!(self, Self::Running | Self::Stopped | Self::Failed | Self::Deleting)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A named volume mounted into an instance's container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Named volume on the host side
    pub source: String,
    /// Mount point inside the container
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeMount {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    /// Bind string in the runtime's `source:target[:ro]` form
    pub fn bind(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}

/// Desired configuration for an instance
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Image reference the container is created from
    pub image: String,
    /// Environment variables passed to the container
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Volume mounts; a per-instance data volume is provisioned when empty
    #[serde(default)]
    pub volumes: Vec<VolumeMount>,
    /// Resource limits for the container
    #[serde(default)]
    pub limits: ResourceLimits,
}

impl InstanceConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_volume(mut self, mount: VolumeMount) -> Self {
        self.volumes.push(mount);
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Durable record of a managed instance.
///
/// The persistence store owns these records; only the lifecycle engine
/// mutates them. A `Running` record always carries a container id and a
/// committed port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    /// Unique validated name
    pub name: String,
    pub config: InstanceConfig,
    pub status: InstanceStatus,
    /// Host port bound to the instance
    pub port: u16,
    /// Container handle once one exists
    pub container_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(name: impl Into<String>, config: InstanceConfig, port: u16) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::new(),
            name: name.into(),
            config,
            status: InstanceStatus::Pending,
            port,
            container_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Name of the per-instance data volume
    pub fn data_volume(&self) -> String {
        data_volume_name(&self.name)
    }
}

/// Per-instance data volume naming scheme
pub fn data_volume_name(instance_name: &str) -> String {
    format!("{instance_name}-data")
}

/// Names that cannot be used for instances (legacy device names that break
/// volume paths on some platforms)
const RESERVED_NAMES: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// Validate an instance name: 3-50 characters, letters, digits, hyphens,
/// and underscores only, excluding reserved names.
pub fn validate_name(name: &str) -> Result<()> {
    if name.len() < 3 {
        return Err(Error::Validation(
            "instance name must be at least 3 characters long".into(),
        ));
    }
    if name.len() > 50 {
        return Err(Error::Validation(
            "instance name cannot exceed 50 characters".into(),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::Validation(
            "instance name can only contain letters, numbers, hyphens, and underscores".into(),
        ));
    }
    if RESERVED_NAMES.contains(&name.to_ascii_lowercase().as_str()) {
        return Err(Error::Validation(format!(
            "'{name}' is a reserved name and cannot be used"
        )));
    }
    Ok(())
}
