//! Lifecycle engine - Orchestrates instance operations across the runtime,
//! the port allocator, and the persistence store

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use super::config::Config;
use super::instance::{
    self, Instance, InstanceConfig, InstanceId, InstanceStatus, VolumeMount,
};
use super::ports::PortAllocator;
use super::resource::{ResourceLimits, ResourceUsage};
use super::runtime::{ContainerRuntime, ContainerSpec};
use crate::error::{Error, Result};
use crate::persistence::{Database, LifecycleEvent};

/// Per-field overrides applied on top of the configured defaults when
/// creating an instance.
#[derive(Debug, Clone, Default)]
pub struct CreateOverrides {
    pub image: Option<String>,
    /// Merged over the default environment
    pub environment: Option<BTreeMap<String, String>>,
    pub volumes: Option<Vec<VolumeMount>>,
    pub limits: Option<ResourceLimits>,
}

/// Result of a clone: always a usable instance, with a warning attached
/// when the data copy was skipped or failed.
#[derive(Debug)]
pub struct CloneOutcome {
    pub instance: Instance,
    pub warning: Option<String>,
}

/// The sole writer of instance lifecycle transitions.
///
/// Multi-step operations are made atomic by treating the store as the
/// source of truth for "should exist": a provisional record is committed
/// first, the runtime side is realized, and any failure rolls the record
/// back and compensates (port release, best-effort container removal).
/// Operations on the same instance are serialized through a per-instance
/// lock; operations on different instances proceed in parallel.
pub struct Engine {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    db: Arc<Database>,
    ports: PortAllocator,
    op_locks: Mutex<HashMap<InstanceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Engine {
    /// Build the engine, re-adopting ports held by persisted records so a
    /// restart cannot double-allocate them.
    pub fn new(config: Config, runtime: Arc<dyn ContainerRuntime>, db: Arc<Database>) -> Result<Self> {
        config.validate()?;
        let ports = PortAllocator::new(config.ports.start, config.ports.end);
        for existing in db.list_instances()? {
            if existing.status != InstanceStatus::Deleted {
                ports.adopt(existing.port);
            }
        }
        Ok(Self {
            config,
            runtime,
            db,
            ports,
            op_locks: Mutex::new(HashMap::new()),
        })
    }

    fn op_lock(&self, id: InstanceId) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .op_locks
            .lock()
            .map_err(|e| Error::Unknown(format!("op lock map poisoned: {e}")))?;
        Ok(Arc::clone(locks.entry(id).or_default()))
    }

    fn require_instance(&self, id: InstanceId) -> Result<Instance> {
        self.db
            .get_instance(id)?
            .ok_or_else(|| Error::NotFound(format!("instance {id}")))
    }

    /// Commit a status transition and its audit event atomically.
    fn transition(
        &self,
        id: InstanceId,
        from: InstanceStatus,
        to: InstanceStatus,
        outcome: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        self.db.with_transaction(|tx| {
            Database::update_status(tx, id, to)?;
            Database::record_event(tx, id, Some(from), to, outcome, detail)
        })
    }

    fn build_instance_config(&self, overrides: CreateOverrides) -> InstanceConfig {
        let docker = &self.config.docker;
        let mut environment = docker.default_environment.clone();
        if let Some(extra) = overrides.environment {
            environment.extend(extra);
        }
        InstanceConfig {
            image: overrides
                .image
                .unwrap_or_else(|| docker.default_image.clone()),
            environment,
            volumes: overrides.volumes.unwrap_or_default(),
            limits: overrides.limits.unwrap_or_else(|| {
                ResourceLimits::default()
                    .with_memory_limit(docker.default_memory_mb)
                    .with_cpu_limit(docker.default_cpu_cores)
            }),
        }
    }

    /// An empty volume list means "give the instance its own data volume",
    /// resolved here rather than persisted so clones derive their own.
    fn container_spec(&self, record: &Instance) -> ContainerSpec {
        let docker = &self.config.docker;
        let binds = if record.config.volumes.is_empty() {
            vec![format!("{}:{}", record.data_volume(), docker.data_path)]
        } else {
            record.config.volumes.iter().map(VolumeMount::bind).collect()
        };
        ContainerSpec {
            name: record.name.clone(),
            image: record.config.image.clone(),
            env: record
                .config
                .environment
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect(),
            binds,
            host_port: record.port,
            container_port: docker.service_port,
            network: docker.network_name.clone(),
            limits: record.config.limits.clone(),
        }
    }

    /// Create a new instance and start it.
    ///
    /// The creation path either leaves a committed `Running` record with a
    /// bound port and container, or nothing at all: on any failure the
    /// provisional record is rolled back, the reserved port returns to the
    /// pool, and partial container artifacts are removed best-effort.
    pub async fn create_instance(&self, name: &str, overrides: CreateOverrides) -> Result<Instance> {
        instance::validate_name(name)?;
        if self.db.get_instance_by_name(name)?.is_some() {
            return Err(Error::DuplicateName(name.to_string()));
        }

        let reservation = self.ports.reserve()?;
        let config = self.build_instance_config(overrides);
        let mut record = Instance::new(name, config, reservation.port());

        // Provisional record: reserves the name, visible only as pending.
        self.db.with_transaction(|tx| {
            Database::insert_instance(tx, &record)?;
            Database::record_event(tx, record.id, None, InstanceStatus::Pending, "ok", None)
        })?;

        match self.realize_instance(&record).await {
            Ok(container_id) => {
                let port = reservation.commit();
                record.status = InstanceStatus::Running;
                record.container_id = Some(container_id);
                info!("created instance '{name}' ({}) on port {port}", record.id);
                Ok(record)
            }
            Err(e) => {
                error!("creation of '{name}' failed, rolling back: {e}");
                self.rollback_creation(&record).await;
                // The uncommitted reservation releases the port on drop.
                Err(e)
            }
        }
    }

    /// The runtime-facing half of creation: provision prerequisites,
    /// create and start the container, then commit the running state.
    async fn realize_instance(&self, record: &Instance) -> Result<String> {
        self.db.with_transaction(|tx| {
            Database::update_status(tx, record.id, InstanceStatus::Creating)?;
            Database::record_event(
                tx,
                record.id,
                Some(InstanceStatus::Pending),
                InstanceStatus::Creating,
                "ok",
                None,
            )
        })?;

        let docker = &self.config.docker;
        self.runtime.ensure_network(&docker.network_name).await?;
        self.runtime.ensure_image(&record.config.image).await?;
        if record.config.volumes.is_empty() {
            self.runtime.ensure_volume(&record.data_volume()).await?;
        }

        let spec = self.container_spec(record);
        let container_id = self.runtime.create_container(&spec).await?;
        self.runtime.start_container(&container_id).await?;

        self.db.with_transaction(|tx| {
            Database::attach_container(tx, record.id, &container_id, InstanceStatus::Running)?;
            Database::record_event(
                tx,
                record.id,
                Some(InstanceStatus::Creating),
                InstanceStatus::Running,
                "ok",
                None,
            )
        })?;

        Ok(container_id)
    }

    /// Compensation for a failed creation. Container creation is not
    /// idempotent, so partial artifacts are removed by name before the
    /// provisional record is rolled back.
    async fn rollback_creation(&self, record: &Instance) {
        if let Err(e) = self.runtime.remove_container(&record.name, true).await {
            warn!("could not remove partial container for '{}': {e}", record.name);
        }
        if record.config.volumes.is_empty() {
            if let Err(e) = self.runtime.remove_volume(&record.data_volume()).await {
                warn!("could not remove data volume for '{}': {e}", record.name);
            }
        }
        let rolled_back = self.db.with_transaction(|tx| {
            Database::delete_record(tx, record.id)?;
            Database::record_event(
                tx,
                record.id,
                Some(InstanceStatus::Creating),
                InstanceStatus::Deleted,
                "rolled_back",
                None,
            )
        });
        if let Err(e) = rolled_back {
            error!("failed to roll back record for '{}': {e}", record.name);
        }
    }

    /// Start a stopped (or failed) instance.
    pub async fn start_instance(&self, id: InstanceId) -> Result<()> {
        let lock = self.op_lock(id)?;
        let _guard = lock.lock().await;

        let record = self.require_instance(id)?;
        if record.status == InstanceStatus::Running {
            return Ok(());
        }
        if !record.status.can_start() {
            return Err(Error::Conflict(format!(
                "instance '{}' cannot start while {}",
                record.name, record.status
            )));
        }
        let container_id = record.container_id.as_deref().ok_or_else(|| {
            Error::Conflict(format!("instance '{}' has no container", record.name))
        })?;

        match self.runtime.start_container(container_id).await {
            Ok(()) => {
                self.transition(id, record.status, InstanceStatus::Running, "ok", None)?;
                info!("started instance '{}'", record.name);
                Ok(())
            }
            Err(e) => {
                let detail = e.to_string();
                if let Err(te) =
                    self.transition(id, record.status, InstanceStatus::Failed, "error", Some(&detail))
                {
                    error!("could not record failed start of '{}': {te}", record.name);
                }
                Err(e)
            }
        }
    }

    /// Stop a running instance. Stopping an already stopped instance is a
    /// no-op.
    pub async fn stop_instance(&self, id: InstanceId) -> Result<()> {
        let lock = self.op_lock(id)?;
        let _guard = lock.lock().await;

        let record = self.require_instance(id)?;
        if record.status == InstanceStatus::Stopped {
            return Ok(());
        }
        if !record.status.can_stop() {
            return Err(Error::Conflict(format!(
                "instance '{}' cannot stop while {}",
                record.name, record.status
            )));
        }
        let container_id = record.container_id.as_deref().ok_or_else(|| {
            Error::Conflict(format!("instance '{}' has no container", record.name))
        })?;

        self.runtime.stop_container(container_id).await?;
        self.transition(id, record.status, InstanceStatus::Stopped, "ok", None)?;
        info!("stopped instance '{}'", record.name);
        Ok(())
    }

    /// Restart an instance, passing through the transitional state so a
    /// concurrent reader never observes a silent stop/start.
    pub async fn restart_instance(&self, id: InstanceId) -> Result<()> {
        let lock = self.op_lock(id)?;
        let _guard = lock.lock().await;

        let record = self.require_instance(id)?;
        if !record.status.can_restart() {
            return Err(Error::Conflict(format!(
                "instance '{}' cannot restart while {}",
                record.name, record.status
            )));
        }
        let container_id = record
            .container_id
            .clone()
            .ok_or_else(|| Error::Conflict(format!("instance '{}' has no container", record.name)))?;

        self.transition(id, record.status, InstanceStatus::Restarting, "ok", None)?;

        match self.runtime.restart_container(&container_id).await {
            Ok(()) => {
                self.transition(id, InstanceStatus::Restarting, InstanceStatus::Running, "ok", None)?;
                info!("restarted instance '{}'", record.name);
                Ok(())
            }
            Err(e) => {
                let detail = e.to_string();
                if let Err(te) = self.transition(
                    id,
                    InstanceStatus::Restarting,
                    InstanceStatus::Failed,
                    "error",
                    Some(&detail),
                ) {
                    error!("could not record failed restart of '{}': {te}", record.name);
                }
                Err(e)
            }
        }
    }

    /// Delete an instance, its container, and optionally its data volume.
    ///
    /// Container removal tolerates "already removed", and a failure leaves
    /// the record in `Deleting` so the call is safe to retry. The record
    /// is removed only after the runtime side is confirmed gone.
    pub async fn delete_instance(&self, id: InstanceId, remove_data: bool) -> Result<()> {
        let lock = self.op_lock(id)?;
        let _guard = lock.lock().await;

        let record = self.require_instance(id)?;
        if !record.status.can_delete() {
            return Err(Error::Conflict(format!(
                "instance '{}' cannot be deleted while {}",
                record.name, record.status
            )));
        }

        if record.status != InstanceStatus::Deleting {
            self.transition(id, record.status, InstanceStatus::Deleting, "ok", None)?;
        }

        if let Some(container_id) = record.container_id.as_deref() {
            self.runtime.remove_container(container_id, remove_data).await?;
        }
        if remove_data && record.config.volumes.is_empty() {
            self.runtime.remove_volume(&record.data_volume()).await?;
        }

        self.db.with_transaction(|tx| {
            Database::delete_record(tx, id)?;
            Database::record_event(
                tx,
                id,
                Some(InstanceStatus::Deleting),
                InstanceStatus::Deleted,
                "ok",
                None,
            )
        })?;
        self.ports.release(record.port);

        if let Ok(mut locks) = self.op_locks.lock() {
            locks.remove(&id);
        }
        info!("deleted instance '{}' (data removed: {remove_data})", record.name);
        Ok(())
    }

    /// Clone an instance's committed configuration under a new name, with
    /// an optional copy of its data volume.
    ///
    /// The data copy is a side operation outside the creation
    /// transaction: its failure degrades the result to a
    /// configuration-only clone with a warning, never an error.
    pub async fn clone_instance(
        &self,
        source_id: InstanceId,
        new_name: &str,
        copy_data: bool,
    ) -> Result<CloneOutcome> {
        let source = self.require_instance(source_id)?;

        let overrides = CreateOverrides {
            image: Some(source.config.image.clone()),
            environment: Some(source.config.environment.clone()),
            volumes: (!source.config.volumes.is_empty()).then(|| source.config.volumes.clone()),
            limits: Some(source.config.limits.clone()),
        };
        let instance = self.create_instance(new_name, overrides).await?;

        let mut warning = None;
        if copy_data {
            if source.config.volumes.is_empty() {
                if let Err(e) = self
                    .runtime
                    .copy_volume(&source.data_volume(), &instance.data_volume())
                    .await
                {
                    warn!("data copy from '{}' to '{new_name}' failed: {e}", source.name);
                    warning = Some(format!(
                        "configuration cloned, but copying data from '{}' failed: {e}",
                        source.name
                    ));
                }
            } else {
                warning = Some(
                    "data copy skipped: source uses explicit volume mounts".to_string(),
                );
            }
        }

        info!("cloned instance '{}' to '{new_name}'", source.name);
        Ok(CloneOutcome { instance, warning })
    }

    /// Fetch one instance's committed record.
    pub fn get_instance(&self, id: InstanceId) -> Result<Instance> {
        self.require_instance(id)
    }

    /// Align a running record with the container state the runtime
    /// actually observes. The store stays authoritative for "should
    /// exist"; this only downgrades a record whose container stopped or
    /// vanished behind our back.
    pub async fn refresh_instance(&self, id: InstanceId) -> Result<Instance> {
        let lock = self.op_lock(id)?;
        let _guard = lock.lock().await;

        let record = self.require_instance(id)?;
        if record.status != InstanceStatus::Running {
            return Ok(record);
        }
        let Some(container_id) = record.container_id.as_deref() else {
            return Ok(record);
        };

        match self.runtime.container_status(container_id).await? {
            Some(observed) if observed.running => Ok(record),
            Some(observed) => {
                let detail = format!("container observed {}", observed.state);
                self.transition(
                    id,
                    InstanceStatus::Running,
                    InstanceStatus::Stopped,
                    "observed",
                    Some(&detail),
                )?;
                self.require_instance(id)
            }
            None => {
                self.transition(
                    id,
                    InstanceStatus::Running,
                    InstanceStatus::Failed,
                    "observed",
                    Some("container is gone"),
                )?;
                self.require_instance(id)
            }
        }
    }

    /// Fetch an instance by name, if any.
    pub fn get_instance_by_name(&self, name: &str) -> Result<Option<Instance>> {
        self.db.get_instance_by_name(name)
    }

    /// All committed instance records.
    pub fn list_instances(&self) -> Result<Vec<Instance>> {
        self.db.list_instances()
    }

    /// Tail of an instance's container log.
    pub async fn instance_logs(&self, id: InstanceId, tail: usize) -> Result<String> {
        let record = self.require_instance(id)?;
        let container_id = record.container_id.as_deref().ok_or_else(|| {
            Error::Conflict(format!("instance '{}' has no container", record.name))
        })?;
        self.runtime.logs(container_id, tail).await
    }

    /// On-demand resource snapshot for one instance.
    pub async fn instance_stats(&self, id: InstanceId) -> Result<ResourceUsage> {
        let record = self.require_instance(id)?;
        let container_id = record.container_id.as_deref().ok_or_else(|| {
            Error::Conflict(format!("instance '{}' has no container", record.name))
        })?;
        self.runtime.stats(container_id).await
    }

    /// Audit trail, newest first, optionally filtered to one instance.
    pub fn events(&self, instance: Option<InstanceId>, limit: usize) -> Result<Vec<LifecycleEvent>> {
        self.db.events(instance, limit)
    }

    /// Age out old audit entries.
    pub fn prune_events(&self, retention_days: u32) -> Result<usize> {
        self.db.prune_events(retention_days)
    }
}
