//! In-memory container runtime for tests; nothing here touches a daemon.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::resource::ResourceUsage;
use super::runtime::{ContainerRuntime, ContainerSpec, ContainerStatus};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub host_port: u16,
    pub running: bool,
}

/// Scriptable fake runtime. Failure flags make one class of operation
/// fail until cleared, which is how tests exercise the engine's rollback
/// and retry paths.
#[derive(Default)]
pub struct MockRuntime {
    containers: Mutex<HashMap<String, MockContainer>>,
    volumes: Mutex<HashSet<String>>,
    networks: Mutex<HashSet<String>>,
    images: Mutex<HashSet<String>>,
    removed: Mutex<Vec<String>>,
    copied: Mutex<Vec<(String, String)>>,
    next_id: Mutex<u64>,

    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub fail_restart: AtomicBool,
    pub fail_remove: AtomicBool,
    pub fail_copy: AtomicBool,
    pub fail_stats: AtomicBool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn failing(flag: &AtomicBool, what: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(Error::Unknown(format!("injected {what} failure")))
        } else {
            Ok(())
        }
    }

    fn resolve(&self, key: &str) -> Option<String> {
        let containers = self.containers.lock().unwrap();
        if containers.contains_key(key) {
            return Some(key.to_string());
        }
        containers
            .values()
            .find(|c| c.name == key)
            .map(|c| c.id.clone())
    }

    pub fn container(&self, key: &str) -> Option<MockContainer> {
        let id = self.resolve(key)?;
        self.containers.lock().unwrap().get(&id).cloned()
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.volumes.lock().unwrap().contains(name)
    }

    pub fn removed_containers(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn copied_volumes(&self) -> Vec<(String, String)> {
        self.copied.lock().unwrap().clone()
    }

    /// Drop a container behind the engine's back, as an external actor
    /// would.
    pub fn remove_externally(&self, key: &str) {
        if let Some(id) = self.resolve(key) {
            self.containers.lock().unwrap().remove(&id);
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn version(&self) -> Result<String> {
        Ok("mock-1.0".to_string())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        Self::failing(&self.fail_create, "create")?;
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        let id = format!("mock-{:08x}", *next);
        drop(next);
        self.containers.lock().unwrap().insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                host_port: spec.host_port,
                running: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        Self::failing(&self.fail_start, "start")?;
        let id = self
            .resolve(container_id)
            .ok_or_else(|| Error::NotFound(format!("container {container_id}")))?;
        if let Some(container) = self.containers.lock().unwrap().get_mut(&id) {
            container.running = true;
        }
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        Self::failing(&self.fail_stop, "stop")?;
        let id = self
            .resolve(container_id)
            .ok_or_else(|| Error::NotFound(format!("container {container_id}")))?;
        if let Some(container) = self.containers.lock().unwrap().get_mut(&id) {
            container.running = false;
        }
        Ok(())
    }

    async fn restart_container(&self, container_id: &str) -> Result<()> {
        Self::failing(&self.fail_restart, "restart")?;
        let id = self
            .resolve(container_id)
            .ok_or_else(|| Error::NotFound(format!("container {container_id}")))?;
        if let Some(container) = self.containers.lock().unwrap().get_mut(&id) {
            container.running = true;
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, _remove_volumes: bool) -> Result<()> {
        Self::failing(&self.fail_remove, "remove")?;
        // Idempotent: removing a container that is already gone succeeds.
        if let Some(id) = self.resolve(container_id) {
            self.containers.lock().unwrap().remove(&id);
        }
        self.removed.lock().unwrap().push(container_id.to_string());
        Ok(())
    }

    async fn container_status(&self, container_id: &str) -> Result<Option<ContainerStatus>> {
        Ok(self.container(container_id).map(|c| ContainerStatus {
            running: c.running,
            state: if c.running { "running" } else { "exited" }.to_string(),
        }))
    }

    async fn stats(&self, container_id: &str) -> Result<ResourceUsage> {
        Self::failing(&self.fail_stats, "stats")?;
        if self.resolve(container_id).is_none() {
            return Err(Error::NotFound(format!("container {container_id}")));
        }
        Ok(ResourceUsage {
            cpu_percent: 1.5,
            memory_bytes: 64 * 1024 * 1024,
            memory_limit_bytes: 512 * 1024 * 1024,
            memory_percent: 12.5,
            pids: 3,
            ..Default::default()
        })
    }

    async fn logs(&self, container_id: &str, tail: usize) -> Result<String> {
        if self.resolve(container_id).is_none() {
            return Err(Error::NotFound(format!("container {container_id}")));
        }
        Ok(format!("last {tail} lines\n"))
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        self.networks.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        self.images.lock().unwrap().insert(image.to_string());
        Ok(())
    }

    async fn ensure_volume(&self, name: &str) -> Result<()> {
        self.volumes.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.volumes.lock().unwrap().remove(name);
        Ok(())
    }

    async fn copy_volume(&self, source: &str, target: &str) -> Result<()> {
        Self::failing(&self.fail_copy, "copy")?;
        self.copied
            .lock()
            .unwrap()
            .push((source.to_string(), target.to_string()));
        Ok(())
    }
}
