//! Core module - Lifecycle engine, runtime adapter, ports, and health monitoring

pub mod config;
mod engine;
mod instance;
mod monitor;
mod ports;
pub mod resource;
mod runtime;
#[cfg(test)]
pub(crate) mod testsupport;

pub use config::{Config, DockerConfig, DockerEndpoint, MonitorConfig, PortsConfig};
pub use engine::{CloneOutcome, CreateOverrides, Engine};
pub use instance::{
    validate_name, Instance, InstanceConfig, InstanceId, InstanceStatus, VolumeMount,
};
pub use monitor::{HealthMonitor, HealthRecord, HealthStatus, MonitorHandle};
pub use ports::{PortAllocator, PortReservation};
pub use resource::{ResourceLimits, ResourceUsage};
pub use runtime::{ContainerRuntime, ContainerSpec, ContainerStatus, DockerRuntime};
