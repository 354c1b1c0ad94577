//! Resource management - Limits and usage snapshots

use serde::{Deserialize, Serialize};

/// Resource limits applied to an instance's container
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum memory in MB (0 = unlimited)
    #[serde(default)]
    pub memory_mb: u64,
    /// Maximum CPU in cores, fractional allowed (0.0 = unlimited)
    #[serde(default)]
    pub cpu_cores: f64,
    /// Maximum number of processes (0 = unlimited)
    #[serde(default)]
    pub pids: u32,
}

impl ResourceLimits {
    /// Create limits with a memory cap
    pub fn with_memory_limit(mut self, mb: u64) -> Self {
        self.memory_mb = mb;
        self
    }

    /// Create limits with a CPU cap
    pub fn with_cpu_limit(mut self, cores: f64) -> Self {
        self.cpu_cores = cores.max(0.0);
        self
    }

    /// Check if any limits are set
    pub fn has_limits(&self) -> bool {
        self.memory_mb > 0 || self.cpu_cores > 0.0 || self.pids > 0
    }

    /// Memory limit in bytes for the container host config
    pub fn memory_bytes(&self) -> Option<i64> {
        (self.memory_mb > 0).then(|| self.memory_mb as i64 * 1024 * 1024)
    }

    /// CPU limit in nanocpus for the container host config
    pub fn nano_cpus(&self) -> Option<i64> {
        (self.cpu_cores > 0.0).then(|| (self.cpu_cores * 1_000_000_000.0) as i64)
    }
}

/// Point-in-time resource usage observed for a running container
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU usage percentage (may exceed 100 on multi-core)
    pub cpu_percent: f64,
    /// Memory usage in bytes
    pub memory_bytes: u64,
    /// Memory limit in bytes (0 when unlimited)
    pub memory_limit_bytes: u64,
    /// Memory usage as a percentage of the limit
    pub memory_percent: f64,
    /// Network bytes received since start
    pub network_rx_bytes: u64,
    /// Network bytes transmitted since start
    pub network_tx_bytes: u64,
    /// Block device bytes read since start
    pub block_read_bytes: u64,
    /// Block device bytes written since start
    pub block_write_bytes: u64,
    /// Number of processes in the container
    pub pids: u64,
}

impl ResourceUsage {
    pub fn cpu_string(&self) -> String {
        format!("{:.1}%", self.cpu_percent)
    }

    pub fn memory_string(&self) -> String {
        format_bytes(self.memory_bytes)
    }
}

/// Format bytes as a human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_conversions() {
        let limits = ResourceLimits::default()
            .with_memory_limit(512)
            .with_cpu_limit(0.5);
        assert!(limits.has_limits());
        assert_eq!(limits.memory_bytes(), Some(512 * 1024 * 1024));
        assert_eq!(limits.nano_cpus(), Some(500_000_000));
    }

    #[test]
    fn unlimited_maps_to_none() {
        let limits = ResourceLimits::default();
        assert!(!limits.has_limits());
        assert_eq!(limits.memory_bytes(), None);
        assert_eq!(limits.nano_cpus(), None);
    }

    #[test]
    fn bytes_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");

        let usage = ResourceUsage {
            cpu_percent: 12.34,
            memory_bytes: 2048,
            ..Default::default()
        };
        assert_eq!(usage.cpu_string(), "12.3%");
        assert_eq!(usage.memory_string(), "2.00 KB");
    }
}
