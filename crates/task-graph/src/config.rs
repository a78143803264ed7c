//! Configuration for the scheduler and memory manager.

use serde::{Deserialize, Serialize};

/// Worker and cache settings for a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Threads executing CPU-bound tasks.
    pub cpu_workers: usize,

    /// Threads executing disk-reader tasks.
    pub disk_workers: usize,

    /// Memory budget of the shared cache in megabytes.
    pub memory_limit_mb: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            cpu_workers: cores.saturating_sub(1).max(1),
            disk_workers: 2,
            memory_limit_mb: 4096,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("JETCORE_CPU_WORKERS") {
            if let Ok(n) = val.parse() {
                config.cpu_workers = n;
            }
        }

        if let Ok(val) = std::env::var("JETCORE_DISK_WORKERS") {
            if let Ok(n) = val.parse() {
                config.disk_workers = n;
            }
        }

        if let Ok(val) = std::env::var("JETCORE_MEMORY_LIMIT_MB") {
            if let Ok(mb) = val.parse() {
                config.memory_limit_mb = mb;
            }
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.cpu_workers == 0 {
            return Err("cpu_workers must be > 0".to_string());
        }

        if self.disk_workers == 0 {
            return Err("disk_workers must be > 0".to_string());
        }

        if self.memory_limit_mb == 0 {
            return Err("memory_limit_mb must be > 0".to_string());
        }

        Ok(())
    }

    pub fn memory_limit_kb(&self) -> usize {
        self.memory_limit_mb * 1024
    }
}
