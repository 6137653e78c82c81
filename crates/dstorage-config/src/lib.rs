//! Configuration management for dstorage
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (DSTORAGE__* prefix, highest precedence)
//! 2. dstorage.local.toml (gitignored, local overrides)
//! 3. dstorage.toml (git-tracked, project config)
//! 4. ~/.config/dstorage/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Largest submission queue the kernel accepts without clamping.
pub const MAX_RING_ENTRIES: u32 = 32_768;

/// Main dstorage configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DstorageConfig {
    pub backend: BackendConfig,
    pub cpu: CpuConfig,
    pub ring: RingConfig,
    pub gpu: GpuConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
}

/// Which execution backend a runtime is built with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Cpu,
    IoUring,
    Gpu,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub worker_count: usize,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self { worker_count: 4 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    pub entries: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self { entries: 256 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    pub worker_count: usize,
    pub fence_timeout_ms: u64,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            fence_timeout_ms: 1_000,
        }
    }
}

impl GpuConfig {
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }
}

impl DstorageConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parse a single TOML document; missing keys take their defaults.
    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML, e.g. to seed a `dstorage.toml`.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeError)
    }

    /// Configuration for a CPU backend with `worker_count` threads
    pub fn cpu(worker_count: usize) -> Self {
        Self {
            backend: BackendConfig {
                kind: BackendKind::Cpu,
            },
            cpu: CpuConfig { worker_count },
            ..Default::default()
        }
    }

    /// Configuration for an io_uring backend with `entries` ring slots
    pub fn io_uring(entries: u32) -> Self {
        Self {
            backend: BackendConfig {
                kind: BackendKind::IoUring,
            },
            ring: RingConfig { entries },
            ..Default::default()
        }
    }

    /// Reject values no backend can run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpu.worker_count == 0 {
            return Err(ConfigError::ValidationError(
                "cpu.worker_count must be at least 1".to_string(),
            ));
        }
        if self.ring.entries == 0 || self.ring.entries > MAX_RING_ENTRIES {
            return Err(ConfigError::ValidationError(format!(
                "ring.entries must be in 1..={MAX_RING_ENTRIES}, got {}",
                self.ring.entries
            )));
        }
        if self.gpu.worker_count == 0 {
            return Err(ConfigError::ValidationError(
                "gpu.worker_count must be at least 1".to_string(),
            ));
        }
        if self.gpu.fence_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "gpu.fence_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
