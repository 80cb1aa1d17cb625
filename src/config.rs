//! Driver configuration.
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! shm_name = "nvme_host_driver"
//! process_role = "auto"
//! init_timeout_ms = 180000
//!
//! [log]
//! level = "debug"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::logging::LogConfig;
use crate::memory::DEFAULT_DMA_ALIGN;

/// Largest single bounce/DMA allocation served by the default allocator.
pub const DEFAULT_MAX_DMA_ALLOC: usize = 1 << 30;

const SHM_NAME_MAX_LEN: usize = 200;

/// Which side of the shared driver state this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    Primary,
    Secondary,
    /// Primary unless the shared region already exists.
    #[default]
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Name of the shared-memory region holding the driver singleton.
    #[serde(default = "default_shm_name")]
    pub shm_name: String,

    #[serde(default)]
    pub process_role: ProcessRole,

    /// How long a secondary waits for the primary to finish initializing.
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,

    #[serde(default = "default_max_dma_alloc")]
    pub max_dma_alloc: usize,

    /// Alignment of bounce buffers; a power of two.
    #[serde(default = "default_dma_align")]
    pub dma_align: usize,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_shm_name() -> String {
    "nvme_host_driver".to_string()
}

fn default_init_timeout_ms() -> u64 {
    180_000
}

fn default_max_dma_alloc() -> usize {
    DEFAULT_MAX_DMA_ALLOC
}

fn default_dma_align() -> usize {
    DEFAULT_DMA_ALIGN
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            shm_name: default_shm_name(),
            process_role: ProcessRole::default(),
            init_timeout_ms: default_init_timeout_ms(),
            max_dma_alloc: default_max_dma_alloc(),
            dma_align: default_dma_align(),
            log: LogConfig::default(),
        }
    }
}

impl DriverConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: DriverConfig =
            toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!("config loaded from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.shm_name.strip_prefix('/').unwrap_or(&self.shm_name);
        if name.is_empty() || name.contains('/') || name.contains('\0') {
            return Err(Error::Config(format!(
                "invalid shm_name '{}'",
                self.shm_name
            )));
        }
        if name.len() > SHM_NAME_MAX_LEN {
            return Err(Error::Config(format!(
                "shm_name longer than {} bytes",
                SHM_NAME_MAX_LEN
            )));
        }
        if !self.dma_align.is_power_of_two() {
            return Err(Error::Config(format!(
                "dma_align {} is not a power of two",
                self.dma_align
            )));
        }
        if self.max_dma_alloc == 0 {
            return Err(Error::Config("max_dma_alloc must be > 0".into()));
        }
        Ok(())
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}
