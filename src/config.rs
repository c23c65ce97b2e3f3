//! Configuration management for fpga-npu-emu.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (`NPU_QUEUE_DEPTH`, `NPU_PE_COUNT`,
//!    `NPU_MEMORY_SIZE`, `NPU_MEMORY_LATENCY`)
//! 2. Project-local config file (`./fpga-npu-emu.toml`)
//! 3. User config file (`~/.config/fpga-npu-emu/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # fpga-npu-emu.toml
//!
//! # Depth of each CDC queue (power of two)
//! queue_depth = 512
//!
//! # Processing elements in the array
//! pe_count = 16
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

use crate::device::cdc::DEFAULT_DEPTH;
use crate::device::memory::{DEFAULT_MEMORY_LATENCY, DEFAULT_MEMORY_SIZE};
use crate::device::pe_array::DEFAULT_PE_COUNT;

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

const APP_NAME: &str = "fpga-npu-emu";
const LOCAL_CONFIG: &str = "fpga-npu-emu.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Queue depth {0} must be a power of two >= 2")]
    InvalidQueueDepth(usize),

    #[error("PE count must be at least 1")]
    InvalidPeCount,

    #[error("Memory size {0} must be non-zero and a multiple of 4")]
    InvalidMemorySize(usize),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// fpga-npu-emu configuration as read from files and the environment.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Depth of each CDC queue.
    pub queue_depth: Option<usize>,

    /// Number of processing elements.
    pub pe_count: Option<usize>,

    /// Device memory size in bytes.
    pub memory_size: Option<usize>,

    /// Device memory access latency in cycles.
    pub memory_latency: Option<u32>,
}

/// Validated device parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NpuConfig {
    pub queue_depth: usize,
    pub pe_count: usize,
    pub memory_size: usize,
    pub memory_latency: u32,
}

impl Default for NpuConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_DEPTH,
            pe_count: DEFAULT_PE_COUNT,
            memory_size: DEFAULT_MEMORY_SIZE,
            memory_latency: DEFAULT_MEMORY_LATENCY,
        }
    }
}

impl NpuConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_depth < 2 || !self.queue_depth.is_power_of_two() {
            return Err(ConfigError::InvalidQueueDepth(self.queue_depth));
        }
        if self.pe_count == 0 {
            return Err(ConfigError::InvalidPeCount);
        }
        if self.memory_size == 0 || self.memory_size % 4 != 0 {
            return Err(ConfigError::InvalidMemorySize(self.memory_size));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from all sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        config.apply_env_overrides(|key| std::env::var(key).ok());

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Fill in defaults and validate.
    pub fn resolve(&self) -> Result<NpuConfig, ConfigError> {
        let defaults = NpuConfig::default();
        let resolved = NpuConfig {
            queue_depth: self.queue_depth.unwrap_or(defaults.queue_depth),
            pe_count: self.pe_count.unwrap_or(defaults.pe_count),
            memory_size: self.memory_size.unwrap_or(defaults.memory_size),
            memory_latency: self.memory_latency.unwrap_or(defaults.memory_latency),
        };
        resolved.validate()?;
        Ok(resolved)
    }

    fn load_user_config() -> Option<Self> {
        let path = Self::user_config_path()?;
        Self::load_optional(&path)
    }

    fn load_local_config() -> Option<Self> {
        let local_path = Path::new(LOCAL_CONFIG);
        if let Some(config) = Self::load_optional(local_path) {
            return Some(config);
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join(LOCAL_CONFIG);
            if let Some(config) = Self::load_optional(&project_path) {
                return Some(config);
            }
        }

        None
    }

    /// Load a config file that may be absent; problems are logged, not fatal.
    fn load_optional(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        match Self::load_from_file(path) {
            Ok(config) => Some(config),
            Err(e) => {
                log::warn!("{}", e);
                None
            }
        }
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    pub fn merge(&mut self, other: Self) {
        if other.queue_depth.is_some() {
            self.queue_depth = other.queue_depth;
        }
        if other.pe_count.is_some() {
            self.pe_count = other.pe_count;
        }
        if other.memory_size.is_some() {
            self.memory_size = other.memory_size;
        }
        if other.memory_latency.is_some() {
            self.memory_latency = other.memory_latency;
        }
    }

    /// Apply environment overrides read through `lookup`.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.trim().parse() {
                Ok(v) => {
                    log::info!("Using {} from environment: {}", key, value);
                    Some(v)
                }
                Err(_) => {
                    log::warn!("Ignoring {}={:?}: not a number", key, value);
                    None
                }
            }
        }

        if let Some(v) = parse("NPU_QUEUE_DEPTH", lookup("NPU_QUEUE_DEPTH")) {
            self.queue_depth = Some(v);
        }
        if let Some(v) = parse("NPU_PE_COUNT", lookup("NPU_PE_COUNT")) {
            self.pe_count = Some(v);
        }
        if let Some(v) = parse("NPU_MEMORY_SIZE", lookup("NPU_MEMORY_SIZE")) {
            self.memory_size = Some(v);
        }
        if let Some(v) = parse("NPU_MEMORY_LATENCY", lookup("NPU_MEMORY_LATENCY")) {
            self.memory_latency = Some(v);
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_NAME).join("config.toml"))
    }

    /// Generate a sample config file content.
    pub fn sample_config() -> String {
        r#"# fpga-npu-emu configuration
# Place this file at ~/.config/fpga-npu-emu/config.toml or ./fpga-npu-emu.toml

# Depth of each CDC queue; must be a power of two
queue_depth = 512

# Processing elements in the array
pe_count = 16

# Device memory size in bytes (multiple of 4)
# memory_size = 1048576

# Device memory access latency in cycles
# memory_latency = 2
"#
        .to_string()
    }
}
