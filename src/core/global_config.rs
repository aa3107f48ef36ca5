//! Global configuration management
//!
//! Reads settings from `config.toml` in the config directory. Every field is
//! optional; the accessor methods fall back to [`crate::config::defaults`].
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8787"
//!
//! [fetch]
//! max_retries = 3
//!
//! [writer]
//! use_helper = false
//! assume_privileged = true
//!
//! [pipeline.ranges]
//! downloading = [10.0, 50.0]
//! writing = [50.0, 95.0]
//! ```

use crate::config::defaults;
use crate::core::pipeline::StageRanges;
use crate::infra::dirs::FlashpipeDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Global configuration error types
#[derive(Error, Debug)]
pub enum GlobalConfigError {
    /// Failed to read config file
    #[error("Failed to read config file '{path}': {error}")]
    ReadError { path: String, error: String },

    /// Failed to parse config file
    #[error("Failed to parse config file '{path}': {error}")]
    ParseError { path: String, error: String },
}

/// Global configuration for flashpipe
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// HTTP service settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Image fetcher settings
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Image locator settings
    #[serde(default)]
    pub locator: LocatorConfig,

    /// Device writer settings
    #[serde(default)]
    pub writer: WriterConfig,

    /// Orchestrator settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Target device safety settings
    #[serde(default)]
    pub device: DeviceConfig,
}

/// HTTP service settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (`host:port`)
    pub listen: Option<String>,
}

/// Image fetcher settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Retries after the first attempt
    pub max_retries: Option<u32>,

    /// Base backoff delay in milliseconds
    pub base_delay_ms: Option<u64>,

    /// Read timeout in seconds
    pub timeout_secs: Option<u64>,

    /// Connect timeout in seconds
    pub connect_timeout_secs: Option<u64>,
}

/// Image locator settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocatorConfig {
    /// Maximum listing recursion depth
    pub max_depth: Option<usize>,

    /// Maximum listings fetched per resolution
    pub max_visits: Option<usize>,
}

/// Device writer settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Prefer the block-copy helper when it can be found
    pub use_helper: Option<bool>,

    /// Explicit helper path, skipping discovery
    pub helper_path: Option<PathBuf>,

    /// Permit the in-process direct-write fallback
    pub allow_direct: Option<bool>,

    /// Treat the process as privileged (capability-based setups)
    pub assume_privileged: Option<bool>,

    /// Write block size in bytes
    pub block_size: Option<usize>,
}

/// Orchestrator settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Wall-clock budget for one run in seconds
    pub max_run_secs: Option<u64>,

    /// Grace period between terminate and kill in seconds
    pub cancel_grace_secs: Option<u64>,

    /// Relay channel capacity
    pub channel_capacity: Option<usize>,

    /// Overall percent ranges per stage
    #[serde(default)]
    pub ranges: RangesConfig,
}

/// Overall percent `[start, end]` per working stage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RangesConfig {
    pub formatting: Option<(f64, f64)>,
    pub downloading: Option<(f64, f64)>,
    pub writing: Option<(f64, f64)>,
    pub verifying: Option<(f64, f64)>,
}

/// Target device safety settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Largest device accepted as a target
    pub max_device_bytes: Option<u64>,
}

impl GlobalConfig {
    /// Load global configuration from the config directory
    ///
    /// If the config file doesn't exist, returns default configuration.
    /// If the config file exists but is invalid, returns an error.
    pub fn load(dirs: &FlashpipeDirs) -> Result<Self, GlobalConfigError> {
        Self::load_from_path(&dirs.global_config_path())
    }

    /// Load global configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, GlobalConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| GlobalConfigError::ReadError {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| GlobalConfigError::ParseError {
            path: path.display().to_string(),
            error: e.to_string(),
        })
    }

    /// Save global configuration to a specific path
    ///
    /// Creates parent directories if they don't exist.
    pub fn save_to_path(&self, path: &Path) -> Result<(), GlobalConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| GlobalConfigError::ReadError {
                path: parent.display().to_string(),
                error: e.to_string(),
            })?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| GlobalConfigError::ParseError {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;

        fs::write(path, content).map_err(|e| GlobalConfigError::ReadError {
            path: path.display().to_string(),
            error: e.to_string(),
        })
    }

    /// Effective listen address
    #[must_use]
    pub fn listen_addr(&self) -> &str {
        self.server
            .listen
            .as_deref()
            .unwrap_or(defaults::DEFAULT_LISTEN_ADDR)
    }

    /// Effective download retry count
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.fetch
            .max_retries
            .unwrap_or(defaults::MAX_DOWNLOAD_RETRIES)
    }

    /// Effective base backoff delay
    #[must_use]
    pub fn base_delay_ms(&self) -> u64 {
        self.fetch
            .base_delay_ms
            .unwrap_or(defaults::BASE_RETRY_DELAY_MS)
    }

    /// Effective download read timeout
    #[must_use]
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(
            self.fetch
                .timeout_secs
                .unwrap_or(defaults::DOWNLOAD_TIMEOUT_SECS),
        )
    }

    /// Effective download connect timeout
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(
            self.fetch
                .connect_timeout_secs
                .unwrap_or(defaults::CONNECT_TIMEOUT_SECS),
        )
    }

    /// Effective listing depth bound
    #[must_use]
    pub fn max_listing_depth(&self) -> usize {
        self.locator
            .max_depth
            .unwrap_or(defaults::MAX_LISTING_DEPTH)
    }

    /// Effective listing visit budget
    #[must_use]
    pub fn max_listing_visits(&self) -> usize {
        self.locator
            .max_visits
            .unwrap_or(defaults::MAX_LISTING_VISITS)
    }

    /// Whether the helper strategy is preferred
    #[must_use]
    pub fn use_helper(&self) -> bool {
        self.writer.use_helper.unwrap_or(true)
    }

    /// Whether the direct-write fallback is permitted
    #[must_use]
    pub fn allow_direct(&self) -> bool {
        self.writer.allow_direct.unwrap_or(true)
    }

    /// Whether privilege checks are bypassed
    #[must_use]
    pub fn assume_privileged(&self) -> bool {
        self.writer.assume_privileged.unwrap_or(false)
    }

    /// Effective write block size
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.writer
            .block_size
            .filter(|size| *size > 0)
            .unwrap_or(defaults::WRITE_BLOCK_SIZE)
    }

    /// Effective run budget
    #[must_use]
    pub fn max_run_duration(&self) -> Duration {
        Duration::from_secs(
            self.pipeline
                .max_run_secs
                .unwrap_or(defaults::MAX_RUN_SECS),
        )
    }

    /// Effective cancel grace period
    #[must_use]
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(
            self.pipeline
                .cancel_grace_secs
                .unwrap_or(defaults::CANCEL_GRACE_SECS),
        )
    }

    /// Effective relay channel capacity
    #[must_use]
    pub fn channel_capacity(&self) -> usize {
        self.pipeline
            .channel_capacity
            .filter(|capacity| *capacity > 0)
            .unwrap_or(defaults::EVENT_CHANNEL_CAPACITY)
    }

    /// Effective stage ranges
    ///
    /// Unset stages keep their default range. A combination that overlaps,
    /// runs backwards or leaves 0-100 is ignored as a whole.
    #[must_use]
    pub fn stage_ranges(&self) -> StageRanges {
        let defaults = StageRanges::default();
        let configured = &self.pipeline.ranges;
        let ranges = StageRanges {
            formatting: configured.formatting.unwrap_or(defaults.formatting),
            downloading: configured.downloading.unwrap_or(defaults.downloading),
            writing: configured.writing.unwrap_or(defaults.writing),
            verifying: configured.verifying.unwrap_or(defaults.verifying),
        };
        if ranges.is_monotonic() {
            ranges
        } else {
            warn!("Ignoring non-monotonic stage ranges {:?}", ranges);
            defaults
        }
    }

    /// Effective removable-device size limit
    #[must_use]
    pub fn max_device_bytes(&self) -> u64 {
        self.device
            .max_device_bytes
            .unwrap_or(defaults::MAX_DEVICE_BYTES)
    }
}
