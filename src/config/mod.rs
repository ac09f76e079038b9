//! Configuration module for the S3 writer
//!
//! [`UploaderConfig`] holds the tuning knobs of an upload. It can be built in
//! code or loaded from a YAML file with environment variable expansion:
//!
//! ```yaml
//! concurrency: ${UPLOAD_CONCURRENCY:-4}
//! part_size: 16777216
//! max_bytes_per_second: 0
//! disable_abort_on_error: false
//! ```

use crate::upload::{UploadError, DEFAULT_CONCURRENCY, MAX_PART_SIZE, MIN_PART_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for UploadError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::ValidationError(msg) => UploadError::InvalidConfig(msg),
            other => UploadError::InvalidConfig(other.to_string()),
        }
    }
}

/// Uploader configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// Number of parts uploaded in parallel, counting the one the writing
    /// task runs itself. 1 disables parallelism.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Size of every part but the last. Also the rate limiter burst.
    #[serde(default = "default_part_size")]
    pub part_size: u64,

    /// Upload rate limit in bytes per second; 0 means unlimited.
    #[serde(default)]
    pub max_bytes_per_second: u64,

    /// Leave a failed multipart upload in place instead of aborting it.
    ///
    /// Incomplete uploads keep accruing storage charges until aborted or
    /// removed by a lifecycle rule.
    #[serde(default)]
    pub disable_abort_on_error: bool,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            part_size: default_part_size(),
            max_bytes_per_second: 0,
            disable_abort_on_error: false,
        }
    }
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_part_size() -> u64 {
    MIN_PART_SIZE
}

impl UploaderConfig {
    /// Load configuration from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationError(format!(
                "concurrency ({}) must be a positive integer",
                self.concurrency
            )));
        }

        if self.part_size < MIN_PART_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "part_size ({}) must be at least {} bytes",
                self.part_size, MIN_PART_SIZE
            )));
        }

        if self.part_size > MAX_PART_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "part_size ({}) must be at most {} bytes",
                self.part_size, MAX_PART_SIZE
            )));
        }

        Ok(())
    }
}
