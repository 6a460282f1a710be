//! Module for file-access configuration settings.
//!
//! Loading policy (search paths, merging) belongs to the embedding
//! application; this module only defines the finalized settings the VFD
//! layer reads, plus a TOML deserializer for convenience.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

fn default_max_files_per_process() -> usize {
    1000
}

fn default_enable_fsync() -> bool {
    true
}

/// How [`file_sync`](crate::FileAccess::file_sync) reaches stable storage
/// for local files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMethod {
    /// `fsync(2)`.
    #[default]
    Fsync,
    /// `fdatasync(2)`: skip flushing unneeded metadata.
    Fdatasync,
    /// Write-through the drive cache (`F_FULLFSYNC` where available,
    /// otherwise plain `fsync`).
    FsyncWritethrough,
}

/// Finalized file-access settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FdConfig {
    /// Upper bound on kernel descriptors this process may use, before the
    /// startup probe and reserved-descriptor slop are applied.
    pub max_files_per_process: usize,

    /// Root of the persistent data tree; the orphan sweep walks the
    /// per-database temp subdirectories under `<data-dir>/base`.
    pub data_dir: PathBuf,

    /// Root under which temporary files are created
    /// (`<temp-dir>/pgsql_tmp/...`).
    pub temp_dir: PathBuf,

    /// When false, all sync operations on local files are no-ops.
    pub enable_fsync: bool,

    /// Sync strategy for local files.
    pub sync_method: SyncMethod,
}

impl Default for FdConfig {
    fn default() -> Self {
        Self {
            max_files_per_process: default_max_files_per_process(),
            data_dir: PathBuf::from("."),
            temp_dir: PathBuf::from("."),
            enable_fsync: default_enable_fsync(),
            sync_method: SyncMethod::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),
}

impl FdConfig {
    /// Validate the correctness of the configuration.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_files_per_process == 0 {
            errors.push("max-files-per-process must be positive.".to_owned());
        }
        if self.data_dir.as_os_str().is_empty() {
            errors.push("data-dir must not be empty.".to_owned());
        }
        if self.temp_dir.as_os_str().is_empty() {
            errors.push("temp-dir must not be empty.".to_owned());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Parse and validate settings from a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }
}
