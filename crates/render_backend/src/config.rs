//! Backend configuration: file-loadable settings plus environment overrides.

use std::path::PathBuf;

pub use serde::{Deserialize, Serialize};

/// Configuration trait for file-backed settings.
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;

        // Try different formats
        if path.ends_with(".toml") {
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else if path.ends_with(".ron") {
            ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_string()))
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = if path.ends_with(".toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else if path.ends_with(".ron") {
            ron::ser::to_string_pretty(self, Default::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        };

        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Tunable backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendSettings {
    /// Transfer worker thread count; 0 encodes uploads on the calling thread.
    pub transfer_workers: usize,
    /// Initial staging buffer capacity in bytes.
    pub staging_block_size: usize,
    /// Persist the pipeline cache between runs.
    pub enable_pipeline_cache: bool,
    /// Where the pipeline cache blob lives on disk.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pipeline_cache_path: Option<PathBuf>,
    /// Enable API validation layers when available.
    pub enable_validation: bool,
}

impl Default for BackendSettings {
    fn default() -> Self {
        BackendSettings {
            transfer_workers: 4,
            staging_block_size: 4 * 1024 * 1024,
            enable_pipeline_cache: true,
            pipeline_cache_path: None,
            enable_validation: false,
        }
    }
}

impl Config for BackendSettings {}

impl BackendSettings {
    /// Environment variable selecting the worker count.
    pub const ENV_WORKERS: &'static str = "RENDER_BACKEND_WORKERS";
    /// Environment variable disabling pipeline cache persistence.
    pub const ENV_DISABLE_PIPELINE_CACHE: &'static str = "RENDER_BACKEND_DISABLE_PIPELINE_CACHE";
    /// Environment variable enabling validation layers.
    pub const ENV_VALIDATION: &'static str = "RENDER_BACKEND_VALIDATION";

    /// Applies environment overrides on top of loaded settings.
    ///
    /// Numeric variables replace the field when they parse; flag variables
    /// follow the convention that absent or zero means disabled.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Some(count) = env_usize(Self::ENV_WORKERS) {
            self.transfer_workers = count;
        }
        if env_flag(Self::ENV_DISABLE_PIPELINE_CACHE) {
            self.enable_pipeline_cache = false;
        }
        if env_flag(Self::ENV_VALIDATION) {
            self.enable_validation = true;
        }
        self
    }
}

/// Reads a flag variable; absent or zero means disabled.
fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => value.trim().parse::<i64>().map(|v| v != 0).unwrap_or(false),
        Err(_) => false,
    }
}

/// Reads a numeric variable, if present and well formed.
fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}
