//! Configuration management for autopivot

mod pivot;
pub mod serde_utils;

pub use pivot::PivotConfig;

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("autopivot")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Load the pivot configuration, falling back to defaults when the file is absent
///
/// An explicitly requested file that does not exist is an error; a missing
/// default file is not.
pub fn load_or_default(explicit: Option<&Path>) -> Result<PivotConfig, ConfigError> {
    let config = match explicit {
        Some(path) => load_config(path)?,
        None => {
            let path = default_config_path();
            match load_config(&path) {
                Ok(config) => config,
                Err(ConfigError::NotFound(_)) => {
                    tracing::debug!("No config at {}, using defaults", path.display());
                    PivotConfig::default()
                }
                Err(e) => return Err(e),
            }
        }
    };
    config.validate()?;
    Ok(config)
}
