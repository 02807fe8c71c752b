//! Global Configuration (~/.runlink/config.toml)
//!
//! Handles user-level configuration stored in `~/.runlink/config.toml`.

use crate::project::{LoaderConfig, LoggingConfig};
use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Global user configuration from ~/.runlink/config.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Library loading defaults
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loader: Option<LoaderConfig>,

    /// Logging defaults
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

impl GlobalConfig {
    /// Load global configuration from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the global configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(filter) = self.logging.as_ref().and_then(|l| l.filter.as_deref()) {
            if filter.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "logging.filter".to_string(),
                    reason: "filter directive is empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Get the global config file path (~/.runlink/config.toml)
    pub fn global_config_path() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".runlink").join("config.toml"))
    }

    /// Search paths declared globally
    pub fn search_paths(&self) -> &[PathBuf] {
        self.loader
            .as_ref()
            .map(|l| l.search_paths.as_slice())
            .unwrap_or(&[])
    }

    /// Merge another global config into this one
    /// Other config takes precedence for non-None values
    pub fn merge(&mut self, other: &GlobalConfig) {
        if other.loader.is_some() {
            self.loader = other.loader.clone();
        }
        if other.logging.is_some() {
            self.logging = other.logging.clone();
        }
    }
}
