//! Project Configuration (runlink.toml)
//!
//! Handles project-level configuration stored in `runlink.toml` at the project root.

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Smallest argument buffer a pooled call frame may be configured with.
const MIN_FRAME_BYTES: usize = 8;

/// Project configuration from runlink.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Library loading settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loader: Option<LoaderConfig>,

    /// Call frame pool settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<FramesConfig>,

    /// Location overrides keyed by library name
    #[serde(default)]
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub libraries: BTreeMap<String, String>,

    /// Logging settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Library loading configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LoaderConfig {
    /// Extra directories searched for short library names
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub search_paths: Vec<PathBuf>,

    /// Platform identifier used to pick default locations (e.g. "linux")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

/// Call frame pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct FramesConfig {
    /// Argument bytes of a frame in the small partition (default: 64)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub small_bytes: Option<usize>,

    /// Argument bytes of a frame in the large partition (default: 4096)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_bytes: Option<usize>,

    /// Idle frames kept per partition (default: 32)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_idle: Option<usize>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// `tracing` filter directive (e.g. "runlink=debug")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl ProjectConfig {
    /// Load project configuration from a file
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

    /// Validate the project configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(frames) = &self.frames {
            if let Some(small) = frames.small_bytes {
                if small < MIN_FRAME_BYTES {
                    return Err(ConfigError::InvalidValue {
                        field: "frames.small_bytes".to_string(),
                        reason: format!("must be at least {}, got {}", MIN_FRAME_BYTES, small),
                    });
                }
            }
            if let (Some(small), Some(large)) = (frames.small_bytes, frames.large_bytes) {
                if large < small {
                    return Err(ConfigError::InvalidValue {
                        field: "frames.large_bytes".to_string(),
                        reason: format!("must not be smaller than small_bytes ({})", small),
                    });
                }
            }
        }

        for (name, location) in &self.libraries {
            if location.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("libraries.{}", name),
                    reason: "location string is empty".to_string(),
                });
            }
        }

        if let Some(platform) = self.loader.as_ref().and_then(|l| l.platform.as_deref()) {
            if platform.is_empty() || platform.contains(char::is_whitespace) {
                return Err(ConfigError::InvalidValue {
                    field: "loader.platform".to_string(),
                    reason: format!("invalid platform identifier '{}'", platform),
                });
            }
        }

        Ok(())
    }

    /// Location override for a named library, if configured
    pub fn library(&self, name: &str) -> Option<&str> {
        self.libraries.get(name).map(String::as_str)
    }

    /// Configured search paths (empty when unset)
    pub fn search_paths(&self) -> &[PathBuf] {
        self.loader
            .as_ref()
            .map(|l| l.search_paths.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config: ProjectConfig = toml::from_str("").unwrap();
        assert_eq!(config, ProjectConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[loader]
search_paths = ["vendor/lib", "/opt/lib"]
platform = "linux"

[frames]
small_bytes = 64
large_bytes = 4096
max_idle = 16

[libraries]
libc = "libc.so.6, libc.so"

[logging]
filter = "runlink=debug"
"#;

        let config: ProjectConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.search_paths().len(), 2);
        assert_eq!(config.library("libc"), Some("libc.so.6, libc.so"));
        assert_eq!(config.frames.unwrap().max_idle, Some(16));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<ProjectConfig, _> = toml::from_str("[loader]\nsearch = []\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_frame_sizes_validated() {
        let config = ProjectConfig {
            frames: Some(FramesConfig {
                small_bytes: Some(128),
                large_bytes: Some(64),
                max_idle: None,
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ProjectConfig {
            frames: Some(FramesConfig {
                small_bytes: Some(4),
                large_bytes: None,
                max_idle: None,
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_library_location_rejected() {
        let mut config = ProjectConfig::default();
        config.libraries.insert("sdl".to_string(), "  ".to_string());
        assert!(config.validate().is_err());
    }
}
