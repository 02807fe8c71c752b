//! Configuration Loader
//!
//! Handles loading and merging configuration from multiple sources with proper precedence.

use crate::global::GlobalConfig;
use crate::project::{LoaderConfig, LoggingConfig, ProjectConfig};
use crate::{ConfigError, ConfigResult};
use std::env;
use std::path::{Path, PathBuf};

/// Name of the project configuration file
pub const PROJECT_FILE: &str = "runlink.toml";

/// Default argument bytes of a small call frame
pub const DEFAULT_SMALL_FRAME_BYTES: usize = 64;

/// Default argument bytes of a large call frame
pub const DEFAULT_LARGE_FRAME_BYTES: usize = 4096;

/// Default number of idle frames kept per pool partition
pub const DEFAULT_MAX_IDLE: usize = 32;

/// Configuration loader
///
/// Loads configuration from multiple sources and merges them with proper precedence:
/// 1. Global config (~/.runlink/config.toml) - lowest priority
/// 2. Project config (./runlink.toml) - overrides global
/// 3. Environment variables (RUNLINK_*) - overrides project
/// 4. Explicit arguments - highest priority (handled by caller)
pub struct ConfigLoader {
    /// Cached global config path
    global_config_path: Option<PathBuf>,
}

/// Merged configuration result
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Project configuration
    pub project: ProjectConfig,

    /// Global configuration
    pub global: GlobalConfig,

    /// Project root directory (where runlink.toml was found)
    pub project_root: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Create a loader that reads the global config from an explicit path
    pub fn with_global_path(path: PathBuf) -> Self {
        Self {
            global_config_path: Some(path),
        }
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to find runlink.toml, then loads and merges
    /// global config if it exists.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<Config> {
        let (project_root, project_config) = self.find_project_config(start_dir)?;
        let global_config = self.load_global_config().unwrap_or_default();
        let project_config = self.apply_env_overrides(project_config)?;

        Ok(Config {
            project: project_config,
            global: global_config,
            project_root,
        })
    }

    /// Load configuration from a specific project config file
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<Config> {
        let project_config = ProjectConfig::load_from_file(config_path)?;
        let global_config = self.load_global_config().unwrap_or_default();
        let project_config = self.apply_env_overrides(project_config)?;

        let project_root = config_path.parent().map(|p| p.to_path_buf());

        Ok(Config {
            project: project_config,
            global: global_config,
            project_root,
        })
    }

    /// Find project configuration by walking up directory tree
    fn find_project_config(
        &self,
        start_dir: &Path,
    ) -> ConfigResult<(Option<PathBuf>, ProjectConfig)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(PROJECT_FILE);

            if config_path.exists() {
                let project_config = ProjectConfig::load_from_file(&config_path)?;
                return Ok((Some(current), project_config));
            }

            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, ProjectConfig::default())),
            }
        }
    }

    /// Load global configuration from ~/.runlink/config.toml
    fn load_global_config(&mut self) -> ConfigResult<GlobalConfig> {
        let path = match &self.global_config_path {
            Some(path) => path.clone(),
            None => {
                let path = GlobalConfig::global_config_path()?;
                self.global_config_path = Some(path.clone());
                path
            }
        };

        // Global config is optional - if it doesn't exist, return default
        if !path.exists() {
            return Ok(GlobalConfig::default());
        }

        GlobalConfig::load_from_file(&path)
    }

    /// Apply environment variable overrides to project config
    ///
    /// - RUNLINK_LIBRARY_PATH: platform path list, prepended to search paths
    /// - RUNLINK_PLATFORM: platform identifier for default locations
    /// - RUNLINK_LOG: tracing filter directive
    fn apply_env_overrides(&self, mut config: ProjectConfig) -> ConfigResult<ProjectConfig> {
        if let Some(paths) = env::var_os("RUNLINK_LIBRARY_PATH") {
            let loader = config.loader.get_or_insert_with(LoaderConfig::default);
            let mut merged: Vec<PathBuf> = env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            merged.append(&mut loader.search_paths);
            loader.search_paths = merged;
        }

        if let Ok(platform) = env::var("RUNLINK_PLATFORM") {
            config
                .loader
                .get_or_insert_with(LoaderConfig::default)
                .platform = Some(platform);
        }

        if let Ok(filter) = env::var("RUNLINK_LOG") {
            config
                .logging
                .get_or_insert_with(LoggingConfig::default)
                .filter = Some(filter);
        }

        config.validate()?;
        Ok(config)
    }

    /// Get the global configuration directory (~/.runlink)
    pub fn global_config_dir() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".runlink"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Library search paths (project paths first, then global)
    pub fn search_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.project.search_paths().to_vec();
        for path in self.global.search_paths() {
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }
        paths
    }

    /// Effective platform identifier (configured > compile target)
    pub fn platform(&self) -> &str {
        self.project
            .loader
            .as_ref()
            .and_then(|l| l.platform.as_deref())
            .or_else(|| self.global.loader.as_ref().and_then(|l| l.platform.as_deref()))
            .unwrap_or(env::consts::OS)
    }

    /// Location override for a named library
    pub fn library_override(&self, name: &str) -> Option<&str> {
        self.project.library(name)
    }

    /// Argument bytes of a small call frame
    pub fn small_frame_bytes(&self) -> usize {
        self.project
            .frames
            .as_ref()
            .and_then(|f| f.small_bytes)
            .unwrap_or(DEFAULT_SMALL_FRAME_BYTES)
    }

    /// Argument bytes of a large call frame
    pub fn large_frame_bytes(&self) -> usize {
        self.project
            .frames
            .as_ref()
            .and_then(|f| f.large_bytes)
            .unwrap_or(DEFAULT_LARGE_FRAME_BYTES)
            .max(self.small_frame_bytes())
    }

    /// Idle frames kept per pool partition
    pub fn max_idle_frames(&self) -> usize {
        self.project
            .frames
            .as_ref()
            .and_then(|f| f.max_idle)
            .unwrap_or(DEFAULT_MAX_IDLE)
    }

    /// Effective log filter (project > global)
    pub fn log_filter(&self) -> Option<&str> {
        self.project
            .logging
            .as_ref()
            .and_then(|l| l.filter.as_deref())
            .or_else(|| self.global.logging.as_ref().and_then(|l| l.filter.as_deref()))
    }

    /// Get the project root directory
    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Check if a runlink.toml was found
    pub fn is_project(&self) -> bool {
        self.project_root.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn create_config_file(dir: &Path, content: &str) -> PathBuf {
        let config_path = dir.join(PROJECT_FILE);
        fs::write(&config_path, content).unwrap();
        config_path
    }

    fn isolated_loader(dir: &TempDir) -> ConfigLoader {
        ConfigLoader::with_global_path(dir.path().join("no-global.toml"))
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(
            temp_dir.path(),
            r#"
[libraries]
libc = "libc.so.6"
"#,
        );

        let mut loader = isolated_loader(&temp_dir);
        let config = loader.load_from_directory(temp_dir.path()).unwrap();

        assert_eq!(config.library_override("libc"), Some("libc.so.6"));
        assert!(config.is_project());
    }

    #[test]
    fn test_find_config_in_parent() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(temp_dir.path(), "[frames]\nmax_idle = 4\n");

        let sub_dir = temp_dir.path().join("subdir");
        fs::create_dir(&sub_dir).unwrap();

        let mut loader = isolated_loader(&temp_dir);
        let config = loader.load_from_directory(&sub_dir).unwrap();

        assert_eq!(config.max_idle_frames(), 4);
        assert_eq!(config.project_root(), Some(temp_dir.path()));
    }

    #[test]
    fn test_defaults_without_project() {
        let config = Config::default();

        assert!(!config.is_project());
        assert_eq!(config.small_frame_bytes(), DEFAULT_SMALL_FRAME_BYTES);
        assert_eq!(config.large_frame_bytes(), DEFAULT_LARGE_FRAME_BYTES);
        assert_eq!(config.max_idle_frames(), DEFAULT_MAX_IDLE);
        assert_eq!(config.platform(), env::consts::OS);
        assert!(config.search_paths().is_empty());
    }

    #[test]
    #[serial]
    fn test_env_override_platform() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(temp_dir.path(), "[loader]\nplatform = \"linux\"\n");

        env::set_var("RUNLINK_PLATFORM", "freebsd");

        let mut loader = isolated_loader(&temp_dir);
        let config = loader.load_from_directory(temp_dir.path()).unwrap();

        assert_eq!(config.platform(), "freebsd");

        env::remove_var("RUNLINK_PLATFORM");
    }

    #[test]
    #[serial]
    fn test_env_library_path_prepended() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(
            temp_dir.path(),
            "[loader]\nsearch_paths = [\"/from/project\"]\n",
        );

        let joined = env::join_paths([PathBuf::from("/from/env")]).unwrap();
        env::set_var("RUNLINK_LIBRARY_PATH", &joined);

        let mut loader = isolated_loader(&temp_dir);
        let config = loader.load_from_directory(temp_dir.path()).unwrap();

        assert_eq!(
            config.search_paths(),
            vec![PathBuf::from("/from/env"), PathBuf::from("/from/project")]
        );

        env::remove_var("RUNLINK_LIBRARY_PATH");
    }

    #[test]
    fn test_load_from_specific_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path =
            create_config_file(temp_dir.path(), "[frames]\nsmall_bytes = 128\n");

        let mut loader = isolated_loader(&temp_dir);
        let config = loader.load_from_file(&config_path).unwrap();

        assert_eq!(config.small_frame_bytes(), 128);
        // large partition never shrinks below the small one
        assert!(config.large_frame_bytes() >= 128);
    }
}
