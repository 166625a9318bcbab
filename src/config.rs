//! Configuration module for the directory watcher.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//! - CLI argument overrides (applied by the caller)
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `DIRWATCH_` and use double
//! underscores to separate nested levels:
//! - `DIRWATCH_WATCHER__RECURSIVE=false` sets `watcher.recursive`
//! - `DIRWATCH_WATCHER__QUEUE__CAPACITY=1024` sets `watcher.queue.capacity`
//! - `DIRWATCH_LOGGING__DEFAULT=debug` sets `logging.default`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::watcher::EventKind;

/// Directory holding the project-local settings file.
pub const CONFIG_DIR: &str = ".dirwatch";
const CONFIG_FILE: &str = "settings.toml";
const ENV_PREFIX: &str = "DIRWATCH_";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Watcher behaviour
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Log levels
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WatcherConfig {
    /// Populate and follow subdirectories
    #[serde(default = "default_true")]
    pub recursive: bool,

    /// Apply the watcher-wide mask to every new directory, ignoring
    /// per-call overrides
    #[serde(default = "default_true")]
    pub use_watcher_flags: bool,

    /// Event kinds delivered to the consumer
    #[serde(default = "default_interest")]
    pub interest: Vec<EventKind>,

    /// Outbound queue settings
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct QueueConfig {
    /// Capacity of the event and error queues; unbounded when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Default level for all modules (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module overrides, e.g. `dirwatch::watcher = "debug"`
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_interest() -> Vec<EventKind> {
    EventKind::ALL.to_vec()
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            watcher: WatcherConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            recursive: true,
            use_watcher_flags: true,
            interest: default_interest(),
            queue: QueueConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_config_file()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            // Start with defaults
            .merge(Serialized::defaults(Settings::default()))
            // Layer in config file if it exists
            .merge(Toml::file(path.as_ref()))
            // Double underscore separates nested levels, single underscore
            // stays within field names
            .merge(Env::prefixed(ENV_PREFIX).map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Find the settings file: `.dirwatch/settings.toml` in the current
    /// directory or an ancestor, then the user config directory.
    pub fn find_config_file() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR);
            if config_dir.is_dir() {
                return Some(config_dir.join(CONFIG_FILE));
            }
        }

        dirs::config_dir()
            .map(|dir| dir.join("dirwatch").join(CONFIG_FILE))
            .filter(|path| path.exists())
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file in the current directory
    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = PathBuf::from(CONFIG_DIR).join(CONFIG_FILE);

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        Settings::default().save(&config_path)?;
        Ok(config_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.version, 1);
        assert!(settings.watcher.recursive);
        assert!(settings.watcher.use_watcher_flags);
        assert_eq!(settings.watcher.interest.len(), EventKind::ALL.len());
        assert_eq!(settings.watcher.queue.capacity, None);
        assert_eq!(settings.logging.default, "warn");
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        let toml_content = r#"
version = 2

[watcher]
recursive = false
interest = ["dir_created", "file_changed"]

[watcher.queue]
capacity = 64

[logging]
default = "info"

[logging.modules]
"dirwatch::watcher" = "debug"
"#;

        fs::write(&config_path, toml_content).unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert_eq!(settings.version, 2);
        assert!(!settings.watcher.recursive);
        assert_eq!(
            settings.watcher.interest,
            vec![EventKind::DirCreated, EventKind::FileChanged]
        );
        assert_eq!(settings.watcher.queue.capacity, Some(64));
        assert_eq!(settings.logging.default, "info");
        assert_eq!(settings.logging.modules["dirwatch::watcher"], "debug");
    }

    #[test]
    fn test_partial_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        fs::write(&config_path, "[watcher]\nuse_watcher_flags = false\n").unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert!(!settings.watcher.use_watcher_flags);

        // Default values should still be present
        assert_eq!(settings.version, 1);
        assert!(settings.watcher.recursive);
        assert_eq!(settings.watcher.interest, default_interest());
    }

    #[test]
    fn test_invalid_event_kind_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        fs::write(&config_path, "[watcher]\ninterest = [\"renamed\"]\n").unwrap();

        assert!(Settings::load_from(&config_path).is_err());
    }

    #[test]
    fn test_save_settings() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested/settings.toml");

        let mut settings = Settings::default();
        settings.watcher.recursive = false;
        settings.watcher.interest = vec![EventKind::FileRemoved];
        settings.logging.default = "debug".to_string();

        settings.save(&config_path).unwrap();

        let loaded = Settings::load_from(&config_path).unwrap();
        assert!(!loaded.watcher.recursive);
        assert_eq!(loaded.watcher.interest, vec![EventKind::FileRemoved]);
        assert_eq!(loaded.logging.default, "debug");
    }

    #[test]
    fn test_saved_file_is_readable_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");
        Settings::default().save(&config_path).unwrap();

        let content = fs::read_to_string(&config_path).unwrap();
        assert!(content.contains("version = 1"));
        assert!(content.contains("[watcher]"));
        assert!(content.contains("\"dir_created\""));
    }
}
