//! Configuration module for the board observer.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file (`.oraboard/settings.toml`)
//! - Environment variable overrides
//! - CLI argument overrides (applied by the binary)
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `ORABOARD_` and use double
//! underscores to separate nested levels:
//! - `ORABOARD_OBSERVER__SHARED_FS=true` sets `observer.shared_fs`
//! - `ORABOARD_OBSERVER__POLL_INTERVAL_MS=500` sets `observer.poll_interval_ms`
//! - `ORABOARD_LOGGING__DEFAULT=debug` sets `logging.default`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::observer::ObserverOptions;

/// Directory holding the settings file.
pub const CONFIG_DIR: &str = ".oraboard";

/// Settings file name inside [`CONFIG_DIR`].
pub const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory containing the source `.ora` boards
    #[serde(default = "default_board_dir")]
    pub board_dir: PathBuf,

    /// Directory receiving the generated PNG snapshots
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observer timing and file matching
    #[serde(default)]
    pub observer: ObserverConfig,

    /// Converter selection
    #[serde(default)]
    pub converter: ConverterConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default level for everything not listed in `modules`
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module overrides, e.g. `"oraboard::observer" = "debug"`
    #[serde(default)]
    pub modules: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ObserverConfig {
    /// Poll file modification times instead of relying on OS events.
    /// Needed for network and shared file systems.
    #[serde(default)]
    pub shared_fs: bool,

    /// Poll interval for shared file system mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,

    /// Delay between directory scans
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,

    /// Delay before retrying a failed conversion
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Extra conversion attempts after the first failure
    #[serde(default = "default_conversion_retries")]
    pub conversion_retries: u32,

    /// Delay before retrying a failed watch subscription
    #[serde(default = "default_retry_delay_ms")]
    pub watch_retry_delay_ms: u64,

    /// Extension of watched source files (matched case-insensitively)
    #[serde(default = "default_source_extension")]
    pub source_extension: String,

    /// Extension of generated output files
    #[serde(default = "default_output_extension")]
    pub output_extension: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ConverterConfig {
    /// External converter command line. `{source}` and `{output}` are
    /// substituted. Empty means the built-in merged-image extractor.
    #[serde(default)]
    pub command: Vec<String>,
}

// Default value functions
fn default_version() -> u32 {
    1
}
fn default_board_dir() -> PathBuf {
    PathBuf::from("boards")
}
fn default_out_dir() -> PathBuf {
    PathBuf::from("public/cache")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_scan_interval_ms() -> u64 {
    4000
}
fn default_retry_delay_ms() -> u64 {
    100
}
fn default_conversion_retries() -> u32 {
    1
}
fn default_source_extension() -> String {
    "ora".to_string()
}
fn default_output_extension() -> String {
    "png".to_string()
}

/// Poll interval used when shared fs mode is on and none is configured.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            board_dir: default_board_dir(),
            out_dir: default_out_dir(),
            logging: LoggingConfig::default(),
            observer: ObserverConfig::default(),
            converter: ConverterConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: BTreeMap::new(),
        }
    }
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            shared_fs: false,
            poll_interval_ms: None,
            scan_interval_ms: default_scan_interval_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            conversion_retries: default_conversion_retries(),
            watch_retry_delay_ms: default_retry_delay_ms(),
            source_extension: default_source_extension(),
            output_extension: default_output_extension(),
        }
    }
}

impl ObserverConfig {
    /// Runtime options for [`crate::observer::Observer`].
    pub fn to_options(&self) -> ObserverOptions {
        ObserverOptions {
            shared_fs: self.shared_fs,
            poll_interval: Duration::from_millis(
                self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            scan_interval: Duration::from_millis(self.scan_interval_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            conversion_retries: self.conversion_retries,
            watch_retry_delay: Duration::from_millis(self.watch_retry_delay_ms),
            source_extension: self.source_extension.trim_start_matches('.').to_string(),
            output_extension: self.output_extension.trim_start_matches('.').to_string(),
        }
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(SETTINGS_FILE));
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, still honoring env overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            // Double underscore separates nesting; single underscores stay
            // part of the field name.
            .merge(Env::prefixed("ORABOARD_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(Box::new)
    }

    /// Find `.oraboard/settings.toml` in the current directory or an ancestor
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR);
            if config_dir.is_dir() {
                return Some(config_dir.join(SETTINGS_FILE));
            }
        }

        None
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
        let config_path = PathBuf::from(CONFIG_DIR).join(SETTINGS_FILE);

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
        assert_eq!(settings.board_dir, PathBuf::from("boards"));
        assert!(!settings.observer.shared_fs);
        assert_eq!(settings.observer.scan_interval_ms, 4000);
        assert_eq!(settings.observer.conversion_retries, 1);
        assert!(settings.converter.command.is_empty());
    }

    #[test]
    fn test_to_options_defaults_poll_interval() {
        let options = ObserverConfig::default().to_options();
        assert_eq!(options.poll_interval, Duration::from_millis(DEFAULT_POLL_INTERVAL_MS));
        assert_eq!(options.retry_delay, Duration::from_millis(100));
        assert_eq!(options.scan_interval, Duration::from_secs(4));
        assert_eq!(options.source_extension, "ora");
    }

    #[test]
    fn test_to_options_strips_leading_dot() {
        let config = ObserverConfig {
            source_extension: ".ORA".to_string(),
            output_extension: ".webp".to_string(),
            ..ObserverConfig::default()
        };
        let options = config.to_options();
        assert_eq!(options.source_extension, "ORA");
        assert_eq!(options.output_extension, "webp");
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("settings.toml");

        let toml_content = r#"
board_dir = "/srv/boards"

[observer]
shared_fs = true
poll_interval_ms = 250

[converter]
command = ["ora2png", "{source}", "{output}"]

[logging.modules]
"oraboard::observer" = "debug"
"#;
        fs::write(&config_path, toml_content).unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert_eq!(settings.board_dir, PathBuf::from("/srv/boards"));
        assert!(settings.observer.shared_fs);
        assert_eq!(settings.observer.poll_interval_ms, Some(250));
        // Untouched values keep their defaults
        assert_eq!(settings.observer.scan_interval_ms, 4000);
        assert_eq!(settings.out_dir, PathBuf::from("public/cache"));
        assert_eq!(settings.converter.command.len(), 3);
        assert_eq!(settings.logging.modules["oraboard::observer"], "debug");
    }

    #[test]
    fn test_save_settings() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("settings.toml");

        let mut settings = Settings::default();
        settings.observer.conversion_retries = 3;
        settings.out_dir = PathBuf::from("/tmp/out");

        settings.save(&config_path).unwrap();

        let loaded = Settings::load_from(&config_path).unwrap();
        assert_eq!(loaded.observer.conversion_retries, 3);
        assert_eq!(loaded.out_dir, PathBuf::from("/tmp/out"));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let settings = Settings::load_from(temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.observer.output_extension, "png");
    }
}
