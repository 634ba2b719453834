//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::aggregate::AvgBytesMode;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub import: ImportConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Import pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ImportConfig {
    /// Worker count for the file-indexing stage
    #[serde(default = "default_indexing_threads")]
    pub indexing_threads: usize,

    /// Worker count for the parse stage
    #[serde(default = "default_parse_threads")]
    pub parse_threads: usize,

    /// Connection-count ceiling beyond which a pair becomes a strobe
    #[serde(default = "default_connection_limit")]
    pub connection_limit: i64,

    /// Keep the historical average-bytes arithmetic (see DESIGN.md);
    /// set to false for corrected arithmetic
    #[serde(default = "default_legacy_avg_bytes")]
    pub legacy_avg_bytes: bool,

    /// Worker count for the writer pool
    #[serde(default = "default_writer_workers")]
    pub writer_workers: usize,

    /// Writer pool queue bound; submissions block once it is reached
    #[serde(default = "default_writer_queue_capacity")]
    pub writer_queue_capacity: usize,
}

fn default_indexing_threads() -> usize {
    2
}

fn default_parse_threads() -> usize {
    4
}

fn default_connection_limit() -> i64 {
    250_000
}

fn default_legacy_avg_bytes() -> bool {
    true
}

fn default_writer_workers() -> usize {
    2
}

fn default_writer_queue_capacity() -> usize {
    1024
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            indexing_threads: default_indexing_threads(),
            parse_threads: default_parse_threads(),
            connection_limit: default_connection_limit(),
            legacy_avg_bytes: default_legacy_avg_bytes(),
            writer_workers: default_writer_workers(),
            writer_queue_capacity: default_writer_queue_capacity(),
        }
    }
}

impl ImportConfig {
    /// The average-bytes arithmetic this run uses.
    pub fn avg_bytes_mode(&self) -> AvgBytesMode {
        if self.legacy_avg_bytes {
            AvgBytesMode::Legacy
        } else {
            AvgBytesMode::Corrected
        }
    }
}

/// Storage location configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("flowsift").to_string_lossy().to_string())
        .unwrap_or_else(|| "./flowsift_data".to_string())
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    /// Path of the datastore database file
    pub fn store_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("store.db")
    }

    /// Path of the file-provenance database file
    pub fn meta_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("meta.db")
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("flowsift").join("config.toml")),
            Some(PathBuf::from("/etc/flowsift/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        // Storage overrides
        if let Ok(data_dir) = std::env::var("FLOWSIFT_DATA_DIR") {
            self.storage.data_dir = data_dir;
        }

        // Import overrides
        if let Ok(threads) = std::env::var("FLOWSIFT_PARSE_THREADS") {
            if let Ok(t) = threads.parse() {
                self.import.parse_threads = t;
            }
        }
        if let Ok(limit) = std::env::var("FLOWSIFT_CONNECTION_LIMIT") {
            if let Ok(l) = limit.parse() {
                self.import.connection_limit = l;
            }
        }

        // Logging overrides
        if let Ok(level) = std::env::var("FLOWSIFT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("FLOWSIFT_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            import: ImportConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    // The data dir is written out resolved; `~` is not expanded when
    // the config is read back.
    let data_dir = default_data_dir();
    format!(
        r#"# Flowsift Configuration
#
# Environment variables override these settings:
# - FLOWSIFT_DATA_DIR
# - FLOWSIFT_PARSE_THREADS
# - FLOWSIFT_CONNECTION_LIMIT
# - FLOWSIFT_LOG_LEVEL
# - FLOWSIFT_LOG_FORMAT

[import]
# Worker count for the file-indexing stage
indexing_threads = 2

# Worker count for the parse stage
parse_threads = 4

# Connection-count ceiling; a pair reaching it becomes a strobe
connection_limit = 250000

# Keep the historical average-bytes arithmetic.
# Changing this alters the avg_bytes values written for all new imports.
legacy_avg_bytes = true

# Writer pool sizing
writer_workers = 2
writer_queue_capacity = 1024

[storage]
# Directory for the datastore and metadata database files
data_dir = '{data_dir}'

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"

# Optional log file path
# file = "/var/log/flowsift/flowsift.log"
"#
    )
}
