//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::index::IndexerSpec;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub indexing: IndexingConfig,

    #[serde(default)]
    pub io: IoConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage location configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("apmstore").to_string_lossy().to_string())
        .unwrap_or_else(|| "./apmstore_data".to_string())
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Indexing tree configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IndexingConfig {
    #[serde(default = "default_maximum_tree_size")]
    pub maximum_indexing_tree_size: u64,

    #[serde(default = "default_check_interval")]
    pub tree_check_interval_secs: u64,

    #[serde(default = "default_index_file_name")]
    pub index_file_name: String,

    #[serde(default = "default_finish_wait")]
    pub finish_wait_ms: u64,

    #[serde(default = "default_finish_wait_iterations")]
    pub finish_wait_iterations: u32,

    /// Ordered branch indexers, root first
    #[serde(default = "IndexerSpec::default_chain")]
    pub indexers: Vec<IndexerSpec>,
}

fn default_maximum_tree_size() -> u64 {
    20 * 1024 * 1024 // 20 MB
}

fn default_check_interval() -> u64 {
    30
}

fn default_index_file_name() -> String {
    "indexing_tree".to_string()
}

fn default_finish_wait() -> u64 {
    1000
}

fn default_finish_wait_iterations() -> u32 {
    30
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            maximum_indexing_tree_size: default_maximum_tree_size(),
            tree_check_interval_secs: default_check_interval(),
            index_file_name: default_index_file_name(),
            finish_wait_ms: default_finish_wait(),
            finish_wait_iterations: default_finish_wait_iterations(),
            indexers: IndexerSpec::default_chain(),
        }
    }
}

/// Buffer pool and channel I/O configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IoConfig {
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_read_ahead")]
    pub read_ahead_depth: usize,
}

fn default_buffer_count() -> usize {
    64
}

fn default_buffer_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_read_ahead() -> usize {
    2
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            buffer_count: default_buffer_count(),
            buffer_size: default_buffer_size(),
            read_ahead_depth: default_read_ahead(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
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
        }
    }
}

impl LoggingConfig {
    /// Install the global tracing subscriber
    ///
    /// `RUST_LOG` takes precedence over the configured level. Returns an
    /// error if a subscriber is already installed.
    pub fn init(&self) -> Result<(), ConfigError> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .map_err(|e| ConfigError::Invalid(format!("log level {:?}: {}", self.level, e)))?;

        let registry = tracing_subscriber::registry().with(filter);
        let result = match self.format.as_str() {
            "json" => registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init(),
            _ => registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init(),
        };

        result.map_err(|e| ConfigError::Invalid(format!("logging already initialized: {}", e)))
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

        config.validate()?;
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
        config.validate()?;
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        // Try default config locations
        let config_paths = [
            dirs::config_dir().map(|p| p.join("apmstore").join("config.toml")),
            Some(PathBuf::from("/etc/apmstore/config.toml")),
            Some(PathBuf::from("./apmstore.toml")),
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

        // Fall back to environment-only config
        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Check values that would make the engine unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.io.buffer_count == 0 {
            return Err(ConfigError::Invalid("io.buffer_count must be > 0".into()));
        }
        if self.io.buffer_size == 0 {
            return Err(ConfigError::Invalid("io.buffer_size must be > 0".into()));
        }
        if self.indexing.index_file_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "indexing.index_file_name must not be empty".into(),
            ));
        }
        if self.indexing.tree_check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "indexing.tree_check_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        // Storage overrides
        if let Ok(data_dir) = std::env::var("APMSTORE_DATA_DIR") {
            self.storage.data_dir = data_dir;
        }

        // Indexing overrides
        if let Ok(size) = std::env::var("APMSTORE_MAX_TREE_SIZE") {
            if let Ok(s) = size.parse() {
                self.indexing.maximum_indexing_tree_size = s;
            }
        }

        // I/O overrides
        if let Ok(count) = std::env::var("APMSTORE_BUFFER_COUNT") {
            if let Ok(c) = count.parse() {
                self.io.buffer_count = c;
            }
        }

        // Logging overrides
        if let Ok(level) = std::env::var("APMSTORE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("APMSTORE_LOG_FORMAT") {
            self.logging.format = format;
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

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# apmstore Configuration
#
# Environment variables override these settings:
# - APMSTORE_DATA_DIR
# - APMSTORE_MAX_TREE_SIZE
# - APMSTORE_BUFFER_COUNT
# - APMSTORE_LOG_LEVEL
# - APMSTORE_LOG_FORMAT

[storage]
# Directory for channel files and the persisted indexing tree
data_dir = "~/.local/share/apmstore"

[indexing]
# Estimated tree size (bytes) at which the tree is saved
maximum_indexing_tree_size = 20971520

# How often the tree size is checked (seconds)
tree_check_interval_secs = 30

# The tree is saved as <data_dir>/<index_file_name>.index
index_file_name = "indexing_tree"

# Bounded wait for in-flight writes on shutdown
finish_wait_ms = 1000
finish_wait_iterations = 30

# Branch indexers from the root down
[[indexing.indexers]]
type = "platform_ident"

[[indexing.indexers]]
type = "object_type"
groups = []

[[indexing.indexers]]
type = "sensor_type_ident"

[[indexing.indexers]]
type = "method_ident"

[[indexing.indexers]]
type = "timestamp"
bucket_millis = 3600000

[io]
# Number of pooled buffers
buffer_count = 64

# Size of each pooled buffer (bytes)
buffer_size = 65536

# Reads kept in flight by descriptor streams
read_ahead_depth = 2

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
