//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub exemplars: ExemplarConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Query engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_concurrent_queries")]
    pub max_concurrent_queries: usize,

    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_samples")]
    pub max_samples: usize,

    #[serde(default = "default_lookback_delta")]
    pub lookback_delta_ms: u64,

    #[serde(default = "default_evaluation_interval")]
    pub default_evaluation_interval_ms: u64,

    /// Directory of the active query log; admission is unbounded without it
    #[serde(default = "default_active_query_dir")]
    pub active_query_dir: Option<String>,

    /// JSON-lines file receiving one record per executed query
    #[serde(default)]
    pub query_log_file: Option<String>,
}

fn default_max_concurrent_queries() -> usize {
    20
}

fn default_timeout() -> u64 {
    120_000 // 2 minutes
}

fn default_max_samples() -> usize {
    50_000_000
}

fn default_lookback_delta() -> u64 {
    300_000 // 5 minutes
}

fn default_evaluation_interval() -> u64 {
    60_000 // 1 minute
}

fn default_active_query_dir() -> Option<String> {
    Some(
        dirs::data_local_dir()
            .map(|p| p.join("promql-engine").to_string_lossy().to_string())
            .unwrap_or_else(|| "./promql_data".to_string()),
    )
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_queries: default_max_concurrent_queries(),
            timeout_ms: default_timeout(),
            max_samples: default_max_samples(),
            lookback_delta_ms: default_lookback_delta(),
            default_evaluation_interval_ms: default_evaluation_interval(),
            active_query_dir: default_active_query_dir(),
            query_log_file: None,
        }
    }
}

/// Exemplar store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExemplarConfig {
    #[serde(default = "default_max_exemplars")]
    pub max_exemplars: usize,
}

fn default_max_exemplars() -> usize {
    100_000
}

impl Default for ExemplarConfig {
    fn default() -> Self {
        Self {
            max_exemplars: default_max_exemplars(),
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

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Parse an environment variable, ignoring it when it does not parse
fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Empty values switch an optional path off
fn env_path(name: &str) -> Option<Option<String>> {
    std::env::var(name)
        .ok()
        .map(|v| if v.is_empty() { None } else { Some(v) })
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
            dirs::config_dir().map(|p| p.join("promql-engine").join("config.toml")),
            Some(PathBuf::from("/etc/promql-engine/config.toml")),
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

        // Fall back to environment-only config
        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        // Engine overrides
        if let Some(n) = env_parse("PROMQL_MAX_CONCURRENCY") {
            self.engine.max_concurrent_queries = n;
        }
        if let Some(ms) = env_parse("PROMQL_QUERY_TIMEOUT_MS") {
            self.engine.timeout_ms = ms;
        }
        if let Some(n) = env_parse("PROMQL_MAX_SAMPLES") {
            self.engine.max_samples = n;
        }
        if let Some(ms) = env_parse("PROMQL_LOOKBACK_DELTA_MS") {
            self.engine.lookback_delta_ms = ms;
        }
        if let Some(dir) = env_path("PROMQL_ACTIVE_QUERY_DIR") {
            self.engine.active_query_dir = dir;
        }
        if let Some(file) = env_path("PROMQL_QUERY_LOG_FILE") {
            self.engine.query_log_file = file;
        }

        // Exemplar overrides
        if let Some(n) = env_parse("PROMQL_MAX_EXEMPLARS") {
            self.exemplars.max_exemplars = n;
        }

        // Logging overrides
        if let Ok(level) = std::env::var("PROMQL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("PROMQL_LOG_FORMAT") {
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
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# PromQL Engine Configuration
#
# Environment variables override these settings:
# - PROMQL_MAX_CONCURRENCY
# - PROMQL_QUERY_TIMEOUT_MS
# - PROMQL_MAX_SAMPLES
# - PROMQL_LOOKBACK_DELTA_MS
# - PROMQL_ACTIVE_QUERY_DIR (empty disables the tracker)
# - PROMQL_QUERY_LOG_FILE
# - PROMQL_MAX_EXEMPLARS
# - PROMQL_LOG_LEVEL
# - PROMQL_LOG_FORMAT

[engine]
# Maximum number of queries evaluated at the same time
max_concurrent_queries = 20

# Per-query timeout (ms)
timeout_ms = 120000

# Maximum number of samples a single query may hold in memory
max_samples = 50000000

# How far back an instant selector looks for a sample (ms)
lookback_delta_ms = 300000

# Subquery step used when none is given (ms)
default_evaluation_interval_ms = 60000

# Directory for the active query log
active_query_dir = "~/.local/share/promql-engine"

# Optional JSON-lines file with one record per executed query
# query_log_file = "/var/log/promql-engine/queries.log"

[exemplars]
# Capacity of the circular exemplar buffer
max_exemplars = 100000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"

# Optional log file path
# file = "/var/log/promql-engine/engine.log"
"#
    .to_string()
}
