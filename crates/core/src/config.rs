//! membersys configuration
//!
//! Loaded from a YAML file. The `database.backend` tag selects exactly one
//! backend; the remaining keys are that backend's connection parameters.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembersysConfig {
    /// Which backend to use, and how to reach it
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend selection; the two variants are mutually exclusive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum DatabaseConfig {
    WideColumn(WideColumnConfig),
    Relational(RelationalConfig),
}

/// Read consistency level for wide-column reads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Consistency {
    /// A single replica answers
    #[default]
    One,
    /// A majority of replicas answer
    Quorum,
}

/// Physical engine behind the wide-column backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WideColumnEngineKind {
    /// Cassandra / ScyllaDB cluster (requires the `cassandra` feature)
    #[default]
    Cassandra,
    /// Process-local engine, for tests and demos
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WideColumnConfig {
    #[serde(default)]
    pub engine: WideColumnEngineKind,

    /// Contact points, `host:port`
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default = "default_keyspace")]
    pub keyspace: String,

    /// Replication factor used when the schema setup creates the keyspace
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,

    /// Per-call timeout (milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Consistency of plain listings; point reads feeding a write always use quorum
    #[serde(default)]
    pub listing_consistency: Consistency,

    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationalConfig {
    /// SQLite database file
    pub path: PathBuf,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// How long SQLite waits on a locked database (milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Per-call timeout (milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    pub retry: Option<RetryConfig>,
}

/// Transient failure retry; exponential backoff with a bounded attempt count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_keyspace() -> String {
    "sfmembersys".to_string()
}

fn default_replication_factor() -> u32 {
    3
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_pool_size() -> u32 {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl RetryConfig {
    /// Three attempts backing off between a tenth and half of the timeout
    pub fn for_timeout(timeout: Duration) -> Self {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        Self {
            max_attempts: 3,
            min_backoff_ms: (timeout_ms / 10).max(1),
            max_backoff_ms: (timeout_ms / 2).max(1),
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            min_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let ms = self.min_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

impl WideColumnConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryConfig {
        self.retry.unwrap_or_else(|| RetryConfig::for_timeout(self.timeout()))
    }

    /// In-memory engine configuration
    pub fn memory() -> Self {
        Self {
            engine: WideColumnEngineKind::Memory,
            hosts: Vec::new(),
            keyspace: default_keyspace(),
            replication_factor: default_replication_factor(),
            timeout_ms: default_timeout_ms(),
            listing_consistency: Consistency::One,
            retry: None,
        }
    }
}

impl RelationalConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool_size: default_pool_size(),
            busy_timeout_ms: default_timeout_ms(),
            timeout_ms: default_timeout_ms(),
            retry: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryConfig {
        self.retry.unwrap_or_else(|| RetryConfig::for_timeout(self.timeout()))
    }
}

impl DatabaseConfig {
    pub fn backend_name(&self) -> &'static str {
        match self {
            DatabaseConfig::WideColumn(_) => "wide_column",
            DatabaseConfig::Relational(_) => "relational",
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            DatabaseConfig::WideColumn(wc) => {
                if wc.engine == WideColumnEngineKind::Cassandra && wc.hosts.is_empty() {
                    return Err(ConfigError::Invalid(
                        "wide_column: at least one host is required".to_string(),
                    ));
                }
                if wc.keyspace.trim().is_empty() {
                    return Err(ConfigError::Invalid("wide_column: keyspace is empty".to_string()));
                }
                if !wc.keyspace.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(ConfigError::Invalid(format!(
                        "wide_column: keyspace {:?} is not a plain identifier",
                        wc.keyspace
                    )));
                }
                if wc.replication_factor == 0 {
                    return Err(ConfigError::Invalid(
                        "wide_column: replication_factor must be > 0".to_string(),
                    ));
                }
                if wc.timeout_ms == 0 {
                    return Err(ConfigError::Invalid("wide_column: timeout_ms must be > 0".to_string()));
                }
                validate_retry(wc.retry)
            }
            DatabaseConfig::Relational(rel) => {
                if rel.path.as_os_str().is_empty() {
                    return Err(ConfigError::Invalid("relational: path is empty".to_string()));
                }
                if rel.pool_size == 0 {
                    return Err(ConfigError::Invalid("relational: pool_size must be > 0".to_string()));
                }
                if rel.timeout_ms == 0 {
                    return Err(ConfigError::Invalid("relational: timeout_ms must be > 0".to_string()));
                }
                validate_retry(rel.retry)
            }
        }
    }
}

fn validate_retry(retry: Option<RetryConfig>) -> Result<(), ConfigError> {
    match retry {
        Some(r) if r.max_attempts == 0 => Err(ConfigError::Invalid(
            "retry.max_attempts must be at least 1".to_string(),
        )),
        Some(r) if r.min_backoff_ms > r.max_backoff_ms => Err(ConfigError::Invalid(
            "retry.min_backoff_ms exceeds retry.max_backoff_ms".to_string(),
        )),
        _ => Ok(()),
    }
}

impl MembersysConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: MembersysConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml_str(&text)?;
        debug!(path = %path.display(), backend = config.database.backend_name(), "loaded config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()
    }
}
