//! Cluster configuration via `tessera.toml`
//!
//! On first open of a data directory a default `tessera.toml` is created.
//! To change settings, edit the file and restart.

use crate::retry::RetryPolicy;
use crate::router::SessionLimits;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tessera_concurrency::TableConfig;
use tessera_core::{Error, ErrorCode, Result};
use tessera_durability::DurabilityMode;

/// Config file name placed in the cluster data directory.
pub const CONFIG_FILE_NAME: &str = "tessera.toml";

/// Backoff settings for retried requests (`[retry]` section).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// First delay after a retryable failure
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for the doubled delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Attempts for a non-transactional read against an unreachable shard
    /// (0 = until it answers)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

fn default_initial_backoff_ms() -> u64 {
    5
}

fn default_max_backoff_ms() -> u64 {
    200
}

fn default_max_attempts() -> usize {
    10
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Migration settings (`[migration]` section).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Errors a broadcast write may meet when it races a migration
    #[serde(default = "default_race_errors")]
    pub acceptable_race_errors: Vec<ErrorCode>,
}

fn default_race_errors() -> Vec<ErrorCode> {
    vec![
        ErrorCode::StaleConfig,
        ErrorCode::ShardNotFound,
        ErrorCode::Interrupted,
        ErrorCode::LockTimeout,
        ErrorCode::TenantMigrationCommitted,
        ErrorCode::TenantMigrationAborted,
        ErrorCode::ReshardCollectionCommitted,
    ]
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            acceptable_race_errors: default_race_errors(),
        }
    }
}

/// Error codes a broadcast write tolerates when it overlaps a migration
///
/// A shard answering with one of these lost (or is losing) the range; the
/// write is reported as raced instead of failing the whole broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRacePolicy {
    codes: Vec<ErrorCode>,
}

impl MigrationRacePolicy {
    /// Policy accepting exactly `codes`
    pub fn new(codes: Vec<ErrorCode>) -> Self {
        Self { codes }
    }

    /// True if `error` is an acceptable race outcome
    pub fn accepts(&self, error: &Error) -> bool {
        self.codes.contains(&error.code())
    }

    /// Accepted codes
    pub fn codes(&self) -> &[ErrorCode] {
        &self.codes
    }
}

impl Default for MigrationRacePolicy {
    fn default() -> Self {
        Self::new(default_race_errors())
    }
}

/// Cluster configuration loaded from `tessera.toml`.
///
/// # Example
///
/// ```toml
/// durability = "standard"
/// prepare_conflict_timeout_ms = 5000
///
/// [retry]
/// initial_backoff_ms = 5
///
/// [migration]
/// acceptable_race_errors = ["StaleConfig", "LockTimeout"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Durability mode: `"cache"`, `"standard"` or `"always"`.
    #[serde(default = "default_durability_str")]
    pub durability: String,
    /// Longest wait on a prepared transaction's key
    #[serde(default = "default_prepare_conflict_timeout_ms")]
    pub prepare_conflict_timeout_ms: u64,
    /// Default statement deadline when the request carries none
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
    /// In-progress transactions older than this are aborted
    #[serde(default = "default_transaction_lifetime_limit_ms")]
    pub transaction_lifetime_limit_ms: u64,
    /// Idle terminal sessions are forgotten after this long
    #[serde(default = "default_session_retention_ms")]
    pub session_retention_ms: u64,
    /// Largest buffered write set of one transaction
    #[serde(default = "default_max_transaction_bytes")]
    pub max_transaction_bytes: usize,
    /// Buffered bytes per shard before writes are refused
    #[serde(default = "default_cache_pressure_bytes")]
    pub cache_pressure_bytes: usize,
    /// How long a migration waits for prepared transactions to drain
    #[serde(default = "default_migration_blocking_timeout_ms")]
    pub migration_blocking_timeout_ms: u64,
    /// Background worker threads
    #[serde(default = "default_background_threads")]
    pub background_threads: usize,
    /// Retry backoff
    #[serde(default)]
    pub retry: RetryConfig,
    /// Migration settings
    #[serde(default)]
    pub migration: MigrationConfig,
}

fn default_durability_str() -> String {
    "standard".to_string()
}

fn default_prepare_conflict_timeout_ms() -> u64 {
    5_000
}

fn default_statement_timeout_ms() -> u64 {
    30_000
}

fn default_transaction_lifetime_limit_ms() -> u64 {
    60_000
}

fn default_session_retention_ms() -> u64 {
    30 * 60 * 1000
}

fn default_max_transaction_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_cache_pressure_bytes() -> usize {
    256 * 1024 * 1024
}

fn default_migration_blocking_timeout_ms() -> u64 {
    10_000
}

fn default_background_threads() -> usize {
    2
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            durability: default_durability_str(),
            prepare_conflict_timeout_ms: default_prepare_conflict_timeout_ms(),
            statement_timeout_ms: default_statement_timeout_ms(),
            transaction_lifetime_limit_ms: default_transaction_lifetime_limit_ms(),
            session_retention_ms: default_session_retention_ms(),
            max_transaction_bytes: default_max_transaction_bytes(),
            cache_pressure_bytes: default_cache_pressure_bytes(),
            migration_blocking_timeout_ms: default_migration_blocking_timeout_ms(),
            background_threads: default_background_threads(),
            retry: RetryConfig::default(),
            migration: MigrationConfig::default(),
        }
    }
}

impl ClusterConfig {
    /// Parse the durability string into a `DurabilityMode`.
    ///
    /// # Errors
    ///
    /// Returns `BadValue` if the string is not a known mode.
    pub fn durability_mode(&self) -> Result<DurabilityMode> {
        DurabilityMode::parse(&self.durability).ok_or_else(|| {
            Error::BadValue(format!(
                "Invalid durability mode '{}' in {}. Expected \"cache\", \"standard\" or \"always\".",
                self.durability, CONFIG_FILE_NAME
            ))
        })
    }

    /// Limits for each shard's transaction table
    pub fn table_config(&self) -> TableConfig {
        TableConfig {
            prepare_conflict_timeout: Duration::from_millis(self.prepare_conflict_timeout_ms),
            transaction_lifetime_limit: Duration::from_millis(self.transaction_lifetime_limit_ms),
            session_retention: Duration::from_millis(self.session_retention_ms),
            max_transaction_bytes: self.max_transaction_bytes,
            cache_pressure_bytes: self.cache_pressure_bytes,
        }
    }

    /// Session bounds enforced by the router's reaper
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            transaction_lifetime_limit: Duration::from_millis(self.transaction_lifetime_limit_ms),
            session_retention: Duration::from_millis(self.session_retention_ms),
        }
    }

    /// Backoff used for retryable requests
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry.initial_backoff_ms),
            Duration::from_millis(self.retry.max_backoff_ms),
            self.retry.max_attempts,
        )
    }

    /// Migration race errors tolerated by broadcast writes
    pub fn race_policy(&self) -> MigrationRacePolicy {
        MigrationRacePolicy::new(self.migration.acceptable_race_errors.clone())
    }

    /// Default statement deadline
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }

    /// Bound on a migration's wait to enter its critical section
    pub fn migration_blocking_timeout(&self) -> Duration {
        Duration::from_millis(self.migration_blocking_timeout_ms)
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Tessera cluster configuration
#
# Durability mode: "standard" (default), "always" or "cache"
#   "standard" = periodic fsync (~100ms), may lose last interval on crash
#   "always"   = fsync every log append, zero data loss
#   "cache"    = no log files, everything is lost on restart
durability = "standard"

# Longest a read or write waits on a prepared transaction (ms)
prepare_conflict_timeout_ms = 5000

# Statement deadline when the request carries no maxTimeMS (ms)
statement_timeout_ms = 30000

# In-progress transactions older than this are aborted by the reaper (ms)
transaction_lifetime_limit_ms = 60000

# Idle finished sessions are forgotten after this long (ms)
session_retention_ms = 1800000

# Largest buffered write set of one transaction (bytes)
max_transaction_bytes = 16777216

# Buffered bytes per shard before new writes are refused (bytes)
cache_pressure_bytes = 268435456

# How long a migration waits for prepared transactions to drain (ms)
migration_blocking_timeout_ms = 10000

# Background worker threads (reaper, coordinator recovery)
background_threads = 2

[retry]
initial_backoff_ms = 5
max_backoff_ms = 200
# Attempts for a plain read against an unreachable shard (0 = until it answers).
# Prepare and decision delivery always retry until the coordinator steps down.
max_attempts = 10

[migration]
# Errors a broadcast write may meet when it races a migration
acceptable_race_errors = [
    "StaleConfig",
    "ShardNotFound",
    "Interrupted",
    "LockTimeout",
    "TenantMigrationCommitted",
    "TenantMigrationAborted",
    "ReshardCollectionCommitted",
]
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Io(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: ClusterConfig = toml::from_str(&content).map_err(|e| {
            Error::BadValue(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.durability_mode()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::Io(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    /// Load `tessera.toml` from `dir`, creating it with defaults first
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(CONFIG_FILE_NAME);
        Self::write_default_if_missing(&path)?;
        Self::from_file(&path)
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Serialization(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            Error::Io(format!(
                "Failed to write config file '{}': {}",
                path.display(),
                e
            ))
        })
    }
}
