use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::ledger::{Address, LedgerModules, RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } => "CONFIG_READ",
            ConfigError::Parse { .. } => "CONFIG_PARSE",
            ConfigError::Invalid(_) => "CONFIG_INVALID",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub payments: PaymentsConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
}

/// Ledger gateway connection
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LedgerConfig {
    pub rpc_url: String,
    /// Account whose operation history the indexer replays
    pub tracked_account: String,
    pub request_timeout_ms: u64,
    /// Expiration offset applied to signed operations
    pub operation_ttl_secs: i64,
    pub modules: LedgerModules,
    pub retry: RetryPolicy,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8080/rpc".to_string(),
            tracked_account: "0x1".to_string(),
            request_timeout_ms: 10_000,
            operation_ttl_secs: 60,
            modules: LedgerModules::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// PostgreSQL mirror store. Without a URL the in-memory store is used.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    /// Run `migrations/0001_mirror.sql` at startup
    pub init_schema: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            init_schema: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PaymentsConfig {
    pub tick_interval_ms: u64,
    /// Claims in flight at once within a tick
    pub batch_size: usize,
    /// 0 claims on every tick
    pub min_claim_interval_ms: u64,
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 60_000,
            batch_size: 5,
            min_claim_interval_ms: 0,
        }
    }
}

impl PaymentsConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct IndexerConfig {
    pub tick_interval_ms: u64,
    pub page_size: usize,
    /// Re-read canonical records through view functions before mirroring
    pub refresh_from_views: bool,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 300_000,
            page_size: 100,
            refresh_from_views: true,
        }
    }
}

impl IndexerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl AppConfig {
    /// Load `config/{env}.yaml`
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        Self::from_file(format!("config/{}.yaml", env))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tracked_account()?;
        if self.payments.tick_interval_ms == 0 || self.indexer.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick intervals must be positive".to_string()));
        }
        if self.payments.batch_size == 0 {
            return Err(ConfigError::Invalid("payments.batch_size must be positive".to_string()));
        }
        if self.indexer.page_size == 0 {
            return Err(ConfigError::Invalid("indexer.page_size must be positive".to_string()));
        }
        Ok(())
    }

    pub fn tracked_account(&self) -> Result<Address, ConfigError> {
        Address::parse(&self.ledger.tracked_account).map_err(|e| {
            ConfigError::Invalid(format!(
                "ledger.tracked_account {:?}: {}",
                self.ledger.tracked_account, e
            ))
        })
    }
}
