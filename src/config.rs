use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    /// Extra `target=level` filter directives
    #[serde(default)]
    pub log_targets: Vec<String>,
    /// PostgreSQL connection URL; in-memory stores are used when absent
    #[serde(default)]
    pub postgres_url: Option<String>,
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Tradable instruments
    #[serde(default)]
    pub instruments: Vec<String>,
    /// Currency every BUY is paid in
    #[serde(default = "default_currency")]
    pub settlement_currency: String,
    #[serde(default)]
    pub saga: SagaConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

fn default_currency() -> String {
    "TRY".to_string()
}

/// Connection pool sizing
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: 20,
            acquire_timeout_ms: 5000,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SagaConfig {
    pub max_retries: i32,
    pub expiry_secs: u64,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            expiry_secs: 300,
        }
    }
}

impl SagaConfig {
    pub fn expiry(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiry_secs as i64)
    }
}

/// Asset Ledger boundary settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LedgerConfig {
    pub call_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 2000,
        }
    }
}

impl LedgerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OutboxConfig {
    pub poll_interval_ms: u64,
    pub batch_size: i64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecoveryConfig {
    pub scan_interval_ms: u64,
    pub batch_size: i64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 5000,
            batch_size: 100,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: "./logs".to_string(),
            log_file: "brokerage.log".to_string(),
            use_json: false,
            rotation: "daily".to_string(),
            log_targets: Vec::new(),
            postgres_url: None,
            database: DatabaseConfig::default(),
            instruments: Vec::new(),
            settlement_currency: default_currency(),
            saga: SagaConfig::default(),
            ledger: LedgerConfig::default(),
            outbox: OutboxConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load(env: &str) -> anyhow::Result<Self> {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path))?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", config_path))
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}
