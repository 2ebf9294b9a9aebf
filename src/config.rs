//! Configuration for freight-ledger

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default data directory
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("freight-ledger")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the ledger database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// How long a unit of work waits for the write lease before failing
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Days a quoted price stays acceptable
    #[serde(default = "default_quote_validity_days")]
    pub quote_validity_days: i64,

    /// Per-kg rate used when a freight service has no base rate
    #[serde(default = "default_base_rate")]
    pub default_base_rate: String,

    /// Prefix of allocated tracking numbers
    #[serde(default = "default_tracking_prefix")]
    pub tracking_prefix: String,

    /// Prefix of allocated invoice numbers
    #[serde(default = "default_invoice_prefix")]
    pub invoice_prefix: String,

    /// Seconds between stale-quote sweeps in `sweep` mode
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_quote_validity_days() -> i64 {
    7
}

fn default_base_rate() -> String {
    "100".to_string()
}

fn default_tracking_prefix() -> String {
    "FLT".to_string()
}

fn default_invoice_prefix() -> String {
    "INV-".to_string()
}

fn default_sweep_interval() -> u64 {
    60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            lock_timeout_ms: default_lock_timeout_ms(),
            quote_validity_days: default_quote_validity_days(),
            default_base_rate: default_base_rate(),
            tracking_prefix: default_tracking_prefix(),
            invoice_prefix: default_invoice_prefix(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get ledger database path
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("ledger.db")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join("config.toml")
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn quote_validity(&self) -> chrono::Duration {
        chrono::Duration::days(self.quote_validity_days)
    }
}
