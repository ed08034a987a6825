//! SDK configuration
//!
//! Loaded from TOML. Every section and field is optional; missing values fall
//! back to the defaults below.
//!
//! ```toml
//! [court]
//! address = "0xc0ffee"
//! arbitrable_contracts = ["0xdeal"]
//!
//! [store]
//! base_url = "https://store.example.com/profiles"
//! timeout_secs = 30
//!
//! [watch]
//! poll_interval_ms = 1000
//! overlap_blocks = 0
//!
//! [queue]
//! partition = "per_document"
//! ```

use crate::error::{Result, SdkError};
use arbiter_store_client::{QueuePartition, StoreConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SdkConfig {
    #[serde(default)]
    pub court: CourtConfig,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub watch: WatchSection,
    #[serde(default)]
    pub queue: QueueSection,
}

/// The arbitrator contract and the arbitrable contracts to inspect
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourtConfig {
    /// Arbitrator contract address. Required by the notification service.
    #[serde(default)]
    pub address: String,

    /// Arbitrable contracts checked for pending arbitration fees
    #[serde(default)]
    pub arbitrable_contracts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// Base URI of the profile store
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Optional bearer token
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSection {
    /// Delay between watch ticks in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Blocks below the watermark to re-scan on every tick
    #[serde(default)]
    pub overlap_blocks: u64,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            overlap_blocks: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSection {
    #[serde(default)]
    pub partition: QueuePartition,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_timeout_secs() -> u64 { 30 }
fn default_poll_interval() -> u64 { 1000 }

impl SdkConfig {
    /// Load and validate a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SdkError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML config
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SdkConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.base_url.trim().is_empty() {
            return Err(SdkError::Config("store.base_url must not be empty".into()));
        }
        if self.store.timeout_secs == 0 {
            return Err(SdkError::Config("store.timeout_secs must be positive".into()));
        }
        if self.watch.poll_interval_ms == 0 {
            return Err(SdkError::Config("watch.poll_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            base_url: self.store.base_url.clone(),
            api_key: self.store.api_key.clone(),
            timeout_secs: self.store.timeout_secs,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.watch.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = SdkConfig::from_toml_str("").unwrap();
        assert_eq!(config.store.base_url, "http://localhost:8080");
        assert_eq!(config.store.timeout_secs, 30);
        assert_eq!(config.watch.poll_interval_ms, 1000);
        assert_eq!(config.watch.overlap_blocks, 0);
        assert_eq!(config.queue.partition, QueuePartition::PerDocument);
        assert!(config.court.arbitrable_contracts.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = SdkConfig::from_toml_str(
            r#"
[court]
address = "0xcourt"
arbitrable_contracts = ["0xdeal", "0xother"]

[store]
base_url = "https://store.test/profiles"
timeout_secs = 5
api_key = "secret"

[watch]
poll_interval_ms = 250
overlap_blocks = 12

[queue]
partition = "global"
"#,
        )
        .unwrap();

        assert_eq!(config.court.address, "0xcourt");
        assert_eq!(config.court.arbitrable_contracts.len(), 2);
        assert_eq!(config.store_config().api_key.as_deref(), Some("secret"));
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.watch.overlap_blocks, 12);
        assert_eq!(config.queue.partition, QueuePartition::Global);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = SdkConfig::from_toml_str("[watch]\npoll_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, SdkError::Config(_)));

        let err = SdkConfig::from_toml_str("[queue]\npartition = \"sharded\"\n").unwrap_err();
        assert!(matches!(err, SdkError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[store]\nbase_url = \"http://127.0.0.1:9000\"").unwrap();

        let config = SdkConfig::from_file(file.path()).unwrap();
        assert_eq!(config.store.base_url, "http://127.0.0.1:9000");

        let missing = SdkConfig::from_file("/nonexistent/arbiter.toml").unwrap_err();
        assert!(matches!(missing, SdkError::Config(_)));
    }
}
