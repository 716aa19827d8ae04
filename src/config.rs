//! Configuration module for the txwatch coordinator
//!
//! This module handles configuration loading from TOML files,
//! environment variables, and provides structured configuration types.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::WatcherError;
use crate::types::Commitment;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Ledger node endpoints
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Confirmation watcher tuning
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Monitoring and metrics
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// JSON-RPC endpoint
    #[serde(default = "default_http_url")]
    pub http_url: String,

    /// PubSub (websocket) endpoint
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_rpc_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Interval between poll-path lookups
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Wall-clock bound from registration to `timed_out`
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Commitment level requested from the ledger
    #[serde(default)]
    pub commitment: Commitment,

    /// Interval between re-broadcasts of a signed payload
    #[serde(default = "default_resubmit_interval_ms")]
    pub resubmit_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Serve Prometheus metrics
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

// Default value functions
fn default_http_url() -> String { "https://api.mainnet-beta.solana.com".to_string() }
fn default_ws_url() -> String { "wss://api.mainnet-beta.solana.com".to_string() }
fn default_rpc_timeout() -> u64 { 30 }
fn default_poll_interval_ms() -> u64 { 2_000 }
fn default_timeout_ms() -> u64 { 120_000 }
fn default_resubmit_interval_ms() -> u64 { 2_000 }
fn default_metrics_port() -> u16 { 9090 }
fn default_true() -> bool { true }

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            http_url: default_http_url(),
            ws_url: default_ws_url(),
            timeout_secs: default_rpc_timeout(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            timeout_ms: default_timeout_ms(),
            commitment: Commitment::default(),
            resubmit_interval_ms: default_resubmit_interval_ms(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: default_true(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn resubmit_interval(&self) -> Duration {
        Duration::from_millis(self.resubmit_interval_ms)
    }

    /// Secondary bound on the poll loop: `ceil(timeout / poll_interval)`
    pub fn max_poll_attempts(&self, timeout: Duration) -> u32 {
        let interval = self.poll_interval_ms.max(1) as u128;
        let attempts = timeout.as_millis().div_ceil(interval);
        u32::try_from(attempts).unwrap_or(u32::MAX)
    }

    pub fn validate(&self) -> Result<(), WatcherError> {
        if self.poll_interval_ms == 0 {
            return Err(WatcherError::Configuration(
                "watcher.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(WatcherError::Configuration(
                "watcher.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.resubmit_interval_ms == 0 {
            return Err(WatcherError::Configuration(
                "watcher.resubmit_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with `.env` and `TXWATCH_*` overrides applied
    pub fn from_file_with_env(path: &str) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `TXWATCH_*` environment variables on top of the loaded values
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("TXWATCH_RPC_URL") {
            self.rpc.http_url = url;
        }
        if let Some(url) = lookup("TXWATCH_WS_URL") {
            self.rpc.ws_url = url;
        }
        if let Some(ms) = lookup("TXWATCH_POLL_INTERVAL_MS") {
            self.watcher.poll_interval_ms = ms
                .parse()
                .with_context(|| format!("TXWATCH_POLL_INTERVAL_MS is not a number: {}", ms))?;
        }
        if let Some(ms) = lookup("TXWATCH_TIMEOUT_MS") {
            self.watcher.timeout_ms = ms
                .parse()
                .with_context(|| format!("TXWATCH_TIMEOUT_MS is not a number: {}", ms))?;
        }
        if let Some(level) = lookup("TXWATCH_COMMITMENT") {
            self.watcher.commitment = level.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), WatcherError> {
        if self.rpc.http_url.is_empty() {
            return Err(WatcherError::Configuration("rpc.http_url is empty".to_string()));
        }
        self.watcher.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.watcher.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.watcher.timeout(), Duration::from_secs(120));
        assert_eq!(config.watcher.commitment, Commitment::Confirmed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_poll_attempts_rounds_up() {
        let watcher = WatcherConfig::default();
        assert_eq!(watcher.max_poll_attempts(Duration::from_secs(120)), 60);
        assert_eq!(watcher.max_poll_attempts(Duration::from_millis(5_000)), 3);
        assert_eq!(watcher.max_poll_attempts(Duration::from_millis(1)), 1);
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut watcher = WatcherConfig::default();
        watcher.poll_interval_ms = 0;
        assert!(matches!(watcher.validate(), Err(WatcherError::Configuration(_))));

        let mut watcher = WatcherConfig::default();
        watcher.timeout_ms = 0;
        assert!(watcher.validate().is_err());
    }

    #[test]
    fn test_from_file_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[rpc]
http_url = "http://127.0.0.1:8899"
ws_url = "ws://127.0.0.1:8900"

[watcher]
timeout_ms = 30000
commitment = "finalized"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.rpc.http_url, "http://127.0.0.1:8899");
        assert_eq!(config.rpc.timeout_secs, 30);
        assert_eq!(config.watcher.timeout_ms, 30_000);
        assert_eq!(config.watcher.poll_interval_ms, 2_000);
        assert_eq!(config.watcher.commitment, Commitment::Finalized);
        assert!(config.monitoring.enable_metrics);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TXWATCH_RPC_URL", "http://rpc.local"),
            ("TXWATCH_TIMEOUT_MS", "45000"),
            ("TXWATCH_COMMITMENT", "processed"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.rpc.http_url, "http://rpc.local");
        assert_eq!(config.watcher.timeout_ms, 45_000);
        assert_eq!(config.watcher.commitment, Commitment::Processed);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = Config::default();
        let result = config.apply_overrides(|key| {
            (key == "TXWATCH_POLL_INTERVAL_MS").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }
}
