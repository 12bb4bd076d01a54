//! Daemon configuration.
//!
//! Loaded from a TOML file; every field has a default so a missing file
//! yields a runnable configuration. Durations are written in human form
//! (`10s`, `5m`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from configuration loading.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file did not parse as TOML.
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Directory (exchange) access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Base URL, e.g. `https://exchange.example/v1`.
    #[serde(default = "default_exchange_url")]
    pub url: String,
    /// Our organization.
    #[serde(default = "default_org")]
    pub org: String,
    /// Our id within the organization.
    #[serde(default)]
    pub id: String,
    /// Our directory token.
    #[serde(default)]
    pub token: String,
    /// How often mailboxes are drained.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// TTL for posted protocol messages, seconds.
    #[serde(default = "default_message_ttl")]
    pub message_ttl: u64,
    /// Fixed backoff between retries of transport failures.
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Transport retries before a call is surfaced as failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Anchor stream access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorConfig {
    /// Base URL of the anchor service; empty disables anchoring.
    #[serde(default)]
    pub url: String,
    /// How often the stream is polled.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Bounded retries for anchor writes.
    #[serde(default = "default_anchor_write_retries")]
    pub write_retries: u32,
}

/// Consumer (agbot) behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgbotConfig {
    /// Whether this process runs the consumer worker.
    #[serde(default)]
    pub enabled: bool,
    /// Seconds between directory searches per policy.
    #[serde(default = "default_search_interval", with = "humantime_serde")]
    pub search_interval: Duration,
    /// Minimum delay before re-attempting a failed candidate.
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
    /// Nodes silent for longer than this are skipped; `0` disables the
    /// filter.
    #[serde(default = "default_stale_seconds")]
    pub stale_seconds: u64,
    /// Seconds a proposal may await a reply.
    #[serde(default = "default_proposal_timeout", with = "humantime_serde")]
    pub proposal_timeout: Duration,
    /// Seconds a replied agreement may await its anchor confirmation.
    #[serde(default = "default_finalize_timeout", with = "humantime_serde")]
    pub finalize_timeout: Duration,
}

/// Producer (node) behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Whether this process runs the producer worker.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between directory heartbeats.
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Seconds a confirmed agreement may take to start executing.
    #[serde(default = "default_workload_start_timeout", with = "humantime_serde")]
    pub workload_start_timeout: Duration,
    /// Seconds a replied agreement may await its anchor confirmation.
    #[serde(default = "default_finalize_timeout", with = "humantime_serde")]
    pub finalize_timeout: Duration,
}

/// Governance loop behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Verification tick.
    #[serde(default = "default_governance_tick", with = "humantime_serde")]
    pub tick: Duration,
}

/// Local configuration API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Listen address, e.g. `127.0.0.1:8510`.
    #[serde(default = "default_api_listen")]
    pub listen: String,
}

/// Embedded store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the database and key material.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory access.
    pub exchange: ExchangeConfig,
    /// Anchor access.
    pub anchor: AnchorConfig,
    /// Consumer worker.
    pub agbot: AgbotConfig,
    /// Producer worker.
    pub node: NodeConfig,
    /// Governance loop.
    pub governance: GovernanceConfig,
    /// Local REST API.
    pub api: ApiConfig,
    /// Embedded store.
    pub store: StoreConfig,
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] when the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Our full directory id, `org/id` form.
    #[must_use]
    pub fn party_id(&self) -> String {
        format!("{}/{}", self.exchange.org, self.exchange.id)
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            url: default_exchange_url(),
            org: default_org(),
            id: String::new(),
            token: String::new(),
            poll_interval: default_poll_interval(),
            message_ttl: default_message_ttl(),
            retry_backoff: default_retry_backoff(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            poll_interval: default_poll_interval(),
            write_retries: default_anchor_write_retries(),
        }
    }
}

impl Default for AgbotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            search_interval: default_search_interval(),
            retry_interval: default_retry_interval(),
            stale_seconds: default_stale_seconds(),
            proposal_timeout: default_proposal_timeout(),
            finalize_timeout: default_finalize_timeout(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_interval: default_heartbeat_interval(),
            workload_start_timeout: default_workload_start_timeout(),
            finalize_timeout: default_finalize_timeout(),
        }
    }
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            tick: default_governance_tick(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_api_listen(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_exchange_url() -> String {
    "http://127.0.0.1:8080/v1".to_string()
}

fn default_org() -> String {
    "public".to_string()
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

const fn default_message_ttl() -> u64 {
    180
}

const fn default_retry_backoff() -> Duration {
    Duration::from_secs(10)
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_anchor_write_retries() -> u32 {
    3
}

const fn default_search_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_retry_interval() -> Duration {
    Duration::from_secs(120)
}

const fn default_stale_seconds() -> u64 {
    1800
}

const fn default_proposal_timeout() -> Duration {
    Duration::from_secs(120)
}

const fn default_finalize_timeout() -> Duration {
    Duration::from_secs(300)
}

const fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(60)
}

const fn default_workload_start_timeout() -> Duration {
    Duration::from_secs(600)
}

const fn default_governance_tick() -> Duration {
    Duration::from_secs(10)
}

fn default_api_listen() -> String {
    "127.0.0.1:8510".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/accord")
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_runnable() {
        let cfg = Config::default();
        assert!(cfg.node.enabled);
        assert!(!cfg.agbot.enabled);
        assert_eq!(cfg.governance.tick, Duration::from_secs(10));
        assert_eq!(cfg.exchange.retry_backoff, Duration::from_secs(10));
    }

    #[test]
    fn test_parse_partial_file() {
        let text = r#"
            [exchange]
            url = "https://exchange.example/v1"
            org = "myorg"
            id = "agbot1"
            token = "secret"
            poll_interval = "5s"

            [agbot]
            enabled = true
            stale_seconds = 0
        "#;
        let cfg: Config = toml::from_str(text).unwrap();
        assert_eq!(cfg.exchange.org, "myorg");
        assert_eq!(cfg.party_id(), "myorg/agbot1");
        assert_eq!(cfg.exchange.poll_interval, Duration::from_secs(5));
        assert!(cfg.agbot.enabled);
        assert_eq!(cfg.agbot.stale_seconds, 0);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.api.listen, "127.0.0.1:8510");
    }
}
