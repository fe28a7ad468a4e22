//! Configuration system for Lookout.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $LOOKOUT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/lookout/config.toml
//!   3. ~/.config/lookout/config.toml
//!
//! Durations are stored as plain integers with the unit in the field name
//! so the file stays readable.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::message::PROTOCOL_VERSION;
use crate::wire::Network;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LookoutConfig {
    pub network: NetworkConfig,
    pub manager: ManagerSettings,
    pub peer: PeerSettings,
    pub repository: RepositorySettings,
    pub tracker: TrackerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Which network to crawl. Selects magic, default port and DNS seeds.
    pub network: Network,
    /// TCP port for inbound connections. 0 = OS-assigned.
    pub listen_port: u16,
    /// Addresses to listen on. Empty = every non-loopback IPv4 interface.
    pub listen_addrs: Vec<IpAddr>,
    /// Disable inbound connections entirely.
    pub listen: bool,
    /// User agent advertised in `version`.
    pub user_agent: String,
    /// Highest protocol version advertised in `version`.
    pub protocol_version: u32,
    /// Service bits advertised in `version`.
    pub services: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerSettings {
    /// Outbound connection attempts per second.
    pub connection_rate: u32,
    /// Ceiling on simultaneously admitted peers.
    pub max_connected: usize,
    /// How often to check whether the address book wants a poll.
    pub poll_interval_secs: u64,
    /// How often to log peer counters.
    pub stats_interval_secs: u64,
    /// Candidates drawn from the address book per outbound admission.
    pub candidate_retries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerSettings {
    pub dial_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Send a ping after this long without outbound traffic.
    pub ping_interval_secs: u64,
    /// Disconnect after this long without inbound traffic.
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositorySettings {
    /// Where the address book is persisted.
    pub backup_path: PathBuf,
    pub backup_interval_secs: u64,
    pub bootstrap_interval_secs: u64,
    /// Consecutive failed attempts after which a node is no longer retrieved.
    pub max_attempts: u64,
    /// Minimum time between two attempts on the same node.
    pub cooldown_secs: u64,
    /// Minimum time after a success before a node is retrieved again.
    pub success_recency_secs: u64,
    /// Upper bound on tracked nodes. 0 = unbounded.
    pub max_nodes: usize,
    /// Below this many eligible candidates the manager polls peers for addresses.
    pub low_watermark: usize,
    /// Seed hostnames. Empty = the network's built-in seeds.
    pub seeds: Vec<String>,
    /// Deadline for resolving one seed.
    pub dns_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    /// Number of independently locked shards per dedup map.
    pub shards: usize,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for LookoutConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            manager: ManagerSettings::default(),
            peer: PeerSettings::default(),
            repository: RepositorySettings::default(),
            tracker: TrackerSettings::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            listen_port: 18333,
            listen_addrs: Vec::new(),
            listen: true,
            user_agent: format!("/lookout:{}/", env!("CARGO_PKG_VERSION")),
            protocol_version: PROTOCOL_VERSION,
            services: 0,
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            connection_rate: 20,
            max_connected: 100,
            poll_interval_secs: 15,
            stats_interval_secs: 5,
            candidate_retries: 128,
        }
    }
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            dial_timeout_ms: 1_000,
            handshake_timeout_ms: 10_000,
            write_timeout_ms: 1_000,
            read_timeout_ms: 1_000,
            ping_interval_secs: 60,
            idle_timeout_secs: 180,
        }
    }
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            backup_path: data_dir().join("nodes.json"),
            backup_interval_secs: 90,
            bootstrap_interval_secs: 30 * 60,
            max_attempts: 3,
            cooldown_secs: 5 * 60,
            success_recency_secs: 15 * 60,
            max_nodes: 65_536,
            low_watermark: 64,
            seeds: Vec::new(),
            dns_timeout_secs: 10,
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self { shards: 32 }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("lookout")
}

/// Directory for persistent state (the address book).
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("lookout")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("{0} must be non-zero")]
    ZeroInterval(&'static str),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl LookoutConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            LookoutConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reject timer periods of zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("manager.poll_interval_secs", self.manager.poll_interval_secs),
            ("manager.stats_interval_secs", self.manager.stats_interval_secs),
            ("repository.backup_interval_secs", self.repository.backup_interval_secs),
            ("repository.bootstrap_interval_secs", self.repository.bootstrap_interval_secs),
        ];
        match periods.into_iter().find(|(_, secs)| *secs == 0) {
            Some((name, _)) => Err(ConfigError::ZeroInterval(name)),
            None => Ok(()),
        }
    }

    /// Parse a specific file without env overrides.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("LOOKOUT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&LookoutConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply LOOKOUT_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("LOOKOUT_NETWORK__NETWORK") {
            match v.as_str() {
                "mainnet" => self.network.network = Network::Mainnet,
                "testnet" => self.network.network = Network::Testnet,
                "regtest" => self.network.network = Network::Regtest,
                "signet" => self.network.network = Network::Signet,
                _ => {}
            }
        }
        if let Some(p) = var("LOOKOUT_NETWORK__LISTEN_PORT").and_then(|v| v.parse().ok()) {
            self.network.listen_port = p;
        }
        if let Some(v) = var("LOOKOUT_NETWORK__LISTEN") {
            self.network.listen = v == "true" || v == "1";
        }
        if let Some(n) = var("LOOKOUT_MANAGER__MAX_CONNECTED").and_then(|v| v.parse().ok()) {
            self.manager.max_connected = n;
        }
        if let Some(n) = var("LOOKOUT_MANAGER__CONNECTION_RATE").and_then(|v| v.parse().ok()) {
            self.manager.connection_rate = n;
        }
        if let Some(v) = var("LOOKOUT_REPOSITORY__BACKUP_PATH") {
            self.repository.backup_path = PathBuf::from(v);
        }
        if let Some(v) = var("LOOKOUT_REPOSITORY__SEEDS") {
            self.repository.seeds = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
    }
}
