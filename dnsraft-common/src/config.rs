use crate::error::{DnsRaftError, Result};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Settings for one cluster node. Every field has a default so a config
/// file only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub node_id: NodeId,
    /// Address the shared listener binds to.
    pub bind_addr: String,
    /// Address peers use to reach this node. Defaults to the bound address.
    pub advertise_addr: Option<String>,
    /// Existing cluster member to ask for admission on first start.
    pub join: Option<String>,
    pub data_dir: PathBuf,
    pub raft: RaftConfig,
    /// How long a new connection may take to send its discriminator.
    pub classify_timeout_ms: u64,
    /// Ask the cluster to remove this node before stopping.
    pub leave_on_shutdown: bool,
}

/// Timing and sizing knobs for the consensus engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub tick_interval_ms: u64,
    /// Election timeout is drawn from `[election_ticks, 2 * election_ticks)`.
    pub election_ticks: u32,
    pub heartbeat_ticks: u32,
    pub max_append_entries: usize,
    /// Applied entries between two snapshots.
    pub snapshot_threshold: u64,
    pub apply_timeout_ms: u64,
    pub dial_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            bind_addr: "0.0.0.0:15370".into(),
            advertise_addr: None,
            join: None,
            data_dir: PathBuf::from("data"),
            raft: RaftConfig::default(),
            classify_timeout_ms: 5_000,
            leave_on_shutdown: true,
        }
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            election_ticks: 10,
            heartbeat_ticks: 2,
            max_append_entries: 128,
            snapshot_threshold: 1024,
            apply_timeout_ms: 10_000,
            dial_timeout_ms: 1_000,
        }
    }
}

impl ServerConfig {
    pub fn classify_timeout(&self) -> Duration {
        Duration::from_millis(self.classify_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(DnsRaftError::Config("node_id must not be empty".into()));
        }
        if self.node_id.contains(char::is_whitespace) {
            return Err(DnsRaftError::Config(format!(
                "node_id {:?} must not contain whitespace",
                self.node_id
            )));
        }
        if self.classify_timeout_ms == 0 {
            return Err(DnsRaftError::Config(
                "classify_timeout_ms must be positive".into(),
            ));
        }
        self.raft.validate()
    }
}

impl RaftConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 || self.apply_timeout_ms == 0 || self.dial_timeout_ms == 0 {
            return Err(DnsRaftError::Config("timeouts must be positive".into()));
        }
        if self.heartbeat_ticks == 0 || self.election_ticks <= self.heartbeat_ticks {
            return Err(DnsRaftError::Config(format!(
                "election_ticks ({}) must exceed heartbeat_ticks ({}) and both be positive",
                self.election_ticks, self.heartbeat_ticks
            )));
        }
        if self.max_append_entries == 0 || self.snapshot_threshold == 0 {
            return Err(DnsRaftError::Config(
                "max_append_entries and snapshot_threshold must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Loads a node configuration from a JSON file.
pub fn load_config(path: &str) -> Result<ServerConfig> {
    let data = fs::read_to_string(path)?;
    let config: ServerConfig = serde_json::from_str(&data)?;
    Ok(config)
}
