use std::fs;
use std::path::PathBuf;

use super::storage::write_atomic;
use chrono::{DateTime, Utc};
use dnsraft_common::error::{DnsRaftError, Result};
use dnsraft_common::types::{ClusterConfiguration, LogIndex, Term};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RaftSnapshot {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub configuration: ClusterConfiguration, // Membership in effect at last_included_index
    pub created_at: DateTime<Utc>,
    pub state: Vec<u8>, // Serialized state machine data
}

/// Defines the behavior for any snapshot storage backend.
pub trait SnapshotStorage: Send {
    fn save(&mut self, snapshot: &RaftSnapshot) -> Result<()>;
    fn load(&self) -> Result<Option<RaftSnapshot>>;
}

/// Saves the latest snapshot as a binary file.
pub struct FileSnapshotStorage {
    pub path: PathBuf,
}

impl FileSnapshotStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotStorage for FileSnapshotStorage {
    fn save(&mut self, snapshot: &RaftSnapshot) -> Result<()> {
        let encoded = bincode::serialize(snapshot)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&self.path, &encoded)
    }

    fn load(&self) -> Result<Option<RaftSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(&self.path)?;
        let snapshot = bincode::deserialize(&bytes).map_err(|e| {
            DnsRaftError::StorageCorruption(format!(
                "unreadable snapshot {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(Some(snapshot))
    }
}

/// Holds the latest snapshot in memory.
#[derive(Debug, Default)]
pub struct MemorySnapshotStorage {
    latest: Option<RaftSnapshot>,
}

impl SnapshotStorage for MemorySnapshotStorage {
    fn save(&mut self, snapshot: &RaftSnapshot) -> Result<()> {
        self.latest = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<RaftSnapshot>> {
        Ok(self.latest.clone())
    }
}
