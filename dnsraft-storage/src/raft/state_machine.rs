use dnsraft_common::error::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Trait for any Raft-compatible state machine.
/// This allows pluggable logic for different types of services (e.g., key-value store, DB, etc.)
pub trait StateMachine: Send + Sync {
    type Command: Send + Sync;
    type Response: Send + Sync;

    fn get(&self, key: &str) -> Option<String>;

    /// Applies a committed command and returns a response
    fn apply(&mut self, command: Self::Command) -> Self::Response;

    /// Produces a binary snapshot of the current state
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replaces the current state with a snapshot
    fn restore(&mut self, snapshot: &[u8]) -> Result<()>;
}

/// Mutations carried by command log entries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum KvCommand {
    Set(String, String),
    Delete(String),
}

impl KvCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

type SharedMap = Arc<RwLock<HashMap<String, String>>>;

/// The in-memory key-value map.
///
/// Only the holder of this value can mutate the map, and the Raft node is the
/// only holder. Everyone else reads through a [`StoreReader`].
#[derive(Debug, Default)]
pub struct KeyValueStore {
    data: SharedMap,
}

/// Read-only view of a [`KeyValueStore`]. Cheap to clone; reads never wait
/// for consensus and may lag the leader on a follower.
#[derive(Debug, Clone)]
pub struct StoreReader {
    data: SharedMap,
}

impl KeyValueStore {
    pub fn reader(&self) -> StoreReader {
        StoreReader {
            data: Arc::clone(&self.data),
        }
    }
}

impl StoreReader {
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Copy of the whole map, in key order.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl StateMachine for KeyValueStore {
    type Command = KvCommand;
    /// Previous value of the key, if any.
    type Response = Option<String>;

    fn apply(&mut self, command: Self::Command) -> Self::Response {
        let mut data = self.data.write();
        match command {
            KvCommand::Set(k, v) => data.insert(k, v),
            KvCommand::Delete(k) => data.remove(&k),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        // Sorted so equal maps encode to equal bytes on every node.
        let data = self.data.read();
        let ordered: BTreeMap<&String, &String> = data.iter().collect();
        Ok(bincode::serialize(&ordered)?)
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
        let restored: HashMap<String, String> = bincode::deserialize(snapshot)?;
        *self.data.write() = restored;
        Ok(())
    }

    fn get(&self, key: &str) -> Option<String> {
        self.data.read().get(key).cloned()
    }
}
