use crate::membership::Membership;
use crate::raft::{KvCommand, Raft, RaftOptions, RaftStatus, StoreReader, StreamLayer};
use async_trait::async_trait;
use dnsraft_common::error::{DnsRaftError, Result};
use std::sync::Arc;

/// Operations the rest of the service needs from the replicated store.
///
/// Reads are served from the local copy and may lag the leader. Writes and
/// membership changes only succeed on the leader and return once committed.
#[async_trait]
pub trait KeyValueService: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// Like `get`, but a miss is `KeyNotFound`.
    fn lookup(&self, key: &str) -> Result<String> {
        self.get(key)
            .ok_or_else(|| DnsRaftError::KeyNotFound(key.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn join(&self, node_id: &str, addr: &str) -> Result<()>;
    async fn leave(&self, node_id: &str) -> Result<()>;
}

/// Replicated key-value store backed by a Raft node.
#[derive(Clone)]
pub struct Store {
    raft: Raft,
    membership: Membership,
    reader: StoreReader,
}

impl Store {
    pub fn new(raft: Raft) -> Self {
        Self {
            reader: raft.reader(),
            membership: Membership::new(raft.clone()),
            raft,
        }
    }

    /// Opens the node's storage and starts consensus on `layer`.
    pub fn open(options: RaftOptions, layer: Arc<dyn StreamLayer>) -> Result<Self> {
        Ok(Self::new(Raft::open(options, layer)?))
    }

    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    pub fn status(&self) -> RaftStatus {
        self.raft.status()
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    /// Stops consensus and closes peer connections. Idempotent.
    pub async fn shutdown(&self) {
        self.raft.shutdown().await;
    }
}

#[async_trait]
impl KeyValueService for Store {
    fn get(&self, key: &str) -> Option<String> {
        self.reader.get(key)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.raft
            .apply(KvCommand::Set(key.to_string(), value.to_string()))
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.raft.apply(KvCommand::Delete(key.to_string())).await
    }

    async fn join(&self, node_id: &str, addr: &str) -> Result<()> {
        self.membership.join(node_id, addr).await
    }

    async fn leave(&self, node_id: &str) -> Result<()> {
        self.membership.leave(node_id).await
    }
}
