pub type NodeId = String;
pub type ConnId = uuid::Uuid;
pub type Term = u64;
pub type LogIndex = u64;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub node_id: NodeId,
    pub addr: String,
}

/// Voting members of the cluster, keyed by node id.
///
/// A `BTreeMap` keeps the encoded form identical on every node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    pub members: BTreeMap<NodeId, String>,
}

impl ClusterConfiguration {
    pub fn single(node_id: impl Into<NodeId>, addr: impl Into<String>) -> Self {
        let mut members = BTreeMap::new();
        members.insert(node_id.into(), addr.into());
        Self { members }
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.members.contains_key(node_id)
    }

    pub fn address_of(&self, node_id: &str) -> Option<&str> {
        self.members.get(node_id).map(String::as_str)
    }

    /// Returns the member currently registered under `addr`, if any.
    pub fn member_at(&self, addr: &str) -> Option<&NodeId> {
        self.members
            .iter()
            .find(|(_, a)| a.as_str() == addr)
            .map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Number of votes needed for a majority.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn with_member(&self, node_id: &str, addr: &str) -> Self {
        let mut next = self.clone();
        next.members.insert(node_id.to_string(), addr.to_string());
        next
    }

    pub fn without_member(&self, node_id: &str) -> Self {
        let mut next = self.clone();
        next.members.remove(node_id);
        next
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeAddress> + '_ {
        self.members.iter().map(|(node_id, addr)| NodeAddress {
            node_id: node_id.clone(),
            addr: addr.clone(),
        })
    }
}
