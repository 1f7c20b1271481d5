use crate::raft::{ConfigChange, Raft};
use dnsraft_common::error::{DnsRaftError, Result};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Turns join/leave requests into configuration changes on the leader.
#[derive(Clone)]
pub struct Membership {
    raft: Raft,
}

impl Membership {
    pub fn new(raft: Raft) -> Self {
        Self { raft }
    }

    fn ensure_leader(&self) -> Result<()> {
        let status = self.raft.status();
        if !status.is_leader() {
            return Err(DnsRaftError::NotLeader {
                leader: status.leader_addr,
            });
        }
        Ok(())
    }

    /// Adds `node_id` at `addr` as a voter and waits for the change to commit.
    ///
    /// A node rejoining with the same id and address is already a member and
    /// succeeds without a new entry. A stale member holding the same id or
    /// the same address is removed first, unless that member is this leader:
    /// such a join is rejected before anything changes.
    pub async fn join(&self, node_id: &str, addr: &str) -> Result<()> {
        self.ensure_leader()?;
        let configuration = self.raft.status().configuration;

        if configuration.address_of(node_id) == Some(addr) {
            info!(node_id, addr, "node is already a member");
            return Ok(());
        }

        let local = self.raft.id();
        if node_id == local {
            return Err(DnsRaftError::MembershipRejected(format!(
                "{} is the leader and cannot move to {}",
                node_id, addr
            )));
        }
        if configuration.member_at(addr).map(String::as_str) == Some(local) {
            return Err(DnsRaftError::MembershipRejected(format!(
                "{} is the leader's address",
                addr
            )));
        }

        if configuration.contains(node_id) {
            info!(node_id, "replacing member registered under another address");
            self.change(ConfigChange::RemoveVoter {
                node_id: node_id.to_string(),
            })
            .await?;
        }
        if let Some(previous) = configuration.member_at(addr).filter(|id| *id != node_id) {
            info!(node_id = %previous, addr, "removing member that held the joining address");
            self.change(ConfigChange::RemoveVoter {
                node_id: previous.clone(),
            })
            .await?;
        }

        self.change(ConfigChange::AddVoter {
            node_id: node_id.to_string(),
            addr: addr.to_string(),
        })
        .await?;
        info!(node_id, addr, "node joined cluster");
        Ok(())
    }

    /// Removes `node_id`. Removing a node that is not a member succeeds.
    pub async fn leave(&self, node_id: &str) -> Result<()> {
        self.ensure_leader()?;
        if !self.raft.status().configuration.contains(node_id) {
            debug!(node_id, "leave for unknown node");
            return Ok(());
        }

        self.change(ConfigChange::RemoveVoter {
            node_id: node_id.to_string(),
        })
        .await?;
        info!(node_id, "node left cluster");
        Ok(())
    }

    /// Retries while an earlier change is still uncommitted.
    async fn change(&self, change: ConfigChange) -> Result<()> {
        let deadline = Instant::now() + self.raft.apply_timeout();
        loop {
            match self.raft.change_configuration(change.clone()).await {
                Err(DnsRaftError::ConfigChangeInProgress) => {
                    if Instant::now() >= deadline {
                        return Err(DnsRaftError::ReplicationTimeout);
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                other => return other,
            }
        }
    }
}
