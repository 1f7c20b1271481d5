use super::log::{LogEntry, LogEntryType, RaftLog};
use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, Envelope, InstallSnapshotRequest,
    InstallSnapshotResponse, RaftMessage, RequestVoteRequest, RequestVoteResponse,
};
use super::snapshot::{RaftSnapshot, SnapshotStorage};
use super::state_machine::{KvCommand, StateMachine};
use super::storage::{HardState, LogStorage};
use chrono::Utc;
use dnsraft_common::config::RaftConfig;
use dnsraft_common::error::{DnsRaftError, Result};
use dnsraft_common::types::{ClusterConfiguration, LogIndex, NodeId, Term};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

pub type KvStateMachine =
    Box<dyn StateMachine<Command = KvCommand, Response = Option<String>> + Send + Sync>;

/// Role of the node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

/// A single-server membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChange {
    AddVoter { node_id: NodeId, addr: String },
    RemoveVoter { node_id: NodeId },
}

/// An entry that has just been applied, reported so callers waiting on a
/// proposal can tell whether their entry survived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedEntry {
    pub index: LogIndex,
    pub term: Term,
}

/// Point-in-time view of a node, published to readers outside the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftStatus {
    pub id: NodeId,
    pub role: NodeRole,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub leader_addr: Option<String>,
    pub commit_index: LogIndex,
    pub applied_index: LogIndex,
    pub last_log_index: LogIndex,
    pub configuration: ClusterConfiguration,
}

impl RaftStatus {
    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }
}

/// A Raft node: controls its own state and participates in consensus.
///
/// The node does no I/O besides its storage. It is driven by `tick()` and
/// `step()`; outbound messages collect in an outbox drained with
/// `take_messages()`, and applied entries are reported by `take_applied()`.
pub struct RaftNode {
    pub id: NodeId,
    pub addr: String,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub role: NodeRole,
    pub leader_id: Option<NodeId>,
    pub leader_addr: Option<String>,
    pub log: RaftLog,

    /// Latest configuration in the log, committed or not.
    pub configuration: ClusterConfiguration,
    pub configuration_index: LogIndex,
    snapshot_configuration: ClusterConfiguration,

    options: RaftConfig,
    ticks: u64,
    election_elapsed: u32,
    election_timeout: u32,
    heartbeat_elapsed: u32,
    pub votes_received: HashSet<NodeId>,

    pub next_index: HashMap<NodeId, LogIndex>, // For each peer: next entry to send
    pub match_index: HashMap<NodeId, LogIndex>, // For each peer: last index known replicated
    recent_contact: HashSet<NodeId>,
    snapshot_sent_at: HashMap<NodeId, u64>,

    state_machine: KvStateMachine,
    snapshots: Box<dyn SnapshotStorage>,
    outbox: Vec<Envelope>,
    applied: Vec<AppliedEntry>,
}

impl RaftNode {
    /// Create a Raft node from whatever its storage holds. A node with empty
    /// storage has no configuration and stays passive until it is bootstrapped
    /// or a leader replicates to it.
    pub fn new(
        id: NodeId,
        addr: String,
        options: RaftConfig,
        storage: Box<dyn LogStorage>,
        snapshots: Box<dyn SnapshotStorage>,
        mut state_machine: KvStateMachine,
    ) -> Result<Self> {
        let hard_state = storage.load_hard_state()?;
        let (snapshot_index, snapshot_term, snapshot_configuration) = match snapshots.load()? {
            Some(snapshot) => {
                state_machine.restore(&snapshot.state).map_err(|e| {
                    DnsRaftError::StorageCorruption(format!("snapshot state: {}", e))
                })?;
                (
                    snapshot.last_included_index,
                    snapshot.last_included_term,
                    snapshot.configuration,
                )
            }
            None => (0, 0, ClusterConfiguration::default()),
        };
        let log = RaftLog::open(storage, snapshot_index, snapshot_term)?;

        let mut node = Self {
            id,
            addr,
            current_term: hard_state.current_term,
            voted_for: hard_state.voted_for,
            role: NodeRole::Follower,
            leader_id: None,
            leader_addr: None,
            log,
            configuration: ClusterConfiguration::default(),
            configuration_index: 0,
            snapshot_configuration,
            options,
            ticks: 0,
            election_elapsed: 0,
            election_timeout: 0,
            heartbeat_elapsed: 0,
            votes_received: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            recent_contact: HashSet::new(),
            snapshot_sent_at: HashMap::new(),
            state_machine,
            snapshots,
            outbox: Vec::new(),
            applied: Vec::new(),
        };
        node.refresh_configuration()?;
        node.reset_election_timer();

        info!(
            node = %node.id,
            term = node.current_term,
            snapshot_index,
            last_index = node.log.last_index(),
            members = node.configuration.len(),
            "raft node loaded"
        );
        Ok(node)
    }

    /// True when nothing was ever persisted for this node.
    pub fn is_pristine(&self) -> bool {
        self.current_term == 0 && self.log.last_index() == 0
    }

    /// Seeds an empty node with an initial configuration entry.
    pub fn bootstrap(&mut self, configuration: ClusterConfiguration) -> Result<()> {
        if !self.is_pristine() {
            return Err(DnsRaftError::Config(format!(
                "node {} already has raft state",
                self.id
            )));
        }
        let data = bincode::serialize(&configuration)?;
        self.current_term = 1;
        self.persist_hard_state()?;
        self.log.append(vec![LogEntry {
            term: 1,
            index: 1,
            entry_type: LogEntryType::Configuration,
            data,
        }])?;
        self.refresh_configuration()?;
        info!(node = %self.id, members = configuration.len(), "bootstrapped cluster");
        Ok(())
    }

    pub fn status(&self) -> RaftStatus {
        RaftStatus {
            id: self.id.clone(),
            role: self.role,
            term: self.current_term,
            leader_id: self.leader_id.clone(),
            leader_addr: self.leader_addr.clone(),
            commit_index: self.log.commit_index,
            applied_index: self.log.last_applied,
            last_log_index: self.log.last_index(),
            configuration: self.configuration.clone(),
        }
    }

    pub fn take_messages(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_applied(&mut self) -> Vec<AppliedEntry> {
        std::mem::take(&mut self.applied)
    }

    fn is_voter(&self) -> bool {
        self.configuration.contains(&self.id)
    }

    /// Whether a leader is known to be alive, in which case vote requests
    /// from other nodes are ignored.
    fn leader_alive(&self) -> bool {
        self.role == NodeRole::Leader
            || (self.leader_id.is_some() && self.election_elapsed < self.options.election_ticks)
    }

    fn peers(&self) -> Vec<(NodeId, String)> {
        self.configuration
            .members
            .iter()
            .filter(|(id, _)| **id != self.id)
            .map(|(id, addr)| (id.clone(), addr.clone()))
            .collect()
    }

    fn reset_election_timer(&mut self) {
        let base = self.options.election_ticks;
        self.election_timeout = rand::thread_rng().gen_range(base..base * 2);
    }

    fn persist_hard_state(&mut self) -> Result<()> {
        let state = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
        };
        self.log.save_hard_state(&state)
    }

    fn send(&mut self, to: NodeId, to_addr: String, message: RaftMessage) {
        self.outbox.push(Envelope {
            from: self.id.clone(),
            from_addr: self.addr.clone(),
            to,
            to_addr,
            message,
        });
    }

    /// Called on every logical clock tick
    pub fn tick(&mut self) -> Result<()> {
        self.ticks += 1;
        match self.role {
            NodeRole::Leader => {
                self.heartbeat_elapsed += 1;
                if self.heartbeat_elapsed >= self.options.heartbeat_ticks {
                    self.heartbeat_elapsed = 0;
                    self.broadcast_append()?;
                }
                self.election_elapsed += 1;
                if self.election_elapsed >= self.options.election_ticks {
                    self.election_elapsed = 0;
                    self.check_quorum()?;
                }
            }
            NodeRole::Follower | NodeRole::Candidate => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.election_timeout && self.is_voter() {
                    self.start_election()?;
                }
            }
        }
        Ok(())
    }

    /// Leader steps down if it has not heard from a quorum for an election
    /// timeout, so a partitioned leader stops accepting writes.
    fn check_quorum(&mut self) -> Result<()> {
        let mut alive = self
            .recent_contact
            .iter()
            .filter(|id| self.configuration.contains(id))
            .count();
        if self.is_voter() {
            alive += 1;
        }
        self.recent_contact.clear();

        if alive < self.configuration.quorum() {
            warn!(
                node = %self.id,
                term = self.current_term,
                alive,
                quorum = self.configuration.quorum(),
                "lost contact with quorum, stepping down"
            );
            self.become_follower(self.current_term, None)?;
        }
        Ok(())
    }

    /// Starts an election
    pub fn start_election(&mut self) -> Result<()> {
        self.role = NodeRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id.clone());
        self.persist_hard_state()?;
        self.leader_id = None;
        self.leader_addr = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id.clone());
        self.election_elapsed = 0;
        self.reset_election_timer();

        info!(
            node = %self.id,
            term = self.current_term,
            "starting election"
        );

        if self.votes_received.len() >= self.configuration.quorum() && self.is_voter() {
            return self.become_leader();
        }

        let request = RequestVoteRequest {
            term: self.current_term,
            candidate_id: self.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for (peer, addr) in self.peers() {
            self.send(peer, addr, RaftMessage::RequestVote(request.clone()));
        }
        Ok(())
    }

    /// Handles a vote response
    pub fn receive_vote(&mut self, voter_id: NodeId, term: Term, vote_granted: bool) -> Result<()> {
        if term > self.current_term {
            return self.become_follower(term, None);
        }

        if self.role != NodeRole::Candidate || term < self.current_term {
            return Ok(());
        }

        if vote_granted && self.configuration.contains(&voter_id) {
            self.votes_received.insert(voter_id);
            let votes = self
                .votes_received
                .iter()
                .filter(|id| self.configuration.contains(id))
                .count();
            if votes >= self.configuration.quorum() {
                self.become_leader()?;
            }
        }
        Ok(())
    }

    /// Transition to follower role
    pub fn become_follower(&mut self, term: Term, leader: Option<(NodeId, String)>) -> Result<()> {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.persist_hard_state()?;
        }
        let previous = self.role;
        self.role = NodeRole::Follower;
        let (leader_id, leader_addr) = leader.unzip();
        self.leader_id = leader_id;
        self.leader_addr = leader_addr;
        self.votes_received.clear();
        self.election_elapsed = 0;
        self.reset_election_timer();

        if previous != NodeRole::Follower {
            info!(
                node = %self.id,
                term = self.current_term,
                "became follower"
            );
        }
        Ok(())
    }

    /// Transition to leader role
    pub fn become_leader(&mut self) -> Result<()> {
        self.role = NodeRole::Leader;
        self.leader_id = Some(self.id.clone());
        self.leader_addr = Some(self.addr.clone());
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
        self.recent_contact.clear();
        self.snapshot_sent_at.clear();
        self.heartbeat_elapsed = 0;
        self.election_elapsed = 0;
        self.sync_progress();

        info!(node = %self.id, term = self.current_term, "became leader");

        // Append a Noop entry to confirm leadership to followers
        self.append_as_leader(LogEntryType::Noop, Vec::new())?;
        self.apply_committed_entries()?;
        self.maybe_snapshot()
    }

    /// Keeps per-peer replication progress in line with the configuration.
    fn sync_progress(&mut self) {
        let next = self.log.last_index() + 1;
        for (peer, _) in self.peers() {
            self.next_index.entry(peer.clone()).or_insert(next);
            self.match_index.entry(peer).or_insert(0);
        }
        let configuration = &self.configuration;
        self.next_index.retain(|id, _| configuration.contains(id));
        self.match_index.retain(|id, _| configuration.contains(id));
    }

    fn refresh_configuration(&mut self) -> Result<()> {
        let (configuration, index) = self.configuration_at(self.log.last_index())?;
        if configuration != self.configuration {
            debug!(node = %self.id, index, members = ?configuration.members, "configuration changed");
        }
        self.configuration = configuration;
        self.configuration_index = index;
        if self.role == NodeRole::Leader {
            self.sync_progress();
        }
        Ok(())
    }

    /// Latest configuration at or before `index`.
    fn configuration_at(&self, index: LogIndex) -> Result<(ClusterConfiguration, LogIndex)> {
        for entry in self.log.entries.iter().rev() {
            if entry.index > index || entry.entry_type != LogEntryType::Configuration {
                continue;
            }
            let configuration = bincode::deserialize(&entry.data).map_err(|e| {
                DnsRaftError::StorageCorruption(format!(
                    "undecodable configuration at {}: {}",
                    entry.index, e
                ))
            })?;
            return Ok((configuration, entry.index));
        }
        Ok((self.snapshot_configuration.clone(), self.log.snapshot_index))
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.role != NodeRole::Leader {
            return Err(DnsRaftError::NotLeader {
                leader: self.leader_addr.clone(),
            });
        }
        Ok(())
    }

    /// Called by the leader to append a new client command (application-level payload)
    pub fn propose(&mut self, data: Vec<u8>) -> Result<LogIndex> {
        self.ensure_leader()?;
        let index = self.append_as_leader(LogEntryType::Command, data)?;
        debug!(node = %self.id, index, "appended new command");
        self.apply_committed_entries()?;
        self.maybe_snapshot()?;
        Ok(index)
    }

    /// Proposes a membership change. Returns `None` when the configuration
    /// already has the requested shape and nothing was appended.
    pub fn propose_configuration(&mut self, change: ConfigChange) -> Result<Option<LogIndex>> {
        self.ensure_leader()?;

        // One change at a time, and only after this term's first commit.
        if self.configuration_index > self.log.commit_index
            || self.log.term_at(self.log.commit_index) != Some(self.current_term)
        {
            return Err(DnsRaftError::ConfigChangeInProgress);
        }

        let next = match &change {
            ConfigChange::AddVoter { node_id, addr } => {
                if self.configuration.address_of(node_id) == Some(addr.as_str()) {
                    return Ok(None);
                }
                self.configuration.with_member(node_id, addr)
            }
            ConfigChange::RemoveVoter { node_id } => {
                if !self.configuration.contains(node_id) {
                    return Ok(None);
                }
                let next = self.configuration.without_member(node_id);
                if next.is_empty() {
                    return Err(DnsRaftError::MembershipRejected(format!(
                        "{} is the last voter",
                        node_id
                    )));
                }
                next
            }
        };

        info!(node = %self.id, ?change, "proposing configuration change");
        let data = bincode::serialize(&next)?;
        let index = self.append_as_leader(LogEntryType::Configuration, data)?;
        self.apply_committed_entries()?;
        self.maybe_snapshot()?;
        Ok(Some(index))
    }

    fn append_as_leader(&mut self, entry_type: LogEntryType, data: Vec<u8>) -> Result<LogIndex> {
        let index = self.log.last_index() + 1;
        self.log.append(vec![LogEntry {
            term: self.current_term,
            index,
            entry_type,
            data,
        }])?;
        if entry_type == LogEntryType::Configuration {
            self.refresh_configuration()?;
        }
        self.broadcast_append()?;
        self.maybe_advance_commit()?;
        Ok(index)
    }

    /// Processes one inbound message
    pub fn step(&mut self, envelope: Envelope) -> Result<()> {
        let Envelope {
            from,
            from_addr,
            message,
            ..
        } = envelope;

        if message.term() > self.current_term {
            if matches!(message, RaftMessage::RequestVote(_)) && self.leader_alive() {
                debug!(
                    node = %self.id,
                    candidate = %from,
                    "ignoring vote request while leader is alive"
                );
                return Ok(());
            }
            let leader = message
                .is_from_leader()
                .then(|| (from.clone(), from_addr.clone()));
            self.become_follower(message.term(), leader)?;
        }

        match message {
            RaftMessage::AppendEntries(req) => {
                let response = self.handle_append_entries(&from_addr, req)?;
                self.send(from, from_addr, RaftMessage::AppendEntriesResponse(response));
            }
            RaftMessage::AppendEntriesResponse(response) => {
                self.handle_append_entries_response(from, response)?;
            }
            RaftMessage::RequestVote(req) => {
                let response = self.handle_request_vote(req)?;
                self.send(from, from_addr, RaftMessage::RequestVoteResponse(response));
            }
            RaftMessage::RequestVoteResponse(response) => {
                self.receive_vote(from, response.term, response.vote_granted)?;
            }
            RaftMessage::InstallSnapshot(req) => {
                let response = self.handle_install_snapshot(&from_addr, req)?;
                self.send(from, from_addr, RaftMessage::InstallSnapshotResponse(response));
            }
            RaftMessage::InstallSnapshotResponse(response) => {
                self.handle_install_snapshot_response(from, response)?;
            }
        }

        self.apply_committed_entries()?;
        self.maybe_snapshot()
    }

    fn reject_append(&self, last_log_index: LogIndex) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success: false,
            match_index: 0,
            last_log_index,
        }
    }

    /// Handles AppendEntries RPC as a follower
    pub fn handle_append_entries(
        &mut self,
        from_addr: &str,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        // 1. Reject if term is older
        if req.term < self.current_term {
            return Ok(self.reject_append(self.log.last_index()));
        }

        // 2. Same term from here on: the sender is this term's leader
        if self.role != NodeRole::Follower {
            self.become_follower(req.term, None)?;
        }
        self.leader_id = Some(req.leader_id.clone());
        self.leader_addr = Some(from_addr.to_string());
        self.election_elapsed = 0;

        // 3. Validate previous entry consistency
        if req.prev_log_index > self.log.last_index() {
            return Ok(self.reject_append(self.log.last_index()));
        }
        if req.prev_log_index >= self.log.snapshot_index
            && self.log.term_at(req.prev_log_index) != Some(req.prev_log_term)
        {
            return Ok(self.reject_append(req.prev_log_index.saturating_sub(1)));
        }

        // 4. Append new entries (overwrite conflicting entries)
        let last_new = req.prev_log_index + req.entries.len() as LogIndex;
        let mut configuration_touched = false;
        let mut fresh = Vec::new();
        for entry in req.entries {
            if entry.index <= self.log.snapshot_index {
                continue;
            }
            if !fresh.is_empty() {
                fresh.push(entry);
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => {}
                Some(term) => {
                    warn!(
                        node = %self.id,
                        index = entry.index,
                        local_term = term,
                        leader_term = entry.term,
                        "truncating conflicting log suffix"
                    );
                    self.log.truncate_from(entry.index)?;
                    configuration_touched = true;
                    fresh.push(entry);
                }
                None => fresh.push(entry),
            }
        }
        if !fresh.is_empty() {
            configuration_touched |= fresh
                .iter()
                .any(|e| e.entry_type == LogEntryType::Configuration);
            self.log.append(fresh)?;
        }
        if configuration_touched {
            self.refresh_configuration()?;
        }

        // 5. Update commit index
        if req.leader_commit > self.log.commit_index {
            self.log.commit_index = req.leader_commit.min(last_new).max(self.log.commit_index);
        }

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            match_index: last_new.max(self.log.snapshot_index),
            last_log_index: self.log.last_index(),
        })
    }

    /// Called when follower responds to an AppendEntries RPC
    pub fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        response: AppendEntriesResponse,
    ) -> Result<()> {
        if response.term > self.current_term {
            return self.become_follower(response.term, None);
        }
        if self.role != NodeRole::Leader
            || response.term < self.current_term
            || !self.configuration.contains(&from)
        {
            return Ok(());
        }
        self.recent_contact.insert(from.clone());

        if response.success {
            self.record_match(&from, response.match_index);
            self.maybe_advance_commit()?;
        } else {
            // Follower rejected: step next_index back and retry
            let next = self.next_index.get(&from).copied().unwrap_or(1);
            let retry = next
                .saturating_sub(1)
                .min(response.last_log_index + 1)
                .max(1);
            self.next_index.insert(from.clone(), retry);
        }

        if self.role == NodeRole::Leader
            && self.next_index.get(&from).copied().unwrap_or(1) <= self.log.last_index()
        {
            self.send_append(&from)?;
        }
        Ok(())
    }

    fn record_match(&mut self, peer: &str, index: LogIndex) {
        let matched = self.match_index.entry(peer.to_string()).or_insert(0);
        if index > *matched {
            *matched = index;
        }
        let matched = *matched;
        let next = self.next_index.entry(peer.to_string()).or_insert(matched + 1);
        if *next <= matched {
            *next = matched + 1;
        }
    }

    /// Check if a log index is safely replicated on majority → commit it
    fn maybe_advance_commit(&mut self) -> Result<()> {
        if self.role != NodeRole::Leader || self.configuration.is_empty() {
            return Ok(());
        }

        let mut match_indexes: Vec<LogIndex> = self
            .configuration
            .members
            .keys()
            .map(|id| {
                if *id == self.id {
                    self.log.last_index() // include leader's own index
                } else {
                    self.match_index.get(id).copied().unwrap_or(0)
                }
            })
            .collect();
        match_indexes.sort_by(|a, b| b.cmp(a)); // descending

        let new_commit = match_indexes[self.configuration.quorum() - 1];
        if new_commit > self.log.commit_index
            && self.log.term_at(new_commit) == Some(self.current_term)
        {
            self.log.commit_index = new_commit;
            debug!(node = %self.id, commit = new_commit, "commit index advanced");
            self.broadcast_append()?;

            if !self.is_voter() && self.log.commit_index >= self.configuration_index {
                info!(node = %self.id, "removed from configuration, stepping down");
                self.become_follower(self.current_term, None)?;
            }
        }
        Ok(())
    }

    fn broadcast_append(&mut self) -> Result<()> {
        for (peer, _) in self.peers() {
            self.send_append(&peer)?;
        }
        Ok(())
    }

    fn send_append(&mut self, peer: &str) -> Result<()> {
        let Some(addr) = self.configuration.address_of(peer).map(str::to_string) else {
            return Ok(());
        };
        let next = self
            .next_index
            .get(peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1);
        if next <= self.log.snapshot_index {
            return self.send_snapshot(peer, addr);
        }

        let prev_log_index = next - 1;
        let request = AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
            entries: self.log.entries_from(next, self.options.max_append_entries),
            leader_commit: self.log.commit_index,
        };
        self.send(peer.to_string(), addr, RaftMessage::AppendEntries(request));
        Ok(())
    }

    fn send_snapshot(&mut self, peer: &str, addr: String) -> Result<()> {
        if let Some(sent) = self.snapshot_sent_at.get(peer) {
            if self.ticks.saturating_sub(*sent) < self.options.election_ticks as u64 {
                return Ok(());
            }
        }
        let Some(snapshot) = self.snapshots.load()? else {
            warn!(node = %self.id, peer, "peer needs a snapshot but none is stored");
            return Ok(());
        };
        info!(
            node = %self.id,
            peer,
            index = snapshot.last_included_index,
            "sending snapshot to lagging peer"
        );
        self.snapshot_sent_at.insert(peer.to_string(), self.ticks);
        let request = InstallSnapshotRequest {
            term: self.current_term,
            leader_id: self.id.clone(),
            snapshot,
        };
        self.send(peer.to_string(), addr, RaftMessage::InstallSnapshot(request));
        Ok(())
    }

    /// Handles RequestVote RPC
    pub fn handle_request_vote(&mut self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        if req.term < self.current_term {
            return Ok(RequestVoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        let free_to_vote = self
            .voted_for
            .as_ref()
            .map_or(true, |v| *v == req.candidate_id);
        let up_to_date = req.last_log_term > self.log.last_term()
            || (req.last_log_term == self.log.last_term()
                && req.last_log_index >= self.log.last_index());
        let vote_granted = free_to_vote && up_to_date;

        if vote_granted {
            self.voted_for = Some(req.candidate_id.clone());
            self.persist_hard_state()?;
            self.election_elapsed = 0;
        }
        debug!(
            node = %self.id,
            candidate = %req.candidate_id,
            term = req.term,
            vote_granted,
            "handled vote request"
        );

        Ok(RequestVoteResponse {
            term: self.current_term,
            vote_granted,
        })
    }

    /// Handles InstallSnapshot RPC as a follower
    pub fn handle_install_snapshot(
        &mut self,
        from_addr: &str,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                match_index: 0,
            });
        }
        if self.role != NodeRole::Follower {
            self.become_follower(req.term, None)?;
        }
        self.leader_id = Some(req.leader_id.clone());
        self.leader_addr = Some(from_addr.to_string());
        self.election_elapsed = 0;

        let snapshot = req.snapshot;
        let index = snapshot.last_included_index;
        if index > self.log.commit_index {
            info!(
                node = %self.id,
                index,
                term = snapshot.last_included_term,
                "installing snapshot from leader"
            );
            self.state_machine.restore(&snapshot.state)?;
            self.snapshots.save(&snapshot)?;
            self.log
                .install_snapshot(index, snapshot.last_included_term)?;
            self.snapshot_configuration = snapshot.configuration;
            self.refresh_configuration()?;
        }

        Ok(InstallSnapshotResponse {
            term: self.current_term,
            match_index: index,
        })
    }

    fn handle_install_snapshot_response(
        &mut self,
        from: NodeId,
        response: InstallSnapshotResponse,
    ) -> Result<()> {
        if self.role != NodeRole::Leader
            || response.term != self.current_term
            || !self.configuration.contains(&from)
        {
            return Ok(());
        }
        self.snapshot_sent_at.remove(&from);
        self.recent_contact.insert(from.clone());
        self.record_match(&from, response.match_index);
        self.maybe_advance_commit()?;

        if self.role == NodeRole::Leader
            && self.next_index.get(&from).copied().unwrap_or(1) <= self.log.last_index()
        {
            self.send_append(&from)?;
        }
        Ok(())
    }

    /// Applies all entries between last_applied..=commit_index to the state machine
    pub fn apply_committed_entries(&mut self) -> Result<()> {
        while self.log.last_applied < self.log.commit_index {
            let next = self.log.last_applied + 1;

            let Some(entry) = self.log.get(next) else {
                return Err(DnsRaftError::StorageCorruption(format!(
                    "committed entry {} is missing",
                    next
                )));
            };
            let term = entry.term;
            if entry.entry_type == LogEntryType::Command {
                let command = KvCommand::decode(&entry.data).map_err(|e| {
                    DnsRaftError::StorageCorruption(format!(
                        "undecodable command at {}: {}",
                        next, e
                    ))
                })?;
                self.state_machine.apply(command);
                debug!(node = %self.id, index = next, "applied log entry to state machine");
            }

            self.log.last_applied = next;
            self.applied.push(AppliedEntry { index: next, term });
        }
        Ok(())
    }

    fn maybe_snapshot(&mut self) -> Result<()> {
        if self.log.last_applied - self.log.snapshot_index < self.options.snapshot_threshold {
            return Ok(());
        }
        self.take_snapshot()
    }

    /// Captures the state machine at `last_applied` and compacts the log.
    pub fn take_snapshot(&mut self) -> Result<()> {
        let index = self.log.last_applied;
        if index <= self.log.snapshot_index {
            return Ok(());
        }
        let term = self.log.term_at(index).ok_or_else(|| {
            DnsRaftError::StorageCorruption(format!("applied entry {} is missing", index))
        })?;
        let (configuration, _) = self.configuration_at(index)?;

        let snapshot = RaftSnapshot {
            last_included_index: index,
            last_included_term: term,
            configuration: configuration.clone(),
            created_at: Utc::now(),
            state: self.state_machine.snapshot()?,
        };
        self.snapshots.save(&snapshot)?;
        self.log.compact(index)?;
        self.snapshot_configuration = configuration;

        info!(node = %self.id, index, term, "took snapshot and compacted log");
        Ok(())
    }
}
