//! Async runtime around [`RaftNode`].
//!
//! One driver task owns the node and is the only place it is touched. It
//! ticks on an interval, steps inbound messages, and accepts proposals over a
//! channel. Peer I/O runs beside it: an accept loop with one reader task per
//! inbound connection, and one writer task per peer address that dials
//! lazily and redials after a failed write.

use super::node::{ConfigChange, NodeRole, RaftNode, RaftStatus};
use super::rpc::{read_frame, write_frame, Envelope};
use super::snapshot::FileSnapshotStorage;
use super::state_machine::{KeyValueStore, KvCommand, StoreReader};
use super::storage::FileLogStorage;
use super::transport::StreamLayer;
use dnsraft_common::config::RaftConfig;
use dnsraft_common::error::{DnsRaftError, Result};
use dnsraft_common::types::{ClusterConfiguration, LogIndex, NodeId, Term};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const SNAPSHOT_FILE: &str = "snapshot.bin";
const REQUEST_QUEUE_DEPTH: usize = 256;
const INBOUND_QUEUE_DEPTH: usize = 1024;
const PEER_QUEUE_DEPTH: usize = 256;

/// Everything needed to open a node from its data directory.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    pub node_id: NodeId,
    pub advertise_addr: String,
    pub data_dir: PathBuf,
    pub raft: RaftConfig,
    /// Seed a configuration holding only this node when storage is empty.
    pub bootstrap: bool,
}

type Reply = oneshot::Sender<Result<()>>;

enum Request {
    Propose { command: KvCommand, reply: Reply },
    ChangeConfig { change: ConfigChange, reply: Reply },
}

/// A proposal waiting for its entry to be applied.
struct Pending {
    term: Term,
    reply: Reply,
}

/// Handle to a running node. Cheap to clone; every clone talks to the same
/// driver task.
#[derive(Clone)]
pub struct Raft {
    inner: Arc<Inner>,
}

struct Inner {
    id: NodeId,
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<RaftStatus>,
    shutdown: watch::Sender<bool>,
    reader: StoreReader,
    layer: Arc<dyn StreamLayer>,
    apply_timeout: Duration,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Raft {
    /// Opens (or creates) the node stored under `options.data_dir` and starts
    /// it. Must be called inside a tokio runtime.
    pub fn open(options: RaftOptions, layer: Arc<dyn StreamLayer>) -> Result<Self> {
        options.raft.validate()?;
        fs::create_dir_all(&options.data_dir)?;

        let kv = KeyValueStore::default();
        let reader = kv.reader();
        let mut node = RaftNode::new(
            options.node_id.clone(),
            options.advertise_addr.clone(),
            options.raft.clone(),
            Box::new(FileLogStorage::open(&options.data_dir)?),
            Box::new(FileSnapshotStorage::new(
                options.data_dir.join(SNAPSHOT_FILE),
            )),
            Box::new(kv),
        )?;

        if options.bootstrap && node.is_pristine() {
            node.bootstrap(ClusterConfiguration::single(
                options.node_id.clone(),
                options.advertise_addr.clone(),
            ))?;
        }

        Ok(Self::spawn(node, reader, layer, options.raft))
    }

    /// Starts the driver and peer tasks for an already built node.
    pub fn spawn(
        node: RaftNode,
        reader: StoreReader,
        layer: Arc<dyn StreamLayer>,
        options: RaftConfig,
    ) -> Self {
        let id = node.id.clone();
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let (status_tx, status_rx) = watch::channel(node.status());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(accept_loop(
            Arc::clone(&layer),
            inbound_tx,
            shutdown_rx.clone(),
        ));

        let driver = Driver {
            node,
            layer: Arc::clone(&layer),
            inbound: inbound_rx,
            requests: requests_rx,
            status: status_tx,
            shutdown: shutdown_rx,
            pending: BTreeMap::new(),
            peers: HashMap::new(),
            options: options.clone(),
        };
        let handle = tokio::spawn(driver.run());

        info!(node = %id, addr = %layer.addr(), "raft started");

        Self {
            inner: Arc::new(Inner {
                id,
                requests: requests_tx,
                status: status_rx,
                shutdown: shutdown_tx,
                reader,
                layer,
                apply_timeout: options.apply_timeout(),
                driver: Mutex::new(Some(handle)),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn addr(&self) -> String {
        self.inner.layer.addr()
    }

    pub fn apply_timeout(&self) -> Duration {
        self.inner.apply_timeout
    }

    /// Read-only view of the local map.
    pub fn reader(&self) -> StoreReader {
        self.inner.reader.clone()
    }

    pub fn status(&self) -> RaftStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RaftStatus> {
        self.inner.status.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.status.borrow().role == NodeRole::Leader
    }

    /// Waits until the published status satisfies `predicate`.
    pub async fn wait_for<F>(&self, timeout: Duration, mut predicate: F) -> Result<RaftStatus>
    where
        F: FnMut(&RaftStatus) -> bool,
    {
        let mut status = self.subscribe_status();
        let wait = async {
            loop {
                {
                    let current = status.borrow_and_update();
                    if predicate(&current) {
                        return Ok(current.clone());
                    }
                }
                if status.changed().await.is_err() {
                    return Err(DnsRaftError::Shutdown);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| DnsRaftError::ReplicationTimeout)?
    }

    /// Replicates `command` and waits until it is applied locally.
    pub async fn apply(&self, command: KvCommand) -> Result<()> {
        self.submit(|reply| Request::Propose { command, reply })
            .await
    }

    /// Commits a membership change. A change the configuration already
    /// reflects succeeds without appending anything.
    pub async fn change_configuration(&self, change: ConfigChange) -> Result<()> {
        self.submit(|reply| Request::ChangeConfig { change, reply })
            .await
    }

    async fn submit(&self, request: impl FnOnce(Reply) -> Request) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.inner
            .requests
            .send(request(reply))
            .await
            .map_err(|_| DnsRaftError::Shutdown)?;

        match tokio::time::timeout(self.inner.apply_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DnsRaftError::Shutdown),
            Err(_) => Err(DnsRaftError::ReplicationTimeout),
        }
    }

    /// Stops the driver and closes the stream layer. Safe to call more than
    /// once; later calls return immediately.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        self.inner.layer.close();
        let driver = self.inner.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                warn!(node = %self.inner.id, error = %e, "raft driver task failed");
            }
        }
    }
}

struct Driver {
    node: RaftNode,
    layer: Arc<dyn StreamLayer>,
    inbound: mpsc::Receiver<Envelope>,
    requests: mpsc::Receiver<Request>,
    status: watch::Sender<RaftStatus>,
    shutdown: watch::Receiver<bool>,
    pending: BTreeMap<LogIndex, Pending>,
    /// Writer queues keyed by peer address.
    peers: HashMap<String, mpsc::Sender<Envelope>>,
    options: RaftConfig,
}

impl Driver {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.options.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let outcome = tokio::select! {
                _ = ticker.tick() => self.node.tick(),
                Some(envelope) = self.inbound.recv() => self.deliver(envelope),
                Some(request) = self.requests.recv() => self.handle_request(request),
                _ = self.shutdown.changed() => break,
            };

            if let Err(e) = outcome {
                if e.is_fatal() {
                    error!(node = %self.node.id, error = %e, "unrecoverable storage error, halting raft");
                    break;
                }
                warn!(node = %self.node.id, error = %e, "raft step failed");
            }
            self.flush();
        }

        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.reply.send(Err(DnsRaftError::Shutdown));
        }
        self.layer.close();
        info!(node = %self.node.id, "raft stopped");
    }

    fn deliver(&mut self, envelope: Envelope) -> Result<()> {
        if envelope.to != self.node.id {
            debug!(
                node = %self.node.id,
                to = %envelope.to,
                from = %envelope.from,
                "dropping message addressed to another node"
            );
            return Ok(());
        }
        self.node.step(envelope)
    }

    fn handle_request(&mut self, request: Request) -> Result<()> {
        let (result, reply) = match request {
            Request::Propose { command, reply } => {
                let result = command
                    .encode()
                    .and_then(|data| self.node.propose(data))
                    .map(Some);
                (result, reply)
            }
            Request::ChangeConfig { change, reply } => {
                (self.node.propose_configuration(change), reply)
            }
        };

        match result {
            Ok(Some(index)) => {
                self.pending.insert(
                    index,
                    Pending {
                        term: self.node.current_term,
                        reply,
                    },
                );
                Ok(())
            }
            Ok(None) => {
                let _ = reply.send(Ok(()));
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                let _ = reply.send(Err(DnsRaftError::Shutdown));
                Err(e)
            }
            Err(e) => {
                let _ = reply.send(Err(e));
                Ok(())
            }
        }
    }

    /// Sends queued messages, publishes the new status, and resolves
    /// finished proposals. Status goes out first so a woken caller sees it.
    fn flush(&mut self) {
        for envelope in self.node.take_messages() {
            self.route(envelope);
        }
        self.publish_status();

        for applied in self.node.take_applied() {
            if let Some(pending) = self.pending.remove(&applied.index) {
                let result = if pending.term == applied.term {
                    Ok(())
                } else {
                    Err(DnsRaftError::LeadershipLost)
                };
                let _ = pending.reply.send(result);
            }
        }
        if self.node.role != NodeRole::Leader && !self.pending.is_empty() {
            debug!(
                node = %self.node.id,
                pending = self.pending.len(),
                "failing proposals after losing leadership"
            );
            for (_, pending) in std::mem::take(&mut self.pending) {
                let _ = pending.reply.send(Err(DnsRaftError::LeadershipLost));
            }
        }
    }

    fn publish_status(&mut self) {
        let status = self.node.status();
        let (previous_role, configuration_changed) = {
            let current = self.status.borrow();
            (current.role, current.configuration != status.configuration)
        };
        if status.role != previous_role {
            info!(
                node = %self.node.id,
                term = status.term,
                role = ?status.role,
                leader = ?status.leader_id,
                "role changed"
            );
        }
        if configuration_changed {
            let members = &status.configuration;
            self.peers
                .retain(|addr, _| members.member_at(addr).is_some());
        }
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    fn route(&mut self, envelope: Envelope) {
        let addr = envelope.to_addr.clone();
        let dial_timeout = self.options.dial_timeout();
        let layer = &self.layer;
        let queue = self
            .peers
            .entry(addr.clone())
            .or_insert_with(|| spawn_peer_writer(addr.clone(), Arc::clone(layer), dial_timeout));

        match queue.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!(peer = %addr, "peer queue full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {
                self.peers.remove(&addr);
            }
        }
    }
}

/// One task per peer address. Messages are dropped while the peer is
/// unreachable; Raft retries on its own schedule.
fn spawn_peer_writer(
    addr: String,
    layer: Arc<dyn StreamLayer>,
    dial_timeout: Duration,
) -> mpsc::Sender<Envelope> {
    let (tx, mut rx) = mpsc::channel::<Envelope>(PEER_QUEUE_DEPTH);
    tokio::spawn(async move {
        let mut connection: Option<TcpStream> = None;
        while let Some(envelope) = rx.recv().await {
            if connection.is_none() {
                match layer.dial(&addr, dial_timeout).await {
                    Ok(stream) => {
                        debug!(peer = %addr, "connected to peer");
                        connection = Some(stream);
                    }
                    Err(e) => {
                        debug!(peer = %addr, error = %e, "dial failed, dropping message");
                        continue;
                    }
                }
            }
            if let Some(stream) = connection.as_mut() {
                if let Err(e) = write_frame(stream, &envelope).await {
                    debug!(peer = %addr, error = %e, "write to peer failed, will redial");
                    connection = None;
                }
            }
        }
        debug!(peer = %addr, "peer writer stopped");
    });
    tx
}

async fn accept_loop(
    layer: Arc<dyn StreamLayer>,
    inbound: mpsc::Sender<Envelope>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        match layer.accept().await {
            Ok(stream) => {
                tokio::spawn(read_peer(stream, inbound.clone(), shutdown.clone()));
            }
            Err(DnsRaftError::Closed) => break,
            Err(e) => warn!(error = %e, "failed to accept peer connection"),
        }
    }
    debug!("peer accept loop stopped");
}

async fn read_peer(
    stream: TcpStream,
    inbound: mpsc::Sender<Envelope>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".into());
    let mut reader = BufReader::new(stream);

    loop {
        tokio::select! {
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(envelope)) => {
                    if inbound.send(envelope).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "dropping peer connection");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!(peer = %peer, "peer connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::snapshot::MemorySnapshotStorage;
    use crate::raft::storage::MemoryLogStorage;
    use crate::raft::transport::testing::LoopbackLayer;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast() -> RaftConfig {
        RaftConfig {
            tick_interval_ms: 10,
            election_ticks: 10,
            heartbeat_ticks: 2,
            apply_timeout_ms: 3_000,
            dial_timeout_ms: 200,
            ..Default::default()
        }
    }

    async fn cluster(size: usize) -> Vec<Raft> {
        let mut layers = Vec::new();
        for _ in 0..size {
            layers.push(Arc::new(LoopbackLayer::bind().await));
        }
        let mut configuration = ClusterConfiguration::default();
        for (i, layer) in layers.iter().enumerate() {
            configuration = configuration.with_member(&format!("node{}", i + 1), &layer.addr());
        }

        let mut nodes = Vec::new();
        for (i, layer) in layers.into_iter().enumerate() {
            let kv = KeyValueStore::default();
            let reader = kv.reader();
            let mut node = RaftNode::new(
                format!("node{}", i + 1),
                layer.addr(),
                fast(),
                Box::new(MemoryLogStorage::default()),
                Box::new(MemorySnapshotStorage::default()),
                Box::new(kv),
            )
            .unwrap();
            node.bootstrap(configuration.clone()).unwrap();
            nodes.push(Raft::spawn(node, reader, layer, fast()));
        }
        nodes
    }

    async fn leader_of(nodes: &[Raft]) -> Raft {
        let deadline = tokio::time::Instant::now() + WAIT;
        while tokio::time::Instant::now() < deadline {
            if let Some(leader) = nodes.iter().find(|n| n.is_leader()) {
                return leader.clone();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no leader elected");
    }

    #[tokio::test]
    async fn test_single_node_bootstrap_and_apply() {
        let dir = tempfile::tempdir().unwrap();
        let layer = Arc::new(LoopbackLayer::bind().await);
        let raft = Raft::open(
            RaftOptions {
                node_id: "node1".into(),
                advertise_addr: layer.addr(),
                data_dir: dir.path().to_path_buf(),
                raft: fast(),
                bootstrap: true,
            },
            layer,
        )
        .unwrap();

        raft.wait_for(WAIT, |s| s.is_leader()).await.unwrap();
        raft.apply(KvCommand::Set("foo".into(), "bar".into()))
            .await
            .unwrap();
        assert_eq!(raft.reader().get("foo"), Some("bar".to_string()));

        raft.shutdown().await;
        raft.shutdown().await;
        let err = raft
            .apply(KvCommand::Delete("foo".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, DnsRaftError::Shutdown));
    }

    #[tokio::test]
    async fn test_reopen_recovers_applied_state() {
        let dir = tempfile::tempdir().unwrap();
        let options = |addr: String| RaftOptions {
            node_id: "node1".into(),
            advertise_addr: addr,
            data_dir: dir.path().to_path_buf(),
            raft: fast(),
            bootstrap: true,
        };

        let layer = Arc::new(LoopbackLayer::bind().await);
        let raft = Raft::open(options(layer.addr()), layer).unwrap();
        raft.wait_for(WAIT, |s| s.is_leader()).await.unwrap();
        raft.apply(KvCommand::Set("ns1".into(), "10.0.0.53".into()))
            .await
            .unwrap();
        raft.shutdown().await;
        drop(raft);

        // Storage is no longer pristine, so no second bootstrap entry is written.
        let layer = Arc::new(LoopbackLayer::bind().await);
        let raft = Raft::open(options(layer.addr()), layer).unwrap();
        let status = raft.status();
        assert_eq!(status.configuration.len(), 1);
        assert!(status.configuration.contains("node1"));
        raft.wait_for(WAIT, |s| s.is_leader() && s.applied_index >= 3)
            .await
            .unwrap();
        assert_eq!(raft.reader().get("ns1"), Some("10.0.0.53".to_string()));
        raft.shutdown().await;
    }

    #[tokio::test]
    async fn test_three_nodes_replicate_over_tcp() {
        let nodes = cluster(3).await;
        let leader = leader_of(&nodes).await;

        leader
            .apply(KvCommand::Set("www".into(), "192.0.2.1".into()))
            .await
            .unwrap();
        let target = leader.status().commit_index;

        for node in &nodes {
            node.wait_for(WAIT, |s| s.applied_index >= target)
                .await
                .unwrap();
            assert_eq!(node.reader().get("www"), Some("192.0.2.1".to_string()));
        }

        let follower = nodes.iter().find(|n| !n.is_leader()).unwrap();
        let err = follower
            .apply(KvCommand::Set("x".into(), "y".into()))
            .await
            .unwrap_err();
        match err {
            DnsRaftError::NotLeader { leader: addr } => assert_eq!(addr, Some(leader.addr())),
            other => panic!("unexpected error {:?}", other),
        }

        for node in &nodes {
            node.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_new_leader_after_shutdown() {
        let nodes = cluster(3).await;
        let leader = leader_of(&nodes).await;
        leader
            .apply(KvCommand::Set("before".into(), "1".into()))
            .await
            .unwrap();
        leader.shutdown().await;

        let survivors: Vec<Raft> = nodes
            .iter()
            .filter(|n| n.id() != leader.id())
            .cloned()
            .collect();
        let deadline = tokio::time::Instant::now() + WAIT;
        let next = loop {
            if let Some(n) = survivors.iter().find(|n| n.is_leader()) {
                break n.clone();
            }
            assert!(tokio::time::Instant::now() < deadline, "no new leader");
            tokio::time::sleep(Duration::from_millis(20)).await;
        };

        next.apply(KvCommand::Set("after".into(), "2".into()))
            .await
            .unwrap();
        assert_eq!(next.reader().get("before"), Some("1".to_string()));
        assert_eq!(next.reader().get("after"), Some("2".to_string()));

        for node in &survivors {
            node.shutdown().await;
        }
    }
}
