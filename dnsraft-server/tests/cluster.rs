use dnsraft_common::config::{RaftConfig, ServerConfig};
use dnsraft_server::client::send_command;
use dnsraft_server::Server;
use dnsraft_storage::{KeyValueService, Store};
use std::path::Path;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const WAIT: Duration = Duration::from_secs(10);
const REQUEST: Duration = Duration::from_secs(5);

struct TestNode {
    id: String,
    addr: String,
    store: Store,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<dnsraft_common::Result<()>>,
}

impl TestNode {
    async fn start(dir: &Path, id: &str, join: Option<&str>, leave_on_shutdown: bool) -> Self {
        let config = ServerConfig {
            node_id: id.to_string(),
            bind_addr: "127.0.0.1:0".into(),
            join: join.map(str::to_string),
            data_dir: dir.join(id),
            leave_on_shutdown,
            raft: RaftConfig {
                tick_interval_ms: 10,
                election_ticks: 15,
                heartbeat_ticks: 2,
                apply_timeout_ms: 3_000,
                dial_timeout_ms: 200,
                ..Default::default()
            },
            ..Default::default()
        };
        let server = Server::bind(config).await.unwrap();
        let addr = server.advertise_addr().to_string();
        let store = server.store().clone();
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async move {
            let _ = stopped.await;
        }));
        Self {
            id: id.to_string(),
            addr,
            store,
            stop: Some(stop),
            task,
        }
    }

    async fn send(&self, line: &str) -> String {
        send_command(&self.addr, line, REQUEST).await.unwrap()
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.await.unwrap().unwrap();
    }
}

async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Bootstraps the first node and joins the others through it.
async fn cluster(dir: &Path, size: usize, leave_on_shutdown: bool) -> Vec<TestNode> {
    let first = TestNode::start(dir, "node1", None, leave_on_shutdown).await;
    first
        .store
        .raft()
        .wait_for(WAIT, |s| s.is_leader())
        .await
        .unwrap();
    let seed = first.addr.clone();

    let mut nodes = vec![first];
    for n in 2..=size {
        let id = format!("node{}", n);
        nodes.push(TestNode::start(dir, &id, Some(&seed), leave_on_shutdown).await);
    }
    for node in &nodes {
        node.store
            .raft()
            .wait_for(WAIT, |s| s.configuration.len() == size && s.leader_id.is_some())
            .await
            .unwrap();
    }
    nodes
}

fn leader(nodes: &[TestNode]) -> &TestNode {
    nodes
        .iter()
        .find(|n| n.store.is_leader())
        .expect("cluster has a leader")
}

fn follower(nodes: &[TestNode]) -> &TestNode {
    nodes
        .iter()
        .find(|n| !n.store.is_leader())
        .expect("cluster has a follower")
}

async fn stop_all(nodes: Vec<TestNode>) {
    for node in nodes {
        node.stop().await;
    }
}

#[tokio::test]
async fn test_commands_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let nodes = cluster(dir.path(), 3, false).await;

    for node in &nodes {
        assert_eq!(node.send("ping").await, "PONG");
    }

    let leader = leader(&nodes);
    assert_eq!(leader.send("set foo bar").await, "SUCCESS");
    assert!(eventually(|| nodes.iter().all(|n| n.store.get("foo").as_deref() == Some("bar"))).await);
    for node in &nodes {
        assert_eq!(node.send("get foo").await, "bar");
    }

    assert_eq!(leader.send("DEL foo").await, "SUCCESS");
    assert_eq!(leader.send("get foo").await, "ERROR");
    assert!(eventually(|| nodes.iter().all(|n| n.store.get("foo").is_none())).await);

    assert_eq!(leader.send("set onlykey").await, "ERROR");
    assert_eq!(leader.send("frobnicate").await, "ERROR");

    stop_all(nodes).await;
}

#[tokio::test]
async fn test_non_leader_rejects_writes_and_joins() {
    let dir = tempfile::tempdir().unwrap();
    let nodes = cluster(dir.path(), 3, false).await;
    let follower = follower(&nodes);

    assert_eq!(
        follower.send("join 10.0.0.2:15370 node9").await,
        "node is not the leader"
    );
    assert_eq!(follower.send("set k v").await, "node is not the leader");
    assert_eq!(follower.send("leave node1").await, "node is not the leader");

    assert_eq!(follower.store.status().configuration.len(), 3);
    assert_eq!(follower.send("get k").await, "ERROR");

    stop_all(nodes).await;
}

#[tokio::test]
async fn test_follower_leaves_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let mut nodes = cluster(dir.path(), 3, true).await;

    let position = nodes
        .iter()
        .position(|n| !n.store.is_leader())
        .expect("cluster has a follower");
    let departing = nodes.remove(position);
    let departed_id = departing.id.clone();
    departing.stop().await;

    let leader = leader(&nodes);
    assert!(eventually(|| {
        let configuration = leader.store.status().configuration;
        configuration.len() == 2 && !configuration.contains(&departed_id)
    })
    .await);

    // The remaining two still form a quorum
    assert_eq!(leader.send("set after leave").await, "SUCCESS");

    stop_all(nodes).await;
}

#[tokio::test]
async fn test_restart_keeps_data() {
    let dir = tempfile::tempdir().unwrap();
    let node = TestNode::start(dir.path(), "solo", None, false).await;
    node.store
        .raft()
        .wait_for(WAIT, |s| s.is_leader())
        .await
        .unwrap();
    assert_eq!(node.send("set example.com. 93.184.216.34").await, "SUCCESS");
    node.stop().await;

    let node = TestNode::start(dir.path(), "solo", None, false).await;
    assert!(eventually(|| node.store.get("example.com.").is_some()).await);
    assert_eq!(node.send("get example.com.").await, "93.184.216.34");
    node.stop().await;
}
