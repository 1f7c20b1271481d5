use crate::client::{join_cluster, send_command};
use crate::layer::RaftLayer;
use crate::mux::Multiplexer;
use dnsraft_common::config::ServerConfig;
use dnsraft_common::error::{DnsRaftError, Result};
use dnsraft_storage::raft::{RaftOptions, StreamLayer};
use dnsraft_storage::{KeyValueService, Store};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

const JOIN_ATTEMPTS: usize = 30;
const JOIN_BACKOFF: Duration = Duration::from_secs(1);
const LEAVE_TIMEOUT: Duration = Duration::from_secs(15);

/// One cluster node: shared listener, consensus and the command protocol.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    advertise: String,
    layer: Arc<RaftLayer>,
    store: Store,
}

impl Server {
    /// Binds the listener and opens the node's storage. Consensus starts
    /// right away; peers and clients are served once `run_until` is called.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let advertise = match &config.advertise_addr {
            Some(addr) => addr.clone(),
            None => listener.local_addr()?.to_string(),
        };

        let layer = Arc::new(RaftLayer::new(advertise.clone()));
        let store = Store::open(
            RaftOptions {
                node_id: config.node_id.clone(),
                advertise_addr: advertise.clone(),
                data_dir: config.data_dir.clone(),
                raft: config.raft.clone(),
                bootstrap: config.join.is_none(),
            },
            Arc::clone(&layer) as Arc<dyn StreamLayer>,
        )?;

        info!(
            node = %config.node_id,
            bind = %config.bind_addr,
            advertise = %advertise,
            "node started"
        );
        Ok(Self {
            config,
            listener,
            advertise,
            layer,
            store,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn advertise_addr(&self) -> &str {
        &self.advertise
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Serves until `shutdown` resolves, then leaves the cluster if
    /// configured to and stops consensus.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            config,
            listener,
            advertise,
            layer,
            store,
        } = self;

        let service: Arc<dyn KeyValueService> = Arc::new(store.clone());
        let mux = Multiplexer::new(listener, layer, service, config.classify_timeout());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let mux_task = tokio::spawn(mux.run_until(async move {
            let _ = stop_rx.await;
        }));

        let join_task = config.join.clone().map(|target| {
            let node_id = config.node_id.clone();
            let advertise = advertise.clone();
            tokio::spawn(async move {
                if let Err(err) =
                    join_cluster(&target, &node_id, &advertise, JOIN_ATTEMPTS, JOIN_BACKOFF).await
                {
                    error!(error = %err, "giving up on joining the cluster");
                }
            })
        });

        shutdown.await;
        info!(node = %config.node_id, "shutting down");

        if let Some(task) = join_task {
            task.abort();
        }
        if config.leave_on_shutdown {
            if let Err(err) = leave_cluster(&store, &config.node_id).await {
                warn!(error = %err, "could not leave the cluster");
            }
        }

        let _ = stop_tx.send(());
        if let Err(err) = mux_task.await {
            warn!(error = %err, "listener task failed");
        }
        store.shutdown().await;
        info!(node = %config.node_id, "node stopped");
        Ok(())
    }
}

/// Removes `node_id` from the cluster through whichever node leads it.
///
/// Nothing to do when the node is not a member or is the last one.
pub async fn leave_cluster(store: &Store, node_id: &str) -> Result<()> {
    let status = store.status();
    if !status.configuration.contains(node_id) || status.configuration.len() <= 1 {
        return Ok(());
    }

    if status.is_leader() {
        return store.leave(node_id).await;
    }
    let leader = status
        .leader_addr
        .ok_or(DnsRaftError::NotLeader { leader: None })?;
    let reply = send_command(&leader, &format!("leave {}", node_id), LEAVE_TIMEOUT).await?;
    if reply == "SUCCESS" {
        info!(node_id, leader = %leader, "left cluster");
        Ok(())
    } else {
        Err(DnsRaftError::Network(format!("leave refused by {}: {}", leader, reply)))
    }
}
