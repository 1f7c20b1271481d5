use crate::handoff::HandoffQueue;
use async_trait::async_trait;
use dnsraft_common::error::{DnsRaftError, Result};
use dnsraft_storage::raft::StreamLayer;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// First bytes of every peer connection. No client command starts with them.
pub const RAFT_DISCRIMINATOR: &[u8; 3] = b"rft";

/// Stream layer fed by the shared listener instead of a socket of its own.
pub struct RaftLayer {
    advertise: String,
    queue: HandoffQueue<TcpStream>,
}

impl RaftLayer {
    pub fn new(advertise: impl Into<String>) -> Self {
        Self {
            advertise: advertise.into(),
            queue: HandoffQueue::new(),
        }
    }

    /// Passes a classified peer connection to whoever is in `accept`. Waits
    /// while an earlier connection is still unclaimed.
    pub async fn handoff(&self, stream: TcpStream) -> Result<()> {
        self.queue.offer(stream).await
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

#[async_trait]
impl StreamLayer for RaftLayer {
    async fn accept(&self) -> Result<TcpStream> {
        self.queue.take().await
    }

    async fn dial(&self, address: &str, timeout: Duration) -> Result<TcpStream> {
        let connect = async {
            let mut stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true)?;
            stream.write_all(RAFT_DISCRIMINATOR).await?;
            Ok::<_, std::io::Error>(stream)
        };
        match tokio::time::timeout(timeout, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(DnsRaftError::Network(format!("dial {}: {}", address, e))),
            Err(_) => Err(DnsRaftError::Network(format!(
                "dial {} timed out after {:?}",
                address, timeout
            ))),
        }
    }

    fn close(&self) {
        if self.queue.close() {
            debug!(addr = %self.advertise, "raft layer closed");
        }
    }

    fn addr(&self) -> String {
        self.advertise.clone()
    }
}
