use async_trait::async_trait;
use dnsraft_common::error::Result;
use std::time::Duration;
use tokio::net::TcpStream;

/// Connection provider for peer traffic.
///
/// The engine never listens on its own. Inbound connections arrive through
/// `accept`, which may be fed by a listener shared with other protocols.
#[async_trait]
pub trait StreamLayer: Send + Sync + 'static {
    /// Waits for the next inbound peer connection. Returns
    /// [`DnsRaftError::Closed`](dnsraft_common::DnsRaftError::Closed) once the
    /// layer is closed.
    async fn accept(&self) -> Result<TcpStream>;

    /// Opens a connection to a peer, ready to carry frames.
    async fn dial(&self, address: &str, timeout: Duration) -> Result<TcpStream>;

    /// Idempotent. Releases every pending `accept`.
    fn close(&self);

    /// Address peers use to reach this node.
    fn addr(&self) -> String;
}
