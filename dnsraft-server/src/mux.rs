use crate::command;
use crate::layer::{RaftLayer, RAFT_DISCRIMINATOR};
use bytes::{Buf, Bytes};
use dnsraft_common::error::{DnsRaftError, Result};
use dnsraft_common::types::ConnId;
use dnsraft_storage::KeyValueService;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// What a freshly accepted connection turned out to be.
pub enum Classified {
    /// Peer connection. The discriminator has been consumed.
    Raft(TcpStream),
    /// Client connection. Bytes read during classification are replayed.
    Client(PrefixedStream<TcpStream>),
}

/// Reads the discriminator from a new connection.
///
/// Stops early at a newline so a short client line such as `ping\n` is
/// classified without waiting for more input.
pub async fn classify(mut stream: TcpStream, timeout: Duration) -> Result<Classified> {
    let mut header = [0u8; 3];
    let read = async {
        let mut filled = 0;
        while filled < header.len() {
            let n = stream.read(&mut header[filled..]).await?;
            if n == 0 {
                return Err(DnsRaftError::Closed);
            }
            let newline = header[filled..filled + n].contains(&b'\n');
            filled += n;
            if newline {
                break;
            }
        }
        Ok(filled)
    };
    let filled = match tokio::time::timeout(timeout, read).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(DnsRaftError::Network(format!(
                "no discriminator within {:?}",
                timeout
            )))
        }
    };

    if &header[..filled] == RAFT_DISCRIMINATOR {
        return Ok(Classified::Raft(stream));
    }
    let prefix = Bytes::copy_from_slice(&header[..filled]);
    Ok(Classified::Client(PrefixedStream::new(prefix, stream)))
}

/// Stream that yields `prefix` before reading from `inner`.
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.prefix.has_remaining() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Accept loop for the shared listener. Peer connections go to the raft
/// layer, everything else to the command handler.
pub struct Multiplexer {
    listener: TcpListener,
    layer: Arc<RaftLayer>,
    service: Arc<dyn KeyValueService>,
    classify_timeout: Duration,
}

impl Multiplexer {
    pub fn new(
        listener: TcpListener,
        layer: Arc<RaftLayer>,
        service: Arc<dyn KeyValueService>,
        classify_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            layer,
            service,
            classify_timeout,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` resolves. Connections already
    /// being served run to completion on their own tasks.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let Multiplexer {
            listener,
            layer,
            service,
            classify_timeout,
        } = self;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("listener shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        spawn_connection(stream, peer, &layer, &service, classify_timeout)
                    }
                    Err(err) => warn!(error = ?err, "failed to accept connection"),
                }
            }
        }
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    layer: &Arc<RaftLayer>,
    service: &Arc<dyn KeyValueService>,
    classify_timeout: Duration,
) {
    let layer = Arc::clone(layer);
    let service = Arc::clone(service);
    let conn_id: ConnId = Uuid::new_v4();
    let span = tracing::debug_span!("conn", conn = %conn_id, peer = %peer);

    tokio::spawn(
        async move {
            match classify(stream, classify_timeout).await {
                Ok(Classified::Raft(stream)) => {
                    debug!("peer connection");
                    if let Err(err) = layer.handoff(stream).await {
                        debug!(error = %err, "dropping peer connection");
                    }
                }
                Ok(Classified::Client(stream)) => {
                    if let Err(err) = command::handle_connection(stream, service.as_ref()).await {
                        debug!(error = %err, "client connection closed with error");
                    }
                }
                Err(err) => debug!(error = %err, "connection dropped before classification"),
            }
        }
        .instrument(span),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_classify_raft_connection() {
        let (mut client, server) = pair().await;
        client.write_all(b"rft\x00\x01").await.unwrap();

        match classify(server, Duration::from_secs(1)).await.unwrap() {
            Classified::Raft(mut stream) => {
                let mut rest = [0u8; 2];
                stream.read_exact(&mut rest).await.unwrap();
                assert_eq!(rest, [0, 1]);
            }
            Classified::Client(_) => panic!("expected a raft connection"),
        }
    }

    #[tokio::test]
    async fn test_classify_client_replays_prefix() {
        let (mut client, server) = pair().await;
        client.write_all(b"set foo bar\n").await.unwrap();

        match classify(server, Duration::from_secs(1)).await.unwrap() {
            Classified::Client(mut stream) => {
                let mut line = vec![0u8; 12];
                stream.read_exact(&mut line).await.unwrap();
                assert_eq!(line, b"set foo bar\n");
            }
            Classified::Raft(_) => panic!("expected a client connection"),
        }
    }

    #[tokio::test]
    async fn test_classify_short_line() {
        let (mut client, server) = pair().await;
        client.write_all(b"\n").await.unwrap();

        let classified = classify(server, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(classified, Classified::Client(_)));
    }

    #[tokio::test]
    async fn test_classify_early_close() {
        let (mut client, server) = pair().await;
        client.write_all(b"rf").await.unwrap();
        drop(client);

        let err = classify(server, Duration::from_secs(1)).await.err().unwrap();
        assert!(matches!(err, DnsRaftError::Closed));
    }

    #[tokio::test]
    async fn test_classify_timeout() {
        let (_client, server) = pair().await;

        let err = classify(server, Duration::from_millis(50))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DnsRaftError::Network(_)));
    }

    #[tokio::test]
    async fn test_prefixed_stream_small_reads() {
        let (mut client, server) = pair().await;
        client.write_all(b"lo").await.unwrap();
        drop(client);

        let mut stream = PrefixedStream::new(Bytes::from_static(b"hel"), server);
        let mut one = [0u8; 1];
        stream.read_exact(&mut one).await.unwrap();
        assert_eq!(&one, b"h");

        let mut rest = String::new();
        stream.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "ello");
    }
}
