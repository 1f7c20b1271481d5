use dnsraft_common::error::{DnsRaftError, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

/// Covers a join that has to wait for the change to commit.
const JOIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Sends one command line to `addr` and returns the reply without its
/// trailing newline.
pub async fn send_command(addr: &str, line: &str, timeout: Duration) -> Result<String> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await?;
        Ok::<_, std::io::Error>(reply)
    };
    match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok(reply)) => Ok(reply.trim_end_matches(['\r', '\n']).to_string()),
        Ok(Err(e)) => Err(DnsRaftError::Network(format!("{}: {}", addr, e))),
        Err(_) => Err(DnsRaftError::Network(format!(
            "{}: no reply within {:?}",
            addr, timeout
        ))),
    }
}

/// Asks the member at `target` to add this node, retrying until it answers
/// `SUCCESS` or `attempts` run out.
pub async fn join_cluster(
    target: &str,
    node_id: &str,
    advertise: &str,
    attempts: usize,
    backoff: Duration,
) -> Result<()> {
    let request = format!("join {} {}", advertise, node_id);
    let mut last = String::new();

    for attempt in 1..=attempts.max(1) {
        match send_command(target, &request, JOIN_REQUEST_TIMEOUT).await {
            Ok(reply) if reply == "SUCCESS" => {
                info!(target, attempt, "joined cluster");
                return Ok(());
            }
            Ok(reply) => {
                warn!(target, attempt, reply = %reply, "join refused");
                last = reply;
            }
            Err(err) => {
                warn!(target, attempt, error = %err, "join request failed");
                last = err.to_string();
            }
        }
        tokio::time::sleep(backoff).await;
    }

    Err(DnsRaftError::Network(format!(
        "could not join via {} after {} attempts: {}",
        target, attempts, last
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;
    use tokio::io::BufReader;
    use tokio::net::TcpListener;

    /// Answers each connection with the next canned reply.
    async fn canned(replies: Vec<&'static str>) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            for reply in replies {
                let (stream, _) = listener.accept().await.unwrap();
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                seen.push(line.trim_end().to_string());
                reader
                    .get_mut()
                    .write_all(format!("{}\n", reply).as_bytes())
                    .await
                    .unwrap();
            }
            seen
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_send_command_strips_newline() {
        let (addr, handle) = canned(vec!["PONG"]).await;
        let reply = send_command(&addr, "ping", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, "PONG");
        assert_eq!(handle.await.unwrap(), vec!["ping".to_string()]);
    }

    #[tokio::test]
    async fn test_join_retries_until_success() {
        let (addr, handle) = canned(vec!["node is not the leader", "SUCCESS"]).await;
        join_cluster(&addr, "node2", "127.0.0.1:15371", 5, Duration::from_millis(10))
            .await
            .unwrap();

        let seen = handle.await.unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|line| line == "join 127.0.0.1:15371 node2"));
    }

    #[tokio::test]
    async fn test_join_gives_up() {
        let (addr, _handle) = canned(vec!["ERROR", "ERROR"]).await;
        let err = join_cluster(&addr, "node2", "127.0.0.1:15371", 2, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, DnsRaftError::Network(_)));
    }
}
