use dnsraft_common::error::{DnsRaftError, Result};
use dnsraft_storage::KeyValueService;
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info};

/// Longest command line accepted, newline included.
pub const MAX_LINE_LEN: u64 = 64 * 1024;

/// One parsed client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Join { addr: String, node_id: String },
    Leave { node_id: String },
    Get { key: String },
    Set { key: String, value: String },
    Del { key: String },
}

impl FromStr for Command {
    type Err = DnsRaftError;

    fn from_str(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let (verb, args) = match tokens.split_first() {
            Some((verb, args)) => (verb.to_lowercase(), args),
            None => return Err(DnsRaftError::MalformedCommand),
        };

        let command = match (verb.as_str(), args) {
            ("ping", []) => Command::Ping,
            ("join", [addr, node_id]) => Command::Join {
                addr: addr.to_string(),
                node_id: node_id.to_string(),
            },
            ("leave", [node_id]) => Command::Leave {
                node_id: node_id.to_string(),
            },
            ("get", [key]) => Command::Get {
                key: key.to_string(),
            },
            ("set", [key, value]) => Command::Set {
                key: key.to_string(),
                value: value.to_string(),
            },
            ("del", [key]) => Command::Del {
                key: key.to_string(),
            },
            _ => return Err(DnsRaftError::MalformedCommand),
        };
        Ok(command)
    }
}

/// The single line written back for a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Pong,
    Success,
    Value(String),
    /// Malformed input or a missing key.
    Error,
    /// A failed operation, reported with the error's text.
    Failure(String),
}

impl From<Result<()>> for Reply {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => Reply::Success,
            Err(err) => Reply::Failure(err.to_string()),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Pong => write!(f, "PONG"),
            Reply::Success => write!(f, "SUCCESS"),
            Reply::Value(value) => write!(f, "{}", value),
            Reply::Error => write!(f, "ERROR"),
            Reply::Failure(message) => write!(f, "{}", message),
        }
    }
}

pub async fn dispatch(command: Command, service: &dyn KeyValueService) -> Reply {
    match command {
        Command::Ping => Reply::Pong,
        Command::Join { addr, node_id } => service.join(&node_id, &addr).await.into(),
        Command::Leave { node_id } => service.leave(&node_id).await.into(),
        Command::Get { key } => match service.lookup(&key) {
            Ok(value) => Reply::Value(value),
            Err(DnsRaftError::KeyNotFound(_)) => Reply::Error,
            Err(err) => Reply::Failure(err.to_string()),
        },
        Command::Set { key, value } => service.set(&key, &value).await.into(),
        Command::Del { key } => service.delete(&key).await.into(),
    }
}

/// Serves one client connection: read a line, answer it, close.
///
/// A client that disconnects before finishing its line gets no reply.
pub async fn handle_connection<S>(stream: S, service: &dyn KeyValueService) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    let reply = match (&mut reader).take(MAX_LINE_LEN).read_line(&mut line).await {
        Ok(_) if line.ends_with('\n') => {
            let request = line.trim();
            debug!(request, "client command");
            match request.parse::<Command>() {
                Ok(command) => {
                    let reply = dispatch(command, service).await;
                    if let Reply::Failure(ref message) = reply {
                        info!(request, error = %message, "command failed");
                    }
                    reply
                }
                Err(_) => Reply::Error,
            }
        }
        Ok(n) if n as u64 >= MAX_LINE_LEN => Reply::Error,
        Ok(_) => {
            debug!("client closed before sending a full line");
            return Ok(());
        }
        Err(err) if err.kind() == std::io::ErrorKind::InvalidData => Reply::Error,
        Err(err) => return Err(err.into()),
    };

    let stream = reader.get_mut();
    stream.write_all(format!("{}\n", reply).as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tokio::io::duplex;

    struct FakeService {
        leader: bool,
        data: Mutex<HashMap<String, String>>,
        members: Mutex<Vec<(String, String)>>,
    }

    impl FakeService {
        fn new(leader: bool) -> Self {
            Self {
                leader,
                data: Mutex::new(HashMap::new()),
                members: Mutex::new(Vec::new()),
            }
        }

        fn check_leader(&self) -> Result<()> {
            if self.leader {
                Ok(())
            } else {
                Err(DnsRaftError::NotLeader {
                    leader: Some("10.0.0.1:15370".into()),
                })
            }
        }
    }

    #[async_trait]
    impl KeyValueService for FakeService {
        fn get(&self, key: &str) -> Option<String> {
            self.data.lock().get(key).cloned()
        }

        async fn set(&self, key: &str, value: &str) -> Result<()> {
            self.check_leader()?;
            self.data.lock().insert(key.into(), value.into());
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.check_leader()?;
            self.data.lock().remove(key);
            Ok(())
        }

        async fn join(&self, node_id: &str, addr: &str) -> Result<()> {
            self.check_leader()?;
            self.members.lock().push((node_id.into(), addr.into()));
            Ok(())
        }

        async fn leave(&self, node_id: &str) -> Result<()> {
            self.check_leader()?;
            self.members.lock().retain(|(id, _)| id != node_id);
            Ok(())
        }
    }

    async fn roundtrip(service: &FakeService, input: &[u8]) -> String {
        let (mut client, server) = duplex(1024);
        client.write_all(input).await.unwrap();
        handle_connection(server, service).await.unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        out
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!("ping".parse::<Command>().unwrap(), Command::Ping);
        assert_eq!("PiNg".parse::<Command>().unwrap(), Command::Ping);
        assert_eq!(
            "join 10.0.0.2:15370 node2".parse::<Command>().unwrap(),
            Command::Join {
                addr: "10.0.0.2:15370".into(),
                node_id: "node2".into()
            }
        );
        assert_eq!(
            "  SET   foo   bar ".parse::<Command>().unwrap(),
            Command::Set {
                key: "foo".into(),
                value: "bar".into()
            }
        );
        assert_eq!(
            "del foo".parse::<Command>().unwrap(),
            Command::Del { key: "foo".into() }
        );
    }

    #[test]
    fn test_parse_rejects_bad_arity_and_unknown_verbs() {
        for line in [
            "",
            "   ",
            "ping extra",
            "join 10.0.0.2:15370",
            "leave",
            "get",
            "get a b",
            "set foo",
            "set foo bar baz",
            "del",
            "rft",
            "flush",
        ] {
            assert!(
                matches!(line.parse::<Command>(), Err(DnsRaftError::MalformedCommand)),
                "{:?} should be rejected",
                line
            );
        }
    }

    #[test]
    fn test_reply_from_result() {
        assert_eq!(Reply::from(Ok::<(), DnsRaftError>(())), Reply::Success);
        let reply = Reply::from(Err(DnsRaftError::NotLeader { leader: None }));
        assert_eq!(reply.to_string(), "node is not the leader");
    }

    #[tokio::test]
    async fn test_command_flow() {
        let service = FakeService::new(true);

        assert_eq!(roundtrip(&service, b"ping\n").await, "PONG\n");
        assert_eq!(roundtrip(&service, b"set foo bar\n").await, "SUCCESS\n");
        assert_eq!(roundtrip(&service, b"get foo\n").await, "bar\n");
        assert_eq!(roundtrip(&service, b"del foo\n").await, "SUCCESS\n");
        assert_eq!(roundtrip(&service, b"get foo\n").await, "ERROR\n");
        assert_eq!(roundtrip(&service, b"join 10.0.0.2:15370 node2\n").await, "SUCCESS\n");
        assert_eq!(
            service.members.lock().clone(),
            vec![("node2".to_string(), "10.0.0.2:15370".to_string())]
        );
        assert_eq!(roundtrip(&service, b"leave node2\n").await, "SUCCESS\n");
        assert!(service.members.lock().is_empty());
    }

    #[tokio::test]
    async fn test_crlf_line() {
        let service = FakeService::new(true);
        assert_eq!(roundtrip(&service, b"PING\r\n").await, "PONG\n");
    }

    #[tokio::test]
    async fn test_failures_reply_with_error_text() {
        let service = FakeService::new(false);

        assert_eq!(
            roundtrip(&service, b"set foo bar\n").await,
            "node is not the leader\n"
        );
        assert_eq!(
            roundtrip(&service, b"join 10.0.0.2:15370 node2\n").await,
            "node is not the leader\n"
        );
        assert_eq!(service.get("foo"), None);
        // Reads and pings never need the leader
        assert_eq!(roundtrip(&service, b"ping\n").await, "PONG\n");
    }

    #[tokio::test]
    async fn test_malformed_input_replies_error() {
        let service = FakeService::new(true);

        assert_eq!(roundtrip(&service, b"\n").await, "ERROR\n");
        assert_eq!(roundtrip(&service, b"set onlykey\n").await, "ERROR\n");
        assert_eq!(roundtrip(&service, b"bogus verb\n").await, "ERROR\n");
        assert_eq!(roundtrip(&service, b"get \xff\xfe\n").await, "ERROR\n");
    }

    #[tokio::test]
    async fn test_only_first_line_is_served() {
        let service = FakeService::new(true);
        assert_eq!(
            roundtrip(&service, b"set a 1\nset b 2\n").await,
            "SUCCESS\n"
        );
        assert_eq!(service.get("a"), Some("1".into()));
        assert_eq!(service.get("b"), None);
    }

    #[tokio::test]
    async fn test_partial_line_gets_no_reply() {
        let service = FakeService::new(true);
        let (mut client, server) = duplex(1024);
        client.write_all(b"set foo bar").await.unwrap();
        client.shutdown().await.unwrap();

        handle_connection(server, &service).await.unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(service.get("foo"), None);
    }
}
