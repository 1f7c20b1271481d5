use thiserror::Error;

#[derive(Debug, Error)]
pub enum DnsRaftError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Codec Error: {0}")]
    Codec(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    /// Writes and membership changes are only accepted by the leader.
    #[error("node is not the leader")]
    NotLeader { leader: Option<String> },

    /// The proposing leader stepped down before the entry was applied.
    #[error("leadership lost while committing log")]
    LeadershipLost,

    #[error("timed out waiting for replication quorum")]
    ReplicationTimeout,

    #[error("configuration change already in progress")]
    ConfigChangeInProgress,

    /// A membership change that would leave the cluster without a leader
    /// or without voters.
    #[error("membership change rejected: {0}")]
    MembershipRejected(String),

    #[error("transport closed")]
    Closed,

    #[error("raft is shut down")]
    Shutdown,

    #[error("malformed command")]
    MalformedCommand,

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("network error: {0}")]
    Network(String),

    /// Persisted state cannot be trusted; the node must stop.
    #[error("storage corruption: {0}")]
    StorageCorruption(String),
}

pub type Result<T> = std::result::Result<T, DnsRaftError>;

impl From<bincode::Error> for DnsRaftError {
    fn from(err: bincode::Error) -> Self {
        DnsRaftError::Codec(format!("Bincode Error: {}", err))
    }
}

impl DnsRaftError {
    /// Whether the error means local state can no longer be trusted.
    /// A failed write leaves memory and disk possibly out of step.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DnsRaftError::StorageCorruption(_) | DnsRaftError::Io(_)
        )
    }
}
