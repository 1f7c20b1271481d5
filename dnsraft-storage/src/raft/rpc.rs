use super::log::LogEntry;
use super::snapshot::RaftSnapshot;
use dnsraft_common::error::{DnsRaftError, Result};
use dnsraft_common::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on one encoded peer message; snapshots travel in one frame.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Sent by leader to replicate log entries or as heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,              // Leader’s term
    pub leader_id: NodeId,       // Leader's ID
    pub prev_log_index: LogIndex, // Index of log entry before new ones
    pub prev_log_term: Term,     // Term of that entry
    pub entries: Vec<LogEntry>,  // New log entries to store
    pub leader_commit: LogIndex, // Leader’s commit index
}

/// Response from follower to AppendEntries RPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,    // Current term (may be newer)
    pub success: bool, // True if follower appended entries
    pub match_index: LogIndex,    // On success: last index known to match the leader
    pub last_log_index: LogIndex, // On failure: follower's last index, to skip back faster
}

/// RequestVote RPC: Candidate → Peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Response to RequestVote
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Full snapshot shipped to a follower whose next entry was compacted away
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub snapshot: RaftSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
    pub match_index: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftMessage {
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    RequestVote(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    InstallSnapshot(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
}

impl RaftMessage {
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::AppendEntries(m) => m.term,
            RaftMessage::AppendEntriesResponse(m) => m.term,
            RaftMessage::RequestVote(m) => m.term,
            RaftMessage::RequestVoteResponse(m) => m.term,
            RaftMessage::InstallSnapshot(m) => m.term,
            RaftMessage::InstallSnapshotResponse(m) => m.term,
        }
    }

    /// Whether the message can only come from the leader of its term.
    pub fn is_from_leader(&self) -> bool {
        matches!(
            self,
            RaftMessage::AppendEntries(_) | RaftMessage::InstallSnapshot(_)
        )
    }
}

/// A message plus routing. Senders include their address so a node can answer
/// peers it has not yet learned about from the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub from_addr: String,
    pub to: NodeId,
    pub to_addr: String,
    pub message: RaftMessage,
}

/// Writes one length-prefixed envelope.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = bincode::serialize(envelope)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(DnsRaftError::Codec(format!(
            "frame of {} bytes exceeds limit",
            payload.len()
        )));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one envelope. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Envelope>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(DnsRaftError::Codec(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}
