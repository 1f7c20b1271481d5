//! Durable backing for the Raft log and the node's vote.
//!
//! The log file is a sequence of frames `[u32 len BE][u32 crc32 BE][bincode]`.
//! Appends are fsynced before returning. Truncation and compaction rewrite the
//! whole file through a temporary file and an atomic rename.

use super::log::LogEntry;
use dnsraft_common::error::{DnsRaftError, Result};
use dnsraft_common::types::{NodeId, Term};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const LOG_FILE: &str = "raft.log";
const HARD_STATE_FILE: &str = "hard_state.bin";
const FRAME_HEADER_LEN: usize = 8;

/// State that must survive a restart before a node answers any RPC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// Defines the behavior for any log storage backend.
pub trait LogStorage: Send {
    fn load_hard_state(&self) -> Result<HardState>;
    fn save_hard_state(&mut self, state: &HardState) -> Result<()>;
    fn load_entries(&self) -> Result<Vec<LogEntry>>;
    fn append(&mut self, entries: &[LogEntry]) -> Result<()>;
    /// Replaces the stored log with exactly `entries`.
    fn rewrite(&mut self, entries: &[LogEntry]) -> Result<()>;
}

/// Keeps everything in memory. Used by tests and throwaway nodes.
#[derive(Debug, Default)]
pub struct MemoryLogStorage {
    hard_state: HardState,
    entries: Vec<LogEntry>,
}

impl LogStorage for MemoryLogStorage {
    fn load_hard_state(&self) -> Result<HardState> {
        Ok(self.hard_state.clone())
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        self.hard_state = state.clone();
        Ok(())
    }

    fn load_entries(&self) -> Result<Vec<LogEntry>> {
        Ok(self.entries.clone())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn rewrite(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.entries = entries.to_vec();
        Ok(())
    }
}

/// Stores the log and hard state as files under one directory.
pub struct FileLogStorage {
    dir: PathBuf,
    writer: BufWriter<File>,
}

impl FileLogStorage {
    /// Opens the log in `dir`, creating it if needed. A frame left half
    /// written by a crash at the tail is cut off here so later appends start
    /// on a clean boundary.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE);

        if path.exists() {
            let (_, valid_len) = read_frames(&path)?;
            let file_len = fs::metadata(&path)?.len();
            if valid_len < file_len {
                warn!(
                    path = %path.display(),
                    valid_len,
                    file_len,
                    "discarding torn tail of raft log"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            dir,
            writer: BufWriter::new(file),
        })
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }
}

impl LogStorage for FileLogStorage {
    fn load_hard_state(&self) -> Result<HardState> {
        let path = self.dir.join(HARD_STATE_FILE);
        if !path.exists() {
            return Ok(HardState::default());
        }
        let bytes = fs::read(&path)?;
        bincode::deserialize(&bytes).map_err(|e| {
            DnsRaftError::StorageCorruption(format!("unreadable hard state: {}", e))
        })
    }

    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        let encoded = bincode::serialize(state)?;
        write_atomic(&self.dir.join(HARD_STATE_FILE), &encoded)
    }

    fn load_entries(&self) -> Result<Vec<LogEntry>> {
        let (entries, _) = read_frames(&self.log_path())?;
        Ok(entries)
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        for entry in entries {
            self.writer.write_all(&encode_frame(entry)?)?;
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    fn rewrite(&mut self, entries: &[LogEntry]) -> Result<()> {
        let mut buf = Vec::new();
        for entry in entries {
            buf.extend_from_slice(&encode_frame(entry)?);
        }
        let path = self.log_path();
        write_atomic(&path, &buf)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        self.writer = BufWriter::new(file);
        Ok(())
    }
}

fn encode_frame(entry: &LogEntry) -> Result<Vec<u8>> {
    let payload = bincode::serialize(entry)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reads every intact frame. Returns the entries and the byte length they
/// span. A short or checksum-failing frame at the very end is a torn write
/// and ends the scan; a bad frame followed by more data is corruption.
fn read_frames(path: &Path) -> Result<(Vec<LogEntry>, u64)> {
    let file_len = fs::metadata(path)?.len();
    let mut reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    let mut offset = 0u64;
    let mut header = [0u8; FRAME_HEADER_LEN];

    loop {
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let stored_crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let frame_end = offset + FRAME_HEADER_LEN as u64 + len;
        if frame_end > file_len {
            break;
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload)?;
        if crc32fast::hash(&payload) != stored_crc {
            if frame_end == file_len {
                break;
            }
            return Err(DnsRaftError::StorageCorruption(format!(
                "checksum mismatch in {} at offset {}",
                path.display(),
                offset
            )));
        }

        let entry: LogEntry = bincode::deserialize(&payload).map_err(|e| {
            DnsRaftError::StorageCorruption(format!("undecodable log entry at {}: {}", offset, e))
        })?;
        entries.push(entry);
        offset = frame_end;
    }

    Ok((entries, offset))
}

/// Writes `bytes` to `path` via a synced temporary file and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}
