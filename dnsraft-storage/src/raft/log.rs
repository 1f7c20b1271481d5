use super::storage::{HardState, LogStorage, MemoryLogStorage};
use dnsraft_common::error::{DnsRaftError, Result};
use dnsraft_common::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};

/// A single log entry in the Raft log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,               // Term number when entry was received by leader
    pub index: LogIndex,          // Index of the log entry in the log
    pub entry_type: LogEntryType, // Type of entry (Command/Configuration/Noop)
    pub data: Vec<u8>,            // Payload (encoded command or configuration)
}

/// Type of log entry — determines how the node interprets the payload
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogEntryType {
    Command,       // Key/value mutation for the state machine
    Configuration, // Full voting membership after a join/leave
    Noop,          // Empty entry to assert leadership
}

/// The log of one Raft node.
///
/// Entries before `snapshot_index` have been compacted into a snapshot;
/// `entries` holds the contiguous suffix that follows it. Every mutation is
/// written through to the backing [`LogStorage`] before memory changes.
pub struct RaftLog {
    pub entries: Vec<LogEntry>,
    pub snapshot_index: LogIndex,
    pub snapshot_term: Term,
    pub commit_index: LogIndex, // Index of last committed entry
    pub last_applied: LogIndex, // Index of last entry applied to state machine
    storage: Box<dyn LogStorage>,
}

impl RaftLog {
    /// Create an empty, memory-backed log
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            snapshot_index: 0,
            snapshot_term: 0,
            commit_index: 0,
            last_applied: 0,
            storage: Box::new(MemoryLogStorage::default()),
        }
    }

    /// Loads the persisted entries that follow a snapshot taken at
    /// `snapshot_index`. Entries already covered by the snapshot are dropped.
    pub fn open(
        storage: Box<dyn LogStorage>,
        snapshot_index: LogIndex,
        snapshot_term: Term,
    ) -> Result<Self> {
        let mut entries = storage.load_entries()?;
        entries.retain(|e| e.index > snapshot_index);

        if let Some(first) = entries.first() {
            if first.index != snapshot_index + 1 {
                return Err(DnsRaftError::StorageCorruption(format!(
                    "log starts at {} but snapshot ends at {}",
                    first.index, snapshot_index
                )));
            }
        }
        for pair in entries.windows(2) {
            if pair[1].index != pair[0].index + 1 {
                return Err(DnsRaftError::StorageCorruption(format!(
                    "gap in log between {} and {}",
                    pair[0].index, pair[1].index
                )));
            }
        }

        Ok(Self {
            entries,
            snapshot_index,
            snapshot_term,
            commit_index: snapshot_index,
            last_applied: snapshot_index,
            storage,
        })
    }

    pub fn load_hard_state(&self) -> Result<HardState> {
        self.storage.load_hard_state()
    }

    pub fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        self.storage.save_hard_state(state)
    }

    /// Append entries after the current last index
    pub fn append(&mut self, new_entries: Vec<LogEntry>) -> Result<()> {
        let mut expected = self.last_index() + 1;
        for entry in &new_entries {
            if entry.index != expected {
                return Err(DnsRaftError::StorageCorruption(format!(
                    "append of index {} after {}",
                    entry.index,
                    expected - 1
                )));
            }
            expected += 1;
        }
        self.storage.append(&new_entries)?;
        self.entries.extend(new_entries);
        Ok(())
    }

    /// Get a specific log entry by index (not array index, Raft log index)
    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.entries.get((index - self.snapshot_index - 1) as usize)
    }

    /// Term of the entry at `index`, including the entry a snapshot ends on.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == self.snapshot_index {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Returns the last log index, or the snapshot index if no entries follow it
    pub fn last_index(&self) -> LogIndex {
        self.entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.snapshot_index)
    }

    /// Returns the term of the last entry, or the snapshot term
    pub fn last_term(&self) -> Term {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    /// Up to `max` entries starting at `index`.
    pub fn entries_from(&self, index: LogIndex, max: usize) -> Vec<LogEntry> {
        if index <= self.snapshot_index {
            return Vec::new();
        }
        let start = (index - self.snapshot_index - 1) as usize;
        self.entries.iter().skip(start).take(max).cloned().collect()
    }

    /// Drops `index` and everything after it. Committed entries are never
    /// removed.
    pub fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        if index <= self.commit_index {
            return Err(DnsRaftError::StorageCorruption(format!(
                "refusing to truncate at {} below commit index {}",
                index, self.commit_index
            )));
        }
        let keep = (index - self.snapshot_index - 1) as usize;
        if keep >= self.entries.len() {
            return Ok(());
        }
        self.storage.rewrite(&self.entries[..keep])?;
        self.entries.truncate(keep);
        Ok(())
    }

    /// Discards entries up to and including `index`, which must already be
    /// captured by a snapshot.
    pub fn compact(&mut self, index: LogIndex) -> Result<()> {
        if index <= self.snapshot_index {
            return Ok(());
        }
        let term = self.term_at(index).ok_or_else(|| {
            DnsRaftError::StorageCorruption(format!("compaction past end of log at {}", index))
        })?;
        let drop = (index - self.snapshot_index) as usize;
        self.storage.rewrite(&self.entries[drop..])?;
        self.entries.drain(..drop);
        self.snapshot_index = index;
        self.snapshot_term = term;
        Ok(())
    }

    /// Resets the log to start after a snapshot received from the leader.
    /// A suffix that agrees with the snapshot is kept.
    pub fn install_snapshot(&mut self, index: LogIndex, term: Term) -> Result<()> {
        if self.term_at(index) == Some(term) && index <= self.last_index() {
            self.compact(index)?;
        } else {
            self.storage.rewrite(&[])?;
            self.entries.clear();
            self.snapshot_index = index;
            self.snapshot_term = term;
        }
        self.commit_index = self.commit_index.max(index);
        self.last_applied = index;
        Ok(())
    }
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}
