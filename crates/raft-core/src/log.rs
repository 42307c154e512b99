//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by node.rs for replication, persisted via the Storage trait
//! what: LogEntry struct, RaftLog view with term lookups and tail truncation

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::Term;

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: Term, index: u64, command: Vec<u8>) -> Self {
        Self { term, index, command }
    }
}

/// In-memory view of the durable log.
///
/// Entry `i` always sits at position `i - 1`, so lookups are O(1) and the
/// sequence has no gaps. Mutation is limited to appending at the tail and
/// removing a suffix; entries are never edited in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the log from entries loaded out of storage, checking that
    /// they start at 1 and are contiguous.
    pub fn from_entries(entries: Vec<LogEntry>) -> Result<Self> {
        for (pos, entry) in entries.iter().enumerate() {
            let expected = pos as u64 + 1;
            if entry.index != expected {
                return Err(RaftError::LogInconsistency {
                    index: entry.index,
                    reason: "stored log is not contiguous",
                });
            }
        }
        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the last entry, 0 for an empty log.
    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Term of the last entry, 0 for an empty log.
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Like [`RaftLog::get`] but reports a missing index as `OutOfRange`.
    pub fn entry(&self, index: u64) -> Result<&LogEntry> {
        self.get(index).ok_or(RaftError::OutOfRange {
            index,
            first: 1,
            last: self.last_index(),
        })
    }

    /// Term of the entry at `index`. Index 0 is the empty prefix and has
    /// term 0; indexes past the end have no term.
    pub fn term_at(&self, index: u64) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    /// True when the log holds an entry at `index` with `term`.
    pub fn matches(&self, index: u64, term: Term) -> bool {
        self.term_at(index) == Some(term)
    }

    /// Append one entry at the tail.
    pub fn push(&mut self, entry: LogEntry) -> Result<()> {
        if entry.index != self.last_index() + 1 {
            return Err(RaftError::OutOfRange {
                index: entry.index,
                first: 1,
                last: self.last_index(),
            });
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = LogEntry>) -> Result<()> {
        for entry in entries {
            self.push(entry)?;
        }
        Ok(())
    }

    /// Remove every entry with index `>= from`.
    pub fn truncate_from(&mut self, from: u64) -> Result<()> {
        if from == 0 || from > self.last_index() + 1 {
            return Err(RaftError::OutOfRange {
                index: from,
                first: 1,
                last: self.last_index(),
            });
        }
        self.entries.truncate((from - 1) as usize);
        Ok(())
    }

    /// Up to `max` entries starting at `start`.
    pub fn entries_from(&self, start: u64, max: usize) -> Vec<LogEntry> {
        if start == 0 || start > self.last_index() {
            return Vec::new();
        }
        self.entries[(start - 1) as usize..]
            .iter()
            .take(max)
            .cloned()
            .collect()
    }

    /// Entries in `(after, through]`, clamped to the log.
    pub fn range(&self, after: u64, through: u64) -> Vec<LogEntry> {
        let through = through.min(self.last_index());
        if through <= after {
            return Vec::new();
        }
        self.entries[after as usize..through as usize].to_vec()
    }

    /// Hint returned with a rejected AppendEntries: the last index that may
    /// still match the leader. When our log is too short that is our last
    /// index; on a term mismatch we skip back over the whole conflicting term.
    pub fn conflict_hint(&self, prev_log_index: u64) -> u64 {
        if prev_log_index > self.last_index() {
            return self.last_index();
        }
        let conflict_term = match self.term_at(prev_log_index) {
            Some(term) => term,
            None => return self.last_index(),
        };
        let mut index = prev_log_index;
        while index > 0 && self.term_at(index) == Some(conflict_term) {
            index -= 1;
        }
        index
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
}
