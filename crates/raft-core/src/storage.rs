//! # storage
//!
//! why: describe the durability contract the consensus engine writes through
//! relations: implemented here for tests, and by raft-storage for the filesystem
//! what: Storage trait, InMemoryStorage implementation

use std::io;

use crate::{LogEntry, NodeId, Term};

/// trait for durable storage of raft state
///
/// every write must be durable when the call returns: the node sends
/// responses that depend on the written state right afterwards.
pub trait Storage {
    /// persist the current term and voted_for
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> io::Result<()>;

    /// load the persisted term and voted_for
    fn load_term_and_vote(&self) -> io::Result<(Term, Option<NodeId>)>;

    /// append entries to the log
    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()>;

    /// load all log entries (for crash recovery)
    fn load_log(&self) -> io::Result<Vec<LogEntry>>;

    /// truncate log from given index (for conflict resolution)
    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()>;

    /// clear all persisted state (for testing)
    fn clear(&mut self) -> io::Result<()>;
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> io::Result<()> {
        (**self).save_term_and_vote(term, voted_for)
    }

    fn load_term_and_vote(&self) -> io::Result<(Term, Option<NodeId>)> {
        (**self).load_term_and_vote()
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        (**self).append_entries(entries)
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        (**self).load_log()
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        (**self).truncate_log_from(from_index)
    }

    fn clear(&mut self) -> io::Result<()> {
        (**self).clear()
    }
}

/// in-memory storage for testing
///
/// stores all state in memory, no persistence across restarts
#[derive(Debug, Default, Clone)]
pub struct InMemoryStorage {
    term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> io::Result<()> {
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn load_term_and_vote(&self) -> io::Result<(Term, Option<NodeId>)> {
        Ok((self.term, self.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        self.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        Ok(self.log.clone())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        self.log.retain(|e| e.index < from_index);
        Ok(())
    }

    fn clear(&mut self) -> io::Result<()> {
        self.term = 0;
        self.voted_for = None;
        self.log.clear();
        Ok(())
    }
}
