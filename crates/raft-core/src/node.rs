//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry management, storage.rs for durability
//! what: NodeState enum, RaftConfig, RaftNode with election, replication and commit rules
//!
//! The node performs no I/O of its own apart from writing through its
//! [`Storage`]. Every transition that changes term, vote or log writes the
//! change before returning, so any response a handler returns is already
//! backed by durable state when the caller sends it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RaftError, Result};
use crate::log::{LogEntry, RaftLog};
use crate::message::RaftMessage;
use crate::storage::{InMemoryStorage, Storage};
use crate::{NodeId, Term};

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// Timing and batching knobs. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,
    pub heartbeat_interval: u64,
    /// Upper bound on entries carried by one AppendEntries.
    pub max_entries_per_append: usize,
    /// Per-call deadline for outbound RPCs.
    pub rpc_timeout: u64,
    /// Step down when a quorum has not acknowledged us for a full
    /// election timeout.
    pub check_quorum: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            max_entries_per_append: 64,
            rpc_timeout: 100,
            check_quorum: false,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.election_timeout_min == 0 || self.election_timeout_min > self.election_timeout_max {
            return Err("election timeout range must be non-empty and positive");
        }
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.election_timeout_min {
            return Err("heartbeat interval must be shorter than the election timeout");
        }
        if self.max_entries_per_append == 0 {
            return Err("max_entries_per_append must be at least 1");
        }
        Ok(())
    }
}

/// What happened while processing one inbound message.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Step {
    /// Response to send back when the message was a request.
    pub reply: Option<RaftMessage>,
    /// A valid leader or a granted vote was seen; rearm the election timer.
    pub reset_election_timer: bool,
    pub became_leader: bool,
    pub commit_advanced: bool,
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode<S: Storage = InMemoryStorage> {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: Term,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<NodeId>,
    pub log: RaftLog,
    /// Highest index known to be committed
    pub commit_index: u64,
    /// Highest index handed to the state machine
    pub last_applied: u64,
    /// Every member of the cluster, self included
    pub cluster_nodes: Vec<NodeId>,
    pub config: RaftConfig,
    /// Votes collected in the current election (candidate only)
    pub votes_received: Vec<NodeId>,
    /// Leader only: next index to send to each peer
    pub next_index: HashMap<NodeId, u64>,
    /// Leader only: highest index known replicated on each peer
    pub match_index: HashMap<NodeId, u64>,
    /// Leader of the current term, when known
    pub leader_id: Option<NodeId>,
    storage: S,
}

impl RaftNode<InMemoryStorage> {
    /// Create a new Raft node in Follower state
    pub fn new(id: NodeId, cluster_nodes: Vec<NodeId>) -> Self {
        Self::with_config(id, cluster_nodes, RaftConfig::default())
    }

    pub fn with_config(id: NodeId, cluster_nodes: Vec<NodeId>, config: RaftConfig) -> Self {
        Self::from_parts(id, cluster_nodes, config, InMemoryStorage::new(), 0, None, RaftLog::new())
    }
}

impl<S: Storage> RaftNode<S> {
    /// Create a node whose term, vote and log are restored from `storage`.
    /// A fresh store yields term 0, no vote and an empty log.
    pub fn with_storage(
        id: NodeId,
        cluster_nodes: Vec<NodeId>,
        config: RaftConfig,
        storage: S,
    ) -> Result<Self> {
        let (term, voted_for) = storage.load_term_and_vote()?;
        let log = RaftLog::from_entries(storage.load_log()?)?;
        info!(node = id, term, last_index = log.last_index(), "restored persistent state");
        Ok(Self::from_parts(id, cluster_nodes, config, storage, term, voted_for, log))
    }

    fn from_parts(
        id: NodeId,
        cluster_nodes: Vec<NodeId>,
        config: RaftConfig,
        storage: S,
        current_term: Term,
        voted_for: Option<NodeId>,
        log: RaftLog,
    ) -> Self {
        Self {
            id,
            state: NodeState::Follower,
            current_term,
            voted_for,
            log,
            commit_index: 0,
            last_applied: 0,
            cluster_nodes,
            config,
            votes_received: Vec::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            leader_id: None,
            storage,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    /// Every cluster member except this node.
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.cluster_nodes.iter().copied().filter(move |&n| n != self.id)
    }

    // -- quorum --

    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    // -- log helpers --

    pub fn last_log_index(&self) -> u64 {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last_term()
    }

    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        self.log.get(index)
    }

    /// Term of the entry at `index`, 0 when there is none.
    pub fn get_term_at(&self, index: u64) -> Term {
        self.log.term_at(index).unwrap_or(0)
    }

    // -- persistence --

    fn persist_term_and_vote(&mut self) -> Result<()> {
        self.storage.save_term_and_vote(self.current_term, self.voted_for)?;
        Ok(())
    }

    fn persist_append(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.storage.append_entries(entries)?;
        self.log.extend(entries.iter().cloned())
    }

    /// Drop the log suffix starting at `from`. Committed entries are never
    /// removed.
    fn persist_truncate(&mut self, from: u64) -> Result<()> {
        if from <= self.commit_index {
            return Err(RaftError::LogInconsistency {
                index: from,
                reason: "refusing to truncate committed entries",
            });
        }
        self.storage.truncate_log_from(from)?;
        self.log.truncate_from(from)
    }

    // -- role transitions --

    /// Adopt `term` (if newer) and return to Follower. The vote is cleared
    /// only when the term actually changes.
    pub fn become_follower(&mut self, term: Term) -> Result<()> {
        let previous = self.state;
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
            self.persist_term_and_vote()?;
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
        if previous != NodeState::Follower {
            info!(node = self.id, term = self.current_term, from = ?previous, "stepped down to follower");
        }
        Ok(())
    }

    /// Start a new election: bump the term, vote for ourselves, persist,
    /// and return the vote request to broadcast.
    pub fn start_election(&mut self) -> Result<RaftMessage> {
        self.state = NodeState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.votes_received = vec![self.id];
        self.next_index.clear();
        self.match_index.clear();
        self.persist_term_and_vote()?;
        info!(node = self.id, term = self.current_term, "starting election");

        Ok(RaftMessage::VoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        })
    }

    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();

        let next = self.last_log_index() + 1;
        let peers: Vec<NodeId> = self.peers().collect();
        self.next_index.clear();
        self.match_index.clear();
        for peer in peers {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }
        info!(node = self.id, term = self.current_term, "became leader");
    }

    // -- election --

    /// Handle a RequestVote. Returns the response and whether the election
    /// timer should be reset (only when the vote was granted).
    pub fn handle_vote_request(
        &mut self,
        term: Term,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: Term,
    ) -> Result<(RaftMessage, bool)> {
        if term < self.current_term {
            debug!(node = self.id, candidate = candidate_id, term, "rejecting vote for stale term");
            return Ok((self.vote_response(false), false));
        }
        if term > self.current_term {
            self.become_follower(term)?;
        }

        let can_vote = self.voted_for.is_none() || self.voted_for == Some(candidate_id);
        let up_to_date =
            (last_log_term, last_log_index) >= (self.last_log_term(), self.last_log_index());
        let granted = can_vote && up_to_date;

        if granted && self.voted_for != Some(candidate_id) {
            self.voted_for = Some(candidate_id);
            self.persist_term_and_vote()?;
        }
        debug!(node = self.id, candidate = candidate_id, term, granted, "vote request handled");

        Ok((self.vote_response(granted), granted))
    }

    fn vote_response(&self, vote_granted: bool) -> RaftMessage {
        RaftMessage::VoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Count a vote. Returns true when this vote made us leader.
    pub fn handle_vote_response(&mut self, term: Term, vote_granted: bool, from: NodeId) -> Result<bool> {
        if term > self.current_term {
            self.become_follower(term)?;
            return Ok(false);
        }
        if self.state != NodeState::Candidate || term < self.current_term {
            return Ok(false);
        }
        if vote_granted && self.cluster_nodes.contains(&from) && !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }
        if self.has_quorum() {
            self.become_leader();
            return Ok(true);
        }
        Ok(false)
    }

    // -- replication (leader side) --

    /// Append a client command to the leader's log.
    pub fn append_entry(&mut self, command: Vec<u8>) -> Result<LogEntry> {
        if self.state != NodeState::Leader {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader_id,
            });
        }
        let entry = LogEntry::new(self.current_term, self.last_log_index() + 1, command);
        self.persist_append(std::slice::from_ref(&entry))?;
        debug!(node = self.id, index = entry.index, term = entry.term, "appended entry");
        // a single-node cluster commits on its own append
        self.advance_commit_index();
        Ok(entry)
    }

    /// Build the AppendEntries for `peer` starting at its next index. Empty
    /// when the peer is caught up, which makes it a heartbeat.
    pub fn create_append_entries(&self, peer: NodeId) -> Option<RaftMessage> {
        if self.state != NodeState::Leader {
            return None;
        }
        let next = *self.next_index.get(&peer)?;
        let prev_log_index = next.saturating_sub(1);
        Some(RaftMessage::AppendEntries {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.get_term_at(prev_log_index),
            entries: self.log.entries_from(next, self.config.max_entries_per_append),
            leader_commit: self.commit_index,
        })
    }

    /// True when `peer` is missing entries the leader has.
    pub fn has_pending_entries(&self, peer: NodeId) -> bool {
        self.next_index
            .get(&peer)
            .is_some_and(|&next| next <= self.last_log_index())
    }

    /// Process a peer's AppendEntries response. Returns true when the commit
    /// index advanced.
    pub fn handle_append_entries_response(
        &mut self,
        term: Term,
        success: bool,
        from: NodeId,
        match_index: u64,
    ) -> Result<bool> {
        if term > self.current_term {
            self.become_follower(term)?;
            return Ok(false);
        }
        if self.state != NodeState::Leader || term < self.current_term {
            return Ok(false);
        }
        let (Some(&next), Some(&matched)) = (self.next_index.get(&from), self.match_index.get(&from)) else {
            return Ok(false);
        };

        if success {
            let reported = match_index.min(self.last_log_index());
            let matched = matched.max(reported);
            self.match_index.insert(from, matched);
            self.next_index.insert(from, next.max(matched + 1));
            return Ok(self.advance_commit_index());
        }

        let retreat = next.saturating_sub(1).min(match_index + 1).max(matched + 1).max(1);
        debug!(node = self.id, peer = from, next, retreat, "follower rejected append, retreating");
        self.next_index.insert(from, retreat);
        Ok(false)
    }

    /// Move the commit index to the highest entry of the current term that
    /// a quorum (self included) has stored. Earlier-term entries commit only
    /// as a side effect of that.
    fn advance_commit_index(&mut self) -> bool {
        if self.state != NodeState::Leader {
            return false;
        }
        let quorum = self.quorum_size();
        let mut index = self.last_log_index();
        while index > self.commit_index {
            if self.get_term_at(index) != self.current_term {
                break;
            }
            let replicated = 1 + self.match_index.values().filter(|&&m| m >= index).count();
            if replicated >= quorum {
                debug!(node = self.id, commit_index = index, "commit index advanced");
                self.commit_index = index;
                return true;
            }
            index -= 1;
        }
        false
    }

    // -- replication (follower side) --

    /// Handle an AppendEntries. Returns the response and whether the
    /// election timer should be reset (any request from a current leader).
    pub fn handle_append_entries(
        &mut self,
        term: Term,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> Result<(RaftMessage, bool)> {
        if term < self.current_term {
            return Ok((self.append_response(false, 0), false));
        }
        self.become_follower(term)?;
        self.leader_id = Some(leader_id);

        if !self.log.matches(prev_log_index, prev_log_term) {
            let hint = self.log.conflict_hint(prev_log_index);
            debug!(node = self.id, prev_log_index, prev_log_term, hint, "log consistency check failed");
            return Ok((self.append_response(false, hint), true));
        }

        let contiguous = entries
            .iter()
            .enumerate()
            .all(|(i, e)| e.index == prev_log_index + 1 + i as u64);
        if !contiguous {
            warn!(node = self.id, leader = leader_id, "ignoring malformed append entries");
            return Ok((self.append_response(false, self.log.conflict_hint(prev_log_index)), true));
        }

        // skip what we already have, truncate at the first conflict
        let mut first_new = entries.len();
        for (i, entry) in entries.iter().enumerate() {
            match self.log.term_at(entry.index) {
                Some(existing) if existing == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit_index {
                        warn!(node = self.id, index = entry.index, "leader conflicts with committed entry");
                        return Ok((self.append_response(false, self.commit_index), true));
                    }
                    self.persist_truncate(entry.index)?;
                    first_new = i;
                    break;
                }
                None => {
                    first_new = i;
                    break;
                }
            }
        }
        self.persist_append(&entries[first_new..])?;

        let last_new = prev_log_index + entries.len() as u64;
        if leader_commit > self.commit_index {
            let commit = leader_commit.min(last_new);
            if commit > self.commit_index {
                self.commit_index = commit;
            }
        }

        Ok((self.append_response(true, last_new), true))
    }

    fn append_response(&self, success: bool, match_index: u64) -> RaftMessage {
        RaftMessage::AppendEntriesResponse {
            term: self.current_term,
            success,
            match_index,
        }
    }

    // -- dispatch --

    /// Feed any message from `from` into the node.
    pub fn step(&mut self, from: NodeId, message: RaftMessage) -> Result<Step> {
        let commit_before = self.commit_index;
        let mut step = Step::default();
        match message {
            RaftMessage::VoteRequest {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                let (reply, reset) =
                    self.handle_vote_request(term, candidate_id, last_log_index, last_log_term)?;
                step.reply = Some(reply);
                step.reset_election_timer = reset;
            }
            RaftMessage::VoteResponse { term, vote_granted } => {
                step.became_leader = self.handle_vote_response(term, vote_granted, from)?;
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                let (reply, reset) = self.handle_append_entries(
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                )?;
                step.reply = Some(reply);
                step.reset_election_timer = reset;
            }
            RaftMessage::AppendEntriesResponse {
                term,
                success,
                match_index,
            } => {
                self.handle_append_entries_response(term, success, from, match_index)?;
            }
        }
        step.commit_advanced = self.commit_index > commit_before;
        Ok(step)
    }

    // -- state machine application --

    /// Committed entries not yet handed to the state machine, in order.
    /// Advances `last_applied` past them.
    pub fn get_entries_to_apply(&mut self) -> Vec<LogEntry> {
        let entries = self.log.range(self.last_applied, self.commit_index);
        if let Some(last) = entries.last() {
            self.last_applied = last.index;
        }
        entries
    }
}
