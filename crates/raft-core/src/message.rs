//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by node.rs, serialized by raft-node for the network
//! what: VoteRequest, VoteResponse, AppendEntries, AppendEntriesResponse

use serde::{Deserialize, Serialize};

use crate::{LogEntry, NodeId, Term};

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RaftMessage {
    /// Request a vote during leader election
    VoteRequest {
        term: Term,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: Term,
    },
    /// Response to a vote request
    VoteResponse {
        term: Term,
        vote_granted: bool,
    },
    /// Replicate log entries (also serves as heartbeat when entries is empty)
    AppendEntries {
        term: Term,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    /// Response to AppendEntries.
    ///
    /// On success `match_index` is the last index the follower now shares
    /// with the leader. On failure it is the follower's hint of the last
    /// index that may still match, used by the leader to skip back.
    AppendEntriesResponse {
        term: Term,
        success: bool,
        match_index: u64,
    },
}

impl RaftMessage {
    /// The sender's term, carried by every message.
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::VoteRequest { term, .. }
            | RaftMessage::VoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendEntriesResponse { term, .. } => *term,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::VoteRequest { .. } => "vote_request",
            RaftMessage::VoteResponse { .. } => "vote_response",
            RaftMessage::AppendEntries { .. } => "append_entries",
            RaftMessage::AppendEntriesResponse { .. } => "append_entries_response",
        }
    }
}
