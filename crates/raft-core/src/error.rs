//! # error
//!
//! why: give every failure the engine can produce a name callers can match on
//! relations: returned by node.rs and log.rs, wrapped by raft-node for clients
//! what: RaftError taxonomy and the crate-wide Result alias

use std::io;

use thiserror::Error;

use crate::NodeId;

pub type Result<T> = std::result::Result<T, RaftError>;

#[derive(Debug, Error)]
pub enum RaftError {
    /// The log could not be reconciled with what the leader sent.
    #[error("log inconsistency at index {index}: {reason}")]
    LogInconsistency { index: u64, reason: &'static str },

    /// Only the leader accepts proposals.
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("log index {index} out of range [{first}, {last}]")]
    OutOfRange { index: u64, first: u64, last: u64 },

    /// The durable store failed. The replica must stop: continuing could
    /// answer an RPC about state that was never written.
    #[error("persistence failure: {0}")]
    Persistence(#[from] io::Error),
}

impl RaftError {
    /// Whether the replica can keep running after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RaftError::Persistence(_))
    }
}
