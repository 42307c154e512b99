//! # gateway
//!
//! why: hold client proposals until their log index is applied
//! relations: filled by the replica on propose, drained on apply and on stepdown
//! what: ProposalError, Gateway registry (index -> waiter)

use std::collections::BTreeMap;

use raft_core::NodeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Why a proposal did not produce an output. Every variant is retryable,
/// possibly against a different replica.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum ProposalError {
    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("leadership lost before the proposal committed")]
    LeadershipLost,

    #[error("proposal timed out")]
    Timeout,

    #[error("replica stopped")]
    Stopped,
}

pub type ProposalResult = Result<Vec<u8>, ProposalError>;

pub type Waiter = oneshot::Sender<ProposalResult>;

/// Pending proposals keyed by log index.
#[derive(Debug, Default)]
pub struct Gateway {
    pending: BTreeMap<u64, Waiter>,
}

impl Gateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, index: u64, waiter: Waiter) {
        self.pending.insert(index, waiter);
    }

    /// Hand the state machine's output for `index` to its waiter, if any.
    pub fn resolve(&mut self, index: u64, output: Vec<u8>) -> bool {
        match self.pending.remove(&index) {
            Some(waiter) => {
                // the caller may have given up already
                let _ = waiter.send(Ok(output));
                true
            }
            None => false,
        }
    }

    /// Fail every proposal above `commit_index`. Committed ones stay and
    /// resolve once applied.
    pub fn fail_uncommitted(&mut self, commit_index: u64, error: ProposalError) -> usize {
        let failed = self.pending.split_off(&(commit_index + 1));
        fail(failed, &error)
    }

    pub fn fail_all(&mut self, error: ProposalError) -> usize {
        fail(std::mem::take(&mut self.pending), &error)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn fail(waiters: BTreeMap<u64, Waiter>, error: &ProposalError) -> usize {
    let count = waiters.len();
    for (index, waiter) in waiters {
        debug!(index, %error, "failing pending proposal");
        let _ = waiter.send(Err(error.clone()));
    }
    count
}
