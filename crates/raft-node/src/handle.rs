//! # handle
//!
//! why: the only way code outside the actor talks to a replica
//! relations: created by replica.rs; used by server.rs, LocalNetwork and callers
//! what: ReplicaHandle (propose, status, campaign, deliver, shutdown), Stopped

use std::time::Duration;

use raft_core::{NodeId, RaftMessage};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::gateway::{ProposalError, ProposalResult};
use crate::replica::{Command, Status};

pub const DEFAULT_PROPOSAL_TIMEOUT: Duration = Duration::from_secs(5);

/// The replica's event loop has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("replica {0} has stopped")]
pub struct Stopped(pub NodeId);

/// Cheap, cloneable sender into a replica's mailbox.
#[derive(Debug, Clone)]
pub struct ReplicaHandle {
    id: NodeId,
    tx: mpsc::Sender<Command>,
    proposal_timeout: Duration,
}

impl ReplicaHandle {
    pub(crate) fn new(id: NodeId, tx: mpsc::Sender<Command>) -> Self {
        Self {
            id,
            tx,
            proposal_timeout: DEFAULT_PROPOSAL_TIMEOUT,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// How long [`propose`](Self::propose) waits before giving up with
    /// [`ProposalError::Timeout`].
    pub fn with_proposal_timeout(mut self, timeout: Duration) -> Self {
        self.proposal_timeout = timeout;
        self
    }

    /// Submit a command. Resolves with the state machine's output once the
    /// entry is applied on this replica.
    pub async fn propose(&self, command: Vec<u8>) -> ProposalResult {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Propose { command, reply })
            .await
            .map_err(|_| ProposalError::Stopped)?;
        match tokio::time::timeout(self.proposal_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProposalError::Stopped),
            Err(_) => Err(ProposalError::Timeout),
        }
    }

    pub async fn status(&self) -> Result<Status, Stopped> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Start an election now instead of waiting for the timer.
    pub async fn campaign(&self) -> Result<(), Stopped> {
        self.request(|reply| Command::Campaign { reply }).await
    }

    /// Hand an inbound rpc from `from` to the replica and wait for its
    /// response.
    pub async fn deliver(&self, from: NodeId, message: RaftMessage) -> Result<RaftMessage, Stopped> {
        self.request(|reply| Command::Deliver { from, message, reply }).await
    }

    /// Ask the event loop to exit. Pending proposals fail with
    /// [`ProposalError::Stopped`].
    pub async fn shutdown(&self) -> Result<(), Stopped> {
        self.tx
            .send(Command::Shutdown)
            .await
            .map_err(|_| Stopped(self.id))
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, Stopped> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| Stopped(self.id))?;
        rx.await.map_err(|_| Stopped(self.id))
    }
}
