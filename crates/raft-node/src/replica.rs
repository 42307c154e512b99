//! # replica
//!
//! why: run one raft node as a single-owner actor so no two transitions interleave
//! relations: owns a raft-core RaftNode; talks to peers via transport.rs, clients via handle.rs
//! what: Replica event loop, Status snapshot, the Command mailbox protocol
//!
//! Everything that mutates consensus state happens inside [`Replica::run`].
//! Outbound rpcs run on spawned tasks and post their results back into the
//! loop, tagged with the term they were sent in; a result from an earlier
//! term only matters when it reveals a newer term.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use raft_core::{LogEntry, NodeId, NodeState, RaftError, RaftMessage, RaftNode, Storage, Term};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::applier::{spawn_applier, Applied};
use crate::gateway::{Gateway, ProposalError, Waiter};
use crate::handle::ReplicaHandle;
use crate::state_machine::StateMachine;
use crate::timer::{election_timeout, heartbeat_interval, Timer, TimerFired, TimerKind};
use crate::transport::{RpcClient, Transport, TransportError};

const MAILBOX_CAPACITY: usize = 1024;

/// Point-in-time view of a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub id: NodeId,
    pub role: NodeState,
    pub term: Term,
    pub leader_hint: Option<NodeId>,
    pub commit_index: u64,
    /// Highest index the state machine has finished applying.
    pub last_applied: u64,
    pub last_log_index: u64,
}

pub(crate) enum Command {
    /// Inbound rpc from a peer; `reply` gets the response once the state
    /// it reports on is durable.
    Deliver {
        from: NodeId,
        message: RaftMessage,
        reply: oneshot::Sender<RaftMessage>,
    },
    Propose {
        command: Vec<u8>,
        reply: Waiter,
    },
    Status {
        reply: oneshot::Sender<Status>,
    },
    Campaign {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RpcKind {
    Vote,
    Append,
}

struct PeerResponse {
    peer: NodeId,
    kind: RpcKind,
    /// Term the request was sent in.
    term: Term,
    result: Result<RaftMessage, TransportError>,
}

#[derive(Debug, Clone, Copy)]
struct Observed {
    state: NodeState,
    term: Term,
    commit_index: u64,
}

pub struct Replica<S: Storage> {
    node: RaftNode<S>,
    rpc: RpcClient,
    gateway: Gateway,
    mailbox: mpsc::Receiver<Command>,
    responses_tx: mpsc::UnboundedSender<PeerResponse>,
    responses: mpsc::UnboundedReceiver<PeerResponse>,
    timers: mpsc::UnboundedReceiver<TimerFired>,
    election: Timer,
    heartbeat: Timer,
    apply_tx: mpsc::UnboundedSender<LogEntry>,
    applied: mpsc::UnboundedReceiver<Applied>,
    applied_index: u64,
    /// Outstanding AppendEntries per peer, by the term it was sent in.
    in_flight: HashMap<NodeId, Term>,
    /// Last current-term AppendEntries response per peer (check-quorum).
    last_ack: HashMap<NodeId, Instant>,
    leader_since: Option<Instant>,
}

impl<S: Storage + Send + 'static> Replica<S> {
    /// Start the actor and its applier. The task ends with `Ok` on
    /// shutdown and with the error on a fatal persistence failure.
    pub fn spawn<M: StateMachine>(
        node: RaftNode<S>,
        transport: Arc<dyn Transport>,
        state_machine: M,
    ) -> (ReplicaHandle, JoinHandle<Result<(), RaftError>>) {
        let id = node.id;
        let (tx, mailbox) = mpsc::channel(MAILBOX_CAPACITY);
        let (responses_tx, responses) = mpsc::unbounded_channel();
        let (timer_tx, timers) = mpsc::unbounded_channel();
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let (applied_tx, applied) = mpsc::unbounded_channel();

        spawn_applier(state_machine, node.last_applied, apply_rx, applied_tx);

        let replica = Replica {
            rpc: RpcClient::new(transport, Duration::from_millis(node.config.rpc_timeout)),
            gateway: Gateway::new(),
            mailbox,
            responses_tx,
            responses,
            timers,
            election: Timer::new(TimerKind::Election, timer_tx.clone()),
            heartbeat: Timer::new(TimerKind::Heartbeat, timer_tx),
            apply_tx,
            applied,
            applied_index: node.last_applied,
            in_flight: HashMap::new(),
            last_ack: HashMap::new(),
            leader_since: None,
            node,
        };
        let task = tokio::spawn(replica.run());
        (ReplicaHandle::new(id, tx), task)
    }

    async fn run(mut self) -> Result<(), RaftError> {
        info!(node = self.node.id, term = self.node.current_term, "replica started");
        self.arm_election();

        let outcome = loop {
            let result = tokio::select! {
                command = self.mailbox.recv() => match command {
                    Some(Command::Shutdown) | None => break Ok(()),
                    Some(command) => self.on_command(command),
                },
                Some(response) = self.responses.recv() => self.on_response(response),
                Some(fired) = self.timers.recv() => self.on_timer(fired),
                Some(applied) = self.applied.recv() => {
                    self.on_applied(applied);
                    Ok(())
                }
            };
            if let Err(err) = result {
                if err.is_fatal() {
                    error!(node = self.node.id, error = %err, "halting replica");
                    break Err(err);
                }
                warn!(node = self.node.id, error = %err, "transition failed");
            }
        };

        self.election.cancel();
        self.heartbeat.cancel();
        let failed = self.gateway.fail_all(ProposalError::Stopped);
        info!(node = self.node.id, term = self.node.current_term, failed, "replica stopped");
        outcome
    }

    // -- mailbox --

    fn on_command(&mut self, command: Command) -> Result<(), RaftError> {
        match command {
            Command::Deliver { from, message, reply } => {
                let before = self.observe();
                let step = self.node.step(from, message)?;
                if step.reset_election_timer {
                    self.arm_election();
                }
                if let Some(response) = step.reply {
                    let _ = reply.send(response);
                }
                self.after_transition(before);
                Ok(())
            }
            Command::Propose { command, reply } => self.propose(command, reply),
            Command::Status { reply } => {
                let _ = reply.send(self.status());
                Ok(())
            }
            Command::Campaign { reply } => {
                let result = self.campaign();
                let _ = reply.send(());
                result
            }
            Command::Shutdown => Ok(()),
        }
    }

    fn propose(&mut self, command: Vec<u8>, reply: Waiter) -> Result<(), RaftError> {
        let before = self.observe();
        match self.node.append_entry(command) {
            Ok(entry) => {
                self.gateway.register(entry.index, reply);
                self.after_transition(before);
                Ok(())
            }
            Err(RaftError::NotLeader { leader_hint }) => {
                let _ = reply.send(Err(ProposalError::NotLeader { leader_hint }));
                Ok(())
            }
            Err(err) => {
                let _ = reply.send(Err(ProposalError::Stopped));
                Err(err)
            }
        }
    }

    fn status(&self) -> Status {
        Status {
            id: self.node.id,
            role: self.node.state,
            term: self.node.current_term,
            leader_hint: self.node.leader_id,
            commit_index: self.node.commit_index,
            last_applied: self.applied_index,
            last_log_index: self.node.last_log_index(),
        }
    }

    // -- elections --

    fn campaign(&mut self) -> Result<(), RaftError> {
        let before = self.observe();
        let request = self.node.start_election()?;
        self.arm_election();

        if self.node.has_quorum() {
            self.node.become_leader();
        } else {
            let term = self.node.current_term;
            let peers: Vec<NodeId> = self.node.peers().collect();
            for peer in peers {
                let rpc = self.rpc.clone();
                let responses = self.responses_tx.clone();
                let request = request.clone();
                tokio::spawn(async move {
                    let result = rpc.request_vote(peer, request).await;
                    let _ = responses.send(PeerResponse {
                        peer,
                        kind: RpcKind::Vote,
                        term,
                        result,
                    });
                });
            }
        }

        self.after_transition(before);
        Ok(())
    }

    fn arm_election(&mut self) {
        self.election.arm(election_timeout(&self.node.config));
    }

    // -- replication --

    fn replicate(&mut self, force: bool) {
        let peers: Vec<NodeId> = self.node.peers().collect();
        for peer in peers {
            if force || self.node.has_pending_entries(peer) {
                self.send_append(peer);
            }
        }
    }

    /// At most one AppendEntries per peer is outstanding. The next one goes
    /// out when the response (or its failure) comes back.
    fn send_append(&mut self, peer: NodeId) {
        let term = self.node.current_term;
        if self.in_flight.get(&peer) == Some(&term) {
            return;
        }
        let Some(request) = self.node.create_append_entries(peer) else {
            return;
        };
        self.in_flight.insert(peer, term);

        let rpc = self.rpc.clone();
        let responses = self.responses_tx.clone();
        tokio::spawn(async move {
            let result = rpc.append_entries(peer, request).await;
            let _ = responses.send(PeerResponse {
                peer,
                kind: RpcKind::Append,
                term,
                result,
            });
        });
    }

    fn on_response(&mut self, response: PeerResponse) -> Result<(), RaftError> {
        let PeerResponse {
            peer,
            kind,
            term,
            result,
        } = response;
        if kind == RpcKind::Append && self.in_flight.get(&peer) == Some(&term) {
            self.in_flight.remove(&peer);
        }

        let message = match result {
            Ok(message) => message,
            Err(err) => {
                debug!(node = self.node.id, peer, ?kind, error = %err, "rpc failed");
                return Ok(());
            }
        };

        let before = self.observe();
        if message.term() > self.node.current_term {
            self.node.become_follower(message.term())?;
        } else if term != self.node.current_term {
            trace!(node = self.node.id, peer, term, "dropping response to an earlier term");
            return Ok(());
        } else {
            if kind == RpcKind::Append {
                self.last_ack.insert(peer, Instant::now());
            }
            self.node.step(peer, message)?;
        }
        self.after_transition(before);
        Ok(())
    }

    // -- timers --

    fn on_timer(&mut self, fired: TimerFired) -> Result<(), RaftError> {
        match fired.kind {
            TimerKind::Election => {
                if !self.election.is_current(fired.epoch) || self.node.is_leader() {
                    return Ok(());
                }
                info!(node = self.node.id, term = self.node.current_term, "election timeout");
                self.campaign()
            }
            TimerKind::Heartbeat => {
                if !self.heartbeat.is_current(fired.epoch) || !self.node.is_leader() {
                    return Ok(());
                }
                if self.quorum_lost() {
                    return self.step_down_without_quorum();
                }
                self.replicate(true);
                self.heartbeat.arm(heartbeat_interval(&self.node.config));
                Ok(())
            }
        }
    }

    /// Check-quorum: a quorum (self included) must have answered within
    /// the last `election_timeout_max`.
    fn quorum_lost(&self) -> bool {
        if !self.node.config.check_quorum {
            return false;
        }
        let window = Duration::from_millis(self.node.config.election_timeout_max);
        let now = Instant::now();
        match self.leader_since {
            Some(since) if now.duration_since(since) >= window => {}
            _ => return false,
        }
        let recent = self
            .last_ack
            .values()
            .filter(|&&at| now.duration_since(at) < window)
            .count();
        recent + 1 < self.node.quorum_size()
    }

    fn step_down_without_quorum(&mut self) -> Result<(), RaftError> {
        warn!(node = self.node.id, term = self.node.current_term, "lost contact with a quorum, stepping down");
        let before = self.observe();
        self.node.become_follower(self.node.current_term)?;
        self.node.leader_id = None;
        self.after_transition(before);
        Ok(())
    }

    // -- bookkeeping after every transition --

    fn observe(&self) -> Observed {
        Observed {
            state: self.node.state,
            term: self.node.current_term,
            commit_index: self.node.commit_index,
        }
    }

    fn after_transition(&mut self, before: Observed) {
        let state = self.node.state;
        let new_term = self.node.current_term != before.term;

        if before.state == NodeState::Leader && (state != NodeState::Leader || new_term) {
            self.on_leadership_lost(before.commit_index);
        }
        if state == NodeState::Leader {
            if before.state != NodeState::Leader || new_term {
                self.on_leadership_won();
            } else {
                self.replicate(self.node.commit_index > before.commit_index);
            }
        }
        self.drain_committed();
    }

    fn on_leadership_won(&mut self) {
        self.election.cancel();
        self.in_flight.clear();
        self.last_ack.clear();
        self.leader_since = Some(Instant::now());
        self.replicate(true);
        self.heartbeat.arm(heartbeat_interval(&self.node.config));
    }

    /// Proposals above the commit index we reached as leader may have been
    /// replaced by the new leader, even if that same step advanced the
    /// commit index past them.
    fn on_leadership_lost(&mut self, committed_as_leader: u64) {
        self.heartbeat.cancel();
        self.in_flight.clear();
        self.last_ack.clear();
        self.leader_since = None;
        let failed = self
            .gateway
            .fail_uncommitted(committed_as_leader, ProposalError::LeadershipLost);
        if failed > 0 {
            info!(node = self.node.id, failed, "failed proposals after losing leadership");
        }
        if self.node.state != NodeState::Leader {
            self.arm_election();
        }
    }

    fn drain_committed(&mut self) {
        for entry in self.node.get_entries_to_apply() {
            trace!(node = self.node.id, index = entry.index, "handing entry to applier");
            if self.apply_tx.send(entry).is_err() {
                warn!(node = self.node.id, "applier has stopped");
                break;
            }
        }
    }

    fn on_applied(&mut self, applied: Applied) {
        self.applied_index = applied.index;
        self.gateway.resolve(applied.index, applied.output);
    }
}
