//! # raft-node
//!
//! why: turn the pure raft-core engine into a running, networked replica
//! relations: drives raft-core's RaftNode, persists through raft-storage, used by the raft-node binary
//! what: replica actor, timers, transports, rpc server, client gateway, applier, state machines

pub mod applier;
pub mod config;
pub mod gateway;
pub mod handle;
pub mod replica;
pub mod server;
pub mod state_machine;
pub mod timer;
pub mod transport;
pub mod wire;

pub use config::{ClusterConfig, ConfigError};
pub use gateway::{ProposalError, ProposalResult};
pub use handle::{ReplicaHandle, Stopped};
pub use replica::{Replica, Status};
pub use server::{propose_remote, RpcServer};
pub use state_machine::{KvCommand, KvStore, StateMachine};
pub use transport::{LocalNetwork, RpcClient, TcpTransport, Transport, TransportError};
