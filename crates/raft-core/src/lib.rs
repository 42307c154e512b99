//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-node's replica actor, persisted through raft-storage
//! what: state machine, election logic, log management, message types, storage contract

pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod storage;

/// Identifies a replica within the cluster.
pub type NodeId = u64;

/// Election epoch. Never decreases on a replica.
pub type Term = u64;

pub use error::{RaftError, Result};
pub use log::{LogEntry, RaftLog};
pub use message::RaftMessage;
pub use node::{NodeState, RaftConfig, RaftNode, Step};
pub use storage::{InMemoryStorage, Storage};
