//! # state_machine
//!
//! why: the application side of the replicated log
//! relations: driven by applier.rs, one instance per replica
//! what: StateMachine trait, KvStore demo implementation with json commands

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Deterministic application logic. `apply` runs exactly once per
/// committed index, in index order, and must produce the same output on
/// every replica for the same command.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, command: &[u8], index: u64) -> Vec<u8>;
}

impl<F> StateMachine for F
where
    F: FnMut(&[u8], u64) -> Vec<u8> + Send + 'static,
{
    fn apply(&mut self, command: &[u8], index: u64) -> Vec<u8> {
        self(command, index)
    }
}

/// Commands understood by [`KvStore`], encoded as json.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum KvCommand {
    Put { key: String, value: String },
    Get { key: String },
    Delete { key: String },
}

impl KvCommand {
    pub fn encode(&self) -> Vec<u8> {
        // a derived Serialize over strings cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Output of one [`KvCommand`]: the previous value for put/delete, the
/// current value for get, or an error for an undecodable command.
pub type KvOutput = Result<Option<String>, String>;

/// In-memory key/value map.
#[derive(Debug, Default, Clone)]
pub struct KvStore {
    data: BTreeMap<String, String>,
    last_index: u64,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Highest index applied so far.
    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    fn execute(&mut self, command: KvCommand) -> Option<String> {
        match command {
            KvCommand::Put { key, value } => self.data.insert(key, value),
            KvCommand::Get { key } => self.data.get(&key).cloned(),
            KvCommand::Delete { key } => self.data.remove(&key),
        }
    }
}

impl StateMachine for KvStore {
    fn apply(&mut self, command: &[u8], index: u64) -> Vec<u8> {
        self.last_index = index;
        let output: KvOutput = serde_json::from_slice::<KvCommand>(command)
            .map(|cmd| self.execute(cmd))
            .map_err(|e| format!("invalid command: {e}"));
        serde_json::to_vec(&output).unwrap_or_default()
    }
}

/// Decode a [`KvStore`] output.
pub fn decode_kv_output(bytes: &[u8]) -> Result<KvOutput, serde_json::Error> {
    serde_json::from_slice(bytes)
}
