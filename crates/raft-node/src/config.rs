//! # config
//!
//! why: give every component the same immutable view of the cluster
//! relations: read by the binary at startup, consumed by transport.rs and replica.rs
//! what: ClusterConfig (id -> endpoint map loaded from a property file), ConfigError

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use raft_core::NodeId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read cluster config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("replica {0} is listed more than once")]
    DuplicateId(NodeId),

    #[error("cluster config lists no replicas")]
    Empty,

    #[error("replica {0} is not a member of the cluster")]
    UnknownMember(NodeId),
}

/// Fixed cluster membership: every replica id and the `host:port` it
/// listens on. Loaded once and never changed while a replica runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    members: BTreeMap<NodeId, String>,
}

impl ClusterConfig {
    pub fn new(members: impl IntoIterator<Item = (NodeId, String)>) -> Result<Self, ConfigError> {
        let mut map = BTreeMap::new();
        for (id, endpoint) in members {
            if map.insert(id, normalize_endpoint(&endpoint)).is_some() {
                return Err(ConfigError::DuplicateId(id));
            }
        }
        if map.is_empty() {
            return Err(ConfigError::Empty);
        }
        Ok(Self { members: map })
    }

    /// Parse `<id>=<endpoint>` lines. Blank lines and `#` comments are
    /// skipped.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut members = Vec::new();
        for (n, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parse_error = |reason: &str| ConfigError::Parse {
                line: n + 1,
                reason: reason.to_string(),
            };
            let (id, endpoint) = line
                .split_once('=')
                .ok_or_else(|| parse_error("expected <id>=<endpoint>"))?;
            let id: NodeId = id
                .trim()
                .parse()
                .map_err(|_| parse_error("replica id must be an unsigned integer"))?;
            let endpoint = endpoint.trim();
            if endpoint.is_empty() {
                return Err(parse_error("endpoint is empty"));
            }
            members.push((id, endpoint.to_string()));
        }
        Self::new(members)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Fail unless `id` is one of the configured replicas.
    pub fn require_member(&self, id: NodeId) -> Result<(), ConfigError> {
        if self.members.contains_key(&id) {
            Ok(())
        } else {
            Err(ConfigError::UnknownMember(id))
        }
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.members.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Majority size: floor(N/2) + 1.
    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    /// Every member except `id`.
    pub fn peers_of(&self, id: NodeId) -> Vec<NodeId> {
        self.members.keys().copied().filter(|&m| m != id).collect()
    }

    pub fn endpoint(&self, id: NodeId) -> Option<&str> {
        self.members.get(&id).map(String::as_str)
    }
}

/// Reduce `http://host:port/path` to `host:port`.
fn normalize_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(trimmed);
    without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .to_string()
}
