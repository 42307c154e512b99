//! # transport
//!
//! why: carry consensus rpcs between replicas without the actor knowing how
//! relations: used by replica.rs through RpcClient; server.rs is the tcp receiving end
//! what: Transport trait, RpcClient (per-call timeout), TcpTransport, LocalNetwork
//!
//! A transport is created per replica and sends on that replica's behalf.
//! Each call is one request and one response. [`RpcClient`] wraps a
//! transport with a deadline and checks that the response matches the
//! request kind.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use raft_core::{NodeId, RaftMessage};
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::trace;

use crate::config::ClusterConfig;
use crate::handle::ReplicaHandle;
use crate::wire::{read_message, write_message, Request, Response};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("rpc to replica {0} timed out")]
    Timeout(NodeId),

    #[error("i/o error talking to replica {peer}: {source}")]
    Io {
        peer: NodeId,
        #[source]
        source: io::Error,
    },

    #[error("replica {0} is not in the cluster")]
    UnknownPeer(NodeId),

    #[error("replica {0} is unreachable")]
    Unreachable(NodeId),

    #[error("replica {peer} answered with an unexpected {kind}")]
    UnexpectedResponse { peer: NodeId, kind: &'static str },

    #[error("connection closed")]
    Closed,
}

/// Request/response delivery to one peer at a time.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn call(&self, to: NodeId, message: RaftMessage) -> Result<RaftMessage, TransportError>;
}

/// The capability the replica uses to reach its peers: one method per rpc
/// kind, each bounded by its own deadline.
#[derive(Clone)]
pub struct RpcClient {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub async fn request_vote(&self, peer: NodeId, request: RaftMessage) -> Result<RaftMessage, TransportError> {
        let response = self.call(peer, request).await?;
        match response {
            RaftMessage::VoteResponse { .. } => Ok(response),
            other => Err(TransportError::UnexpectedResponse {
                peer,
                kind: other.kind(),
            }),
        }
    }

    pub async fn append_entries(&self, peer: NodeId, request: RaftMessage) -> Result<RaftMessage, TransportError> {
        let response = self.call(peer, request).await?;
        match response {
            RaftMessage::AppendEntriesResponse { .. } => Ok(response),
            other => Err(TransportError::UnexpectedResponse {
                peer,
                kind: other.kind(),
            }),
        }
    }

    async fn call(&self, peer: NodeId, request: RaftMessage) -> Result<RaftMessage, TransportError> {
        tokio::time::timeout(self.timeout, self.transport.call(peer, request))
            .await
            .map_err(|_| TransportError::Timeout(peer))?
    }
}

// -- tcp --

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Connection {
    async fn open(endpoint: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read),
            writer: write,
        })
    }

    async fn exchange(&mut self, request: &Request) -> io::Result<Response> {
        write_message(&mut self.writer, request).await?;
        read_message(&mut self.reader)
            .await?
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection"))
    }
}

/// Newline-delimited json over tcp, one idle connection kept per peer.
///
/// A connection is checked out for the duration of a call and returned
/// only after a complete exchange, so a call abandoned at its deadline
/// never leaves a half-read response behind for the next one.
pub struct TcpTransport {
    id: NodeId,
    cluster: ClusterConfig,
    idle: tokio::sync::Mutex<HashMap<NodeId, Connection>>,
}

impl TcpTransport {
    pub fn new(id: NodeId, cluster: ClusterConfig) -> Self {
        Self {
            id,
            cluster,
            idle: tokio::sync::Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, to: NodeId, message: RaftMessage) -> Result<RaftMessage, TransportError> {
        let endpoint = self.cluster.endpoint(to).ok_or(TransportError::UnknownPeer(to))?;
        let io_error = |source| TransportError::Io { peer: to, source };

        let cached = self.idle.lock().await.remove(&to);
        let mut connection = match cached {
            Some(connection) => connection,
            None => {
                trace!(node = self.id, peer = to, endpoint, "connecting");
                Connection::open(endpoint).await.map_err(io_error)?
            }
        };

        let request = Request::Raft {
            from: self.id,
            message,
        };
        let response = connection.exchange(&request).await.map_err(io_error)?;
        self.idle.lock().await.insert(to, connection);

        match response {
            Response::Raft { message } => Ok(message),
            Response::Proposal { .. } => Err(TransportError::UnexpectedResponse {
                peer: to,
                kind: "proposal",
            }),
        }
    }
}

// -- in-process --

#[derive(Default)]
struct LocalState {
    replicas: HashMap<NodeId, ReplicaHandle>,
    isolated: HashSet<NodeId>,
    cut: HashSet<(NodeId, NodeId)>,
}

/// In-process network for tests and simulations. Replicas register their
/// handles; links can be cut and replicas isolated to model partitions.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<LocalState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `handle` reachable as its replica id, replacing any earlier
    /// registration (a restarted replica).
    pub fn register(&self, handle: ReplicaHandle) {
        self.state().replicas.insert(handle.id(), handle);
    }

    pub fn unregister(&self, id: NodeId) {
        self.state().replicas.remove(&id);
    }

    /// A transport that sends as replica `id`.
    pub fn transport(&self, id: NodeId) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            me: id,
            network: self.clone(),
        })
    }

    /// Drop all traffic to and from `id`.
    pub fn isolate(&self, id: NodeId) {
        self.state().isolated.insert(id);
    }

    /// Drop traffic between `a` and `b` in both directions.
    pub fn cut(&self, a: NodeId, b: NodeId) {
        let mut state = self.state();
        state.cut.insert((a, b));
        state.cut.insert((b, a));
    }

    pub fn heal(&self) {
        let mut state = self.state();
        state.isolated.clear();
        state.cut.clear();
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<ReplicaHandle, TransportError> {
        let state = self.state();
        if state.isolated.contains(&from) || state.isolated.contains(&to) || state.cut.contains(&(from, to)) {
            return Err(TransportError::Unreachable(to));
        }
        state.replicas.get(&to).cloned().ok_or(TransportError::Unreachable(to))
    }
}

struct LocalTransport {
    me: NodeId,
    network: LocalNetwork,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, to: NodeId, message: RaftMessage) -> Result<RaftMessage, TransportError> {
        let handle = self.network.route(self.me, to)?;
        let response = handle.deliver(self.me, message).await.map_err(|_| TransportError::Closed)?;
        // a partition that appeared mid-call loses the response
        self.network.route(to, self.me)?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Transport for Echo {
        async fn call(&self, _to: NodeId, message: RaftMessage) -> Result<RaftMessage, TransportError> {
            Ok(message)
        }
    }

    struct Silent;

    #[async_trait]
    impl Transport for Silent {
        async fn call(&self, _to: NodeId, _message: RaftMessage) -> Result<RaftMessage, TransportError> {
            std::future::pending().await
        }
    }

    fn vote_request() -> RaftMessage {
        RaftMessage::VoteRequest {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        }
    }

    #[tokio::test]
    async fn mismatched_response_kind_is_rejected() {
        let client = RpcClient::new(Arc::new(Echo), Duration::from_millis(50));

        let err = client.request_vote(2, vote_request()).await.unwrap_err();

        assert!(matches!(err, TransportError::UnexpectedResponse { peer: 2, .. }));
    }

    #[tokio::test]
    async fn calls_are_bounded_by_the_rpc_timeout() {
        let client = RpcClient::new(Arc::new(Silent), Duration::from_millis(20));

        let err = client.append_entries(3, vote_request()).await.unwrap_err();

        assert!(matches!(err, TransportError::Timeout(3)));
    }

    #[tokio::test]
    async fn unknown_tcp_peer_fails_fast() {
        let cluster = ClusterConfig::parse("1=127.0.0.1:1").unwrap();
        let transport = TcpTransport::new(1, cluster);

        let err = transport.call(7, vote_request()).await.unwrap_err();

        assert!(matches!(err, TransportError::UnknownPeer(7)));
    }

    #[tokio::test]
    async fn isolated_or_unregistered_replicas_are_unreachable() {
        let network = LocalNetwork::new();
        let transport = network.transport(1);

        let err = transport.call(2, vote_request()).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(2)));

        network.isolate(1);
        let err = transport.call(2, vote_request()).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(2)));
    }
}
