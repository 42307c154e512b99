//! # server
//!
//! why: receive peer rpcs and client proposals over tcp and feed them to the replica
//! relations: the receiving end of TcpTransport; forwards into handle.rs
//! what: RpcServer accept loop, per-connection handler, propose_remote client call

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::select;
use tracing::{debug, info, warn};

use crate::gateway::ProposalResult;
use crate::handle::ReplicaHandle;
use crate::wire::{read_message, write_message, Request, Response};

pub struct RpcServer {
    listener: TcpListener,
    handle: ReplicaHandle,
}

impl RpcServer {
    pub fn new(listener: TcpListener, handle: ReplicaHandle) -> Self {
        Self { listener, handle }
    }

    pub async fn bind(addr: impl ToSocketAddrs, handle: ReplicaHandle) -> io::Result<Self> {
        Ok(Self::new(TcpListener::bind(addr).await?, handle))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` completes. Each connection gets
    /// its own task; frames on one connection are answered in order.
    pub async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RpcServer { listener, handle } = self;
        tokio::pin!(shutdown);
        info!(node = handle.id(), addr = %listener.local_addr()?, "rpc server listening");

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(node = handle.id(), "rpc server shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => spawn_connection(stream, peer, handle.clone()),
                    Err(err) => warn!(node = handle.id(), error = ?err, "failed to accept connection"),
                },
            }
        }

        Ok(())
    }
}

fn spawn_connection(stream: TcpStream, peer: SocketAddr, handle: ReplicaHandle) {
    tokio::spawn(async move {
        if let Err(err) = serve_connection(stream, &handle).await {
            debug!(node = handle.id(), peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

async fn serve_connection(stream: TcpStream, handle: &ReplicaHandle) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    while let Some(request) = read_message::<_, Request>(&mut reader).await? {
        let response = match request {
            Request::Raft { from, message } => match handle.deliver(from, message).await {
                Ok(message) => Response::Raft { message },
                Err(stopped) => {
                    debug!(peer = from, error = %stopped, "dropping rpc");
                    return Ok(());
                }
            },
            Request::Propose { command } => Response::Proposal {
                result: handle.propose(command).await,
            },
        };
        write_message(&mut write, &response).await?;
    }

    Ok(())
}

/// Send one proposal to the replica listening at `endpoint` and wait for
/// its outcome.
pub async fn propose_remote(endpoint: &str, command: Vec<u8>) -> io::Result<ProposalResult> {
    let stream = TcpStream::connect(endpoint).await?;
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    write_message(&mut write, &Request::Propose { command }).await?;
    match read_message::<_, Response>(&mut reader).await? {
        Some(Response::Proposal { result }) => Ok(result),
        Some(Response::Raft { .. }) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "expected a proposal response",
        )),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "replica closed the connection",
        )),
    }
}
