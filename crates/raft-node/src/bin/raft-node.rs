use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use raft_core::{NodeId, RaftConfig, RaftError, RaftNode};
use raft_node::{propose_remote, ClusterConfig, KvStore, ProposalError, Replica, RpcServer, TcpTransport};
use raft_storage::FileStorage;
use tokio::task::JoinError;
use tracing::{info, warn};

const RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Parser, Debug)]
#[command(author, version, about = "Raft replica and client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one replica of the cluster.
    Serve(ServeArgs),
    /// Submit a command to the cluster, following leader redirects.
    Propose(ProposeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Id of this replica in the cluster config.
    id: NodeId,

    /// Cluster config with one `<id>=<endpoint>` line per replica.
    #[arg(short = 'c', long = "config", default_value = "barge.conf")]
    config: PathBuf,

    /// Directory for term, vote and log. Defaults to `log<id>`.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long, default_value_t = 150)]
    election_min_ms: u64,

    #[arg(long, default_value_t = 300)]
    election_max_ms: u64,

    #[arg(long, default_value_t = 50)]
    heartbeat_ms: u64,

    /// Step down when a quorum stops answering.
    #[arg(long)]
    check_quorum: bool,
}

#[derive(Args, Debug)]
struct ProposeArgs {
    #[arg(short = 'c', long = "config", default_value = "barge.conf")]
    config: PathBuf,

    /// Replica to try first. Defaults to the lowest id.
    #[arg(long)]
    to: Option<NodeId>,

    /// Command bytes, e.g. '{"op":"put","key":"a","value":"1"}'.
    command: String,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Propose(args) => propose(args).await,
    }
}

fn load_cluster(path: &PathBuf) -> Result<ClusterConfig> {
    ClusterConfig::load(path).with_context(|| format!("loading cluster config {}", path.display()))
}

async fn serve(args: ServeArgs) -> Result<()> {
    let cluster = load_cluster(&args.config)?;
    cluster.require_member(args.id)?;

    let config = RaftConfig {
        election_timeout_min: args.election_min_ms,
        election_timeout_max: args.election_max_ms,
        heartbeat_interval: args.heartbeat_ms,
        check_quorum: args.check_quorum,
        ..RaftConfig::default()
    };
    config.validate().map_err(anyhow::Error::msg)?;

    let data_dir = args
        .data_dir
        .unwrap_or_else(|| PathBuf::from(format!("log{}", args.id)));
    let storage = FileStorage::new(&data_dir)
        .with_context(|| format!("opening data directory {}", data_dir.display()))?;
    let node = RaftNode::with_storage(args.id, cluster.ids(), config, storage)
        .context("restoring persistent state")?;

    let endpoint = cluster
        .endpoint(args.id)
        .with_context(|| format!("replica {} has no endpoint", args.id))?
        .to_string();
    let transport = Arc::new(TcpTransport::new(args.id, cluster.clone()));
    let (handle, mut replica) = Replica::spawn(node, transport, KvStore::new());

    let server = RpcServer::bind(endpoint.as_str(), handle.clone())
        .await
        .with_context(|| format!("binding {endpoint}"))?;
    info!(node = args.id, endpoint = %endpoint, data_dir = %data_dir.display(), "replica serving");

    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = ?err, "failed to install ctrl-c handler");
        }
    };
    tokio::select! {
        result = server.run_until(ctrl_c) => result.context("rpc server failed")?,
        joined = &mut replica => return replica_outcome(joined),
    }

    let _ = handle.shutdown().await;
    replica_outcome(replica.await)
}

fn replica_outcome(joined: Result<Result<(), RaftError>, JoinError>) -> Result<()> {
    joined
        .context("replica task panicked")?
        .context("replica halted")?;
    Ok(())
}

async fn propose(args: ProposeArgs) -> Result<()> {
    let cluster = load_cluster(&args.config)?;
    let ids = cluster.ids();
    let mut target = match args.to {
        Some(id) => id,
        None => *ids.first().context("cluster config lists no replicas")?,
    };
    let command = args.command.into_bytes();

    for _ in 0..ids.len() * 3 {
        let endpoint = cluster
            .endpoint(target)
            .with_context(|| format!("replica {target} is not in the cluster"))?;

        match propose_remote(endpoint, command.clone()).await {
            Ok(Ok(output)) => {
                println!("{}", String::from_utf8_lossy(&output));
                return Ok(());
            }
            Ok(Err(ProposalError::NotLeader {
                leader_hint: Some(leader),
            })) if leader != target => {
                info!(from = target, to = leader, "redirected to leader");
                target = leader;
                continue;
            }
            Ok(Err(err)) => warn!(replica = target, error = %err, "proposal rejected"),
            Err(err) => warn!(replica = target, error = %err, "replica unreachable"),
        }

        target = next_replica(&ids, target);
        tokio::time::sleep(RETRY_DELAY).await;
    }

    bail!("no replica accepted the proposal")
}

fn next_replica(ids: &[NodeId], current: NodeId) -> NodeId {
    let position = ids.iter().position(|&id| id == current).unwrap_or(0);
    ids[(position + 1) % ids.len()]
}
