// Stratum node binary entry point.
//
// This file wires together the journal engine, peer link, cluster state
// machine, plugin registry, scheduler, and the client server. It also hosts
// the CLI and runtime configuration.

use std::fs;
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;

pub mod codec;
pub mod command;
pub mod executor;
pub mod peer_link;
pub mod plugins;
pub mod queue;
pub mod server;
pub mod storage;
pub mod worker;

use stratum_cluster::cluster::{
    ClusterNode, Member, NodeConfig, SqlEngine, Transport,
};

use command::{Command, Envelope, ResponseRoute};
use executor::CommandExecutor;
use peer_link::PeerLink;
use plugins::{DbPlugin, PluginRegistry, StatusPlugin, TestHarnessPlugin};
use queue::CommandQueue;
use storage::JournalEngine;
use worker::{run_worker, WorkerContext};

/// CLI options for running a node.
#[derive(Parser, Debug)]
#[command(name = "stratum-node")]
pub struct NodeArgs {
    /// This node's id; must appear in `--members`.
    #[arg(long)]
    node_id: u64,

    /// Address clients connect to.
    #[arg(long)]
    listen_client: SocketAddr,

    /// Address peers connect to.
    #[arg(long)]
    listen_peer: SocketAddr,

    /// Comma-separated list like:
    /// `1:node1:100@127.0.0.1:9101,2:node2:50@127.0.0.1:9102`
    /// (id:name:priority@peer-host).
    #[arg(long)]
    members: String,

    #[arg(long)]
    data_dir: String,

    /// Parallel executor workers, one storage session each.
    #[arg(long, env = "STRATUM_WORKERS", default_value_t = 4)]
    workers: usize,

    /// A leader silent for this long is considered lost (ms).
    #[arg(long, env = "STRATUM_RECV_TIMEOUT_MS", default_value_t = 5_000)]
    recv_timeout_ms: u64,

    /// Upper bound on one standup or quorum-commit round (ms).
    #[arg(long, env = "STRATUM_ROUND_TIMEOUT_MS", default_value_t = 2_000)]
    round_timeout_ms: u64,

    /// Maximum records returned per synchronization pull.
    #[arg(long, env = "STRATUM_SYNC_BATCH", default_value_t = 500)]
    sync_batch: usize,

    /// Register the load/failover test commands.
    #[arg(long, env = "STRATUM_TEST_PLUGIN")]
    test_plugin: bool,
}

/// Parse one `--members` entry: `id:name:priority@host`.
fn parse_member(entry: &str) -> anyhow::Result<Member> {
    let (spec, host) = entry
        .split_once('@')
        .with_context(|| format!("member {entry:?} missing @host"))?;
    let mut parts = spec.splitn(3, ':');
    let id = parts
        .next()
        .unwrap_or_default()
        .parse()
        .with_context(|| format!("member {entry:?} has a bad id"))?;
    let name = parts
        .next()
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("node{id}"));
    let priority = parts
        .next()
        .unwrap_or("0")
        .parse()
        .with_context(|| format!("member {entry:?} has a bad priority"))?;
    Ok(Member {
        id,
        name,
        host: host.to_string(),
        priority,
    })
}

fn build_config(args: &NodeArgs) -> anyhow::Result<NodeConfig> {
    let members = args
        .members
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_member)
        .collect::<anyhow::Result<Vec<_>>>()?;
    anyhow::ensure!(!members.is_empty(), "--members is empty");
    let own = members
        .iter()
        .find(|m| m.id == args.node_id)
        .with_context(|| format!("node id {} is not in --members", args.node_id))?;
    Ok(NodeConfig {
        node_id: own.id,
        name: own.name.clone(),
        priority: own.priority,
        members: members.clone(),
        recv_timeout: Duration::from_millis(args.recv_timeout_ms),
        round_timeout: Duration::from_millis(args.round_timeout_ms),
        sync_batch_max: args.sync_batch.max(1),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = NodeArgs::parse();
    run_node(args).await
}

/// Initialize storage, peer link, cluster engine, and servers for a node.
pub async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    run_node_with_shutdown(args, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

/// Initialize storage, peer link, cluster engine, and servers for a node,
/// and run until `shutdown` resolves.
pub async fn run_node_with_shutdown<F>(args: NodeArgs, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send,
{
    let config = build_config(&args)?;
    let data_dir = PathBuf::from(&args.data_dir);
    fs::create_dir_all(&data_dir).context("create data dir")?;
    let engine: Arc<dyn SqlEngine> =
        Arc::new(JournalEngine::open_dir(data_dir.join("journal"))?);

    let (event_tx, event_rx) = mpsc::channel(1024);
    let peer_link = PeerLink::new(&config, args.listen_peer, engine.clone(), event_tx);
    let transport: Arc<dyn Transport> = peer_link.clone();
    let (mut cluster, handle) =
        ClusterNode::new(config.clone(), transport, engine.clone(), event_rx);
    let mut escalations = cluster.take_escalations();
    peer_link.start();
    let cluster_task = tokio::spawn(cluster.run());

    let mut registry = PluginRegistry::new();
    registry.register(StatusPlugin::new(handle.clone()));
    registry.register(DbPlugin::new());
    if args.test_plugin {
        registry.register(TestHarnessPlugin::new());
    }
    let executor = Arc::new(CommandExecutor::new(Arc::new(registry)));
    let queue = Arc::new(CommandQueue::new());

    let ctx = WorkerContext {
        queue: queue.clone(),
        executor,
        handle: handle.clone(),
        engine,
    };
    let workers: Vec<_> = (0..args.workers.max(1))
        .map(|worker_id| tokio::spawn(run_worker(worker_id, ctx.clone())))
        .collect();

    // Escalated commands from followers enter the local scheduler like any
    // other command; their responses route back through the cluster task.
    {
        let queue = queue.clone();
        tokio::spawn(async move {
            while let Some(esc) = escalations.recv().await {
                match Envelope::parse(&esc.request) {
                    Ok(request) => {
                        let mut cmd = Command::from_request(
                            server::next_command_id(),
                            request,
                            ResponseRoute::Peer {
                                node: esc.from,
                                escalation_id: esc.id,
                            },
                        );
                        cmd.escalated = true;
                        if !queue.enqueue(cmd) {
                            tracing::warn!(peer = esc.from, "dropping escalation during shutdown");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(peer = esc.from, error = %err, "undecodable escalation");
                    }
                }
            }
        });
    }

    let client_server = {
        let queue = queue.clone();
        let listen_client = args.listen_client;
        tokio::spawn(async move {
            if let Err(err) = server::run(listen_client, queue).await {
                tracing::error!(alert = true, error = %err, "client server failed");
            }
        })
    };

    tracing::info!(
        node = config.name,
        client = %args.listen_client,
        peer = %args.listen_peer,
        "node up"
    );
    shutdown.await;
    tracing::info!(node = config.name, "shutting down");

    // Stop intake, drain in-flight commands, then walk the cluster state
    // machine down before dropping off the wire.
    queue.begin_shutdown();
    for worker in workers {
        let _ = worker.await;
    }
    handle.stand_down().await;
    client_server.abort();
    peer_link.shutdown().await;
    cluster_task.abort();
    Ok(())
}
