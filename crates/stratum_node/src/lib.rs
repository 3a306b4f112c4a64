use std::net::SocketAddr as EmbedSocketAddr;
use std::path::PathBuf as EmbedPathBuf;
use std::time::Duration as EmbedDuration;

include!("main.rs");

/// Minimal embeddable configuration for running a stratum node inside
/// another process (integration tests, mostly).
#[derive(Clone, Debug)]
pub struct EmbeddedNodeConfig {
    pub node_id: u64,
    pub listen_client: EmbedSocketAddr,
    pub listen_peer: EmbedSocketAddr,
    /// Same format as the `--members` flag.
    pub members: String,
    pub data_dir: EmbedPathBuf,
    pub workers: usize,
    pub test_plugin: bool,
    pub ready_timeout: EmbedDuration,
}

impl EmbeddedNodeConfig {
    pub fn single_node(
        node_id: u64,
        listen_client: EmbedSocketAddr,
        listen_peer: EmbedSocketAddr,
        data_dir: EmbedPathBuf,
    ) -> Self {
        Self {
            node_id,
            listen_client,
            listen_peer,
            members: format!("{node_id}:node{node_id}:100@{listen_peer}"),
            data_dir,
            workers: 2,
            test_plugin: true,
            ready_timeout: EmbedDuration::from_secs(10),
        }
    }
}

pub struct EmbeddedNodeHandle {
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl EmbeddedNodeHandle {
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("stratum node task join failed: {err}")),
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

pub fn build_node_args(config: &EmbeddedNodeConfig) -> anyhow::Result<NodeArgs> {
    use clap::Parser;

    let mut argv = vec![
        "stratum-node".to_string(),
        "--node-id".to_string(),
        config.node_id.to_string(),
        "--listen-client".to_string(),
        config.listen_client.to_string(),
        "--listen-peer".to_string(),
        config.listen_peer.to_string(),
        "--members".to_string(),
        config.members.clone(),
        "--data-dir".to_string(),
        config.data_dir.display().to_string(),
        "--workers".to_string(),
        config.workers.max(1).to_string(),
    ];
    if config.test_plugin {
        argv.push("--test-plugin".to_string());
    }
    NodeArgs::try_parse_from(argv).map_err(|err| anyhow::anyhow!(err.to_string()))
}

pub async fn start_embedded_node(config: EmbeddedNodeConfig) -> anyhow::Result<EmbeddedNodeHandle> {
    let args = build_node_args(&config)?;
    let wait_client = config.listen_client;
    let wait_timeout = config.ready_timeout.max(EmbedDuration::from_secs(1));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    let task = tokio::spawn(run_node_with_shutdown(args, async move {
        let _ = shutdown_rx.await;
    }));

    // Wait for the client listener before handing the node back.
    let deadline = tokio::time::Instant::now() + wait_timeout;
    loop {
        if tokio::net::TcpStream::connect(wait_client).await.is_ok() {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            task.abort();
            anyhow::bail!("node did not become ready on {wait_client}");
        }
        tokio::time::sleep(EmbedDuration::from_millis(25)).await;
    }

    Ok(EmbeddedNodeHandle {
        shutdown_tx: Some(shutdown_tx),
        task,
    })
}
