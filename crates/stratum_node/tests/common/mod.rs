//! Shared helpers for integration tests.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use stratum_node::codec::EnvelopeCodec;
use stratum_node::command::Envelope;
use stratum_node::{start_embedded_node, EmbeddedNodeConfig, EmbeddedNodeHandle};

/// Timeout for one command round trip.
pub const ROUND_TRIP_TIMEOUT: Duration = Duration::from_secs(10);

/// Reserve distinct free loopback ports; the listeners are held until all
/// are picked so consecutive calls cannot hand back the same port.
pub async fn free_addrs(count: usize) -> Vec<SocketAddr> {
    let mut listeners = Vec::new();
    for _ in 0..count {
        listeners.push(TcpListener::bind("127.0.0.1:0").await.expect("bind"));
    }
    listeners
        .iter()
        .map(|l| l.local_addr().expect("local addr"))
        .collect()
}

/// A client connection speaking the command envelope.
pub struct Client {
    framed: Framed<TcpStream, EnvelopeCodec>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect client");
        Self {
            framed: Framed::new(stream, EnvelopeCodec),
        }
    }

    pub async fn round_trip(&mut self, request: Envelope) -> Envelope {
        self.framed.send(request).await.expect("send request");
        tokio::time::timeout(ROUND_TRIP_TIMEOUT, self.framed.next())
            .await
            .expect("response timeout")
            .expect("connection closed")
            .expect("decode response")
    }
}

/// One-shot convenience client.
pub async fn send_command(addr: SocketAddr, request: Envelope) -> Envelope {
    Client::connect(addr).await.round_trip(request).await
}

pub struct TestCluster {
    pub nodes: Vec<EmbeddedNodeHandle>,
    pub client_addrs: Vec<SocketAddr>,
    _dirs: Vec<tempfile::TempDir>,
}

/// Spawn an embedded cluster; node ids are 1-based, priorities descend with
/// the id so node 1 is always the expected first leader.
pub async fn spawn_cluster(count: usize) -> TestCluster {
    let addrs = free_addrs(count * 2).await;
    let client_addrs = addrs[..count].to_vec();
    let peer_addrs = addrs[count..].to_vec();
    let members = peer_addrs
        .iter()
        .enumerate()
        .map(|(i, addr)| format!("{}:node{}:{}@{}", i + 1, i + 1, 100 - i as i64 * 10, addr))
        .collect::<Vec<_>>()
        .join(",");

    let mut nodes = Vec::new();
    let mut dirs = Vec::new();
    for i in 0..count {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = EmbeddedNodeConfig {
            node_id: (i + 1) as u64,
            listen_client: client_addrs[i],
            listen_peer: peer_addrs[i],
            members: members.clone(),
            data_dir: dir.path().to_path_buf(),
            workers: 2,
            test_plugin: true,
            ready_timeout: Duration::from_secs(10),
        };
        nodes.push(start_embedded_node(config).await.expect("start node"));
        dirs.push(dir);
    }
    TestCluster {
        nodes,
        client_addrs,
        _dirs: dirs,
    }
}

/// Poll `Status` until the node reports the wanted state.
pub async fn wait_for_state(addr: SocketAddr, wanted: &str, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let response = send_command(addr, Envelope::new("Status")).await;
        if status_field(&response, "state").as_deref() == Some(wanted) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("node at {addr} never reached {wanted}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Pull a string or integer field out of a `Status` JSON body.
pub fn status_field(response: &Envelope, field: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(&response.body).ok()?;
    match value.get(field)? {
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
