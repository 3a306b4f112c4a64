//! Peer connection manager and frame transport.
//!
//! One TCP connection per peer, held in an id-keyed arena. The node with the
//! lower id dials; the higher id accepts. Every connection opens with a
//! `LOGIN` exchange, after which frames flow to the cluster task's event
//! channel. Reconnects back off exponentially with a floor so a flapping
//! peer does not spin.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

use stratum_cluster::cluster::{
    Login, NodeConfig, NodeId, PeerEvent, PeerFrame, ReplicationRecord, SqlEngine, State,
    Transport,
};

use crate::codec::EnvelopeCodec;
use crate::command::Envelope;

const RECONNECT_FLOOR: Duration = Duration::from_millis(500);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// One configured peer's connection slot. Slots are created at configuration
/// load and live for the life of the process; only the socket comes and goes.
struct PeerSlot {
    id: NodeId,
    name: String,
    host: String,
    /// Send and teardown synchronize on this mutex so a failover can close
    /// the socket while a worker holds a frame.
    writer: Mutex<Option<FramedWrite<OwnedWriteHalf, EnvelopeCodec>>>,
    logged_in: AtomicBool,
    failed_connections: AtomicU32,
}

impl PeerSlot {
    /// Null the socket and report the drop once, no matter who noticed first.
    async fn detach(&self, events: &mpsc::Sender<PeerEvent>) {
        let mut writer = self.writer.lock().await;
        *writer = None;
        if self.logged_in.swap(false, Ordering::AcqRel) {
            let _ = events.send(PeerEvent::Disconnected(self.id)).await;
        }
    }
}

pub struct PeerLink {
    node_id: NodeId,
    name: String,
    priority: i64,
    listen_addr: SocketAddr,
    peers: HashMap<NodeId, Arc<PeerSlot>>,
    events: mpsc::Sender<PeerEvent>,
    engine: Arc<dyn SqlEngine>,
    /// Accept, dial, and per-connection tasks; aborted on shutdown so a
    /// stopped node actually drops off the wire.
    tasks: std::sync::Mutex<JoinSet<()>>,
}

impl PeerLink {
    pub fn new(
        config: &NodeConfig,
        listen_addr: SocketAddr,
        engine: Arc<dyn SqlEngine>,
        events: mpsc::Sender<PeerEvent>,
    ) -> Arc<Self> {
        let peers = config
            .peers()
            .map(|m| {
                (
                    m.id,
                    Arc::new(PeerSlot {
                        id: m.id,
                        name: m.name.clone(),
                        host: m.host.clone(),
                        writer: Mutex::new(None),
                        logged_in: AtomicBool::new(false),
                        failed_connections: AtomicU32::new(0),
                    }),
                )
            })
            .collect();
        Arc::new(Self {
            node_id: config.node_id,
            name: config.name.clone(),
            priority: config.priority,
            listen_addr,
            peers,
            events,
            engine,
            tasks: std::sync::Mutex::new(JoinSet::new()),
        })
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        self.tasks.lock().expect("peer task set").spawn(task);
    }

    /// Tear down every connection and background task. Writers are dropped so
    /// peers see the FIN promptly instead of waiting out a timeout.
    pub async fn shutdown(&self) {
        self.tasks.lock().expect("peer task set").abort_all();
        for slot in self.peers.values() {
            let mut writer = slot.writer.lock().await;
            *writer = None;
            slot.logged_in.store(false, Ordering::Release);
        }
    }

    fn login(&self) -> Login {
        Login {
            node_id: self.node_id,
            name: self.name.clone(),
            priority: self.priority,
            version: env!("CARGO_PKG_VERSION").to_string(),
            // The cluster task broadcasts the real state right after login.
            state: State::Unknown,
            commit_count: self.engine.commit_count(),
        }
    }

    /// Start the accept loop and one dial loop per lower-id peer.
    pub fn start(self: &Arc<Self>) {
        let link = self.clone();
        self.spawn(async move {
            if let Err(err) = link.accept_loop().await {
                tracing::error!(alert = true, error = %err, "peer accept loop failed");
            }
        });
        for slot in self.peers.values() {
            if slot.id < self.node_id {
                let link = self.clone();
                let slot = slot.clone();
                self.spawn(async move { link.dial_loop(slot).await });
            }
        }
    }

    async fn accept_loop(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .with_context(|| format!("bind peer listener {}", self.listen_addr))?;
        tracing::info!(addr = %self.listen_addr, "peer listener up");
        loop {
            let (stream, remote) = listener.accept().await?;
            let link = self.clone();
            self.spawn(async move {
                if let Err(err) = link.handle_inbound(stream).await {
                    tracing::debug!(%remote, error = %err, "inbound peer connection closed");
                }
            });
        }
    }

    async fn handle_inbound(self: Arc<Self>, stream: TcpStream) -> anyhow::Result<()> {
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, EnvelopeCodec);
        let mut writer = FramedWrite::new(write_half, EnvelopeCodec);

        let envelope = reader
            .next()
            .await
            .context("connection closed before login")??;
        let PeerFrame::Login(login) = frame_from_envelope(&envelope)? else {
            bail!("expected LOGIN, got {}", envelope.method());
        };
        let slot = self
            .peers
            .get(&login.node_id)
            .with_context(|| format!("login from unknown peer {}", login.node_id))?
            .clone();
        if login.node_id <= self.node_id {
            bail!("peer {} should be dialed, not accepted", login.node_id);
        }
        if slot.logged_in.load(Ordering::Acquire) {
            bail!("duplicate connection from {}", slot.name);
        }
        writer.send(frame_to_envelope(&PeerFrame::Login(self.login()))?).await?;
        self.attach(slot.clone(), login, writer).await;
        self.read_frames(&slot, reader).await;
        Ok(())
    }

    async fn dial_loop(self: Arc<Self>, slot: Arc<PeerSlot>) {
        loop {
            let failed = slot.failed_connections.load(Ordering::Acquire);
            tokio::time::sleep(reconnect_delay(failed)).await;
            match self.dial_once(&slot).await {
                Ok(()) => {
                    // A completed session resets the backoff.
                    slot.failed_connections.store(0, Ordering::Release);
                }
                Err(err) => {
                    slot.failed_connections.fetch_add(1, Ordering::AcqRel);
                    tracing::debug!(peer = slot.name, error = %err, "dial failed");
                }
            }
        }
    }

    async fn dial_once(self: &Arc<Self>, slot: &Arc<PeerSlot>) -> anyhow::Result<()> {
        let stream = TcpStream::connect(&slot.host)
            .await
            .with_context(|| format!("connect {}", slot.host))?;
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, EnvelopeCodec);
        let mut writer = FramedWrite::new(write_half, EnvelopeCodec);

        writer.send(frame_to_envelope(&PeerFrame::Login(self.login()))?).await?;
        let envelope = reader
            .next()
            .await
            .context("connection closed before login")??;
        let PeerFrame::Login(login) = frame_from_envelope(&envelope)? else {
            bail!("expected LOGIN, got {}", envelope.method());
        };
        anyhow::ensure!(
            login.node_id == slot.id,
            "peer at {} identified as {} instead of {}",
            slot.host,
            login.node_id,
            slot.id
        );
        slot.failed_connections.store(0, Ordering::Release);
        self.attach(slot.clone(), login, writer).await;
        self.read_frames(slot, reader).await;
        Ok(())
    }

    async fn attach(
        &self,
        slot: Arc<PeerSlot>,
        login: Login,
        writer: FramedWrite<OwnedWriteHalf, EnvelopeCodec>,
    ) {
        {
            let mut guard = slot.writer.lock().await;
            *guard = Some(writer);
        }
        slot.logged_in.store(true, Ordering::Release);
        let _ = self
            .events
            .send(PeerEvent::Connected(slot.id, login))
            .await;
    }

    /// Pump inbound frames to the cluster task until the connection drops.
    async fn read_frames(
        &self,
        slot: &Arc<PeerSlot>,
        mut reader: FramedRead<OwnedReadHalf, EnvelopeCodec>,
    ) {
        while let Some(next) = reader.next().await {
            let envelope = match next {
                Ok(envelope) => envelope,
                Err(err) => {
                    tracing::debug!(peer = slot.name, error = %err, "peer read failed");
                    break;
                }
            };
            match frame_from_envelope(&envelope) {
                Ok(frame) => {
                    if self
                        .events
                        .send(PeerEvent::Frame(slot.id, frame))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(peer = slot.name, error = %err, "undecodable peer frame");
                    break;
                }
            }
        }
        slot.detach(&self.events).await;
    }
}

#[async_trait]
impl Transport for PeerLink {
    async fn send(&self, target: NodeId, frame: PeerFrame) -> anyhow::Result<()> {
        let slot = self
            .peers
            .get(&target)
            .with_context(|| format!("unknown peer {target}"))?;
        let envelope = frame_to_envelope(&frame)?;
        let mut writer = slot.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            bail!("peer {} not connected", slot.name);
        };
        if let Err(err) = sink.send(envelope).await {
            // Null the socket now; the read side will notice on its own, but
            // further sends should fail fast.
            *writer = None;
            drop(writer);
            if slot.logged_in.swap(false, Ordering::AcqRel) {
                let _ = self.events.send(PeerEvent::Disconnected(slot.id)).await;
            }
            return Err(err);
        }
        Ok(())
    }

    fn connected(&self, target: NodeId) -> bool {
        self.peers
            .get(&target)
            .map(|slot| slot.logged_in.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

/// Exponential backoff keyed off the failed-connection count, with a floor
/// and jitter.
fn reconnect_delay(failed_connections: u32) -> Duration {
    if failed_connections == 0 {
        return Duration::from_millis(50);
    }
    let shift = failed_connections.min(6);
    let base = RECONNECT_FLOOR * 2u32.saturating_pow(shift);
    let jitter = rand::thread_rng().gen_range(0..250);
    base.min(RECONNECT_CAP) + Duration::from_millis(jitter)
}

fn header_u64(envelope: &Envelope, name: &str) -> anyhow::Result<u64> {
    envelope
        .headers
        .get(name)
        .with_context(|| format!("{} missing {name}", envelope.method()))?
        .parse()
        .with_context(|| format!("{} bad {name}", envelope.method()))
}

fn header_i64(envelope: &Envelope, name: &str) -> anyhow::Result<i64> {
    envelope
        .headers
        .get(name)
        .with_context(|| format!("{} missing {name}", envelope.method()))?
        .parse()
        .with_context(|| format!("{} bad {name}", envelope.method()))
}

/// Map a peer frame onto the wire envelope: scalars ride headers, payloads
/// ride the body.
pub fn frame_to_envelope(frame: &PeerFrame) -> anyhow::Result<Envelope> {
    let mut envelope = Envelope::new(frame.method());
    match frame {
        PeerFrame::Login(login) => {
            envelope.headers.set("nodeID", login.node_id.to_string());
            envelope.headers.set("name", login.name.clone());
            envelope.headers.set("priority", login.priority.to_string());
            envelope.headers.set("version", login.version.clone());
            envelope.headers.set("state", login.state.name());
            envelope
                .headers
                .set("commitCount", login.commit_count.to_string());
        }
        PeerFrame::State {
            state,
            commit_count,
            priority,
        } => {
            envelope.headers.set("state", state.name());
            envelope.headers.set("commitCount", commit_count.to_string());
            envelope.headers.set("priority", priority.to_string());
        }
        PeerFrame::Synchronize { from } => {
            envelope.headers.set("from", from.to_string());
        }
        PeerFrame::SynchronizeResponse {
            records,
            commit_count,
        } => {
            envelope.headers.set("commitCount", commit_count.to_string());
            envelope.body = serde_json::to_vec(records).context("encode records")?;
        }
        PeerFrame::Replicate { record } => {
            envelope.headers.set("index", record.index.to_string());
            envelope.headers.set("hash", record.hash.clone());
            envelope.headers.set("epoch", record.epoch.to_string());
            envelope
                .headers
                .set("commandID", record.command_id.to_string());
            envelope.body = record.sql.clone().into_bytes();
        }
        PeerFrame::Approve { index } => {
            envelope.headers.set("index", index.to_string());
        }
        PeerFrame::Deny { index, reason } => {
            envelope.headers.set("index", index.to_string());
            envelope.headers.set("reason", reason.clone());
        }
        PeerFrame::StandingUp {
            priority,
            commit_count,
            epoch,
        } => {
            envelope.headers.set("priority", priority.to_string());
            envelope.headers.set("commitCount", commit_count.to_string());
            envelope.headers.set("epoch", epoch.to_string());
        }
        PeerFrame::StandUpApprove => {}
        PeerFrame::StandUpDeny { better } => {
            envelope.headers.set("better", better.to_string());
        }
        PeerFrame::Subscribe { commit_count } => {
            envelope.headers.set("commitCount", commit_count.to_string());
        }
        PeerFrame::SubscribeApproved { commit_count } => {
            envelope.headers.set("commitCount", commit_count.to_string());
        }
        PeerFrame::Escalate { id, command } => {
            envelope.headers.set("id", id.to_string());
            envelope.body = command.clone();
        }
        PeerFrame::EscalateResponse { id, response } => {
            envelope.headers.set("id", id.to_string());
            envelope.body = response.clone();
        }
        PeerFrame::Ping { timestamp } => {
            envelope.headers.set("timestamp", timestamp.to_string());
        }
        PeerFrame::Pong { timestamp } => {
            envelope.headers.set("timestamp", timestamp.to_string());
        }
    }
    Ok(envelope)
}

pub fn frame_from_envelope(envelope: &Envelope) -> anyhow::Result<PeerFrame> {
    let frame = match envelope.method() {
        "LOGIN" => PeerFrame::Login(Login {
            node_id: header_u64(envelope, "nodeID")?,
            name: envelope.headers.get("name").unwrap_or_default().to_string(),
            priority: header_i64(envelope, "priority")?,
            version: envelope
                .headers
                .get("version")
                .unwrap_or_default()
                .to_string(),
            state: envelope
                .headers
                .get("state")
                .and_then(State::from_name)
                .unwrap_or(State::Unknown),
            commit_count: header_u64(envelope, "commitCount")?,
        }),
        "STATE" => PeerFrame::State {
            state: envelope
                .headers
                .get("state")
                .and_then(State::from_name)
                .context("STATE missing state")?,
            commit_count: header_u64(envelope, "commitCount")?,
            priority: header_i64(envelope, "priority")?,
        },
        "SYNCHRONIZE" => PeerFrame::Synchronize {
            from: header_u64(envelope, "from")?,
        },
        "SYNCHRONIZE_RESPONSE" => PeerFrame::SynchronizeResponse {
            records: serde_json::from_slice::<Vec<ReplicationRecord>>(&envelope.body)
                .context("decode records")?,
            commit_count: header_u64(envelope, "commitCount")?,
        },
        "REPLICATE" => PeerFrame::Replicate {
            record: ReplicationRecord {
                index: header_u64(envelope, "index")?,
                sql: String::from_utf8(envelope.body.clone()).context("sql is not UTF-8")?,
                hash: envelope
                    .headers
                    .get("hash")
                    .context("REPLICATE missing hash")?
                    .to_string(),
                epoch: header_u64(envelope, "epoch")?,
                command_id: header_u64(envelope, "commandID")?,
            },
        },
        "APPROVE" => PeerFrame::Approve {
            index: header_u64(envelope, "index")?,
        },
        "DENY" => PeerFrame::Deny {
            index: header_u64(envelope, "index")?,
            reason: envelope
                .headers
                .get("reason")
                .unwrap_or_default()
                .to_string(),
        },
        "STANDINGUP" => PeerFrame::StandingUp {
            priority: header_i64(envelope, "priority")?,
            commit_count: header_u64(envelope, "commitCount")?,
            epoch: header_u64(envelope, "epoch")?,
        },
        "STANDUP_APPROVE" => PeerFrame::StandUpApprove,
        "STANDUP_DENY" => PeerFrame::StandUpDeny {
            better: header_u64(envelope, "better")?,
        },
        "SUBSCRIBE" => PeerFrame::Subscribe {
            commit_count: header_u64(envelope, "commitCount")?,
        },
        "SUBSCRIBE_APPROVED" => PeerFrame::SubscribeApproved {
            commit_count: header_u64(envelope, "commitCount")?,
        },
        "ESCALATE" => PeerFrame::Escalate {
            id: header_u64(envelope, "id")?,
            command: envelope.body.clone(),
        },
        "ESCALATE_RESPONSE" => PeerFrame::EscalateResponse {
            id: header_u64(envelope, "id")?,
            response: envelope.body.clone(),
        },
        "PING" => PeerFrame::Ping {
            timestamp: header_u64(envelope, "timestamp")?,
        },
        "PONG" => PeerFrame::Pong {
            timestamp: header_u64(envelope, "timestamp")?,
        },
        other => bail!("unknown peer frame {other}"),
    };
    Ok(frame)
}
