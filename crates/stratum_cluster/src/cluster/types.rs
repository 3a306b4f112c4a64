//! Shared types for the cluster engine.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the cluster state machine and the transport/storage layers
//! implemented in the node crate.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::NodeId;

/// Possible states of a node in the cluster.
///
/// The state graph is `SEARCHING -> SYNCHRONIZING -> WAITING`, then either the
/// leader path (`STANDINGUP -> LEADING -> STANDINGDOWN`) or the follower path
/// (`SUBSCRIBING -> FOLLOWING`). `UNKNOWN` is the sentinel used for peers we
/// have not heard from yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    Unknown,
    Searching,
    Synchronizing,
    Waiting,
    StandingUp,
    Leading,
    StandingDown,
    Subscribing,
    Following,
}

impl State {
    pub fn name(self) -> &'static str {
        match self {
            State::Unknown => "UNKNOWN",
            State::Searching => "SEARCHING",
            State::Synchronizing => "SYNCHRONIZING",
            State::Waiting => "WAITING",
            State::StandingUp => "STANDINGUP",
            State::Leading => "LEADING",
            State::StandingDown => "STANDINGDOWN",
            State::Subscribing => "SUBSCRIBING",
            State::Following => "FOLLOWING",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "UNKNOWN" => State::Unknown,
            "SEARCHING" => State::Searching,
            "SYNCHRONIZING" => State::Synchronizing,
            "WAITING" => State::Waiting,
            "STANDINGUP" => State::StandingUp,
            "LEADING" => State::Leading,
            "STANDINGDOWN" => State::StandingDown,
            "SUBSCRIBING" => State::Subscribing,
            "FOLLOWING" => State::Following,
            _ => return None,
        })
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Write consistency declared by a command.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Commit locally as soon as the record is broadcast; followers catch up.
    #[default]
    Async,
    /// Wait for a majority of followers to apply before committing locally.
    Quorum,
}

impl Consistency {
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "ASYNC" | "ASYNCHRONOUS_REPLICATION" => Consistency::Async,
            "QUORUM" => Consistency::Quorum,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Consistency::Async => "ASYNC",
            Consistency::Quorum => "QUORUM",
        }
    }
}

/// Static description of one cluster member, loaded from configuration.
#[derive(Clone, Debug)]
pub struct Member {
    pub id: NodeId,
    pub name: String,
    pub host: String,
    pub priority: i64,
}

/// Cluster engine configuration for the local node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub name: String,
    pub priority: i64,
    /// Every configured member, the local node included.
    pub members: Vec<Member>,
    /// A leader silent for longer than this is considered lost.
    pub recv_timeout: Duration,
    /// Upper bound on one standup or quorum-commit round.
    pub round_timeout: Duration,
    /// Maximum records returned per synchronization pull.
    pub sync_batch_max: usize,
}

impl NodeConfig {
    /// Strict majority of the configured member set, the local node included.
    pub fn quorum(&self) -> usize {
        (self.members.len() / 2) + 1
    }

    pub fn peers(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.id != self.node_id)
    }

    pub fn member(&self, id: NodeId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }
}

/// One committed write in the replication log.
///
/// Records are totally ordered by `index`; followers admit no gaps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationRecord {
    pub index: u64,
    pub sql: String,
    /// blake3 digest of the SQL text, hex-encoded.
    pub hash: String,
    /// Epoch of the leader that assigned this index.
    pub epoch: u64,
    /// Id of the command that produced the write, for tracing.
    pub command_id: u64,
}

impl ReplicationRecord {
    pub fn new(index: u64, sql: String, epoch: u64, command_id: u64) -> Self {
        let hash = content_hash(&sql);
        Self {
            index,
            sql,
            hash,
            epoch,
            command_id,
        }
    }
}

/// blake3 digest of replicated SQL text, hex-encoded.
pub fn content_hash(sql: &str) -> String {
    blake3::hash(sql.as_bytes()).to_hex().to_string()
}

/// Identity presented by a peer when its connection opens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Login {
    pub node_id: NodeId,
    pub name: String,
    pub priority: i64,
    pub version: String,
    pub state: State,
    pub commit_count: u64,
}

/// Frames exchanged between peers.
///
/// The engine is transport-agnostic; the node crate maps these onto its wire
/// envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerFrame {
    Login(Login),
    /// Broadcast on every local state transition.
    State {
        state: State,
        commit_count: u64,
        priority: i64,
    },
    /// Pull replication records starting at `from`.
    Synchronize {
        from: u64,
    },
    SynchronizeResponse {
        records: Vec<ReplicationRecord>,
        /// Sender's commit count at response time, so the puller knows when
        /// it has caught up.
        commit_count: u64,
    },
    Replicate {
        record: ReplicationRecord,
    },
    /// Follower acknowledgment that `index` has been applied.
    Approve {
        index: u64,
    },
    Deny {
        index: u64,
        reason: String,
    },
    StandingUp {
        priority: i64,
        commit_count: u64,
        epoch: u64,
    },
    StandUpApprove,
    StandUpDeny {
        /// The strictly better candidate the denier can see.
        better: NodeId,
    },
    Subscribe {
        commit_count: u64,
    },
    SubscribeApproved {
        commit_count: u64,
    },
    /// A follower forwarding a client write; body is the encoded request.
    Escalate {
        id: u64,
        command: Vec<u8>,
    },
    /// The leader's verbatim response to an escalated command.
    EscalateResponse {
        id: u64,
        response: Vec<u8>,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
}

impl PeerFrame {
    /// Wire method name, used for logging and envelope framing.
    pub fn method(&self) -> &'static str {
        match self {
            PeerFrame::Login(_) => "LOGIN",
            PeerFrame::State { .. } => "STATE",
            PeerFrame::Synchronize { .. } => "SYNCHRONIZE",
            PeerFrame::SynchronizeResponse { .. } => "SYNCHRONIZE_RESPONSE",
            PeerFrame::Replicate { .. } => "REPLICATE",
            PeerFrame::Approve { .. } => "APPROVE",
            PeerFrame::Deny { .. } => "DENY",
            PeerFrame::StandingUp { .. } => "STANDINGUP",
            PeerFrame::StandUpApprove => "STANDUP_APPROVE",
            PeerFrame::StandUpDeny { .. } => "STANDUP_DENY",
            PeerFrame::Subscribe { .. } => "SUBSCRIBE",
            PeerFrame::SubscribeApproved { .. } => "SUBSCRIBE_APPROVED",
            PeerFrame::Escalate { .. } => "ESCALATE",
            PeerFrame::EscalateResponse { .. } => "ESCALATE_RESPONSE",
            PeerFrame::Ping { .. } => "PING",
            PeerFrame::Pong { .. } => "PONG",
        }
    }
}

/// Inbound events delivered to the cluster state machine.
///
/// The peer link owns the sockets; the engine only ever sees peers by id, so
/// there are no reference cycles between the two layers.
#[derive(Debug)]
pub enum PeerEvent {
    /// A connection to `peer` completed its login handshake.
    Connected(NodeId, Login),
    Disconnected(NodeId),
    Frame(NodeId, PeerFrame),
}

/// Transport interface for peer frames.
///
/// The engine is transport-agnostic; concrete implementations can use TCP,
/// in-memory channels, or test harnesses. Sends are best-effort: a failure to
/// reach a disconnected peer is not an error the state machine acts on beyond
/// the eventual `Disconnected` event.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, target: NodeId, frame: PeerFrame) -> anyhow::Result<()>;

    /// Whether a logged-in connection to `target` currently exists.
    fn connected(&self, target: NodeId) -> bool;
}

/// Errors raised by the transactional storage surface.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The per-transaction timing budget was exhausted.
    #[error("transaction timeout")]
    Timeout,
    /// The engine refused to start or commit a concurrent transaction.
    #[error("storage busy: {0}")]
    Busy(String),
    /// A follower was assigned an index that is not `commit_count + 1`.
    #[error("commit index gap: assigned {assigned}, expected {expected}")]
    IndexGap { assigned: u64, expected: u64 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Factory for per-worker storage sessions.
///
/// Mirrors the one-connection-per-worker model: every executor worker and the
/// cluster engine hold their own session onto the shared engine.
pub trait SqlEngine: Send + Sync + 'static {
    fn session(&self) -> Box<dyn SqlSession>;

    /// Most recent committed index visible engine-wide.
    fn commit_count(&self) -> u64;

    /// Read committed records in `[from, from + limit)` order for
    /// synchronization pulls.
    fn records_from(&self, from: u64, limit: usize) -> Vec<ReplicationRecord>;
}

/// Transactional storage surface: a thin contract over the embedded SQL
/// engine.
///
/// Peek and process share one transaction so that invariants checked in peek
/// remain valid at process time; without that the pipeline would need
/// pessimistic locking.
pub trait SqlSession: Send + Sync {
    /// Start a snapshot-isolated transaction that permits concurrent
    /// execution of non-conflicting writes on other sessions.
    fn begin_concurrent(&mut self) -> Result<(), EngineError>;

    fn inside_transaction(&self) -> bool;

    /// Arm the per-transaction timing budget.
    fn start_timing(&mut self, budget: Duration);

    fn reset_timing(&mut self);

    fn execute(&mut self, sql: &str) -> Result<Vec<Vec<String>>, EngineError>;

    /// Concatenation of statements issued in the current transaction; empty
    /// iff the transaction is effectively read-only.
    fn uncommitted_query(&self) -> &str;

    /// Commit the open transaction. Followers pass the index assigned by the
    /// leader; the leader path passes `None` and the engine assigns the next.
    fn commit(&mut self, assign_index: Option<u64>, epoch: u64, command_id: u64)
        -> Result<u64, EngineError>;

    /// Idempotent; safe to call with or without an open transaction.
    fn rollback(&mut self);

    /// Most recent committed index visible to this session.
    fn commit_count(&self) -> u64;
}
