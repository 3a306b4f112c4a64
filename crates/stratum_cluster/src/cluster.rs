//! Cluster module wiring.
//!
//! `node` contains the cluster state machine and replication engine, `view`
//! holds the in-memory peer table and vote/commit bookkeeping, and `types`
//! defines the shared frame/record types and trait contracts (transport,
//! transactional storage surface).

mod node;
mod types;
mod view;

pub use node::{ClusterHandle, ClusterNode, CommitError, CommitTicket, EscalatedCommand};
pub use types::{
    Consistency, EngineError, Login, Member, NodeConfig, PeerEvent, PeerFrame, ReplicationRecord,
    SqlEngine, SqlSession, State, Transport,
};
pub use view::{ClusterStatus, PeerRow};

/// Logical node identifier within a cluster.
pub type NodeId = u64;
