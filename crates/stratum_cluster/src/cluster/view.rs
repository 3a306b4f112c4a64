//! In-memory cluster view for the state machine.
//!
//! This module holds the observed-peer table plus the vote and quorum-commit
//! bookkeeping. It is intentionally separate from the transition logic so
//! that candidate selection and quorum math stay testable on their own.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use serde::Serialize;
use tokio::time::Instant;

use super::types::{Login, NodeConfig, State};
use super::NodeId;

/// Everything the local node knows about one peer.
#[derive(Clone, Debug)]
pub(super) struct PeerStatus {
    pub(super) id: NodeId,
    pub(super) name: String,
    pub(super) host: String,
    pub(super) priority: i64,
    pub(super) logged_in: bool,
    pub(super) state: State,
    pub(super) commit_count: u64,
    pub(super) latency_us: u64,
    pub(super) last_recv: Instant,
}

/// Observed state of the whole cluster from the local node's perspective.
#[derive(Debug)]
pub(super) struct ClusterView {
    pub(super) state: State,
    pub(super) epoch: u64,
    pub(super) leader: Option<NodeId>,
    pub(super) peers: BTreeMap<NodeId, PeerStatus>,
    /// Approvals collected while `STANDINGUP`, the local vote included.
    pub(super) standup_approvals: usize,
    pub(super) standup_started: Option<Instant>,
    /// Peer currently serving our synchronization pull.
    pub(super) sync_source: Option<NodeId>,
}

impl ClusterView {
    pub(super) fn new(config: &NodeConfig) -> Self {
        let now = Instant::now();
        let peers = config
            .peers()
            .map(|m| {
                (
                    m.id,
                    PeerStatus {
                        id: m.id,
                        name: m.name.clone(),
                        host: m.host.clone(),
                        priority: m.priority,
                        logged_in: false,
                        state: State::Unknown,
                        commit_count: 0,
                        latency_us: 0,
                        last_recv: now,
                    },
                )
            })
            .collect();
        Self {
            state: State::Searching,
            epoch: 0,
            leader: None,
            peers,
            standup_approvals: 0,
            standup_started: None,
            sync_source: None,
        }
    }

    pub(super) fn peer_mut(&mut self, id: NodeId) -> Option<&mut PeerStatus> {
        self.peers.get_mut(&id)
    }

    pub(super) fn note_login(&mut self, id: NodeId, login: &Login) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.logged_in = true;
            peer.state = login.state;
            peer.priority = login.priority;
            peer.commit_count = login.commit_count;
            peer.last_recv = Instant::now();
        }
    }

    /// Reset a peer to its disconnected shape. The entry itself is never
    /// removed; members live for the life of the process.
    pub(super) fn note_disconnect(&mut self, id: NodeId) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.logged_in = false;
            peer.state = State::Unknown;
            peer.latency_us = 0;
        }
    }

    pub(super) fn logged_in_count(&self) -> usize {
        self.peers.values().filter(|p| p.logged_in).count()
    }

    /// Reachable members including the local node.
    pub(super) fn reachable(&self) -> usize {
        self.logged_in_count() + 1
    }

    /// Highest commit count observed across logged-in peers.
    pub(super) fn max_peer_commit(&self) -> Option<(NodeId, u64)> {
        self.peers
            .values()
            .filter(|p| p.logged_in)
            .map(|p| (p.id, p.commit_count))
            .max_by_key(|(id, count)| (*count, Reverse(*id)))
    }

    /// The visible leader, preferring `LEADING` over `STANDINGUP`.
    pub(super) fn leader_candidate(&self) -> Option<NodeId> {
        let leading = self
            .peers
            .values()
            .filter(|p| p.logged_in && p.state == State::Leading)
            .max_by_key(|p| (p.priority, Reverse(p.id)))
            .map(|p| p.id);
        if leading.is_some() {
            return leading;
        }
        self.peers
            .values()
            .filter(|p| p.logged_in && p.state == State::StandingUp)
            .max_by_key(|p| (p.priority, Reverse(p.id)))
            .map(|p| p.id)
    }

    /// Whether a candidacy by `(priority, id)` should be denied in favor of a
    /// strictly better `WAITING` or standing-up node we can see.
    ///
    /// Greater priority wins; ties break to the lower id.
    pub(super) fn better_candidate(
        &self,
        own_priority: i64,
        own_id: NodeId,
        candidate_priority: i64,
        candidate_id: NodeId,
    ) -> Option<NodeId> {
        let mut best = (candidate_priority, candidate_id);
        let mut best_id = None;
        let mut consider = |priority: i64, id: NodeId| {
            if (priority, Reverse(id)) > (best.0, Reverse(best.1)) {
                best = (priority, id);
                best_id = Some(id);
            }
        };
        consider(own_priority, own_id);
        for peer in self.peers.values() {
            if peer.logged_in
                && matches!(peer.state, State::Waiting | State::StandingUp | State::Leading)
            {
                consider(peer.priority, peer.id);
            }
        }
        best_id
    }

    /// Whether the local node is the best standup candidate among everything
    /// currently `WAITING`.
    pub(super) fn is_best_waiting_candidate(&self, own_priority: i64, own_id: NodeId) -> bool {
        self.peers
            .values()
            .filter(|p| p.logged_in && p.state == State::Waiting)
            .all(|p| (own_priority, Reverse(own_id)) > (p.priority, Reverse(p.id)))
    }

    pub(super) fn status(
        &self,
        config: &NodeConfig,
        commit_count: u64,
        escalations_pending: usize,
    ) -> ClusterStatus {
        ClusterStatus {
            node_id: config.node_id,
            name: config.name.clone(),
            state: self.state.name().to_string(),
            commit_count,
            priority: config.priority,
            epoch: self.epoch,
            leader: self.leader.and_then(|id| {
                self.peers.get(&id).map(|p| p.name.clone()).or_else(|| {
                    (id == config.node_id).then(|| config.name.clone())
                })
            }),
            escalations_pending,
            peer_list: self
                .peers
                .values()
                .map(|p| PeerRow {
                    name: p.name.clone(),
                    host: p.host.clone(),
                    state: if p.logged_in {
                        p.state.name().to_string()
                    } else {
                        // Unreachable peers report an empty state.
                        String::new()
                    },
                    latest_commit_count: p.commit_count,
                    priority: p.priority,
                    latency_us: p.latency_us,
                })
                .collect(),
        }
    }
}

/// JSON-facing snapshot returned by the `Status` command.
#[derive(Clone, Debug, Serialize)]
pub struct ClusterStatus {
    #[serde(rename = "nodeID")]
    pub node_id: NodeId,
    pub name: String,
    pub state: String,
    #[serde(rename = "commitCount")]
    pub commit_count: u64,
    pub priority: i64,
    pub epoch: u64,
    pub leader: Option<String>,
    #[serde(rename = "escalationsPending")]
    pub escalations_pending: usize,
    #[serde(rename = "peerList")]
    pub peer_list: Vec<PeerRow>,
}

/// One row of the `Status` peer list.
#[derive(Clone, Debug, Serialize)]
pub struct PeerRow {
    pub name: String,
    pub host: String,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "LatestCommitCount")]
    pub latest_commit_count: u64,
    #[serde(rename = "Priority")]
    pub priority: i64,
    #[serde(rename = "latencyUS")]
    pub latency_us: u64,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::types::Member;
    use super::*;

    fn config(members: &[(NodeId, i64)]) -> NodeConfig {
        NodeConfig {
            node_id: members[0].0,
            name: format!("node{}", members[0].0),
            priority: members[0].1,
            members: members
                .iter()
                .map(|(id, priority)| Member {
                    id: *id,
                    name: format!("node{id}"),
                    host: format!("127.0.0.1:{}", 9000 + id),
                    priority: *priority,
                })
                .collect(),
            recv_timeout: Duration::from_secs(5),
            round_timeout: Duration::from_secs(2),
            sync_batch_max: 100,
        }
    }

    fn login(priority: i64, state: State, commit_count: u64) -> Login {
        Login {
            node_id: 0,
            name: String::new(),
            priority,
            version: String::new(),
            state,
            commit_count,
        }
    }

    #[test]
    fn best_candidate_prefers_priority_then_lower_id() {
        let config = config(&[(2, 100), (1, 100), (3, 50)]);
        let mut view = ClusterView::new(&config);
        view.note_login(1, &login(100, State::Waiting, 0));
        view.note_login(3, &login(50, State::Waiting, 0));

        // Node 1 ties our priority but has the lower id, so it wins.
        assert!(!view.is_best_waiting_candidate(config.priority, config.node_id));
        assert_eq!(view.better_candidate(config.priority, config.node_id, 100, 2), Some(1));

        // With node 1 gone, we are the best candidate.
        view.note_disconnect(1);
        assert!(view.is_best_waiting_candidate(config.priority, config.node_id));
        assert_eq!(view.better_candidate(config.priority, config.node_id, 100, 2), None);
    }

    #[test]
    fn leader_candidate_prefers_leading_over_standingup() {
        let config = config(&[(1, 10), (2, 20), (3, 30)]);
        let mut view = ClusterView::new(&config);
        view.note_login(2, &login(20, State::StandingUp, 0));
        view.note_login(3, &login(30, State::Leading, 0));
        assert_eq!(view.leader_candidate(), Some(3));
        view.peer_mut(3).unwrap().state = State::Waiting;
        assert_eq!(view.leader_candidate(), Some(2));
    }

    #[test]
    fn disconnected_peers_report_empty_state() {
        let config = config(&[(1, 10), (2, 20)]);
        let mut view = ClusterView::new(&config);
        view.note_login(2, &login(20, State::Following, 7));
        view.note_disconnect(2);
        let status = view.status(&config, 0, 0);
        assert_eq!(status.peer_list.len(), 1);
        assert_eq!(status.peer_list[0].state, "");
        assert_eq!(status.peer_list[0].latest_commit_count, 7);
    }

    #[test]
    fn max_peer_commit_tracks_logged_in_peers_only() {
        let config = config(&[(1, 10), (2, 20), (3, 30)]);
        let mut view = ClusterView::new(&config);
        assert_eq!(view.max_peer_commit(), None);
        view.note_login(2, &login(20, State::Waiting, 12));
        view.note_login(3, &login(30, State::Waiting, 9));
        assert_eq!(view.max_peer_commit(), Some((2, 12)));
        view.note_disconnect(2);
        assert_eq!(view.max_peer_commit(), Some((3, 9)));
    }
}
