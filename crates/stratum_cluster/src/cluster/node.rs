//! Cluster state machine and replication engine.
//!
//! This file contains the election, synchronization, and replicated-write
//! paths, plus follower escalation. The machine runs as one dedicated task
//! fed by per-peer channels, so every transition is serialized without locks;
//! workers talk to it through a cloneable [`ClusterHandle`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};

use super::types::{
    content_hash, Consistency, NodeConfig, PeerEvent, PeerFrame, ReplicationRecord, SqlEngine,
    SqlSession, State, Transport,
};
use super::view::{ClusterStatus, ClusterView};
use super::NodeId;

const TICK_INTERVAL: Duration = Duration::from_millis(50);
const PING_INTERVAL: Duration = Duration::from_secs(1);
/// Backstop for a granted commit ticket whose worker never reports back.
const COMMIT_FINISH_GRACE: Duration = Duration::from_secs(10);

/// Why a replicated write or an escalation could not complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommitError {
    /// Quorum was lost or a follower rejected the record.
    #[error("commit conflict")]
    Conflict,
    /// The local node is not currently leading.
    #[error("not leading")]
    NotLeader,
    /// The node is draining for shutdown.
    #[error("shutting down")]
    ShuttingDown,
}

/// A client write forwarded by a follower, handed to the local scheduler.
#[derive(Debug)]
pub struct EscalatedCommand {
    pub from: NodeId,
    pub id: u64,
    pub request: Vec<u8>,
}

/// Grant returned for a replicated write: commit with exactly this index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitTicket {
    pub index: u64,
    pub epoch: u64,
}

enum ClusterRequest {
    CommitWrite {
        sql: String,
        command_id: u64,
        consistency: Consistency,
        tx: oneshot::Sender<Result<CommitTicket, CommitError>>,
    },
    CommitFinished {
        index: u64,
        ok: bool,
    },
    Escalate {
        command: Vec<u8>,
        tx: oneshot::Sender<Result<Vec<u8>, CommitError>>,
    },
    EscalationReply {
        peer: NodeId,
        id: u64,
        response: Vec<u8>,
    },
    Status {
        tx: oneshot::Sender<ClusterStatus>,
    },
    StandDown {
        tx: oneshot::Sender<()>,
    },
}

/// Cloneable handle used by workers and the client server to reach the
/// cluster task.
#[derive(Clone)]
pub struct ClusterHandle {
    tx: mpsc::Sender<ClusterRequest>,
}

impl ClusterHandle {
    /// Hand a `needs_commit` result to the replication layer. On success the
    /// caller must commit its transaction with exactly the granted index and
    /// then call [`commit_finished`](Self::commit_finished).
    pub async fn commit_write(
        &self,
        sql: String,
        command_id: u64,
        consistency: Consistency,
    ) -> Result<CommitTicket, CommitError> {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(ClusterRequest::CommitWrite {
                sql,
                command_id,
                consistency,
                tx,
            })
            .await
            .is_err()
        {
            return Err(CommitError::ShuttingDown);
        }
        rx.await.unwrap_or(Err(CommitError::ShuttingDown))
    }

    /// Report the outcome of a granted commit ticket so the next queued
    /// write can be sequenced.
    pub async fn commit_finished(&self, index: u64, ok: bool) {
        let _ = self
            .tx
            .send(ClusterRequest::CommitFinished { index, ok })
            .await;
    }

    /// Forward an encoded client request to the leader and wait for its
    /// encoded response.
    pub async fn escalate(&self, command: Vec<u8>) -> Result<Vec<u8>, CommitError> {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(ClusterRequest::Escalate { command, tx })
            .await
            .is_err()
        {
            return Err(CommitError::ShuttingDown);
        }
        rx.await.unwrap_or(Err(CommitError::ShuttingDown))
    }

    /// Route a finished escalated command's encoded response back to its
    /// originating peer.
    pub async fn escalation_reply(&self, peer: NodeId, id: u64, response: Vec<u8>) {
        let _ = self
            .tx
            .send(ClusterRequest::EscalationReply { peer, id, response })
            .await;
    }

    pub async fn status(&self) -> Option<ClusterStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(ClusterRequest::Status { tx }).await.ok()?;
        rx.await.ok()
    }

    /// Drain in-flight replication and walk the node `STANDINGDOWN ->
    /// SEARCHING`; resolves when the cluster task has stopped accepting work.
    pub async fn stand_down(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ClusterRequest::StandDown { tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// A replicated write waiting for its turn in the single-writer sequence.
struct QueuedWrite {
    sql: String,
    command_id: u64,
    consistency: Consistency,
    tx: oneshot::Sender<Result<CommitTicket, CommitError>>,
}

/// A broadcast record waiting on follower acknowledgments.
struct PendingQuorum {
    index: u64,
    epoch: u64,
    acks: usize,
    needed: usize,
    deadline: Instant,
    tx: oneshot::Sender<Result<CommitTicket, CommitError>>,
}

/// An escalation held open on behalf of a local client.
struct PendingEscalation {
    command: Vec<u8>,
    sent_to: Option<NodeId>,
    tx: oneshot::Sender<Result<Vec<u8>, CommitError>>,
}

/// The cluster engine: owns the transport, the observed-peer view, and one
/// storage session used for follower and synchronization applies.
pub struct ClusterNode {
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    engine: Arc<dyn SqlEngine>,
    session: Box<dyn SqlSession>,
    view: ClusterView,
    events: mpsc::Receiver<PeerEvent>,
    requests: mpsc::Receiver<ClusterRequest>,
    escalation_out: mpsc::Sender<EscalatedCommand>,
    escalation_rx: Option<mpsc::Receiver<EscalatedCommand>>,

    write_queue: VecDeque<QueuedWrite>,
    pending_quorum: Option<PendingQuorum>,
    /// Set between granting a commit ticket and the worker's
    /// `commit_finished`, so indices are handed out strictly in order.
    commit_in_flight: Option<(u64, Instant)>,
    /// Replicated records that arrived ahead of the contiguous prefix.
    replica_backlog: BTreeMap<u64, ReplicationRecord>,
    escalations: BTreeMap<u64, PendingEscalation>,
    next_escalation_id: u64,
    /// Do not attempt another standup before this instant.
    standup_holdoff: Option<Instant>,
    subscribe_target: Option<NodeId>,
    subscribe_started: Option<Instant>,
    last_ping: Instant,
    shutting_down: bool,
    stand_down_tx: Option<oneshot::Sender<()>>,
}

impl ClusterNode {
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        engine: Arc<dyn SqlEngine>,
        events: mpsc::Receiver<PeerEvent>,
    ) -> (Self, ClusterHandle) {
        let (request_tx, request_rx) = mpsc::channel(1024);
        let (escalation_out, escalation_rx) = mpsc::channel(256);
        let view = ClusterView::new(&config);
        let session = engine.session();
        let node = Self {
            config,
            transport,
            engine,
            session,
            view,
            events,
            requests: request_rx,
            escalation_out,
            escalation_rx: Some(escalation_rx),
            write_queue: VecDeque::new(),
            pending_quorum: None,
            commit_in_flight: None,
            replica_backlog: BTreeMap::new(),
            escalations: BTreeMap::new(),
            next_escalation_id: 1,
            standup_holdoff: None,
            subscribe_target: None,
            subscribe_started: None,
            last_ping: Instant::now(),
            shutting_down: false,
            stand_down_tx: None,
        };
        (node, ClusterHandle { tx: request_tx })
    }

    /// Receiver for escalated commands the leader must execute locally.
    /// Taken once by the node wiring before `run`.
    pub fn take_escalations(&mut self) -> mpsc::Receiver<EscalatedCommand> {
        self.escalation_rx
            .take()
            .expect("escalation receiver already taken")
    }

    pub async fn run(mut self) {
        let mut tick = time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe = self.events.recv() => match maybe {
                    Some(event) => self.on_event(event).await,
                    None => break,
                },
                maybe = self.requests.recv() => match maybe {
                    Some(request) => self.on_request(request).await,
                    None => break,
                },
                _ = tick.tick() => self.on_tick().await,
            }
            if self.shutting_down && self.drained() {
                self.finish_stand_down().await;
                break;
            }
        }
        tracing::info!(node = self.config.name, "cluster task stopped");
    }

    fn drained(&self) -> bool {
        self.pending_quorum.is_none()
            && self.commit_in_flight.is_none()
            && self.write_queue.is_empty()
    }

    async fn finish_stand_down(&mut self) {
        // Abandoned escalations answer the client-side synthesized failure.
        for (_, esc) in std::mem::take(&mut self.escalations) {
            let _ = esc.tx.send(Err(CommitError::ShuttingDown));
        }
        if self.view.state != State::Searching {
            self.transition(State::Searching).await;
        }
        if let Some(tx) = self.stand_down_tx.take() {
            let _ = tx.send(());
        }
    }

    async fn on_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected(id, login) => {
                tracing::info!(peer = %login.name, state = %login.state, "peer logged in");
                self.view.note_login(id, &login);
                // Bring the new peer's view of us current immediately.
                self.send(
                    id,
                    PeerFrame::State {
                        state: self.view.state,
                        commit_count: self.engine.commit_count(),
                        priority: self.config.priority,
                    },
                )
                .await;
            }
            PeerEvent::Disconnected(id) => {
                self.view.note_disconnect(id);
                if self.view.leader == Some(id) {
                    self.on_leader_lost("peer disconnected").await;
                }
                if self.view.sync_source == Some(id) && self.view.state == State::Synchronizing {
                    self.transition(State::Searching).await;
                }
            }
            PeerEvent::Frame(id, frame) => {
                if let Some(peer) = self.view.peer_mut(id) {
                    peer.last_recv = Instant::now();
                }
                self.on_frame(id, frame).await;
            }
        }
    }

    async fn on_frame(&mut self, from: NodeId, frame: PeerFrame) {
        match frame {
            PeerFrame::Login(login) => {
                // Normally consumed by the peer link handshake; tolerated
                // here so a re-login refreshes the view.
                self.view.note_login(from, &login);
            }
            PeerFrame::State {
                state,
                commit_count,
                priority,
            } => {
                let was_leader = self.view.leader == Some(from);
                if let Some(peer) = self.view.peer_mut(from) {
                    peer.state = state;
                    peer.commit_count = commit_count;
                    peer.priority = priority;
                }
                if was_leader
                    && matches!(state, State::StandingDown | State::Searching | State::Waiting)
                {
                    self.on_leader_lost("leader stood down").await;
                }
            }
            PeerFrame::Synchronize { from: start } => {
                // The pull position tells us how far the peer has applied.
                if let Some(peer) = self.view.peer_mut(from) {
                    peer.commit_count = peer.commit_count.max(start.saturating_sub(1));
                }
                let records = self
                    .engine
                    .records_from(start, self.config.sync_batch_max);
                self.send(
                    from,
                    PeerFrame::SynchronizeResponse {
                        records,
                        commit_count: self.engine.commit_count(),
                    },
                )
                .await;
            }
            PeerFrame::SynchronizeResponse {
                records,
                commit_count,
            } => {
                self.on_synchronize_response(from, records, commit_count)
                    .await;
            }
            PeerFrame::Replicate { record } => {
                self.on_replicate(from, record).await;
            }
            PeerFrame::Approve { index } => {
                // An ack means the follower has applied through this index.
                if let Some(peer) = self.view.peer_mut(from) {
                    peer.commit_count = peer.commit_count.max(index);
                }
                self.on_approve(index).await;
            }
            PeerFrame::Deny { index, reason } => {
                tracing::warn!(peer = from, index, reason, "replication denied");
                if let Some(pending) = self.pending_quorum.take() {
                    if pending.index == index {
                        let _ = pending.tx.send(Err(CommitError::Conflict));
                    } else {
                        self.pending_quorum = Some(pending);
                    }
                }
            }
            PeerFrame::StandingUp {
                priority,
                commit_count,
                epoch: _,
            } => {
                self.on_standing_up(from, priority, commit_count).await;
            }
            PeerFrame::StandUpApprove => {
                if self.view.state == State::StandingUp {
                    self.view.standup_approvals += 1;
                    self.check_standup_quorum().await;
                }
            }
            PeerFrame::StandUpDeny { better } => {
                if self.view.state == State::StandingUp {
                    tracing::info!(better, "standup denied, returning to WAITING");
                    self.standup_holdoff = Some(Instant::now() + self.config.round_timeout);
                    self.transition(State::Waiting).await;
                }
            }
            PeerFrame::Subscribe { commit_count } => {
                if self.view.state == State::Leading {
                    tracing::info!(peer = from, commit_count, "accepting subscription");
                    self.send(
                        from,
                        PeerFrame::SubscribeApproved {
                            commit_count: self.engine.commit_count(),
                        },
                    )
                    .await;
                }
            }
            PeerFrame::SubscribeApproved { commit_count } => {
                if self.view.state == State::Subscribing && self.subscribe_target == Some(from) {
                    self.view.leader = Some(from);
                    self.subscribe_target = None;
                    self.subscribe_started = None;
                    self.transition(State::Following).await;
                    if commit_count > self.engine.commit_count() {
                        // Catch up on anything committed during the handshake.
                        self.send(
                            from,
                            PeerFrame::Synchronize {
                                from: self.engine.commit_count() + 1,
                            },
                        )
                        .await;
                    }
                    self.flush_escalations().await;
                }
            }
            PeerFrame::Escalate { id, command } => {
                if self.view.state == State::Leading {
                    let escalated = EscalatedCommand {
                        from,
                        id,
                        request: command,
                    };
                    if self.escalation_out.send(escalated).await.is_err() {
                        tracing::warn!(peer = from, id, "scheduler gone, dropping escalation");
                    }
                } else {
                    // The origin re-queues once it observes the leader change.
                    tracing::warn!(peer = from, id, "ignoring escalation while not leading");
                }
            }
            PeerFrame::EscalateResponse { id, response } => {
                if let Some(esc) = self.escalations.remove(&id) {
                    let _ = esc.tx.send(Ok(response));
                }
            }
            PeerFrame::Ping { timestamp } => {
                self.send(from, PeerFrame::Pong { timestamp }).await;
            }
            PeerFrame::Pong { timestamp } => {
                let rtt = epoch_micros().saturating_sub(timestamp);
                if let Some(peer) = self.view.peer_mut(from) {
                    peer.latency_us = rtt;
                }
            }
        }
    }

    async fn on_request(&mut self, request: ClusterRequest) {
        match request {
            ClusterRequest::CommitWrite {
                sql,
                command_id,
                consistency,
                tx,
            } => {
                // StandingDown still accepts writes so in-flight commands can
                // drain; intake is cut off at the scheduler.
                if !matches!(self.view.state, State::Leading | State::StandingDown) {
                    let _ = tx.send(Err(CommitError::NotLeader));
                    return;
                }
                self.write_queue.push_back(QueuedWrite {
                    sql,
                    command_id,
                    consistency,
                    tx,
                });
                self.pump_writes().await;
            }
            ClusterRequest::CommitFinished { index, ok } => {
                if let Some((granted, _)) = self.commit_in_flight.take() {
                    if granted != index {
                        tracing::error!(alert = true, granted, index, "commit ticket mismatch");
                    }
                }
                if !ok {
                    tracing::error!(
                        alert = true,
                        index,
                        "local commit failed after replication broadcast"
                    );
                }
                self.pump_writes().await;
            }
            ClusterRequest::Escalate { command, tx } => {
                if self.shutting_down {
                    let _ = tx.send(Err(CommitError::ShuttingDown));
                    return;
                }
                let id = self.next_escalation_id;
                self.next_escalation_id += 1;
                self.escalations.insert(
                    id,
                    PendingEscalation {
                        command,
                        sent_to: None,
                        tx,
                    },
                );
                if self.view.state == State::Leading {
                    // The election resolved between the worker's role check
                    // and this request; execute locally.
                    self.adopt_pending_escalations().await;
                } else {
                    self.flush_escalations().await;
                }
            }
            ClusterRequest::EscalationReply { peer, id, response } => {
                if peer == self.config.node_id {
                    // An escalation we adopted after winning the election.
                    if let Some(esc) = self.escalations.remove(&id) {
                        let _ = esc.tx.send(Ok(response));
                    }
                } else {
                    self.send(peer, PeerFrame::EscalateResponse { id, response })
                        .await;
                }
            }
            ClusterRequest::Status { tx } => {
                let status = self.view.status(
                    &self.config,
                    self.engine.commit_count(),
                    self.escalations.len(),
                );
                let _ = tx.send(status);
            }
            ClusterRequest::StandDown { tx } => {
                tracing::info!("stand down requested");
                self.shutting_down = true;
                self.stand_down_tx = Some(tx);
                if self.view.state == State::Leading {
                    self.transition(State::StandingDown).await;
                }
            }
        }
    }

    /// Start the next queued replicated write if the single-writer sequence
    /// is free.
    async fn pump_writes(&mut self) {
        if self.pending_quorum.is_some() || self.commit_in_flight.is_some() {
            return;
        }
        let Some(write) = self.write_queue.pop_front() else {
            return;
        };
        if self.view.state != State::Leading && self.view.state != State::StandingDown {
            let _ = write.tx.send(Err(CommitError::NotLeader));
            return;
        }
        let index = self.engine.commit_count() + 1;
        let epoch = self.view.epoch;
        let record = ReplicationRecord::new(index, write.sql, epoch, write.command_id);
        self.broadcast(PeerFrame::Replicate {
            record: record.clone(),
        })
        .await;
        let ticket = CommitTicket { index, epoch };
        match write.consistency {
            Consistency::Async => {
                if write.tx.send(Ok(ticket)).is_ok() {
                    self.commit_in_flight = Some((index, Instant::now()));
                } else {
                    // Worker gone; the next tick pumps the following write.
                    tracing::warn!(index, "write abandoned before commit ticket was granted");
                }
            }
            Consistency::Quorum => {
                // Wait for floor(n/2) follower acknowledgments; with the
                // leader itself that is a strict majority of the members.
                let needed = self.config.members.len() / 2;
                if needed == 0 {
                    if write.tx.send(Ok(ticket)).is_ok() {
                        self.commit_in_flight = Some((index, Instant::now()));
                    }
                    return;
                }
                self.pending_quorum = Some(PendingQuorum {
                    index,
                    epoch,
                    acks: 0,
                    needed,
                    deadline: Instant::now() + self.config.round_timeout,
                    tx: write.tx,
                });
            }
        }
    }

    async fn on_approve(&mut self, index: u64) {
        let Some(pending) = self.pending_quorum.as_mut() else {
            return;
        };
        if pending.index != index {
            return;
        }
        pending.acks += 1;
        if pending.acks >= pending.needed {
            let pending = self.pending_quorum.take().expect("pending checked above");
            let ticket = CommitTicket {
                index: pending.index,
                epoch: pending.epoch,
            };
            if pending.tx.send(Ok(ticket)).is_ok() {
                self.commit_in_flight = Some((pending.index, Instant::now()));
            }
        }
    }

    async fn on_standing_up(&mut self, from: NodeId, priority: i64, commit_count: u64) {
        if let Some(peer) = self.view.peer_mut(from) {
            peer.state = State::StandingUp;
            peer.priority = priority;
            peer.commit_count = commit_count;
        }
        // Approve unless we can see a strictly better candidate, ourselves
        // included when we hold a claim to leadership.
        let own_priority = match self.view.state {
            State::Waiting | State::StandingUp | State::Leading | State::StandingDown => {
                self.config.priority
            }
            _ => i64::MIN,
        };
        let better =
            self.view
                .better_candidate(own_priority, self.config.node_id, priority, from);
        match better {
            Some(better) => {
                self.send(from, PeerFrame::StandUpDeny { better }).await;
            }
            None => {
                self.send(from, PeerFrame::StandUpApprove).await;
            }
        }
    }

    async fn check_standup_quorum(&mut self) {
        if self.view.standup_approvals >= self.config.quorum() {
            self.view.epoch += 1;
            self.view.leader = Some(self.config.node_id);
            tracing::info!(epoch = self.view.epoch, "standup accepted, leading");
            self.transition(State::Leading).await;
            self.adopt_pending_escalations().await;
        }
    }

    /// Escalations collected while following are executed locally once this
    /// node is elected; their responses resolve through the local id.
    async fn adopt_pending_escalations(&mut self) {
        let ids: Vec<u64> = self
            .escalations
            .iter()
            .filter(|(_, esc)| esc.sent_to != Some(self.config.node_id))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let request = self.escalations[&id].command.clone();
            let escalated = EscalatedCommand {
                from: self.config.node_id,
                id,
                request,
            };
            if self.escalation_out.send(escalated).await.is_err() {
                if let Some(esc) = self.escalations.remove(&id) {
                    let _ = esc.tx.send(Err(CommitError::ShuttingDown));
                }
                continue;
            }
            if let Some(esc) = self.escalations.get_mut(&id) {
                esc.sent_to = Some(self.config.node_id);
            }
        }
    }

    async fn on_synchronize_response(
        &mut self,
        from: NodeId,
        records: Vec<ReplicationRecord>,
        peer_commit_count: u64,
    ) {
        let pulling = self.view.state == State::Synchronizing && self.view.sync_source == Some(from);
        let following = self.view.state == State::Following && self.view.leader == Some(from);
        if !pulling && !following {
            return;
        }
        for record in records {
            let index = record.index;
            if index <= self.session.commit_count() {
                continue;
            }
            if let Err(err) = self.apply_record(&record) {
                tracing::warn!(index, error = %err, "synchronization apply failed, retrying");
                if pulling {
                    self.view.sync_source = None;
                    self.transition(State::Searching).await;
                }
                return;
            }
        }
        let local = self.engine.commit_count();
        if local < peer_commit_count {
            self.send(from, PeerFrame::Synchronize { from: local + 1 })
                .await;
        } else if pulling {
            tracing::info!(commit_count = local, "synchronized");
            self.view.sync_source = None;
            self.transition(State::Waiting).await;
        } else {
            self.drain_replica_backlog(from).await;
        }
    }

    async fn on_replicate(&mut self, from: NodeId, record: ReplicationRecord) {
        if self.view.leader != Some(from) || self.view.state != State::Following {
            tracing::debug!(peer = from, index = record.index, "ignoring replicate");
            return;
        }
        if content_hash(&record.sql) != record.hash {
            self.send(
                from,
                PeerFrame::Deny {
                    index: record.index,
                    reason: "content hash mismatch".into(),
                },
            )
            .await;
            return;
        }
        self.replica_backlog.insert(record.index, record);
        self.drain_replica_backlog(from).await;
        // A hole in front of the backlog means we missed a record; pull the
        // gap from the leader rather than waiting it out.
        if let Some((&lowest, _)) = self.replica_backlog.iter().next() {
            let expected = self.session.commit_count() + 1;
            if lowest > expected {
                self.send(from, PeerFrame::Synchronize { from: expected })
                    .await;
            }
        }
    }

    /// Apply contiguous backlog records, acknowledging each to the leader.
    async fn drain_replica_backlog(&mut self, leader: NodeId) {
        loop {
            let expected = self.session.commit_count() + 1;
            let Some(record) = self.replica_backlog.remove(&expected) else {
                break;
            };
            match self.apply_record(&record) {
                Ok(()) => {
                    self.send(leader, PeerFrame::Approve { index: record.index })
                        .await;
                }
                Err(err) => {
                    tracing::error!(alert = true, index = record.index, error = %err, "follower apply failed");
                    self.send(
                        leader,
                        PeerFrame::Deny {
                            index: record.index,
                            reason: err.to_string(),
                        },
                    )
                    .await;
                    break;
                }
            }
        }
        // Anything at or below the applied prefix is a duplicate.
        let applied = self.session.commit_count();
        self.replica_backlog.retain(|&index, _| index > applied);
    }

    fn apply_record(&mut self, record: &ReplicationRecord) -> anyhow::Result<()> {
        if !self.session.inside_transaction() {
            self.session.begin_concurrent()?;
        }
        let result = self
            .session
            .execute(&record.sql)
            .map(|_| ())
            .and_then(|()| {
                self.session
                    .commit(Some(record.index), record.epoch, record.command_id)
                    .map(|_| ())
            });
        if result.is_err() {
            self.session.rollback();
        }
        result.map_err(Into::into)
    }

    async fn on_leader_lost(&mut self, reason: &str) {
        tracing::warn!(reason, "leader lost");
        self.view.leader = None;
        self.subscribe_target = None;
        self.subscribe_started = None;
        // Escalations stay pending and are re-sent to the next leader.
        for esc in self.escalations.values_mut() {
            esc.sent_to = None;
        }
        if matches!(self.view.state, State::Following | State::Subscribing) {
            self.transition(State::Waiting).await;
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_ping) >= PING_INTERVAL {
            self.last_ping = now;
            self.broadcast(PeerFrame::Ping {
                timestamp: epoch_micros(),
            })
            .await;
        }

        // Quorum-commit deadline: losing the round fails the write.
        if let Some(pending) = self.pending_quorum.as_ref() {
            if now >= pending.deadline {
                let pending = self.pending_quorum.take().expect("pending checked above");
                tracing::warn!(index = pending.index, "quorum ack deadline exceeded");
                let _ = pending.tx.send(Err(CommitError::Conflict));
            }
        }
        if let Some((index, granted_at)) = self.commit_in_flight {
            if now.duration_since(granted_at) > COMMIT_FINISH_GRACE {
                tracing::error!(alert = true, index, "worker never confirmed granted commit");
                self.commit_in_flight = None;
            }
        }

        match self.view.state {
            State::Searching => self.tick_searching().await,
            State::Synchronizing => {
                if self
                    .view
                    .sync_source
                    .map(|id| !self.transport.connected(id))
                    .unwrap_or(true)
                {
                    self.view.sync_source = None;
                    self.transition(State::Searching).await;
                }
            }
            State::Waiting => self.tick_waiting().await,
            State::StandingUp => {
                if let Some(started) = self.view.standup_started {
                    if now.duration_since(started) > self.config.round_timeout {
                        tracing::info!("standup timed out, returning to WAITING");
                        self.standup_holdoff = Some(now + self.config.round_timeout);
                        self.transition(State::Waiting).await;
                    }
                }
            }
            State::Leading => self.tick_leading().await,
            State::StandingDown => {
                if self.drained() {
                    self.transition(State::Searching).await;
                }
            }
            State::Subscribing => {
                if let Some(started) = self.subscribe_started {
                    if now.duration_since(started) > self.config.round_timeout {
                        self.subscribe_target = None;
                        self.subscribe_started = None;
                        self.transition(State::Waiting).await;
                    }
                }
            }
            State::Following => {
                let lost = match self.view.leader.and_then(|id| self.view.peers.get(&id)) {
                    Some(peer) => {
                        !peer.logged_in
                            || now.duration_since(peer.last_recv) > self.config.recv_timeout
                    }
                    None => true,
                };
                if lost {
                    self.on_leader_lost("recv timeout").await;
                }
            }
            State::Unknown => {
                self.transition(State::Searching).await;
            }
        }

        self.pump_writes().await;
        self.flush_escalations().await;
    }

    async fn tick_searching(&mut self) {
        if self.shutting_down {
            return;
        }
        let single = self.config.members.len() == 1;
        if !single && self.view.logged_in_count() == 0 {
            return;
        }
        match self.view.max_peer_commit() {
            Some((peer, count)) if count > self.engine.commit_count() => {
                self.view.sync_source = Some(peer);
                let from = self.engine.commit_count() + 1;
                tracing::info!(peer, from, "synchronizing");
                self.transition(State::Synchronizing).await;
                self.send(peer, PeerFrame::Synchronize { from }).await;
            }
            _ => {
                self.transition(State::Waiting).await;
            }
        }
    }

    async fn tick_waiting(&mut self) {
        if self.shutting_down {
            return;
        }
        // A peer got ahead of us while we waited; pull before electing.
        if let Some((peer, count)) = self.view.max_peer_commit() {
            if count > self.engine.commit_count()
                && self
                    .view
                    .peers
                    .get(&peer)
                    .map(|p| p.state != State::Leading)
                    .unwrap_or(false)
            {
                self.view.sync_source = Some(peer);
                let from = self.engine.commit_count() + 1;
                self.transition(State::Synchronizing).await;
                self.send(peer, PeerFrame::Synchronize { from }).await;
                return;
            }
        }

        if let Some(candidate) = self.view.leader_candidate() {
            let leading = self
                .view
                .peers
                .get(&candidate)
                .map(|p| p.state == State::Leading)
                .unwrap_or(false);
            if leading {
                self.subscribe_target = Some(candidate);
                self.subscribe_started = Some(Instant::now());
                self.transition(State::Subscribing).await;
                self.send(
                    candidate,
                    PeerFrame::Subscribe {
                        commit_count: self.engine.commit_count(),
                    },
                )
                .await;
            }
            // A candidate mid-standup resolves on its own; hold our vote.
            return;
        }

        if let Some(holdoff) = self.standup_holdoff {
            if Instant::now() < holdoff {
                return;
            }
            self.standup_holdoff = None;
        }
        if self.view.reachable() < self.config.quorum() {
            return;
        }
        if !self
            .view
            .is_best_waiting_candidate(self.config.priority, self.config.node_id)
        {
            return;
        }
        self.view.standup_approvals = 1;
        self.view.standup_started = Some(Instant::now());
        tracing::info!(priority = self.config.priority, "standing up");
        self.transition(State::StandingUp).await;
        self.broadcast(PeerFrame::StandingUp {
            priority: self.config.priority,
            commit_count: self.engine.commit_count(),
            epoch: self.view.epoch + 1,
        })
        .await;
        // Single-node clusters elect themselves immediately.
        self.check_standup_quorum().await;
    }

    async fn tick_leading(&mut self) {
        if self.config.members.len() > 1 && self.view.reachable() < self.config.quorum() {
            tracing::warn!("lost quorum while leading");
            self.fail_inflight_writes();
            self.view.leader = None;
            self.transition(State::Searching).await;
            return;
        }
        // Yield to a higher-priority peer that has caught up and is waiting.
        let own_commit = self.engine.commit_count();
        let should_yield = self.view.peers.values().any(|p| {
            p.logged_in
                && p.state == State::Waiting
                && p.commit_count >= own_commit
                && (p.priority, std::cmp::Reverse(p.id))
                    > (self.config.priority, std::cmp::Reverse(self.config.node_id))
        });
        if should_yield {
            tracing::info!("higher priority peer is ready, standing down");
            self.view.leader = None;
            self.transition(State::StandingDown).await;
        }
    }

    fn fail_inflight_writes(&mut self) {
        if let Some(pending) = self.pending_quorum.take() {
            let _ = pending.tx.send(Err(CommitError::Conflict));
        }
        for write in self.write_queue.drain(..) {
            let _ = write.tx.send(Err(CommitError::Conflict));
        }
    }

    /// Send pending escalations that have not yet reached the current leader.
    async fn flush_escalations(&mut self) {
        if self.view.state != State::Following {
            return;
        }
        let Some(leader) = self.view.leader else {
            return;
        };
        let unsent: Vec<u64> = self
            .escalations
            .iter()
            .filter(|(_, esc)| esc.sent_to != Some(leader))
            .map(|(id, _)| *id)
            .collect();
        for id in unsent {
            let command = self.escalations[&id].command.clone();
            self.send(leader, PeerFrame::Escalate { id, command }).await;
            if let Some(esc) = self.escalations.get_mut(&id) {
                esc.sent_to = Some(leader);
            }
        }
    }

    async fn transition(&mut self, next: State) {
        let prev = self.view.state;
        if prev == next {
            return;
        }
        self.view.state = next;
        if next != State::StandingUp {
            self.view.standup_approvals = 0;
            self.view.standup_started = None;
        }
        tracing::info!(from = %prev, to = %next, "state transition");
        self.broadcast(PeerFrame::State {
            state: next,
            commit_count: self.engine.commit_count(),
            priority: self.config.priority,
        })
        .await;
    }

    async fn broadcast(&self, frame: PeerFrame) {
        for member in self.config.peers() {
            if self.transport.connected(member.id) {
                self.send(member.id, frame.clone()).await;
            }
        }
    }

    async fn send(&self, target: NodeId, frame: PeerFrame) {
        if let Err(err) = self.transport.send(target, frame).await {
            tracing::debug!(target, error = %err, "peer send failed");
        }
    }
}

fn epoch_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(u128::from(u64::MAX)) as u64
}
