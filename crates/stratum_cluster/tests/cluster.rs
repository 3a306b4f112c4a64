//! Multi-node cluster tests over an in-memory transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

use stratum_cluster::cluster::{
    ClusterHandle, ClusterNode, CommitError, Consistency, EngineError, Login, Member, NodeConfig,
    NodeId, PeerEvent, PeerFrame, ReplicationRecord, SqlEngine, SqlSession, State, Transport,
};

/// Storage stub: a journal of committed records, no file behind it.
struct MemEngine {
    records: RwLock<Vec<ReplicationRecord>>,
    count: AtomicU64,
}

impl MemEngine {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            records: RwLock::new(Vec::new()),
            count: AtomicU64::new(0),
        })
    }

    fn records(&self) -> Vec<ReplicationRecord> {
        self.records.read().unwrap().clone()
    }
}

struct MemSession {
    engine: Arc<MemEngine>,
    in_txn: bool,
    uncommitted: String,
}

impl MemSession {
    fn new(engine: Arc<MemEngine>) -> Box<dyn SqlSession> {
        Box::new(Self {
            engine,
            in_txn: false,
            uncommitted: String::new(),
        })
    }
}

impl SqlSession for MemSession {
    fn begin_concurrent(&mut self) -> Result<(), EngineError> {
        self.in_txn = true;
        self.uncommitted.clear();
        Ok(())
    }

    fn inside_transaction(&self) -> bool {
        self.in_txn
    }

    fn start_timing(&mut self, _budget: Duration) {}

    fn reset_timing(&mut self) {}

    fn execute(&mut self, sql: &str) -> Result<Vec<Vec<String>>, EngineError> {
        self.uncommitted.push_str(sql);
        Ok(Vec::new())
    }

    fn uncommitted_query(&self) -> &str {
        &self.uncommitted
    }

    fn commit(
        &mut self,
        assign_index: Option<u64>,
        epoch: u64,
        command_id: u64,
    ) -> Result<u64, EngineError> {
        let mut records = self.engine.records.write().unwrap();
        let expected = records.last().map(|r| r.index).unwrap_or(0) + 1;
        let index = match assign_index {
            Some(assigned) if assigned != expected => {
                return Err(EngineError::IndexGap { assigned, expected });
            }
            Some(assigned) => assigned,
            None => expected,
        };
        let sql = std::mem::take(&mut self.uncommitted);
        records.push(ReplicationRecord::new(index, sql, epoch, command_id));
        self.engine.count.store(index, Ordering::Release);
        self.in_txn = false;
        Ok(index)
    }

    fn rollback(&mut self) {
        self.in_txn = false;
        self.uncommitted.clear();
    }

    fn commit_count(&self) -> u64 {
        self.engine.count.load(Ordering::Acquire)
    }
}

/// `SqlEngine` view over the shared in-memory journal.
struct MemEngineHandle {
    engine: Arc<MemEngine>,
}

impl SqlEngine for MemEngineHandle {
    fn session(&self) -> Box<dyn SqlSession> {
        MemSession::new(self.engine.clone())
    }

    fn commit_count(&self) -> u64 {
        self.engine.count.load(Ordering::Acquire)
    }

    fn records_from(&self, from: u64, limit: usize) -> Vec<ReplicationRecord> {
        let records = self.engine.records.read().unwrap();
        if from == 0 || from as usize > records.len() {
            return Vec::new();
        }
        let start = (from - 1) as usize;
        let end = records.len().min(start + limit);
        records[start..end].to_vec()
    }
}

/// In-memory frame router standing in for the peer link.
#[derive(Default)]
struct Hub {
    senders: Mutex<HashMap<NodeId, mpsc::Sender<PeerEvent>>>,
}

impl Hub {
    fn sender(&self, id: NodeId) -> Option<mpsc::Sender<PeerEvent>> {
        self.senders.lock().unwrap().get(&id).cloned()
    }

    /// Drop a node off the hub and tell everyone else, like a TCP reset.
    async fn kill(&self, id: NodeId) {
        let senders: Vec<_> = {
            let mut map = self.senders.lock().unwrap();
            map.remove(&id);
            map.values().cloned().collect()
        };
        for sender in senders {
            let _ = sender.send(PeerEvent::Disconnected(id)).await;
        }
    }
}

struct HubTransport {
    hub: Arc<Hub>,
    from: NodeId,
}

#[async_trait]
impl Transport for HubTransport {
    async fn send(&self, target: NodeId, frame: PeerFrame) -> anyhow::Result<()> {
        let sender = self
            .hub
            .sender(target)
            .ok_or_else(|| anyhow::anyhow!("peer {target} is down"))?;
        sender
            .send(PeerEvent::Frame(self.from, frame))
            .await
            .map_err(|_| anyhow::anyhow!("peer {target} stopped"))
    }

    fn connected(&self, target: NodeId) -> bool {
        self.hub.sender(target).is_some()
    }
}

struct TestNode {
    id: NodeId,
    priority: i64,
    handle: ClusterHandle,
    engine: Arc<MemEngine>,
    events: mpsc::Sender<PeerEvent>,
    task: tokio::task::JoinHandle<()>,
}

impl TestNode {
    async fn state(&self) -> State {
        match self.handle.status().await {
            Some(status) => State::from_name(&status.state).unwrap_or(State::Unknown),
            None => State::Unknown,
        }
    }
}

fn config_for(id: NodeId, members: &[(NodeId, i64)]) -> NodeConfig {
    let own = members.iter().find(|(m, _)| *m == id).unwrap();
    NodeConfig {
        node_id: id,
        name: format!("node{id}"),
        priority: own.1,
        members: members
            .iter()
            .map(|(id, priority)| Member {
                id: *id,
                name: format!("node{id}"),
                host: format!("mem://{id}"),
                priority: *priority,
            })
            .collect(),
        recv_timeout: Duration::from_millis(800),
        round_timeout: Duration::from_millis(400),
        sync_batch_max: 100,
    }
}

/// Spawn one node and register it on the hub. The escalation pump answers
/// every escalated command with a canned `756` response, standing in for the
/// node-side scheduler.
fn spawn_node(hub: &Arc<Hub>, id: NodeId, members: &[(NodeId, i64)]) -> TestNode {
    let config = config_for(id, members);
    let priority = config.priority;
    let engine = MemEngine::new();
    let engine_handle: Arc<dyn SqlEngine> = Arc::new(MemEngineHandle {
        engine: engine.clone(),
    });
    let transport: Arc<dyn Transport> = Arc::new(HubTransport {
        hub: hub.clone(),
        from: id,
    });
    let (event_tx, event_rx) = mpsc::channel(1024);
    let (mut node, handle) = ClusterNode::new(config, transport, engine_handle, event_rx);
    let mut escalations = node.take_escalations();
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            while let Some(esc) = escalations.recv().await {
                handle
                    .escalation_reply(esc.from, esc.id, b"756\r\ncommitCount: 1\r\n\r\n".to_vec())
                    .await;
            }
        });
    }
    let task = tokio::spawn(node.run());
    hub.senders.lock().unwrap().insert(id, event_tx.clone());
    TestNode {
        id,
        priority,
        handle,
        engine,
        events: event_tx,
        task,
    }
}

fn login_for(node: &TestNode) -> Login {
    Login {
        node_id: node.id,
        name: format!("node{}", node.id),
        priority: node.priority,
        version: "test".into(),
        state: State::Unknown,
        commit_count: node.engine.count.load(Ordering::Acquire),
    }
}

/// Deliver `Connected` events for every pair, as the peer link would after
/// its login handshakes.
async fn connect_all(nodes: &[TestNode]) {
    for a in nodes {
        for b in nodes {
            if a.id != b.id {
                let _ = a
                    .events
                    .send(PeerEvent::Connected(b.id, login_for(b)))
                    .await;
            }
        }
    }
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(25)).await;
    }
}

async fn leader_of(nodes: &[TestNode]) -> Option<NodeId> {
    for node in nodes {
        if node.state().await == State::Leading {
            return Some(node.id);
        }
    }
    None
}

async fn wait_for_leader(nodes: &[TestNode]) -> NodeId {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(id) = leader_of(nodes).await {
            return id;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for a leader");
        }
        sleep(Duration::from_millis(25)).await;
    }
}

async fn followers_ready(nodes: &[TestNode], leader_id: NodeId) -> bool {
    for node in nodes {
        if node.id != leader_id && node.state().await != State::Following {
            return false;
        }
    }
    true
}

/// Run the full worker-side replicated write against the current leader.
async fn replicated_write(
    node: &TestNode,
    sql: &str,
    consistency: Consistency,
) -> Result<u64, CommitError> {
    let mut session = MemSession::new(node.engine.clone());
    session.begin_concurrent().unwrap();
    session.execute(sql).unwrap();
    let ticket = node
        .handle
        .commit_write(session.uncommitted_query().to_string(), 0, consistency)
        .await?;
    session
        .commit(Some(ticket.index), ticket.epoch, 0)
        .expect("granted commit");
    node.handle.commit_finished(ticket.index, true).await;
    Ok(ticket.index)
}

#[tokio::test]
async fn elects_highest_priority_with_lowest_id_tiebreak() {
    let hub = Arc::new(Hub::default());
    let members = [(1, 100), (2, 100), (3, 50)];
    let nodes: Vec<_> = members
        .iter()
        .map(|(id, _)| spawn_node(&hub, *id, &members))
        .collect();
    connect_all(&nodes).await;

    let leader = wait_for_leader(&nodes).await;
    assert_eq!(leader, 1, "equal priorities break to the lower id");

    let nodes_ref = &nodes;
    wait_until("followers to subscribe", || async move {
        followers_ready(nodes_ref, 1).await
    })
    .await;

    // Election safety: at most one node is ever leading.
    for _ in 0..10 {
        let mut leading = 0;
        for node in &nodes {
            if node.state().await == State::Leading {
                leading += 1;
            }
        }
        assert!(leading <= 1, "two leaders at once");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn replicates_writes_in_order_to_all_followers() {
    let hub = Arc::new(Hub::default());
    let members = [(1, 100), (2, 50), (3, 10)];
    let nodes: Vec<_> = members
        .iter()
        .map(|(id, _)| spawn_node(&hub, *id, &members))
        .collect();
    connect_all(&nodes).await;
    let leader_id = wait_for_leader(&nodes).await;
    let nodes_ref = &nodes;
    wait_until("followers", || async move {
        followers_ready(nodes_ref, leader_id).await
    })
    .await;
    let leader = nodes.iter().find(|n| n.id == leader_id).unwrap();

    for i in 1..=5u64 {
        let index = replicated_write(
            leader,
            &format!("INSERT INTO t VALUES ({i});"),
            Consistency::Async,
        )
        .await
        .unwrap();
        assert_eq!(index, i, "indices are strictly increasing with no gaps");
    }

    wait_until("followers to apply", || async move {
        nodes_ref
            .iter()
            .all(|n| n.engine.count.load(Ordering::Acquire) == 5)
    })
    .await;

    // Follower equality: same indices, same content hashes.
    let expected = leader.engine.records();
    for node in &nodes {
        let records = node.engine.records();
        assert_eq!(records.len(), expected.len());
        for (a, b) in records.iter().zip(expected.iter()) {
            assert_eq!(a.index, b.index);
            assert_eq!(a.hash, b.hash);
        }
    }
}

#[tokio::test]
async fn quorum_write_fails_without_followers() {
    let hub = Arc::new(Hub::default());
    let members = [(1, 100), (2, 50), (3, 10)];
    let nodes: Vec<_> = members
        .iter()
        .map(|(id, _)| spawn_node(&hub, *id, &members))
        .collect();
    connect_all(&nodes).await;
    let leader_id = wait_for_leader(&nodes).await;
    assert_eq!(leader_id, 1);
    let nodes_ref = &nodes;
    wait_until("followers", || async move {
        followers_ready(nodes_ref, 1).await
    })
    .await;

    // A quorum write with live followers succeeds.
    replicated_write(&nodes[0], "INSERT INTO t VALUES (1);", Consistency::Quorum)
        .await
        .expect("quorum write with live followers");

    // Cut both followers off; the next quorum write cannot collect acks.
    // (The leader also drops to SEARCHING once it notices quorum loss, so
    // the write fails either way: ack deadline or leadership loss.)
    hub.kill(2).await;
    hub.kill(3).await;
    let result =
        replicated_write(&nodes[0], "INSERT INTO t VALUES (2);", Consistency::Quorum).await;
    assert!(result.is_err(), "quorum write must fail without followers");

    nodes[1].task.abort();
    nodes[2].task.abort();
}

#[tokio::test]
async fn late_peer_synchronizes_the_whole_journal() {
    let hub = Arc::new(Hub::default());
    let members = [(1, 100), (2, 50), (3, 10)];
    let first_two: Vec<_> = [1u64, 2]
        .iter()
        .map(|id| spawn_node(&hub, *id, &members))
        .collect();
    connect_all(&first_two).await;
    let leader_id = wait_for_leader(&first_two).await;
    assert_eq!(leader_id, 1);
    let first_ref = &first_two;
    wait_until("follower", || async move {
        first_ref[1].state().await == State::Following
    })
    .await;

    for i in 1..=4u64 {
        replicated_write(
            &first_two[0],
            &format!("INSERT INTO t VALUES ({i});"),
            Consistency::Async,
        )
        .await
        .unwrap();
    }

    // Node 3 joins late with an empty journal.
    let late = spawn_node(&hub, 3, &members);
    for existing in &first_two {
        let _ = late
            .events
            .send(PeerEvent::Connected(existing.id, login_for(existing)))
            .await;
        let _ = existing
            .events
            .send(PeerEvent::Connected(late.id, login_for(&late)))
            .await;
    }

    let late_ref = &late;
    wait_until("late peer to catch up", || async move {
        late_ref.engine.count.load(Ordering::Acquire) == 4
            && late_ref.state().await == State::Following
    })
    .await;
    let expected = first_two[0].engine.records();
    let got = late.engine.records();
    assert_eq!(got.len(), expected.len());
    for (a, b) in got.iter().zip(expected.iter()) {
        assert_eq!((a.index, a.hash.clone()), (b.index, b.hash.clone()));
    }
}

#[tokio::test]
async fn failover_elects_the_next_best_candidate() {
    let hub = Arc::new(Hub::default());
    let members = [(1, 100), (2, 50), (3, 10)];
    let nodes: Vec<_> = members
        .iter()
        .map(|(id, _)| spawn_node(&hub, *id, &members))
        .collect();
    connect_all(&nodes).await;
    let leader_id = wait_for_leader(&nodes).await;
    assert_eq!(leader_id, 1);
    let nodes_ref = &nodes;
    wait_until("followers", || async move {
        followers_ready(nodes_ref, 1).await
    })
    .await;

    // Kill the leader outright.
    nodes[0].task.abort();
    hub.kill(1).await;

    let survivors = &nodes[1..];
    wait_until("a new leader", || async move {
        leader_of(survivors).await == Some(2)
    })
    .await;
    wait_until("node3 to follow node2", || async move {
        nodes_ref[2].state().await == State::Following
    })
    .await;
}

#[tokio::test]
async fn follower_escalates_and_relays_the_leader_response() {
    let hub = Arc::new(Hub::default());
    let members = [(1, 100), (2, 50)];
    let nodes: Vec<_> = members
        .iter()
        .map(|(id, _)| spawn_node(&hub, *id, &members))
        .collect();
    connect_all(&nodes).await;
    let leader_id = wait_for_leader(&nodes).await;
    assert_eq!(leader_id, 1);
    let nodes_ref = &nodes;
    wait_until("follower", || async move {
        nodes_ref[1].state().await == State::Following
    })
    .await;

    let response = nodes[1]
        .handle
        .escalate(b"idcollision\r\n\r\n".to_vec())
        .await
        .expect("escalation response");
    // Relayed verbatim from the leader-side pump.
    assert!(response.starts_with(b"756\r\n"));
}

#[tokio::test]
async fn stand_down_drains_to_searching() {
    let hub = Arc::new(Hub::default());
    let members = [(1, 100)];
    let node = spawn_node(&hub, 1, &members);

    let node_ref = &node;
    wait_until("single node to lead", || async move {
        node_ref.state().await == State::Leading
    })
    .await;
    replicated_write(&node, "INSERT INTO t VALUES (1);", Consistency::Quorum)
        .await
        .expect("single-node quorum write");

    node.handle.stand_down().await;
    node.task.abort();
    assert_eq!(node.engine.count.load(Ordering::Acquire), 1);
}
