// End-to-end cluster tests over an in-memory transport mesh.
//
// Every node's handle is registered in a shared router; the transport
// resolves peer addresses to handles and delivers RPCs straight into the
// peer's inbound queue. Partitions are simulated by marking an address down
// in the router.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rusty_raft::common::{NodeAddr, NodeId};
use rusty_raft::fsm::StateMachine;
use rusty_raft::storage::{
    MemorySnapshotStore, MemoryStateStore, SnapshotPersister, StatePersister,
};
use rusty_raft::transport::RaftTransport;
use rusty_raft::{
    AppendEntriesRequest, AppendEntriesResponse, ApplyStatus, InstallSnapshotRequest,
    InstallSnapshotResponse, NodeEvent, RaftConfig, RaftError, RaftHandle, RaftNode, Result,
    VoteRequest, VoteResponse,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

/// Shared routing table plus the set of addresses currently "down".
#[derive(Default)]
struct Router {
    routes: RwLock<HashMap<NodeAddr, RaftHandle>>,
    down: RwLock<Vec<NodeAddr>>,
}

impl Router {
    fn register(&self, addr: NodeAddr, handle: RaftHandle) {
        self.routes.write().insert(addr, handle);
    }

    fn partition(&self, addr: &str) {
        self.down.write().push(addr.to_string());
    }

    fn heal(&self, addr: &str) {
        self.down.write().retain(|a| a != addr);
    }

    fn reachable(&self, from: &NodeAddr, to: &NodeAddr) -> bool {
        let down = self.down.read();
        !down.contains(from) && !down.contains(to)
    }

    fn handle_of(&self, addr: &NodeAddr) -> Option<RaftHandle> {
        self.routes.read().get(addr).cloned()
    }
}

/// Transport that short-circuits RPCs through the router.
struct MeshTransport {
    self_addr: NodeAddr,
    router: Arc<Router>,
}

impl MeshTransport {
    fn route(&self, addr: &NodeAddr) -> Result<RaftHandle> {
        if !self.router.reachable(&self.self_addr, addr) {
            return Err(RaftError::Transport(format!("{addr} unreachable")));
        }
        self.router
            .handle_of(addr)
            .ok_or_else(|| RaftError::Transport(format!("{addr} unknown")))
    }
}

#[async_trait]
impl RaftTransport for MeshTransport {
    async fn append_entries(
        &self,
        addr: &NodeAddr,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.route(addr)?.append_entries(req).await
    }

    async fn request_vote(&self, addr: &NodeAddr, req: VoteRequest) -> Result<VoteResponse> {
        self.route(addr)?.request_vote(req).await
    }

    async fn install_snapshot(
        &self,
        addr: &NodeAddr,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.route(addr)?.install_snapshot(req).await
    }
}

/// State machine that records applied commands in order.
#[derive(Default)]
struct VecFsm {
    applied: Mutex<Vec<Vec<u8>>>,
}

impl VecFsm {
    fn applied(&self) -> Vec<Vec<u8>> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl StateMachine for VecFsm {
    async fn apply(&self, data: &[u8]) -> Result<()> {
        self.applied.lock().push(data.to_vec());
        Ok(())
    }

    async fn serialize(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(&*self.applied.lock(), bincode::config::standard())
            .map_err(|e| RaftError::Serialization(e.to_string()))
    }
}

struct NodeHarness {
    handle: RaftHandle,
    events: mpsc::Receiver<NodeEvent>,
    fsm: Arc<VecFsm>,
    state_store: Arc<MemoryStateStore>,
    snapshot_store: Arc<MemorySnapshotStore>,
}

fn addr_of(id: &str) -> NodeAddr {
    format!("mem://{id}")
}

fn peer_map(ids: &[&str]) -> HashMap<NodeId, NodeAddr> {
    ids.iter().map(|id| (id.to_string(), addr_of(id))).collect()
}

fn spawn_node(
    id: &str,
    peers: HashMap<NodeId, NodeAddr>,
    as_learner: bool,
    max_log_length: u64,
    router: &Arc<Router>,
) -> NodeHarness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let config = RaftConfig {
        id: id.to_string(),
        addr: addr_of(id),
        peers,
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        heartbeat_interval: Duration::from_millis(50),
        max_log_length,
        as_learner,
    };
    let fsm = Arc::new(VecFsm::default());
    let state_store = Arc::new(MemoryStateStore::new());
    let snapshot_store = Arc::new(MemorySnapshotStore::new());
    let transport = Arc::new(MeshTransport {
        self_addr: addr_of(id),
        router: router.clone(),
    });

    let (node, handle, events) = RaftNode::new(
        config,
        transport,
        fsm.clone(),
        state_store.clone(),
        snapshot_store.clone(),
    )
    .expect("valid node config");

    router.register(addr_of(id), handle.clone());
    tokio::spawn(node.run());

    NodeHarness {
        handle,
        events,
        fsm,
        state_store,
        snapshot_store,
    }
}

fn spawn_cluster(
    ids: &[&str],
    max_log_length: u64,
) -> (Arc<Router>, HashMap<NodeId, NodeHarness>) {
    let router = Arc::new(Router::default());
    let peers = peer_map(ids);
    let nodes = ids
        .iter()
        .map(|id| {
            (
                id.to_string(),
                spawn_node(id, peers.clone(), false, max_log_length, &router),
            )
        })
        .collect();
    (router, nodes)
}

/// Submit a command through whichever node currently leads; returns that
/// node's id. Doubles as leader discovery.
async fn apply_anywhere(nodes: &HashMap<NodeId, NodeHarness>, data: &[u8]) -> NodeId {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        for (id, harness) in nodes {
            if let Ok(resp) = harness.handle.apply_command(data.to_vec()).await {
                if resp.status == ApplyStatus::Ok {
                    return id.clone();
                }
            }
        }
        if Instant::now() >= deadline {
            panic!("no node accepted the command as leader");
        }
        sleep(Duration::from_millis(50)).await;
    }
}

/// Wait for the next matching event from one node.
async fn wait_event(
    harness: &mut NodeHarness,
    pred: impl Fn(&NodeEvent) -> bool,
    wait: Duration,
) -> NodeEvent {
    timeout(wait, async {
        loop {
            match harness.events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for node event")
}

/// Wait until a node's state machine has applied `expected` commands.
async fn wait_applied(harness: &NodeHarness, expected: usize, wait: Duration) {
    let deadline = Instant::now() + wait;
    while harness.fsm.applied().len() < expected {
        if Instant::now() >= deadline {
            panic!(
                "state machine stuck at {} of {expected} applied commands",
                harness.fsm.applied().len()
            );
        }
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_three_nodes_elect_and_replicate() {
    let (_router, nodes) = spawn_cluster(&["a", "b", "c"], 10_000);

    apply_anywhere(&nodes, b"x=1").await;

    // Followers learn the commit index from heartbeats and apply.
    for harness in nodes.values() {
        wait_applied(harness, 1, Duration::from_secs(3)).await;
        assert_eq!(harness.fsm.applied(), vec![b"x=1".to_vec()]);
    }
}

#[tokio::test]
async fn test_single_node_commits_without_peers() {
    let (_router, nodes) = spawn_cluster(&["solo"], 10_000);

    let leader = apply_anywhere(&nodes, b"first").await;
    assert_eq!(leader, "solo");

    for i in 0..3u8 {
        let resp = nodes["solo"].handle.apply_command(vec![i]).await.unwrap();
        assert_eq!(resp.status, ApplyStatus::Ok);
    }
    assert_eq!(nodes["solo"].fsm.applied().len(), 4);
}

#[tokio::test]
async fn test_followers_redirect_clients_to_leader() {
    let (_router, nodes) = spawn_cluster(&["a", "b", "c"], 10_000);

    let leader = apply_anywhere(&nodes, b"seed").await;
    let follower = nodes.keys().find(|id| **id != leader).unwrap().clone();

    // The follower learns the leader from its heartbeats; retry until the
    // hint has propagated.
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let resp = nodes[&follower]
            .handle
            .apply_command(b"nope".to_vec())
            .await
            .unwrap();
        assert_eq!(resp.status, ApplyStatus::NotLeader);
        if resp.leader.as_ref() == Some(&leader) {
            break;
        }
        if Instant::now() >= deadline {
            panic!("follower never learned the leader id");
        }
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_partitioned_leader_steps_down_and_adopts_new_log() {
    let (router, mut nodes) = spawn_cluster(&["a", "b", "c"], 10_000);

    let old_leader = apply_anywhere(&nodes, b"committed").await;
    for harness in nodes.values() {
        wait_applied(harness, 1, Duration::from_secs(3)).await;
    }

    // Cut the leader off and give it an entry it can never commit.
    router.partition(&addr_of(&old_leader));
    let orphan = nodes[&old_leader]
        .handle
        .apply_command(b"orphan".to_vec())
        .await;
    assert!(!matches!(orphan, Ok(ref resp) if resp.status == ApplyStatus::Ok));

    // The healthy majority elects a replacement and keeps committing.
    let healthy_ids: Vec<NodeId> = nodes
        .keys()
        .filter(|id| **id != old_leader)
        .cloned()
        .collect();
    let mut healthy = HashMap::new();
    for id in healthy_ids {
        let harness = nodes.remove(&id).unwrap();
        healthy.insert(id, harness);
    }
    let new_leader = apply_anywhere(&healthy, b"after-failover").await;
    assert_ne!(new_leader, old_leader);

    // After the partition heals, the deposed leader truncates its orphaned
    // entry and adopts the new leader's log.
    router.heal(&addr_of(&old_leader));
    let old = nodes.get_mut(&old_leader).unwrap();
    wait_event(
        old,
        |e| matches!(e, NodeEvent::SteppedDown { .. }),
        Duration::from_secs(5),
    )
    .await;
    wait_applied(old, 2, Duration::from_secs(5)).await;
    assert_eq!(
        old.fsm.applied(),
        vec![b"committed".to_vec(), b"after-failover".to_vec()]
    );
}

#[tokio::test]
async fn test_leadership_transfer() {
    let (_router, mut nodes) = spawn_cluster(&["a", "b", "c"], 10_000);

    let leader = apply_anywhere(&nodes, b"pre-transfer").await;
    let target = nodes.keys().find(|id| **id != leader).unwrap().clone();

    nodes[&leader]
        .handle
        .transfer_leadership(target.clone())
        .await
        .unwrap();

    // The target elects itself; the old leader yields.
    let target_harness = nodes.get_mut(&target).unwrap();
    wait_event(
        target_harness,
        |e| matches!(e, NodeEvent::LeaderElected { .. }),
        Duration::from_secs(5),
    )
    .await;
    let old = nodes.get_mut(&leader).unwrap();
    wait_event(
        old,
        |e| matches!(e, NodeEvent::SteppedDown { .. }),
        Duration::from_secs(5),
    )
    .await;

    // The new leader serves clients.
    let resp = nodes[&target]
        .handle
        .apply_command(b"post-transfer".to_vec())
        .await
        .unwrap();
    assert_eq!(resp.status, ApplyStatus::Ok);
}

#[tokio::test]
async fn test_snapshot_compaction_and_lagging_follower_catch_up() {
    let (router, nodes) = spawn_cluster(&["a", "b", "c"], 5);

    let leader = apply_anywhere(&nodes, &[b'k', 0]).await;

    // One follower falls behind while the cluster keeps committing.
    let lagging = nodes.keys().find(|id| **id != leader).unwrap().clone();
    router.partition(&addr_of(&lagging));

    for i in 1..8u8 {
        let resp = nodes[&leader]
            .handle
            .apply_command(vec![b'k', i])
            .await
            .unwrap();
        assert_eq!(resp.status, ApplyStatus::Ok);
    }

    // Eight committed entries against a threshold of five: the leader must
    // have compacted.
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if let Some(snapshot) = nodes[&leader].snapshot_store.load().unwrap() {
            assert!(snapshot.last_index >= 5);
            break;
        }
        if Instant::now() >= deadline {
            panic!("leader never compacted its log");
        }
        sleep(Duration::from_millis(20)).await;
    }

    // The lagging follower returns and is fed the snapshot plus the tail.
    router.heal(&addr_of(&lagging));
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let installed = nodes[&lagging]
            .snapshot_store
            .load()
            .unwrap()
            .is_some_and(|s| s.last_index >= 5);
        if installed {
            break;
        }
        if Instant::now() >= deadline {
            panic!("lagging follower never received a snapshot");
        }
        sleep(Duration::from_millis(20)).await;
    }

    // Entries past the snapshot boundary flow through its own state machine
    // (the prefix lives in the snapshot).
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let applied = nodes[&lagging].fsm.applied();
        if applied.last() == Some(&vec![b'k', 7]) {
            break;
        }
        if Instant::now() >= deadline {
            panic!("lagging follower never caught up past the snapshot");
        }
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_joint_consensus_membership_change() {
    let (router, mut nodes) = spawn_cluster(&["a", "b", "c"], 10_000);

    apply_anywhere(&nodes, b"before").await;

    // Bring up two fresh nodes configured with the five-node map.
    let five = peer_map(&["a", "b", "c", "d", "e"]);
    for id in ["d", "e"] {
        let harness = spawn_node(id, five.clone(), false, 10_000, &router);
        nodes.insert(id.to_string(), harness);
    }

    // The joining nodes may disturb the current term; retry the change
    // until a settled leader drives it through both phases.
    let deadline = Instant::now() + Duration::from_secs(10);
    'change: loop {
        for harness in nodes.values() {
            if harness.handle.change_config(five.clone()).await.is_ok() {
                break 'change;
            }
        }
        if Instant::now() >= deadline {
            panic!("membership change never succeeded");
        }
        sleep(Duration::from_millis(100)).await;
    }

    // A post-change command reaches all five state machines.
    apply_anywhere(&nodes, b"after").await;
    for harness in nodes.values() {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !harness.fsm.applied().contains(&b"after".to_vec()) {
            if Instant::now() >= deadline {
                panic!("a member never applied the post-change command");
            }
            sleep(Duration::from_millis(20)).await;
        }
    }
}

#[tokio::test]
async fn test_membership_change_without_new_quorum_times_out() {
    let (_router, nodes) = spawn_cluster(&["a", "b", "c"], 10_000);

    let leader = apply_anywhere(&nodes, b"seed").await;

    // C_new is {leader, ghost1, ghost2}: its majority needs two nodes, and
    // the ghosts do not exist.
    let mut target = HashMap::new();
    target.insert(leader.clone(), addr_of(&leader));
    target.insert("ghost1".to_string(), addr_of("ghost1"));
    target.insert("ghost2".to_string(), addr_of("ghost2"));

    let result = nodes[&leader].handle.change_config(target).await;
    assert!(matches!(result, Err(RaftError::Timeout(_))));
}

#[tokio::test]
async fn test_learner_bootstrap_and_promotion() {
    let (router, mut nodes) = spawn_cluster(&["a", "b", "c"], 10_000);

    let leader = apply_anywhere(&nodes, &[0]).await;
    for i in 1..3u8 {
        nodes[&leader].handle.apply_command(vec![i]).await.unwrap();
    }

    // A fresh learner starts empty and is fed the log by the leader.
    let learner = spawn_node("d", peer_map(&["a", "b", "c"]), true, 10_000, &router);
    nodes.insert("d".to_string(), learner);
    nodes[&leader]
        .handle
        .add_node("d".to_string(), addr_of("d"))
        .await
        .unwrap();

    let leader_harness = nodes.get_mut(&leader).unwrap();
    let promoted = wait_event(
        leader_harness,
        |e| matches!(e, NodeEvent::LearnerPromoted { .. }),
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(
        promoted,
        NodeEvent::LearnerPromoted {
            node: "d".to_string()
        }
    );

    let learner_harness = nodes.get_mut("d").unwrap();
    wait_event(
        learner_harness,
        |e| matches!(e, NodeEvent::PromotedToFollower { .. }),
        Duration::from_secs(5),
    )
    .await;

    // The promoted node receives subsequent commits.
    nodes[&leader]
        .handle
        .apply_command(b"post-promote".to_vec())
        .await
        .unwrap();
    wait_applied(&nodes["d"], 4, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_failed_prevote_never_increments_term() {
    // A node whose two peers are unreachable keeps pre-voting and failing;
    // its persisted term must stay put.
    let router = Arc::new(Router::default());
    let harness = spawn_node("a", peer_map(&["a", "b", "c"]), false, 10_000, &router);

    // Several election timeouts worth of failed rounds.
    sleep(Duration::from_secs(2)).await;

    let term = harness
        .state_store
        .load()
        .unwrap()
        .map(|state| state.term)
        .unwrap_or(0);
    assert_eq!(term, 0, "pre-vote rounds must not burn through terms");
}
