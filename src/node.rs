// The role engine.
//
// One task owns the node: it runs the loop for the current role (Leader,
// Candidate, Follower, Learner), consumes the single inbound request queue,
// and is the only writer of role transitions. Replication workers and
// fan-out tasks report back over channels; they never mutate the role or
// the log themselves.

use crate::common::{LogIndex, NodeAddr, NodeId, Term};
use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::fsm::StateMachine;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, ApplyResponse, ApplyStatus, EntryType, Inbound,
    InstallSnapshotRequest, InstallSnapshotResponse, NodeEvent, RaftHandle, VoteRequest,
    VoteResponse,
};
use crate::peers::PeerRegistry;
use crate::replication::{
    FollowerTracker, ProgressEvent, ReplicationWorker, TrackedRole,
};
use crate::state::{PersistentState, SnapshotStore, VolatileState};
use crate::storage::{Snapshot, SnapshotPersister, StatePersister};
use crate::timer::ElectionTimer;
use crate::transport::RaftTransport;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

/// Depth of the inbound request queue.
const INBOUND_QUEUE: usize = 64;

/// Depth of the node event queue.
const EVENT_QUEUE: usize = 16;

/// Depth of the worker progress queue.
const PROGRESS_QUEUE: usize = 64;

/// Current role of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Learner,
    Stopped,
}

/// An InstallSnapshot transfer being assembled from chunks.
struct PendingSnapshot {
    last_included_index: LogIndex,
    last_included_term: Term,
    data: Vec<u8>,
}

/// A pending leadership transfer. At most one at a time.
struct TransferState {
    transferee: NodeId,
    deadline: Instant,
    tx: oneshot::Sender<Result<()>>,
}

/// Leader-only state, torn down when leadership is lost.
pub(crate) struct LeaderContext {
    pub(crate) trackers: HashMap<NodeId, Arc<FollowerTracker>>,
    pub(crate) progress_tx: mpsc::Sender<ProgressEvent>,
    progress_rx: mpsc::Receiver<ProgressEvent>,
    transfer: Option<TransferState>,
    pub(crate) config_changing: bool,
}

impl LeaderContext {
    fn new() -> Self {
        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_QUEUE);
        Self {
            trackers: HashMap::new(),
            progress_tx,
            progress_rx,
            transfer: None,
            config_changing: false,
        }
    }

    pub(crate) fn transfer_pending(&self) -> bool {
        self.transfer.is_some()
    }
}

/// Result of one parallel AppendEntries fan-out.
#[derive(Debug, Default)]
pub(crate) struct FanOut {
    /// Followers that replied success within the budget.
    pub acked: HashSet<NodeId>,

    /// Highest reply term above ours, if any.
    pub higher_term: Option<Term>,
}

/// A Raft consensus node.
///
/// Built from its configuration and the four external ports, then driven by
/// [`RaftNode::run`]; all interaction goes through the [`RaftHandle`].
pub struct RaftNode {
    pub(crate) config: RaftConfig,
    role: Role,
    pub(crate) persistent: Arc<PersistentState>,
    pub(crate) volatile: Arc<VolatileState>,
    pub(crate) snapshots: Arc<SnapshotStore>,
    pub(crate) peers: Arc<PeerRegistry>,
    pub(crate) transport: Arc<dyn RaftTransport>,
    fsm: Arc<dyn StateMachine>,
    inbound: mpsc::Receiver<Inbound>,
    pub(crate) event_tx: mpsc::Sender<NodeEvent>,
    election: ElectionTimer,
    pending_snapshot: Option<PendingSnapshot>,
}

impl RaftNode {
    /// Build a node from its config and ports, recovering persisted state.
    pub fn new(
        config: RaftConfig,
        transport: Arc<dyn RaftTransport>,
        fsm: Arc<dyn StateMachine>,
        state_store: Arc<dyn StatePersister>,
        snapshot_store: Arc<dyn SnapshotPersister>,
    ) -> Result<(Self, RaftHandle, mpsc::Receiver<NodeEvent>)> {
        config.validate()?;

        let snapshots = Arc::new(SnapshotStore::load(snapshot_store, config.max_log_length)?);
        let boundary = snapshots.boundary();
        let persistent = Arc::new(PersistentState::load(state_store, boundary)?);
        let volatile = Arc::new(VolatileState::new());
        if let Some((index, _)) = boundary {
            volatile.absorb_snapshot(index);
        }

        let peers = Arc::new(PeerRegistry::new(config.id.clone(), config.peers.clone()));
        let election = ElectionTimer::new(config.election_timeout_min, config.election_timeout_max);
        let role = if config.as_learner {
            Role::Learner
        } else {
            Role::Follower
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);

        let node = Self {
            config,
            role,
            persistent,
            volatile,
            snapshots,
            peers,
            transport,
            fsm,
            inbound: inbound_rx,
            event_tx,
            election,
            pending_snapshot: None,
        };
        Ok((node, RaftHandle::new(inbound_tx), event_rx))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn set_role(&mut self, role: Role) {
        self.role = role;
    }

    /// Drive the node until it is stopped (removed from the cluster or its
    /// handle dropped).
    pub async fn run(mut self) {
        tracing::info!(node_id = %self.config.id, role = ?self.role, "raft node started");
        loop {
            match self.role {
                Role::Follower => self.run_follower().await,
                Role::Candidate => self.run_candidate().await,
                Role::Leader => self.run_leader().await,
                Role::Learner => self.run_learner().await,
                Role::Stopped => break,
            }
        }
        tracing::info!(node_id = %self.config.id, "raft node stopped");
    }

    // ------------------------------------------------------------------
    // Follower / Learner loops
    // ------------------------------------------------------------------

    async fn run_follower(&mut self) {
        self.election.reset();
        while self.role == Role::Follower {
            let deadline = self.election.deadline();
            tokio::select! {
                msg = self.inbound.recv() => match msg {
                    Some(msg) => self.serve(msg).await,
                    None => self.role = Role::Stopped,
                },
                _ = time::sleep_until(deadline) => {
                    tracing::info!(
                        node_id = %self.config.id,
                        term = self.persistent.current_term(),
                        "election timeout, becoming candidate"
                    );
                    self.role = Role::Candidate;
                }
            }
        }
    }

    /// Learners serve requests but never run an election timer.
    async fn run_learner(&mut self) {
        while self.role == Role::Learner {
            match self.inbound.recv().await {
                Some(msg) => self.serve(msg).await,
                None => self.role = Role::Stopped,
            }
        }
    }

    /// Serve one request outside of leadership.
    async fn serve(&mut self, msg: Inbound) {
        match msg {
            Inbound::AppendEntries { req, tx } => {
                let _ = tx.send(self.handle_append_entries(req).await);
            }
            Inbound::RequestVote { req, tx } => {
                let _ = tx.send(self.handle_request_vote(req));
            }
            Inbound::InstallSnapshot { req, tx } => {
                let _ = tx.send(self.handle_install_snapshot(req));
            }
            Inbound::ApplyCommand { tx, .. } => {
                let _ = tx.send(Ok(ApplyResponse {
                    status: ApplyStatus::NotLeader,
                    leader: self.peers.leader_id(),
                }));
            }
            Inbound::ChangeConfig { tx, .. } => {
                let _ = tx.send(Err(self.not_leader()));
            }
            Inbound::TransferLeadership { tx, .. } => {
                let _ = tx.send(Err(self.not_leader()));
            }
            Inbound::AddNode { tx, .. } => {
                let _ = tx.send(Err(self.not_leader()));
            }
        }
    }

    fn not_leader(&self) -> RaftError {
        RaftError::NotLeader {
            leader_hint: self.peers.leader_id(),
        }
    }

    // ------------------------------------------------------------------
    // RPC handlers
    // ------------------------------------------------------------------

    /// AppendEntries: consistency-checked replication, heartbeats and the
    /// control markers (TimeoutNow, Promote).
    pub(crate) async fn handle_append_entries(
        &mut self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let mut current_term = self.persistent.current_term();
        if req.term < current_term {
            return Ok(AppendEntriesResponse {
                term: current_term,
                success: false,
                conflict_term: None,
                conflict_start_index: None,
            });
        }
        if req.term > current_term {
            self.persistent.observe_term(req.term)?;
            current_term = req.term;
            if !matches!(self.role, Role::Follower | Role::Learner) {
                self.role = Role::Follower;
            }
        }
        // A candidate that sees the current-term leader yields to it.
        if self.role == Role::Candidate {
            self.role = Role::Follower;
        }
        // Two leaders in one term would break election safety.
        if self.role == Role::Leader {
            tracing::error!(
                node_id = %self.config.id,
                other = %req.leader_id,
                term = current_term,
                "append entries from another leader in our own term"
            );
            return Err(RaftError::InvalidState(
                "two leaders in the same term".to_string(),
            ));
        }

        // Valid contact from the leader of our term.
        self.election.reset();
        self.peers.set_leader(Some(req.leader_id.clone()));

        // Consistency check with fast backtrack hints.
        let last_index = self.persistent.last_index();
        if req.prev_log_index > last_index {
            return Ok(AppendEntriesResponse {
                term: current_term,
                success: false,
                conflict_term: Some(self.persistent.last_term()),
                conflict_start_index: Some(last_index),
            });
        }
        if req.prev_log_index > 0 {
            if let Some(local_term) = self.persistent.term_at(req.prev_log_index) {
                if local_term != req.prev_log_term {
                    // Walk back to the first index still carrying the
                    // conflicting term so the leader can skip the whole run.
                    let mut start = req.prev_log_index;
                    while start > 1 && self.persistent.term_at(start - 1) == Some(local_term) {
                        start -= 1;
                    }
                    return Ok(AppendEntriesResponse {
                        term: current_term,
                        success: false,
                        conflict_term: Some(local_term),
                        conflict_start_index: Some(start),
                    });
                }
            }
            // No local term means the index sits inside the snapshot prefix:
            // only committed entries live there, so it matches by
            // construction.
        }

        match req.entry_type {
            EntryType::Replicate | EntryType::ChangeConf => {
                self.accept_entries(&req)?;
            }
            EntryType::Heartbeat => {
                if req.leader_commit > self.volatile.commit_index() {
                    self.volatile
                        .advance_commit(req.leader_commit.min(req.prev_log_index + 1));
                }
                self.apply_committed().await;
                self.maybe_compact().await;
            }
            EntryType::TimeoutNow => {
                if self.role == Role::Follower {
                    tracing::info!(
                        node_id = %self.config.id,
                        "received timeout-now, starting election"
                    );
                    self.role = Role::Candidate;
                }
            }
            EntryType::Promote => {
                if self.role == Role::Learner {
                    tracing::info!(
                        node_id = %self.config.id,
                        term = current_term,
                        "promoted to follower"
                    );
                    self.role = Role::Follower;
                    let _ = self
                        .event_tx
                        .try_send(NodeEvent::PromotedToFollower { term: current_term });
                }
            }
        }

        Ok(AppendEntriesResponse {
            term: current_term,
            success: true,
            conflict_term: None,
            conflict_start_index: None,
        })
    }

    /// Store the request's entries, truncating on conflict. Duplicates are
    /// detected by (index, term) and skipped, which makes redelivery
    /// idempotent.
    fn accept_entries(&mut self, req: &AppendEntriesRequest) -> Result<()> {
        for entry in &req.entries {
            match self.persistent.term_at(entry.index) {
                Some(term) if term == entry.term => {
                    // Already stored.
                    continue;
                }
                Some(_) => {
                    if entry.index <= self.volatile.commit_index() {
                        return Err(RaftError::InvalidState(format!(
                            "refusing to truncate committed entry {}",
                            entry.index
                        )));
                    }
                    self.persistent.truncate_after(entry.index)?;
                    self.persistent.append(entry.clone())?;
                }
                None => {
                    if self.persistent.covered_by_snapshot(entry.index) {
                        // The snapshot already holds it.
                        continue;
                    }
                    self.persistent.append(entry.clone())?;
                }
            }

            if entry.entry_type == EntryType::ChangeConf {
                self.adopt_config(&entry.data)?;
                if self.role == Role::Stopped {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Replace the peer registry from a ChangeConf payload; a configuration
    /// that drops this node shuts it down.
    pub(crate) fn adopt_config(&mut self, data: &[u8]) -> Result<()> {
        let peers = PeerRegistry::decode_peer_map(data)?;
        let still_member = peers.contains_key(self.peers.self_id());
        tracing::info!(
            node_id = %self.config.id,
            members = peers.len(),
            still_member,
            "adopting cluster configuration"
        );
        self.peers.replace(peers);
        if !still_member && self.role != Role::Learner {
            let _ = self.event_tx.try_send(NodeEvent::RemovedFromCluster);
            self.role = Role::Stopped;
        }
        Ok(())
    }

    /// RequestVote, serving both the pre-vote and the real round.
    pub(crate) fn handle_request_vote(&mut self, req: VoteRequest) -> Result<VoteResponse> {
        let mut current_term = self.persistent.current_term();

        // Learners have no say in elections.
        if self.role == Role::Learner {
            return Ok(VoteResponse {
                term: current_term,
                vote_granted: false,
            });
        }

        if req.term < current_term {
            return Ok(VoteResponse {
                term: current_term,
                vote_granted: false,
            });
        }

        let (last_index, last_term) = self.persistent.last_position();
        let up_to_date = req.last_log_term > last_term
            || (req.last_log_term == last_term && req.last_log_index >= last_index);

        if req.pre_vote {
            // Willingness only, nothing persisted: the real round runs at a
            // strictly higher term, where our vote slot is necessarily
            // unspent, so the current vote is not consulted either.
            return Ok(VoteResponse {
                term: current_term,
                vote_granted: up_to_date,
            });
        }

        if req.term > current_term {
            self.persistent.observe_term(req.term)?;
            current_term = req.term;
            if self.role != Role::Follower {
                self.role = Role::Follower;
            }
        }

        let free_to_vote = match self.persistent.voted_for() {
            None => true,
            Some(voted) => voted == req.candidate_id,
        };

        if up_to_date && free_to_vote {
            self.persistent.record_vote(&req.candidate_id)?;
            self.election.reset();
            tracing::debug!(
                node_id = %self.config.id,
                candidate = %req.candidate_id,
                term = current_term,
                "vote granted"
            );
            return Ok(VoteResponse {
                term: current_term,
                vote_granted: true,
            });
        }

        Ok(VoteResponse {
            term: current_term,
            vote_granted: false,
        })
    }

    /// InstallSnapshot: accumulate chunks and, on the final one, replace the
    /// compacted prefix.
    pub(crate) fn handle_install_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let mut current_term = self.persistent.current_term();
        if req.term < current_term {
            return Ok(InstallSnapshotResponse { term: current_term });
        }
        if req.term > current_term {
            self.persistent.observe_term(req.term)?;
            current_term = req.term;
            if !matches!(self.role, Role::Follower | Role::Learner) {
                self.role = Role::Follower;
            }
        }
        self.election.reset();
        self.peers.set_leader(Some(req.leader_id.clone()));

        // Chunk assembly. Offset zero starts a new transfer; a chunk that
        // does not extend the current one restarts from scratch.
        let matches_pending = self.pending_snapshot.as_ref().is_some_and(|p| {
            p.last_included_index == req.last_included_index
                && p.last_included_term == req.last_included_term
                && p.data.len() as u64 == req.offset
        });
        if req.offset == 0 {
            self.pending_snapshot = Some(PendingSnapshot {
                last_included_index: req.last_included_index,
                last_included_term: req.last_included_term,
                data: req.data,
            });
        } else if matches_pending {
            if let Some(pending) = self.pending_snapshot.as_mut() {
                pending.data.extend_from_slice(&req.data);
            }
        } else {
            tracing::warn!(
                node_id = %self.config.id,
                offset = req.offset,
                "out-of-order snapshot chunk, discarding transfer"
            );
            self.pending_snapshot = None;
            return Ok(InstallSnapshotResponse { term: current_term });
        }

        if !req.done {
            return Ok(InstallSnapshotResponse { term: current_term });
        }

        let pending = match self.pending_snapshot.take() {
            Some(pending) => pending,
            None => return Ok(InstallSnapshotResponse { term: current_term }),
        };
        let last_index = pending.last_included_index;
        let last_term = pending.last_included_term;
        let snapshot = Snapshot {
            last_index,
            last_term,
            data: pending.data,
        };

        if self.snapshots.install(snapshot)? {
            // Keep the log tail when it still matches the snapshot's last
            // entry; clear it otherwise.
            self.persistent.compact_to(last_index, last_term)?;
            self.volatile.absorb_snapshot(last_index);
            tracing::info!(
                node_id = %self.config.id,
                last_index,
                last_term,
                "snapshot installed"
            );
        }

        Ok(InstallSnapshotResponse { term: current_term })
    }

    // ------------------------------------------------------------------
    // Apply and compaction
    // ------------------------------------------------------------------

    /// Apply committed entries to the state machine, in order, each index at
    /// most once.
    pub(crate) async fn apply_committed(&mut self) {
        while let Some(index) = self.volatile.next_to_apply() {
            let entry = match self.persistent.entry(index) {
                Ok(entry) => entry,
                // Below the snapshot boundary: the snapshot already covers it.
                Err(_) => continue,
            };
            if entry.entry_type != EntryType::Replicate {
                continue;
            }
            if let Err(e) = self.fsm.apply(&entry.data).await {
                // The index stays consumed: apply is at-most-once.
                let e = RaftError::StateMachine(e.to_string());
                tracing::error!(
                    node_id = %self.config.id,
                    index,
                    error = %e,
                    "state machine apply failed"
                );
            }
        }
    }

    /// Compact the log into a snapshot once the committed suffix beyond the
    /// last snapshot reaches the configured threshold.
    pub(crate) async fn maybe_compact(&mut self) {
        let commit_index = self.volatile.commit_index();
        if !self.snapshots.should_compact(commit_index) {
            return;
        }
        let last_applied = self.volatile.last_applied();
        if last_applied <= self.snapshots.last_index() {
            return;
        }
        let Some(last_term) = self.persistent.term_at(last_applied) else {
            return;
        };

        let data = match self.fsm.serialize().await {
            Ok(data) => data,
            Err(e) => {
                let e = RaftError::StateMachine(e.to_string());
                tracing::error!(
                    node_id = %self.config.id,
                    error = %e,
                    "state machine serialize failed, skipping compaction"
                );
                return;
            }
        };

        let snapshot = Snapshot {
            last_index: last_applied,
            last_term,
            data,
        };
        match self.snapshots.install(snapshot) {
            Ok(true) => {
                if let Err(e) = self.persistent.compact_to(last_applied, last_term) {
                    tracing::error!(
                        node_id = %self.config.id,
                        error = %e,
                        "log truncation after snapshot failed"
                    );
                    return;
                }
                tracing::info!(
                    node_id = %self.config.id,
                    last_index = last_applied,
                    "log compacted into snapshot"
                );
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(
                    node_id = %self.config.id,
                    error = %e,
                    "snapshot persist failed"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Candidate loop
    // ------------------------------------------------------------------

    async fn run_candidate(&mut self) {
        while self.role == Role::Candidate {
            self.election.reset();
            let round_deadline = self.election.deadline();
            let current_term = self.persistent.current_term();

            // Pre-vote: ask at the current term, not incremented; neither
            // side persists anything, and a round that finds no majority
            // only re-arms the timer.
            match self.election_round(current_term, true, round_deadline).await {
                RoundOutcome::Majority => {}
                RoundOutcome::HigherTerm(term) => {
                    self.step_down(term);
                    return;
                }
                RoundOutcome::NoMajority => {
                    // Wait out the rest of this round's timeout before the
                    // next attempt; the term was never incremented.
                    self.idle_until(round_deadline).await;
                    continue;
                }
            }
            if self.role != Role::Candidate {
                return;
            }

            // Real round: durably enter the new term voting for self.
            let term = match self.persistent.begin_election_term(&self.config.id) {
                Ok(term) => term,
                Err(e) => {
                    tracing::error!(node_id = %self.config.id, error = %e, "cannot persist election term");
                    self.role = Role::Follower;
                    return;
                }
            };
            tracing::info!(node_id = %self.config.id, term, "starting election");

            match self.election_round(term, false, round_deadline).await {
                RoundOutcome::Majority => {
                    if self.role == Role::Candidate {
                        self.role = Role::Leader;
                    }
                }
                RoundOutcome::HigherTerm(term) => self.step_down(term),
                RoundOutcome::NoMajority => {
                    self.idle_until(round_deadline).await;
                }
            }
        }
    }

    /// Keep serving requests until the deadline (a candidate waiting out a
    /// failed round).
    async fn idle_until(&mut self, deadline: Instant) {
        while self.role == Role::Candidate {
            tokio::select! {
                msg = self.inbound.recv() => match msg {
                    Some(msg) => self.serve(msg).await,
                    None => self.role = Role::Stopped,
                },
                _ = time::sleep_until(deadline) => return,
            }
        }
    }

    /// Fan a RequestVote out to every other member and collect grants until
    /// majority, a higher term, or the round deadline. Inbound requests keep
    /// being served while the round runs.
    async fn election_round(
        &mut self,
        term: Term,
        pre_vote: bool,
        deadline: Instant,
    ) -> RoundOutcome {
        let (last_log_index, last_log_term) = self.persistent.last_position();
        let req = VoteRequest {
            term,
            candidate_id: self.config.id.clone(),
            last_log_index,
            last_log_term,
            pre_vote,
        };

        let majority = self.peers.majority();
        let mut granted = 1usize; // self
        if granted >= majority {
            return RoundOutcome::Majority;
        }

        let others = self.peers.others();
        let (result_tx, mut result_rx) = mpsc::channel(others.len().max(1));
        let (stop_tx, _) = watch::channel(false);

        for (id, addr) in others {
            let transport = self.transport.clone();
            let req = req.clone();
            let tx = result_tx.clone();
            let mut stop_rx = stop_tx.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    _ = stop_rx.changed() => {}
                    resp = transport.request_vote(&addr, req) => {
                        let _ = tx.send((id, resp)).await;
                    }
                }
            });
        }
        drop(result_tx);

        loop {
            tokio::select! {
                msg = self.inbound.recv() => match msg {
                    Some(msg) => {
                        self.serve(msg).await;
                        if self.role != Role::Candidate {
                            let _ = stop_tx.send(true);
                            return RoundOutcome::NoMajority;
                        }
                    }
                    None => {
                        self.role = Role::Stopped;
                        let _ = stop_tx.send(true);
                        return RoundOutcome::NoMajority;
                    }
                },
                result = result_rx.recv() => match result {
                    Some((_, Ok(resp))) => {
                        if resp.term > term {
                            let _ = stop_tx.send(true);
                            return RoundOutcome::HigherTerm(resp.term);
                        }
                        if resp.vote_granted {
                            granted += 1;
                            if granted >= majority {
                                let _ = stop_tx.send(true);
                                return RoundOutcome::Majority;
                            }
                        }
                    }
                    // Transport failure: indistinguishable from a slow peer.
                    Some((_, Err(_))) => {}
                    None => return RoundOutcome::NoMajority,
                },
                _ = time::sleep_until(deadline) => {
                    let _ = stop_tx.send(true);
                    return RoundOutcome::NoMajority;
                }
            }
        }
    }

    /// Adopt a higher term and fall back to follower.
    pub(crate) fn step_down(&mut self, term: Term) {
        if let Err(e) = self.persistent.observe_term(term) {
            tracing::error!(node_id = %self.config.id, error = %e, "cannot persist observed term");
        }
        if matches!(self.role, Role::Leader | Role::Candidate) {
            self.role = Role::Follower;
        }
        self.election.reset();
    }

    // ------------------------------------------------------------------
    // Leader loop
    // ------------------------------------------------------------------

    async fn run_leader(&mut self) {
        let term = self.persistent.current_term();
        tracing::info!(node_id = %self.config.id, term, "became leader");
        self.peers.set_leader(Some(self.config.id.clone()));
        let _ = self.event_tx.try_send(NodeEvent::LeaderElected {
            leader: self.config.id.clone(),
            term,
        });

        let mut ctx = LeaderContext::new();
        for (id, addr) in self.peers.others() {
            self.register_tracker(&mut ctx, id, addr, TrackedRole::Follower);
        }

        // Establishing heartbeat: assert authority before serving anything.
        self.broadcast_heartbeat(&mut ctx).await;

        let mut heartbeat = time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.reset();

        while self.role == Role::Leader {
            let transfer_active = ctx.transfer.is_some();
            let transfer_deadline = ctx
                .transfer
                .as_ref()
                .map(|t| t.deadline)
                .unwrap_or_else(Instant::now);

            tokio::select! {
                msg = self.inbound.recv() => match msg {
                    Some(msg) => self.leader_serve(&mut ctx, msg).await,
                    None => self.role = Role::Stopped,
                },
                _ = heartbeat.tick() => {
                    self.broadcast_heartbeat(&mut ctx).await;
                    self.check_transfer(&mut ctx).await;
                }
                event = ctx.progress_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_progress(&mut ctx, event).await;
                    }
                }
                _ = time::sleep_until(transfer_deadline), if transfer_active => {
                    if let Some(transfer) = ctx.transfer.take() {
                        tracing::warn!(
                            node_id = %self.config.id,
                            transferee = %transfer.transferee,
                            "leadership transfer deadline elapsed"
                        );
                        let _ = transfer.tx.send(Err(RaftError::Timeout(
                            "leadership transfer deadline elapsed".to_string(),
                        )));
                    }
                }
            }
        }

        // Leadership lost or node stopping: tear the workers down.
        for tracker in ctx.trackers.values() {
            tracker.stop();
        }
        if let Some(transfer) = ctx.transfer.take() {
            let _ = transfer.tx.send(Err(RaftError::NotLeader {
                leader_hint: self.peers.leader_id(),
            }));
        }
        if self.role == Role::Follower {
            let _ = self.event_tx.try_send(NodeEvent::SteppedDown {
                term: self.persistent.current_term(),
            });
            tracing::info!(
                node_id = %self.config.id,
                term = self.persistent.current_term(),
                "stepped down"
            );
        }
    }

    /// Serve one request as the leader.
    async fn leader_serve(&mut self, ctx: &mut LeaderContext, msg: Inbound) {
        match msg {
            Inbound::AppendEntries { req, tx } => {
                let _ = tx.send(self.handle_append_entries(req).await);
            }
            Inbound::RequestVote { req, tx } => {
                let _ = tx.send(self.handle_request_vote(req));
            }
            Inbound::InstallSnapshot { req, tx } => {
                let _ = tx.send(self.handle_install_snapshot(req));
            }
            Inbound::ApplyCommand { data, tx } => {
                let _ = tx.send(self.leader_apply(ctx, data).await);
            }
            Inbound::ChangeConfig { peers, tx } => {
                let _ = tx.send(self.leader_change_config(ctx, peers).await);
            }
            Inbound::TransferLeadership { transferee, tx } => {
                self.leader_transfer(ctx, transferee, tx).await;
            }
            Inbound::AddNode { id, addr, tx } => {
                let _ = tx.send(self.leader_add_node(ctx, id, addr));
            }
        }
    }

    /// Register a follower (or learner) in the replication tracker and
    /// spawn its worker.
    pub(crate) fn register_tracker(
        &self,
        ctx: &mut LeaderContext,
        id: NodeId,
        addr: NodeAddr,
        role: TrackedRole,
    ) {
        let (tracker, trigger_rx, stop_rx) =
            FollowerTracker::new(id.clone(), addr, self.persistent.last_index(), role);
        ReplicationWorker {
            leader_id: self.config.id.clone(),
            tracker: tracker.clone(),
            persistent: self.persistent.clone(),
            volatile: self.volatile.clone(),
            snapshots: self.snapshots.clone(),
            peers: self.peers.clone(),
            transport: self.transport.clone(),
            progress_tx: ctx.progress_tx.clone(),
        }
        .spawn(trigger_rx, stop_rx);
        ctx.trackers.insert(id, tracker);
    }

    /// Send one AppendEntries to every non-busy tracked peer in parallel and
    /// collect replies for up to `budget`. Unfinished branches are abandoned
    /// through the stop channel; their busy slots are released by the tasks
    /// themselves.
    pub(crate) async fn fan_out_append(
        &self,
        ctx: &LeaderContext,
        req: AppendEntriesRequest,
        budget: Duration,
    ) -> FanOut {
        let mut result = FanOut::default();
        let matched_index = req
            .entries
            .last()
            .map(|entry| entry.index)
            .unwrap_or(req.prev_log_index);

        let (result_tx, mut result_rx) = mpsc::channel(ctx.trackers.len().max(1));
        let (stop_tx, _) = watch::channel(false);
        let mut in_flight = 0usize;

        for tracker in ctx.trackers.values() {
            if !tracker.try_begin() {
                continue;
            }
            let addr = self
                .peers
                .addr_of(&tracker.id)
                .unwrap_or_else(|| tracker.addr.clone());
            let transport = self.transport.clone();
            let req = req.clone();
            let tx = result_tx.clone();
            let tracker = tracker.clone();
            let mut stop_rx = stop_tx.subscribe();
            in_flight += 1;
            tokio::spawn(async move {
                tokio::select! {
                    _ = stop_rx.changed() => {}
                    resp = transport.append_entries(&addr, req) => {
                        let _ = tx.send((tracker.id.clone(), resp)).await;
                    }
                }
                tracker.end();
            });
        }
        drop(result_tx);
        if in_flight == 0 {
            return result;
        }

        let deadline = Instant::now() + budget;
        let majority = self.peers.majority();
        loop {
            tokio::select! {
                reply = result_rx.recv() => match reply {
                    Some((id, Ok(resp))) => {
                        if resp.term > self.persistent.current_term() {
                            result.higher_term = Some(resp.term);
                            break;
                        }
                        if let Some(tracker) = ctx.trackers.get(&id) {
                            if resp.success {
                                tracker.observe_matched(matched_index);
                            } else {
                                tracker.apply_conflict_hint(
                                    resp.conflict_term,
                                    resp.conflict_start_index,
                                    |index| self.persistent.term_at(index),
                                );
                                // The worker walks it back the rest of the way.
                                tracker.trigger();
                            }
                        }
                        if resp.success {
                            result.acked.insert(id);
                            // +1 for self.
                            if result.acked.len() + 1 >= majority {
                                break;
                            }
                        }
                    }
                    Some((_, Err(_))) => {}
                    None => break,
                },
                _ = time::sleep_until(deadline) => break,
            }
        }
        let _ = stop_tx.send(true);
        result
    }

    /// Heartbeat tick: empty AppendEntries to everyone, step down on a
    /// higher term, nudge stragglers.
    pub(crate) async fn broadcast_heartbeat(&mut self, ctx: &mut LeaderContext) {
        let term = self.persistent.current_term();
        let (prev_log_index, prev_log_term) = self.persistent.last_position();
        let req = AppendEntriesRequest {
            term,
            leader_id: self.config.id.clone(),
            prev_log_index,
            prev_log_term,
            leader_commit: self.volatile.commit_index(),
            entries: Vec::new(),
            entry_type: EntryType::Heartbeat,
        };

        let outcome = self
            .fan_out_append(ctx, req, self.config.heartbeat_interval)
            .await;
        if let Some(higher) = outcome.higher_term {
            self.step_down(higher);
            return;
        }

        // Anyone who did not ack up to our last index needs its worker.
        for tracker in ctx.trackers.values() {
            if tracker.match_index() < prev_log_index {
                tracker.trigger();
            }
        }
    }

    /// The client command path: append locally, replicate, commit, apply.
    async fn leader_apply(&mut self, ctx: &mut LeaderContext, data: Vec<u8>) -> Result<ApplyResponse> {
        if ctx.transfer.is_some() {
            return Err(RaftError::TransferInProgress);
        }

        let entry = self.persistent.append_new(EntryType::Replicate, data)?;
        let term = self.persistent.current_term();
        let req = AppendEntriesRequest {
            term,
            leader_id: self.config.id.clone(),
            prev_log_index: entry.index - 1,
            prev_log_term: self.persistent.term_at(entry.index - 1).unwrap_or(0),
            leader_commit: self.volatile.commit_index(),
            entries: vec![entry.clone()],
            entry_type: EntryType::Replicate,
        };

        let outcome = self
            .fan_out_append(ctx, req, self.config.heartbeat_interval)
            .await;
        if let Some(higher) = outcome.higher_term {
            self.step_down(higher);
            return Err(self.not_leader());
        }

        // Stragglers (busy or rejected) catch up through their workers.
        for tracker in ctx.trackers.values() {
            if tracker.match_index() < entry.index {
                tracker.trigger();
            }
        }

        self.advance_leader_commit(ctx).await;

        if self.volatile.commit_index() >= entry.index {
            Ok(ApplyResponse {
                status: ApplyStatus::Ok,
                leader: Some(self.config.id.clone()),
            })
        } else {
            // No promise either way: the entry may still commit later.
            Err(RaftError::Timeout(
                "command not committed within the replication window".to_string(),
            ))
        }
    }

    /// Advance the commit index from current match indexes and apply.
    pub(crate) async fn advance_leader_commit(&mut self, ctx: &LeaderContext) {
        if let Some(index) = self.compute_commit(ctx) {
            if self.volatile.advance_commit(index) {
                tracing::debug!(
                    node_id = %self.config.id,
                    commit_index = index,
                    "commit index advanced"
                );
                self.apply_committed().await;
                self.maybe_compact().await;
            }
        }
    }

    /// Largest N beyond the commit index that a majority holds and that
    /// belongs to the current term. Committing N also commits every earlier
    /// uncommitted entry.
    pub(crate) fn compute_commit(&self, ctx: &LeaderContext) -> Option<LogIndex> {
        let term = self.persistent.current_term();
        let commit_index = self.volatile.commit_index();
        let majority = self.peers.majority();

        let mut n = self.persistent.last_index();
        while n > commit_index {
            match self.persistent.term_at(n) {
                Some(entry_term) if entry_term == term => {
                    let mut count = 1; // self holds everything up to last_index
                    for tracker in ctx.trackers.values() {
                        if tracker.role() == TrackedRole::Follower
                            && self.peers.contains(&tracker.id)
                            && tracker.match_index() >= n
                        {
                            count += 1;
                        }
                    }
                    if count >= majority {
                        return Some(n);
                    }
                }
                // Terms only decrease going backward; a prior-term entry
                // means nothing newer in our term can be below it.
                Some(entry_term) if entry_term < term => return None,
                _ => {}
            }
            n -= 1;
        }
        None
    }

    /// React to a worker progress report.
    async fn handle_progress(&mut self, ctx: &mut LeaderContext, event: ProgressEvent) {
        match event {
            ProgressEvent::HigherTerm(term) => {
                self.step_down(term);
            }
            ProgressEvent::Matched { id, match_index } => {
                tracing::trace!(
                    node_id = %self.config.id,
                    follower = %id,
                    match_index,
                    "replication progress"
                );
                self.advance_leader_commit(ctx).await;
                self.check_transfer(ctx).await;
            }
            ProgressEvent::Promoted { id } => {
                if let Some(tracker) = ctx.trackers.get(&id) {
                    tracker.set_role(TrackedRole::Follower);
                    self.peers.insert(id.clone(), tracker.addr.clone());
                }
                tracing::info!(node_id = %self.config.id, learner = %id, "learner caught up");
                let _ = self.event_tx.try_send(NodeEvent::LearnerPromoted { node: id });
            }
        }
    }

    /// Accept a leadership transfer request.
    async fn leader_transfer(
        &mut self,
        ctx: &mut LeaderContext,
        transferee: NodeId,
        tx: oneshot::Sender<Result<()>>,
    ) {
        if ctx.transfer.is_some() {
            let _ = tx.send(Err(RaftError::TransferInProgress));
            return;
        }
        if transferee == self.config.id {
            let _ = tx.send(Ok(()));
            return;
        }
        match ctx.trackers.get(&transferee) {
            None => {
                let _ = tx.send(Err(RaftError::InvalidState(format!(
                    "unknown transfer target {transferee}"
                ))));
                return;
            }
            Some(tracker) if tracker.role() == TrackedRole::Learner => {
                let _ = tx.send(Err(RaftError::InvalidState(format!(
                    "transfer target {transferee} is a learner"
                ))));
                return;
            }
            Some(_) => {}
        }

        tracing::info!(
            node_id = %self.config.id,
            transferee = %transferee,
            "starting leadership transfer"
        );
        ctx.transfer = Some(TransferState {
            transferee: transferee.clone(),
            deadline: Instant::now() + self.config.election_timeout_min,
            tx,
        });
        if let Some(tracker) = ctx.trackers.get(&transferee) {
            tracker.trigger();
        }
        self.check_transfer(ctx).await;
    }

    /// If the transfer target is fully caught up and idle, order it to
    /// start an election.
    pub(crate) async fn check_transfer(&mut self, ctx: &mut LeaderContext) {
        let Some(transferee) = ctx.transfer.as_ref().map(|t| t.transferee.clone()) else {
            return;
        };
        let Some(tracker) = ctx.trackers.get(&transferee).cloned() else {
            if let Some(transfer) = ctx.transfer.take() {
                let _ = transfer.tx.send(Err(RaftError::InvalidState(
                    "transfer target left the cluster".to_string(),
                )));
            }
            return;
        };

        let last_index = self.persistent.last_index();
        if tracker.match_index() != last_index {
            tracker.trigger();
            return;
        }
        if !tracker.try_begin() {
            return;
        }

        let term = self.persistent.current_term();
        let addr = self
            .peers
            .addr_of(&transferee)
            .unwrap_or_else(|| tracker.addr.clone());
        let (prev_log_index, prev_log_term) = self.persistent.last_position();
        let req = AppendEntriesRequest {
            term,
            leader_id: self.config.id.clone(),
            prev_log_index,
            prev_log_term,
            leader_commit: self.volatile.commit_index(),
            entries: Vec::new(),
            entry_type: EntryType::TimeoutNow,
        };
        let resp = self.transport.append_entries(&addr, req).await;
        tracker.end();

        match resp {
            Ok(resp) if resp.term > term => {
                // The target (or someone else) is already past us.
                self.step_down(resp.term);
            }
            Ok(resp) if resp.success => {
                tracing::info!(
                    node_id = %self.config.id,
                    transferee = %transferee,
                    "transfer target ordered to elect itself"
                );
                if let Some(transfer) = ctx.transfer.take() {
                    let _ = transfer.tx.send(Ok(()));
                }
            }
            // Transient; the next progress event or tick retries.
            _ => {}
        }
    }

    /// Register a fresh node as a learner and start catching it up.
    fn leader_add_node(
        &mut self,
        ctx: &mut LeaderContext,
        id: NodeId,
        addr: NodeAddr,
    ) -> Result<()> {
        if ctx.trackers.contains_key(&id) || self.peers.contains(&id) {
            return Err(RaftError::InvalidState(format!(
                "node {id} is already part of the cluster"
            )));
        }
        tracing::info!(node_id = %self.config.id, new_node = %id, "adding learner");
        self.register_tracker(ctx, id.clone(), addr, TrackedRole::Learner);
        if let Some(tracker) = ctx.trackers.get(&id) {
            tracker.trigger();
        }
        Ok(())
    }
}

enum RoundOutcome {
    Majority,
    NoMajority,
    HigherTerm(Term),
}
