// Wire messages and the inbound request queue.
//
// Every request a node serves arrives on one mpsc queue as an `Inbound`
// variant carrying a oneshot reply slot; the role loop consumes them one at
// a time. `RaftHandle` is the cloneable sending half handed to the outer
// process and to transport implementations.

use crate::common::{LogIndex, NodeAddr, NodeId, Term};
use crate::error::{RaftError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

/// Kind of an AppendEntries request and of the entries it carries.
///
/// `Heartbeat`, `TimeoutNow` and `Promote` are request markers: they never
/// appear in the stored log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// An opaque state machine command.
    Replicate,

    /// Empty keep-alive carrying the leader's commit index.
    Heartbeat,

    /// A serialized peer map replacing the cluster configuration.
    ChangeConf,

    /// Leader-to-follower order to start an election immediately.
    TimeoutNow,

    /// Leader-to-learner order to become a follower.
    Promote,
}

/// A single replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Logical index, dense and strictly increasing across snapshot + log.
    pub index: LogIndex,

    /// Term under which the entry was created by a leader.
    pub term: Term,

    /// Entry kind (`Replicate` or `ChangeConf` for stored entries).
    pub entry_type: EntryType,

    /// Opaque payload.
    pub data: Vec<u8>,
}

/// AppendEntries request (replication, heartbeats and control markers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: Term,

    /// Leader's node ID.
    pub leader_id: NodeId,

    /// Index of the log entry immediately preceding the new ones. Heartbeats
    /// carry the leader's last index here.
    pub prev_log_index: LogIndex,

    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,

    /// Leader's commit index.
    pub leader_commit: LogIndex,

    /// Entries to store (empty for heartbeats, probes and markers).
    pub entries: Vec<Entry>,

    /// Request kind.
    pub entry_type: EntryType,
}

/// AppendEntries response with conflict hints for fast backtracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Receiver's current term, for the leader to update itself.
    pub term: Term,

    /// True when the receiver's log matched at `prev_log_index`.
    pub success: bool,

    /// On mismatch: term of the conflicting local entry.
    pub conflict_term: Option<Term>,

    /// On mismatch: smallest local index still carrying `conflict_term`.
    pub conflict_start_index: Option<LogIndex>,
}

/// RequestVote request, used by both the pre-vote and the real round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Candidate's term. The pre-vote round carries the current term, not
    /// incremented.
    pub term: Term,

    /// Candidate requesting the vote.
    pub candidate_id: NodeId,

    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,

    /// Term of the candidate's last log entry.
    pub last_log_term: Term,

    /// Pre-vote flag (true for the pre-vote phase). A pre-vote answers
    /// willingness only and mutates no persistent state on either side.
    pub pre_vote: bool,
}

/// RequestVote response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Receiver's current term.
    pub term: Term,

    /// True when the vote was granted.
    pub vote_granted: bool,
}

/// InstallSnapshot request. Large snapshots arrive as consecutive chunks;
/// `done` marks the final one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,

    /// Index of the last entry covered by the snapshot.
    pub last_included_index: LogIndex,

    /// Term of that entry.
    pub last_included_term: Term,

    /// Byte offset of this chunk within the snapshot data.
    pub offset: u64,

    /// Chunk payload.
    pub data: Vec<u8>,

    /// True on the final chunk.
    pub done: bool,
}

/// InstallSnapshot response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
}

/// Outcome of a client command submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyStatus {
    /// The command was committed and applied.
    Ok,

    /// This node is not the leader; retry against `leader`.
    NotLeader,
}

/// Reply to a client command submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyResponse {
    pub status: ApplyStatus,

    /// Known leader, when `status` is `NotLeader`.
    pub leader: Option<NodeId>,
}

/// Notifications surfaced to the outer process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// This node won an election.
    LeaderElected { leader: NodeId, term: Term },

    /// This node lost leadership after observing a higher term.
    SteppedDown { term: Term },

    /// This learner was promoted to follower by the leader.
    PromotedToFollower { term: Term },

    /// A learner this leader was feeding caught up and became a follower.
    LearnerPromoted { node: NodeId },

    /// A membership change removed this node; the role loop has stopped and
    /// the process should exit.
    RemovedFromCluster,
}

/// A request queued for the role loop, with its reply slot.
#[derive(Debug)]
pub(crate) enum Inbound {
    AppendEntries {
        req: AppendEntriesRequest,
        tx: oneshot::Sender<Result<AppendEntriesResponse>>,
    },
    RequestVote {
        req: VoteRequest,
        tx: oneshot::Sender<Result<VoteResponse>>,
    },
    InstallSnapshot {
        req: InstallSnapshotRequest,
        tx: oneshot::Sender<Result<InstallSnapshotResponse>>,
    },
    ApplyCommand {
        data: Vec<u8>,
        tx: oneshot::Sender<Result<ApplyResponse>>,
    },
    ChangeConfig {
        peers: HashMap<NodeId, NodeAddr>,
        tx: oneshot::Sender<Result<()>>,
    },
    TransferLeadership {
        transferee: NodeId,
        tx: oneshot::Sender<Result<()>>,
    },
    AddNode {
        id: NodeId,
        addr: NodeAddr,
        tx: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable handle submitting requests to a node's inbound queue.
#[derive(Debug, Clone)]
pub struct RaftHandle {
    tx: mpsc::Sender<Inbound>,
}

impl RaftHandle {
    pub(crate) fn new(tx: mpsc::Sender<Inbound>) -> Self {
        Self { tx }
    }

    async fn submit<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<R>>) -> Inbound,
    ) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .await
            .map_err(|_| RaftError::ChannelClosed)?;
        rx.await.map_err(|_| RaftError::ChannelClosed)?
    }

    pub async fn append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.submit(|tx| Inbound::AppendEntries { req, tx }).await
    }

    pub async fn request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        self.submit(|tx| Inbound::RequestVote { req, tx }).await
    }

    pub async fn install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.submit(|tx| Inbound::InstallSnapshot { req, tx }).await
    }

    /// Submit a client command for replication.
    pub async fn apply_command(&self, data: Vec<u8>) -> Result<ApplyResponse> {
        self.submit(|tx| Inbound::ApplyCommand { data, tx }).await
    }

    /// Request a joint-consensus membership change to the given peer map.
    pub async fn change_config(&self, peers: HashMap<NodeId, NodeAddr>) -> Result<()> {
        self.submit(|tx| Inbound::ChangeConfig { peers, tx }).await
    }

    /// Ask the leader to hand leadership to `transferee`.
    pub async fn transfer_leadership(&self, transferee: NodeId) -> Result<()> {
        self.submit(|tx| Inbound::TransferLeadership { transferee, tx })
            .await
    }

    /// Register a fresh node as a catching-up learner.
    pub async fn add_node(&self, id: NodeId, addr: NodeAddr) -> Result<()> {
        self.submit(|tx| Inbound::AddNode { id, addr, tx }).await
    }
}
