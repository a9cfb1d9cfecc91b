// Leader-side replication.
//
// One long-lived worker per follower, woken over its trigger channel. The
// worker owns all outbound AppendEntries/InstallSnapshot traffic to its
// follower, so there is never more than one in-flight request per peer; the
// busy flag extends that guarantee to the leader's own heartbeat and client
// fan-outs. Workers never touch leader-owned maps: progress flows back over
// the progress channel and through the tracker's guarded accessors.

use crate::common::{LogIndex, NodeAddr, NodeId, Term};
use crate::error::Result;
use crate::message::{AppendEntriesRequest, EntryType, InstallSnapshotRequest};
use crate::peers::PeerRegistry;
use crate::state::{PersistentState, SnapshotStore, VolatileState};
use crate::transport::RaftTransport;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Role of a tracked peer. Learners replicate but do not vote or count
/// toward the quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackedRole {
    Follower,
    Learner,
}

#[derive(Debug)]
struct Progress {
    next_index: LogIndex,
    match_index: LogIndex,
    role: TrackedRole,
    busy: bool,
}

/// Per-follower replication progress plus the worker's wake-up channels.
pub(crate) struct FollowerTracker {
    pub id: NodeId,

    /// Address recorded at registration, used while the peer is not yet in
    /// the registry (learner bootstrap).
    pub addr: NodeAddr,

    progress: Mutex<Progress>,
    trigger_tx: mpsc::Sender<()>,
    stop_tx: mpsc::Sender<()>,
}

impl FollowerTracker {
    /// Create a tracker for a follower whose log is assumed to extend to
    /// `last_index` until proven otherwise.
    pub fn new(
        id: NodeId,
        addr: NodeAddr,
        last_index: LogIndex,
        role: TrackedRole,
    ) -> (Arc<Self>, mpsc::Receiver<()>, mpsc::Receiver<()>) {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let tracker = Arc::new(Self {
            id,
            addr,
            progress: Mutex::new(Progress {
                next_index: last_index + 1,
                match_index: 0,
                role,
                busy: false,
            }),
            trigger_tx,
            stop_tx,
        });
        (tracker, trigger_rx, stop_rx)
    }

    pub fn next_index(&self) -> LogIndex {
        self.progress.lock().next_index
    }

    pub fn match_index(&self) -> LogIndex {
        self.progress.lock().match_index
    }

    pub fn role(&self) -> TrackedRole {
        self.progress.lock().role
    }

    pub fn set_role(&self, role: TrackedRole) {
        self.progress.lock().role = role;
    }

    /// Claim the outbound slot for this follower. Returns false when a
    /// request is already in flight.
    pub fn try_begin(&self) -> bool {
        let mut progress = self.progress.lock();
        if progress.busy {
            return false;
        }
        progress.busy = true;
        true
    }

    /// Release the outbound slot.
    pub fn end(&self) {
        self.progress.lock().busy = false;
    }

    /// Record a successful match up to `index`.
    pub fn observe_matched(&self, index: LogIndex) {
        let mut progress = self.progress.lock();
        progress.match_index = progress.match_index.max(index);
        progress.next_index = progress.next_index.max(progress.match_index + 1);
    }

    /// Rewind `next_index` from a rejection, using the follower's conflict
    /// hint when present.
    pub fn apply_conflict_hint(
        &self,
        conflict_term: Option<Term>,
        conflict_start_index: Option<LogIndex>,
        local_term_at: impl Fn(LogIndex) -> Option<Term>,
    ) {
        let mut progress = self.progress.lock();
        let next = match (conflict_term, conflict_start_index) {
            (Some(term), Some(start)) => {
                if local_term_at(start) == Some(term) {
                    start + 1
                } else {
                    start
                }
            }
            _ => progress.next_index.saturating_sub(1),
        };
        progress.next_index = next.max(1);
    }

    /// Wake the worker; multiple triggers coalesce.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Ask the worker to exit.
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }
}

/// Progress reports from workers to the leader loop.
#[derive(Debug)]
pub(crate) enum ProgressEvent {
    /// The follower acknowledged entries up to `match_index`.
    Matched { id: NodeId, match_index: LogIndex },

    /// A reply carried a term above ours; the leader must step down.
    HigherTerm(Term),

    /// A learner caught up and accepted the promote marker.
    Promoted { id: NodeId },
}

enum ReplicateOutcome {
    /// The follower is caught up (or there was nothing to send).
    Done,

    /// A reply carried a higher term.
    SteppedDown(Term),
}

/// The long-lived replication task for one follower.
pub(crate) struct ReplicationWorker {
    pub leader_id: NodeId,
    pub tracker: Arc<FollowerTracker>,
    pub persistent: Arc<PersistentState>,
    pub volatile: Arc<VolatileState>,
    pub snapshots: Arc<SnapshotStore>,
    pub peers: Arc<PeerRegistry>,
    pub transport: Arc<dyn RaftTransport>,
    pub progress_tx: mpsc::Sender<ProgressEvent>,
}

impl ReplicationWorker {
    pub fn spawn(
        self,
        trigger_rx: mpsc::Receiver<()>,
        stop_rx: mpsc::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(trigger_rx, stop_rx))
    }

    async fn run(self, mut trigger_rx: mpsc::Receiver<()>, mut stop_rx: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                trigger = trigger_rx.recv() => {
                    if trigger.is_none() {
                        break;
                    }
                }
            }

            if !self.tracker.try_begin() {
                continue;
            }
            let outcome = self.replicate().await;
            self.tracker.end();

            match outcome {
                Ok(ReplicateOutcome::SteppedDown(term)) => {
                    let _ = self.progress_tx.send(ProgressEvent::HigherTerm(term)).await;
                    break;
                }
                Ok(ReplicateOutcome::Done) => {}
                Err(e) => {
                    // Transient: the next trigger or heartbeat retries.
                    tracing::debug!(
                        follower = %self.tracker.id,
                        error = %e,
                        "replication attempt failed"
                    );
                }
            }
        }
        tracing::debug!(follower = %self.tracker.id, "replication worker stopped");
    }

    fn resolve_addr(&self) -> NodeAddr {
        self.peers
            .addr_of(&self.tracker.id)
            .unwrap_or_else(|| self.tracker.addr.clone())
    }

    /// Bring the follower's log up to date: locate the agreement point with
    /// empty probes, then stream entries (or a snapshot) one request at a
    /// time.
    async fn replicate(&self) -> Result<ReplicateOutcome> {
        let term = self.persistent.current_term();
        let addr = self.resolve_addr();

        // Locate next_index.
        loop {
            let next = self.tracker.next_index().max(1);
            let prev = next - 1;
            if self.persistent.covered_by_snapshot(prev)
                && prev < self.persistent.snapshot_last_index()
            {
                // Agreement point is buried in the snapshot; ship it.
                match self.send_snapshot(&addr, term).await? {
                    ReplicateOutcome::SteppedDown(t) => {
                        return Ok(ReplicateOutcome::SteppedDown(t))
                    }
                    ReplicateOutcome::Done => continue,
                }
            }

            let prev_term = self.persistent.term_at(prev).unwrap_or(0);
            let probe = AppendEntriesRequest {
                term,
                leader_id: self.leader_id.clone(),
                prev_log_index: prev,
                prev_log_term: prev_term,
                leader_commit: self.volatile.commit_index(),
                entries: Vec::new(),
                entry_type: EntryType::Replicate,
            };
            let resp = self.transport.append_entries(&addr, probe).await?;
            if resp.term > term {
                return Ok(ReplicateOutcome::SteppedDown(resp.term));
            }
            if resp.success {
                self.tracker.observe_matched(prev);
                break;
            }
            self.tracker.apply_conflict_hint(
                resp.conflict_term,
                resp.conflict_start_index,
                |index| self.persistent.term_at(index),
            );
        }

        // Stream the missing suffix.
        loop {
            let next = self.tracker.next_index();
            if next > self.persistent.last_index() {
                break;
            }

            if self.persistent.covered_by_snapshot(next) {
                match self.send_snapshot(&addr, term).await? {
                    ReplicateOutcome::SteppedDown(t) => {
                        return Ok(ReplicateOutcome::SteppedDown(t))
                    }
                    ReplicateOutcome::Done => continue,
                }
            }

            let entry = match self.persistent.entry(next) {
                Ok(entry) => entry,
                // Compacted between the check and the read; retry the loop.
                Err(_) => continue,
            };
            let entry_type = entry.entry_type;
            let prev = next - 1;
            let prev_term = self.persistent.term_at(prev).unwrap_or(0);

            let req = AppendEntriesRequest {
                term,
                leader_id: self.leader_id.clone(),
                prev_log_index: prev,
                prev_log_term: prev_term,
                leader_commit: self.volatile.commit_index(),
                entries: vec![entry],
                entry_type: match entry_type {
                    EntryType::ChangeConf => EntryType::ChangeConf,
                    _ => EntryType::Replicate,
                },
            };
            let resp = self.transport.append_entries(&addr, req).await?;
            if resp.term > term {
                return Ok(ReplicateOutcome::SteppedDown(resp.term));
            }
            if resp.success {
                self.tracker.observe_matched(next);
                let _ = self
                    .progress_tx
                    .send(ProgressEvent::Matched {
                        id: self.tracker.id.clone(),
                        match_index: next,
                    })
                    .await;
            } else {
                self.tracker.apply_conflict_hint(
                    resp.conflict_term,
                    resp.conflict_start_index,
                    |index| self.persistent.term_at(index),
                );
            }
        }

        // A fully caught-up learner gets promoted to follower.
        if self.tracker.role() == TrackedRole::Learner
            && self.tracker.match_index() == self.persistent.last_index()
        {
            let (prev, prev_term) = self.persistent.last_position();
            let req = AppendEntriesRequest {
                term,
                leader_id: self.leader_id.clone(),
                prev_log_index: prev,
                prev_log_term: prev_term,
                leader_commit: self.volatile.commit_index(),
                entries: Vec::new(),
                entry_type: EntryType::Promote,
            };
            let resp = self.transport.append_entries(&addr, req).await?;
            if resp.term > term {
                return Ok(ReplicateOutcome::SteppedDown(resp.term));
            }
            if resp.success {
                let _ = self
                    .progress_tx
                    .send(ProgressEvent::Promoted {
                        id: self.tracker.id.clone(),
                    })
                    .await;
            }
        }

        Ok(ReplicateOutcome::Done)
    }

    /// Ship the latest snapshot to a follower whose next entry has been
    /// compacted away.
    async fn send_snapshot(&self, addr: &NodeAddr, term: Term) -> Result<ReplicateOutcome> {
        let Some(snapshot) = self.snapshots.snapshot() else {
            // Nothing to ship; the log state will resolve on the next pass.
            return Ok(ReplicateOutcome::Done);
        };

        tracing::info!(
            follower = %self.tracker.id,
            last_included = snapshot.last_index,
            "installing snapshot on lagging follower"
        );

        let req = InstallSnapshotRequest {
            term,
            leader_id: self.leader_id.clone(),
            last_included_index: snapshot.last_index,
            last_included_term: snapshot.last_term,
            offset: 0,
            data: snapshot.data,
            done: true,
        };
        let resp = self.transport.install_snapshot(addr, req).await?;
        if resp.term > term {
            return Ok(ReplicateOutcome::SteppedDown(resp.term));
        }

        self.tracker.observe_matched(snapshot.last_index);
        let _ = self
            .progress_tx
            .send(ProgressEvent::Matched {
                id: self.tracker.id.clone(),
                match_index: snapshot.last_index,
            })
            .await;
        Ok(ReplicateOutcome::Done)
    }
}
