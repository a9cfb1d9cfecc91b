// Node state aggregates.
//
// Three aggregates, one mutex each: the persistent state (term, vote, log),
// the volatile indexes (commit, last applied) and the snapshot store. Locks
// are held for short critical sections only and never across I/O other than
// the persister write that makes a mutation durable; if that write fails the
// mutation is rolled back before the lock is released, so no unpersisted
// state is ever observable.

use crate::common::{LogIndex, NodeId, Term};
use crate::error::{RaftError, Result};
use crate::log::RaftLog;
use crate::message::{Entry, EntryType};
use crate::storage::{HardState, Snapshot, SnapshotPersister, StatePersister};
use parking_lot::Mutex;
use std::sync::Arc;

struct PersistentInner {
    term: Term,
    voted_for: Option<NodeId>,
    log: RaftLog,
}

/// Term, vote and log behind one mutex, durably backed by a
/// [`StatePersister`].
pub(crate) struct PersistentState {
    inner: Mutex<PersistentInner>,
    persister: Arc<dyn StatePersister>,
}

impl PersistentState {
    /// Load the hard state at boot. The snapshot boundary (recovered by the
    /// snapshot store) anchors the virtual indexing of the tail.
    pub fn load(
        persister: Arc<dyn StatePersister>,
        snapshot_boundary: Option<(LogIndex, Term)>,
    ) -> Result<Self> {
        let record = persister.load()?.unwrap_or_default();
        let (snap_index, snap_term) = snapshot_boundary.unwrap_or((0, 0));
        let inner = PersistentInner {
            term: record.term,
            voted_for: record.voted_for,
            log: RaftLog::restore(record.entries, snap_index, snap_term),
        };
        Ok(Self {
            inner: Mutex::new(inner),
            persister,
        })
    }

    fn persist(&self, inner: &PersistentInner) -> Result<()> {
        let record = HardState {
            term: inner.term,
            voted_for: inner.voted_for.clone(),
            entries: inner.log.tail(),
        };
        self.persister.save(&record)
    }

    pub fn current_term(&self) -> Term {
        self.inner.lock().term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.inner.lock().voted_for.clone()
    }

    /// Adopt a higher term observed in a request or response, clearing the
    /// vote. Returns true when the term advanced.
    pub fn observe_term(&self, term: Term) -> Result<bool> {
        let mut inner = self.inner.lock();
        if term <= inner.term {
            return Ok(false);
        }
        let prev = (inner.term, inner.voted_for.take());
        inner.term = term;
        if let Err(e) = self.persist(&inner) {
            (inner.term, inner.voted_for) = prev;
            return Err(e);
        }
        Ok(true)
    }

    /// Enter the next term as a candidate, voting for self.
    pub fn begin_election_term(&self, self_id: &NodeId) -> Result<Term> {
        let mut inner = self.inner.lock();
        let prev = (inner.term, inner.voted_for.clone());
        inner.term += 1;
        inner.voted_for = Some(self_id.clone());
        if let Err(e) = self.persist(&inner) {
            (inner.term, inner.voted_for) = prev;
            return Err(e);
        }
        Ok(inner.term)
    }

    /// Record a granted vote in the current term.
    pub fn record_vote(&self, candidate: &NodeId) -> Result<()> {
        let mut inner = self.inner.lock();
        let prev = inner.voted_for.replace(candidate.clone());
        if let Err(e) = self.persist(&inner) {
            inner.voted_for = prev;
            return Err(e);
        }
        Ok(())
    }

    pub fn last_index(&self) -> LogIndex {
        self.inner.lock().log.last_index()
    }

    pub fn last_term(&self) -> Term {
        self.inner.lock().log.last_term()
    }

    /// Last index and term as one consistent pair.
    pub fn last_position(&self) -> (LogIndex, Term) {
        let inner = self.inner.lock();
        (inner.log.last_index(), inner.log.last_term())
    }

    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.inner.lock().log.term_at(index)
    }

    pub fn snapshot_last_index(&self) -> LogIndex {
        self.inner.lock().log.snapshot_last_index()
    }

    pub fn covered_by_snapshot(&self, index: LogIndex) -> bool {
        self.inner.lock().log.covered_by_snapshot(index)
    }

    pub fn entry(&self, index: LogIndex) -> Result<Entry> {
        self.inner.lock().log.entry(index).cloned()
    }

    /// Append a fully formed entry, durably.
    pub fn append(&self, entry: Entry) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.log.append(entry)?;
        if let Err(e) = self.persist(&inner) {
            let last_index = inner.log.last_index();
            inner.log.truncate_after(last_index).ok();
            return Err(e);
        }
        Ok(())
    }

    /// Form and append a new entry at `last_index() + 1` under the current
    /// term (the leader's client path).
    pub fn append_new(&self, entry_type: EntryType, data: Vec<u8>) -> Result<Entry> {
        let mut inner = self.inner.lock();
        let entry = Entry {
            index: inner.log.last_index() + 1,
            term: inner.term,
            entry_type,
            data,
        };
        inner.log.append(entry.clone())?;
        if let Err(e) = self.persist(&inner) {
            inner.log.truncate_after(entry.index).ok();
            return Err(e);
        }
        Ok(entry)
    }

    /// Drop entries with index >= `index` (conflict resolution), durably.
    pub fn truncate_after(&self, index: LogIndex) -> Result<()> {
        let mut inner = self.inner.lock();
        let removed = inner.log.truncate_after(index)?;
        if let Err(e) = self.persist(&inner) {
            inner.log.restore_tail_suffix(removed);
            return Err(e);
        }
        Ok(())
    }

    /// Advance the snapshot boundary, dropping covered entries, durably.
    pub fn compact_to(&self, last_index: LogIndex, last_term: Term) -> Result<()> {
        let mut inner = self.inner.lock();
        let rollback = inner.log.clone();
        inner.log.advance_snapshot(last_index, last_term)?;
        if let Err(e) = self.persist(&inner) {
            inner.log = rollback;
            return Err(e);
        }
        Ok(())
    }
}

/// Commit and apply indexes. Commit never moves backward; apply indexes are
/// handed out exactly once each, in order.
#[derive(Default)]
pub(crate) struct VolatileState {
    inner: Mutex<VolatileInner>,
}

#[derive(Default)]
struct VolatileInner {
    commit_index: LogIndex,
    last_applied: LogIndex,
}

impl VolatileState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.inner.lock().commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.inner.lock().last_applied
    }

    /// Raise the commit index. Regressions are ignored; returns true when
    /// the index advanced.
    pub fn advance_commit(&self, index: LogIndex) -> bool {
        let mut inner = self.inner.lock();
        if index <= inner.commit_index {
            return false;
        }
        inner.commit_index = index;
        true
    }

    /// Claim the next index to apply, if any. Each index is handed out at
    /// most once.
    pub fn next_to_apply(&self) -> Option<LogIndex> {
        let mut inner = self.inner.lock();
        if inner.last_applied < inner.commit_index {
            inner.last_applied += 1;
            Some(inner.last_applied)
        } else {
            None
        }
    }

    /// Fast-forward both indexes to a snapshot boundary (monotonic).
    pub fn absorb_snapshot(&self, last_index: LogIndex) {
        let mut inner = self.inner.lock();
        inner.commit_index = inner.commit_index.max(last_index);
        inner.last_applied = inner.last_applied.max(last_index);
    }
}

/// Latest snapshot, durably backed; replaced wholesale, never mutated.
pub(crate) struct SnapshotStore {
    inner: Mutex<Option<Snapshot>>,
    persister: Arc<dyn SnapshotPersister>,
    max_log_length: u64,
}

impl SnapshotStore {
    pub fn load(persister: Arc<dyn SnapshotPersister>, max_log_length: u64) -> Result<Self> {
        let snapshot = persister.load()?;
        Ok(Self {
            inner: Mutex::new(snapshot),
            persister,
            max_log_length,
        })
    }

    /// Boundary of the latest snapshot, if any.
    pub fn boundary(&self) -> Option<(LogIndex, Term)> {
        self.inner
            .lock()
            .as_ref()
            .map(|s| (s.last_index, s.last_term))
    }

    pub fn last_index(&self) -> LogIndex {
        self.inner.lock().as_ref().map(|s| s.last_index).unwrap_or(0)
    }

    pub fn snapshot(&self) -> Option<Snapshot> {
        self.inner.lock().clone()
    }

    /// Persist and publish a new snapshot. Older snapshots are ignored;
    /// returns true when the snapshot was installed.
    pub fn install(&self, snapshot: Snapshot) -> Result<bool> {
        let mut inner = self.inner.lock();
        if let Some(current) = inner.as_ref() {
            if snapshot.last_index <= current.last_index {
                return Ok(false);
            }
        }
        self.persister.save(&snapshot)?;
        *inner = Some(snapshot);
        Ok(true)
    }

    /// Whether the committed log beyond the snapshot has reached the
    /// compaction threshold.
    pub fn should_compact(&self, commit_index: LogIndex) -> bool {
        commit_index.saturating_sub(self.last_index()) >= self.max_log_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemorySnapshotStore, MemoryStateStore};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Persister that can be switched to fail, for checking that failed
    /// writes leave no visible mutation behind.
    #[derive(Default)]
    struct FlakyStateStore {
        fail: AtomicBool,
        saved: Mutex<Option<HardState>>,
    }

    impl StatePersister for FlakyStateStore {
        fn save(&self, state: &HardState) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RaftError::Storage("disk full".to_string()));
            }
            *self.saved.lock() = Some(state.clone());
            Ok(())
        }

        fn load(&self) -> Result<Option<HardState>> {
            Ok(self.saved.lock().clone())
        }
    }

    fn entry(index: LogIndex, term: Term) -> Entry {
        Entry {
            index,
            term,
            entry_type: EntryType::Replicate,
            data: vec![],
        }
    }

    #[test]
    fn test_term_observation_persists_and_clears_vote() {
        let state = PersistentState::load(Arc::new(MemoryStateStore::new()), None).unwrap();
        state.record_vote(&"node2".to_string()).unwrap();

        assert!(state.observe_term(5).unwrap());
        assert_eq!(state.current_term(), 5);
        assert_eq!(state.voted_for(), None);

        // Equal or lower terms change nothing.
        assert!(!state.observe_term(5).unwrap());
        assert!(!state.observe_term(3).unwrap());
    }

    #[test]
    fn test_failed_persist_rolls_back() {
        let flaky = Arc::new(FlakyStateStore::default());
        let state = PersistentState::load(flaky.clone(), None).unwrap();
        state.append(entry(1, 1)).unwrap();

        flaky.fail.store(true, Ordering::SeqCst);

        assert!(state.append(entry(2, 1)).is_err());
        assert_eq!(state.last_index(), 1);

        assert!(state.observe_term(9).is_err());
        assert_eq!(state.current_term(), 0);

        flaky.fail.store(false, Ordering::SeqCst);
        assert!(state.append(entry(2, 1)).is_ok());
        assert_eq!(state.last_index(), 2);
    }

    #[test]
    fn test_reload_round_trip() {
        let persister = Arc::new(MemoryStateStore::new());
        let state = PersistentState::load(persister.clone(), None).unwrap();
        state.observe_term(2).unwrap();
        state.append(entry(1, 2)).unwrap();
        state.append(entry(2, 2)).unwrap();
        drop(state);

        // Rebuild from the same backing store.
        let reloaded = PersistentState::load(persister, None).unwrap();
        assert_eq!(reloaded.current_term(), 2);
        assert_eq!(reloaded.last_index(), 2);
        assert_eq!(reloaded.last_term(), 2);
    }

    #[test]
    fn test_volatile_monotonic_and_at_most_once() {
        let vol = VolatileState::new();
        assert!(vol.advance_commit(3));
        assert!(!vol.advance_commit(2));
        assert_eq!(vol.commit_index(), 3);

        assert_eq!(vol.next_to_apply(), Some(1));
        assert_eq!(vol.next_to_apply(), Some(2));
        assert_eq!(vol.next_to_apply(), Some(3));
        assert_eq!(vol.next_to_apply(), None);
    }

    #[test]
    fn test_snapshot_store_rejects_stale() {
        let store = SnapshotStore::load(Arc::new(MemorySnapshotStore::new()), 50).unwrap();
        assert!(store
            .install(Snapshot {
                last_index: 100,
                last_term: 2,
                data: vec![1],
            })
            .unwrap());
        assert!(!store
            .install(Snapshot {
                last_index: 90,
                last_term: 2,
                data: vec![2],
            })
            .unwrap());
        assert_eq!(store.last_index(), 100);
    }

    #[test]
    fn test_compaction_threshold() {
        let store = SnapshotStore::load(Arc::new(MemorySnapshotStore::new()), 50).unwrap();
        assert!(!store.should_compact(49));
        assert!(store.should_compact(50));

        store
            .install(Snapshot {
                last_index: 60,
                last_term: 1,
                data: vec![],
            })
            .unwrap();
        assert!(!store.should_compact(100));
        assert!(store.should_compact(110));
    }
}
