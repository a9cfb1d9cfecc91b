// In-memory log with virtual indexing.
//
// All access is by logical index, counting from 1 and including the
// snapshot-covered prefix. The tail holds entries above the snapshot
// boundary at physical offset `index - snapshot_last_index - 1`.

use crate::common::{LogIndex, Term};
use crate::error::{RaftError, Result};
use crate::message::Entry;
use std::collections::VecDeque;

/// The replicated log: a snapshot-covered prefix described by its boundary
/// plus the in-memory tail.
#[derive(Debug, Clone, Default)]
pub struct RaftLog {
    /// Entries above the snapshot boundary.
    entries: VecDeque<Entry>,

    /// Index of the last entry covered by the latest snapshot (0 when none).
    snapshot_last_index: LogIndex,

    /// Term of that entry.
    snapshot_last_term: Term,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from a persisted tail and snapshot boundary.
    pub fn restore(
        entries: Vec<Entry>,
        snapshot_last_index: LogIndex,
        snapshot_last_term: Term,
    ) -> Self {
        Self {
            entries: entries.into(),
            snapshot_last_index,
            snapshot_last_term,
        }
    }

    /// Index of the last logical entry (tail, else snapshot boundary, else 0).
    pub fn last_index(&self) -> LogIndex {
        match self.entries.back() {
            Some(entry) => entry.index,
            None => self.snapshot_last_index,
        }
    }

    /// Term at `last_index()` (0 when there is no log and no snapshot).
    pub fn last_term(&self) -> Term {
        match self.entries.back() {
            Some(entry) => entry.term,
            None => self.snapshot_last_term,
        }
    }

    pub fn snapshot_last_index(&self) -> LogIndex {
        self.snapshot_last_index
    }

    pub fn snapshot_last_term(&self) -> Term {
        self.snapshot_last_term
    }

    /// First logical index held in the tail.
    pub fn first_tail_index(&self) -> LogIndex {
        self.snapshot_last_index + 1
    }

    /// Term of the entry at `index`.
    ///
    /// `Some(0)` at index 0, the snapshot's term at the boundary, `None`
    /// inside the snapshot-covered region or past the tail.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_last_index {
            return Some(self.snapshot_last_term);
        }
        self.tail_entry(index).map(|entry| entry.term)
    }

    /// Whether `index` lies at or below the snapshot boundary.
    pub fn covered_by_snapshot(&self, index: LogIndex) -> bool {
        index <= self.snapshot_last_index
    }

    /// Entry at a logical index. Fails with `LogOutOfRange` for indexes the
    /// snapshot covers (the caller must ship a snapshot instead) or past the
    /// tail.
    pub fn entry(&self, index: LogIndex) -> Result<&Entry> {
        if index <= self.snapshot_last_index {
            return Err(RaftError::LogOutOfRange { index });
        }
        self.tail_entry(index)
            .ok_or(RaftError::LogOutOfRange { index })
    }

    fn tail_entry(&self, index: LogIndex) -> Option<&Entry> {
        if index < self.first_tail_index() {
            return None;
        }
        let offset = (index - self.first_tail_index()) as usize;
        self.entries.get(offset)
    }

    /// Append a fully formed entry; its index must be `last_index() + 1`.
    pub fn append(&mut self, entry: Entry) -> Result<()> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(RaftError::InvalidState(format!(
                "log entry index mismatch: expected {}, got {}",
                expected, entry.index
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    /// Drop entries with index >= `index`, returning them for rollback.
    /// The snapshot-covered region is untouchable.
    pub fn truncate_after(&mut self, index: LogIndex) -> Result<Vec<Entry>> {
        if index <= self.snapshot_last_index {
            return Err(RaftError::LogOutOfRange { index });
        }
        let first = self.first_tail_index();
        let keep = (index.max(first) - first) as usize;
        Ok(self.entries.split_off(keep.min(self.entries.len())).into())
    }

    /// Drop entries with index < `index`, returning them for rollback.
    pub fn truncate_before(&mut self, index: LogIndex) -> Result<Vec<Entry>> {
        let first = self.first_tail_index();
        if index < first {
            return Ok(Vec::new());
        }
        let drop = ((index - first) as usize).min(self.entries.len());
        Ok(self.entries.drain(..drop).collect())
    }

    /// Move the snapshot boundary forward, dropping covered tail entries.
    /// Used by local compaction and by snapshot installation.
    pub fn advance_snapshot(&mut self, last_index: LogIndex, last_term: Term) -> Result<()> {
        if last_index < self.snapshot_last_index {
            return Err(RaftError::InvalidState(format!(
                "snapshot boundary moving backward: {} -> {}",
                self.snapshot_last_index, last_index
            )));
        }
        // Keep the tail past the boundary only if it actually matches the
        // snapshot's last entry; otherwise the whole tail is stale.
        let matches = self.term_at(last_index) == Some(last_term);
        self.snapshot_last_index = last_index;
        self.snapshot_last_term = last_term;
        if matches {
            let first = self.first_tail_index();
            while self
                .entries
                .front()
                .map(|entry| entry.index < first)
                .unwrap_or(false)
            {
                self.entries.pop_front();
            }
        } else {
            self.entries.clear();
        }
        Ok(())
    }

    /// The tail entries, for persisting.
    pub fn tail(&self) -> Vec<Entry> {
        self.entries.iter().cloned().collect()
    }

    /// Number of entries held in memory.
    pub fn tail_len(&self) -> usize {
        self.entries.len()
    }

    /// Restore entries removed by a failed truncate-after.
    pub(crate) fn restore_tail_suffix(&mut self, removed: Vec<Entry>) {
        self.entries.extend(removed);
    }

    /// Restore entries removed by a failed truncate-before.
    pub(crate) fn restore_tail_prefix(&mut self, removed: Vec<Entry>) {
        for entry in removed.into_iter().rev() {
            self.entries.push_front(entry);
        }
    }
}
