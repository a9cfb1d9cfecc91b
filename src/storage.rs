// Durable storage ports.
//
// The core persists two records with atomic-replace semantics: the hard
// state (term, vote, log tail) and the latest snapshot. Both ports are
// synchronous and must not be held open across await points; callers invoke
// them from short critical sections before a mutation becomes observable.

use crate::common::{LogIndex, NodeId, Term};
use crate::error::{RaftError, Result};
use crate::message::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// The persisted hard state: everything a node must recover after a restart
/// to keep its promises (votes cast, entries acknowledged).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<NodeId>,

    /// Log tail above the snapshot boundary.
    pub entries: Vec<Entry>,
}

/// A snapshot of the state machine covering the logical log prefix
/// `[1 ..= last_index]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_index: LogIndex,
    pub last_term: Term,
    pub data: Vec<u8>,
}

/// Durable store for the hard state. Implementations replace the record
/// atomically; a partially written record must never be loadable.
pub trait StatePersister: Send + Sync {
    fn save(&self, state: &HardState) -> Result<()>;
    fn load(&self) -> Result<Option<HardState>>;
}

/// Durable store for the latest snapshot, replaced wholesale.
pub trait SnapshotPersister: Send + Sync {
    fn save(&self, snapshot: &Snapshot) -> Result<()>;
    fn load(&self) -> Result<Option<Snapshot>>;
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| RaftError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| RaftError::Serialization(e.to_string()))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|e| RaftError::Storage(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| RaftError::Storage(e.to_string()))
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(RaftError::Storage(e.to_string())),
    }
}

/// In-memory hard state store, for tests and throwaway clusters.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<HardState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatePersister for MemoryStateStore {
    fn save(&self, state: &HardState) -> Result<()> {
        *self.state.lock() = Some(state.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<HardState>> {
        Ok(self.state.lock().clone())
    }
}

/// In-memory snapshot store, for tests and throwaway clusters.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshot: Mutex<Option<Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotPersister for MemorySnapshotStore {
    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        *self.snapshot.lock() = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.lock().clone())
    }
}

/// File-backed hard state store using write-temp-then-rename replacement.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl StatePersister for FileStateStore {
    fn save(&self, state: &HardState) -> Result<()> {
        write_atomic(&self.path, &encode(state)?)
    }

    fn load(&self) -> Result<Option<HardState>> {
        read_optional(&self.path)?.map(|bytes| decode(&bytes)).transpose()
    }
}

/// File-backed snapshot store using write-temp-then-rename replacement.
#[derive(Debug)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotPersister for FileSnapshotStore {
    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        write_atomic(&self.path, &encode(snapshot)?)
    }

    fn load(&self) -> Result<Option<Snapshot>> {
        read_optional(&self.path)?.map(|bytes| decode(&bytes)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EntryType;

    fn sample_state() -> HardState {
        HardState {
            term: 3,
            voted_for: Some("node2".to_string()),
            entries: vec![Entry {
                index: 1,
                term: 1,
                entry_type: EntryType::Replicate,
                data: b"set x=1".to_vec(),
            }],
        }
    }

    #[test]
    fn test_memory_state_round_trip() {
        let store = MemoryStateStore::new();
        assert!(store.load().unwrap().is_none());

        store.save(&sample_state()).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.term, 3);
        assert_eq!(loaded.voted_for.as_deref(), Some("node2"));
        assert_eq!(loaded.entries.len(), 1);
    }

    #[test]
    fn test_file_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("raft-state.bin"));
        assert!(store.load().unwrap().is_none());

        store.save(&sample_state()).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.term, 3);
        assert_eq!(loaded.entries[0].data, b"set x=1");
    }

    #[test]
    fn test_file_snapshot_replaced_wholesale() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("snapshot.bin"));

        store
            .save(&Snapshot {
                last_index: 10,
                last_term: 2,
                data: vec![1, 2, 3],
            })
            .unwrap();
        store
            .save(&Snapshot {
                last_index: 20,
                last_term: 3,
                data: vec![4, 5],
            })
            .unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.last_index, 20);
        assert_eq!(loaded.data, vec![4, 5]);
    }
}
