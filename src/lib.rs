// RustyRaft - Raft consensus engine
// Core library module
//
// A replicated-log state machine: leader election with a pre-vote round,
// log replication with fast conflict backtracking, snapshot-based log
// compaction, joint-consensus membership changes, leadership transfer and
// non-voting learners. Transport, durable storage and the application state
// machine are ports supplied at construction.

pub mod common;
pub mod config;
pub mod error;
pub mod fsm;
pub mod message;
pub mod storage;
pub mod transport;

mod log;
mod membership;
mod node;
mod peers;
mod replication;
mod state;
mod timer;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, ApplyResponse, ApplyStatus, Entry, EntryType,
    InstallSnapshotRequest, InstallSnapshotResponse, NodeEvent, RaftHandle, VoteRequest,
    VoteResponse,
};
pub use node::{RaftNode, Role};
