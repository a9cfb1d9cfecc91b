// Shared identifier and index types used across the consensus engine.

/// Unique, stable identifier of a node in the cluster.
pub type NodeId = String;

/// Opaque transport endpoint of a node. The core never interprets it; it is
/// handed verbatim to the transport port.
pub type NodeAddr = String;

/// Monotonically increasing logical clock identifying a leadership epoch.
pub type Term = u64;

/// Logical log index, counting from 1 and including the snapshot-covered
/// prefix.
pub type LogIndex = u64;
