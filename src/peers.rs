// Peer registry.
//
// The authoritative id -> address map of the current configuration (self
// included), the known leader, and the quorum arithmetic derived from it.
// ChangeConf log entries carry this map serialized; the codec lives here so
// every node interprets the payload identically.

use crate::common::{NodeAddr, NodeId};
use crate::error::{RaftError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Cluster membership view owned by one node.
pub(crate) struct PeerRegistry {
    self_id: NodeId,
    inner: RwLock<RegistryInner>,
}

struct RegistryInner {
    peers: HashMap<NodeId, NodeAddr>,
    leader_id: Option<NodeId>,
}

impl PeerRegistry {
    pub fn new(self_id: NodeId, peers: HashMap<NodeId, NodeAddr>) -> Self {
        Self {
            self_id,
            inner: RwLock::new(RegistryInner {
                peers,
                leader_id: None,
            }),
        }
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.inner.read().leader_id.clone()
    }

    pub fn set_leader(&self, leader: Option<NodeId>) {
        self.inner.write().leader_id = leader;
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.inner.read().peers.contains_key(id)
    }

    pub fn addr_of(&self, id: &NodeId) -> Option<NodeAddr> {
        self.inner.read().peers.get(id).cloned()
    }

    /// Number of members in the current configuration.
    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    /// Quorum size of the current configuration: floor(N / 2) + 1.
    pub fn majority(&self) -> usize {
        self.inner.read().peers.len() / 2 + 1
    }

    /// Snapshot of the full peer map.
    pub fn all(&self) -> HashMap<NodeId, NodeAddr> {
        self.inner.read().peers.clone()
    }

    /// Every peer except self, as (id, addr) pairs.
    pub fn others(&self) -> Vec<(NodeId, NodeAddr)> {
        self.inner
            .read()
            .peers
            .iter()
            .filter(|(id, _)| **id != self.self_id)
            .map(|(id, addr)| (id.clone(), addr.clone()))
            .collect()
    }

    /// Replace the whole configuration (ChangeConf apply).
    pub fn replace(&self, peers: HashMap<NodeId, NodeAddr>) {
        self.inner.write().peers = peers;
    }

    /// Register a single node (learner promotion path).
    pub fn insert(&self, id: NodeId, addr: NodeAddr) {
        self.inner.write().peers.insert(id, addr);
    }

    /// Serialize a peer map into a ChangeConf entry payload.
    pub fn encode_peer_map(peers: &HashMap<NodeId, NodeAddr>) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(peers, bincode::config::standard())
            .map_err(|e| RaftError::Serialization(e.to_string()))
    }

    /// Decode a ChangeConf entry payload back into a peer map.
    pub fn decode_peer_map(data: &[u8]) -> Result<HashMap<NodeId, NodeAddr>> {
        bincode::serde::decode_from_slice(data, bincode::config::standard())
            .map(|(peers, _)| peers)
            .map_err(|e| RaftError::Serialization(e.to_string()))
    }
}
