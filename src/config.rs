// Node configuration.
//
// Timeout ordering is validated up front: a heartbeat interval that is not
// strictly below the minimum election timeout cannot keep a healthy leader
// in power.

use crate::common::{NodeAddr, NodeId};
use crate::error::{RaftError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Raft consensus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Local node ID.
    pub id: NodeId,

    /// Local transport address.
    pub addr: NodeAddr,

    /// Initial cluster peers (self included, unless joining as a learner).
    pub peers: HashMap<NodeId, NodeAddr>,

    /// Election timeout range (randomized per round within this range).
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,

    /// Heartbeat interval (strictly below `election_timeout_min`).
    pub heartbeat_interval: Duration,

    /// Number of committed entries beyond the latest snapshot that triggers
    /// log compaction.
    pub max_log_length: u64,

    /// Start as a non-voting learner that catches up from the leader.
    pub as_learner: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            addr: String::new(),
            peers: HashMap::new(),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            heartbeat_interval: Duration::from_millis(100),
            max_log_length: 10_000,
            as_learner: false,
        }
    }
}

impl RaftConfig {
    /// Validate the configuration. Called at node construction; a node is
    /// never built from an invalid config.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(RaftError::Config("node id must not be empty".to_string()));
        }
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftError::Config(format!(
                "election timeout min ({:?}) must be below max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::Config(format!(
                "heartbeat interval ({:?}) must be below the minimum election timeout ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.max_log_length == 0 {
            return Err(RaftError::Config(
                "max_log_length must be at least 1".to_string(),
            ));
        }
        if !self.as_learner && !self.peers.contains_key(&self.id) {
            return Err(RaftError::Config(format!(
                "peer map does not contain the local node {}",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> RaftConfig {
        RaftConfig {
            id: "node1".to_string(),
            addr: "127.0.0.1:7001".to_string(),
            peers: HashMap::from([("node1".to_string(), "127.0.0.1:7001".to_string())]),
            ..RaftConfig::default()
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_election_range() {
        let mut config = valid_config();
        config.election_timeout_min = Duration::from_millis(600);
        config.election_timeout_max = Duration::from_millis(300);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_heartbeat_at_election_floor() {
        let mut config = valid_config();
        config.heartbeat_interval = config.election_timeout_min;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_missing_self() {
        let mut config = valid_config();
        config.peers.clear();
        assert!(config.validate().is_err());

        config.as_learner = true;
        assert!(config.validate().is_ok());
    }
}
