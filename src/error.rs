use crate::common::{LogIndex, NodeId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not the leader (known leader: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("log index {index} is out of range")]
    LogOutOfRange { index: LogIndex },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("state machine error: {0}")]
    StateMachine(String),

    #[error("a leadership transfer is in progress")]
    TransferInProgress,

    #[error("a membership change is in progress")]
    MembershipChangeInProgress,

    #[error("node channel closed")]
    ChannelClosed,

    #[error("timeout: {0}")]
    Timeout(String),
}

pub type Result<T> = std::result::Result<T, RaftError>;
