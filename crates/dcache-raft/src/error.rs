//! Raft error taxonomy

use serde::{Deserialize, Serialize};
use thiserror::Error;

use dcache_core::{NodeId, StorageError};

/// Errors produced by the consensus module
#[derive(Error, Debug)]
pub enum RaftError {
    /// A peer could not be reached; the caller retries
    #[error("Network error: {0}")]
    TransientNetwork(String),

    /// A peer answered with a newer term
    #[error("Term conflict: local term {local}, remote term {remote}")]
    TermConflict { local: u64, remote: u64 },

    /// The follower's log does not contain the leader's previous entry
    #[error("Log conflict at index {index}")]
    LogConflict { index: u64, term: Option<u64> },

    /// The entry was appended but no quorum confirmed it in time; it may still commit
    #[error("Quorum unavailable for entry {index}")]
    QuorumUnavailable { index: u64 },

    /// Snapshot persistence or restore failed; fatal to the local node
    #[error("Snapshot IO error: {0}")]
    SnapshotIo(String),

    /// A log entry payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Not the leader (leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    /// Leadership changed before the entry was applied; it may or may not have committed
    #[error("Leadership lost before entry {index} was applied")]
    LeadershipLost { index: u64 },

    #[error("A membership change is already in progress")]
    MembershipChangePending,

    #[error("Learner {id} did not catch up in time")]
    LearnerCatchUp { id: NodeId },

    #[error("Unknown server: {id}")]
    UnknownServer { id: NodeId },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Raft node is shutting down")]
    ShuttingDown,
}

impl RaftError {
    /// True when the outcome of a write is unknown: it may have committed
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            RaftError::QuorumUnavailable { .. } | RaftError::LeadershipLost { .. }
        )
    }
}

/// Result type alias for Raft operations
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Wire form of [`RaftError`] carried in forwarded request replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteError {
    NotLeader { leader: Option<NodeId> },
    QuorumUnavailable { index: u64 },
    LeadershipLost { index: u64 },
    MembershipChangePending,
    LearnerCatchUp { id: NodeId },
    UnknownServer { id: NodeId },
    ShuttingDown,
    Other(String),
}

impl From<RaftError> for RemoteError {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader { leader } => RemoteError::NotLeader { leader },
            RaftError::QuorumUnavailable { index } => RemoteError::QuorumUnavailable { index },
            RaftError::LeadershipLost { index } => RemoteError::LeadershipLost { index },
            RaftError::MembershipChangePending => RemoteError::MembershipChangePending,
            RaftError::LearnerCatchUp { id } => RemoteError::LearnerCatchUp { id },
            RaftError::UnknownServer { id } => RemoteError::UnknownServer { id },
            RaftError::ShuttingDown => RemoteError::ShuttingDown,
            other => RemoteError::Other(other.to_string()),
        }
    }
}

impl From<RemoteError> for RaftError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotLeader { leader } => RaftError::NotLeader { leader },
            RemoteError::QuorumUnavailable { index } => RaftError::QuorumUnavailable { index },
            RemoteError::LeadershipLost { index } => RaftError::LeadershipLost { index },
            RemoteError::MembershipChangePending => RaftError::MembershipChangePending,
            RemoteError::LearnerCatchUp { id } => RaftError::LearnerCatchUp { id },
            RemoteError::UnknownServer { id } => RaftError::UnknownServer { id },
            RemoteError::ShuttingDown => RaftError::ShuttingDown,
            RemoteError::Other(msg) => RaftError::TransientNetwork(msg),
        }
    }
}
