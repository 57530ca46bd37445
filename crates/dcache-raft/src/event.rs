//! Leadership events and metrics published by a node

use serde::{Deserialize, Serialize};

use dcache_core::{Configuration, NodeId};

/// Raft node state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Discrete leadership changes, delivered on a broadcast channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RaftEvent {
    BecameLeader { term: u64 },
    /// Emitted when a leader steps down
    BecameFollower { term: u64, leader: Option<NodeId> },
    /// The node hit an unrecoverable error and is shutting down
    Fatal { reason: String },
}

/// Point-in-time view of a node's consensus state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub role: Role,
    pub current_term: u64,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub applied_index: u64,
    pub last_log_index: u64,
    pub snapshot_index: u64,
    pub membership: Configuration,
}
