//! RPC messages exchanged between nodes

use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use dcache_core::{Command, LogEntry, NodeId, SnapshotMeta};

/// Raft RPC request types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftRequest {
    AppendEntries(AppendEntriesRequest),
    RequestVote(RequestVoteRequest),
    InstallSnapshot(InstallSnapshotRequest),
    Forward(ForwardRequest),
}

/// Raft RPC response types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftResponse {
    AppendEntries(AppendEntriesResponse),
    RequestVote(RequestVoteResponse),
    InstallSnapshot(InstallSnapshotResponse),
    Forward(ForwardResponse),
    Error(String),
}

/// AppendEntries RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

/// AppendEntries RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// On success, the last index known to match the leader
    pub last_log_index: u64,
    /// On rejection, where the leader should retry from
    pub conflict_index: u64,
    /// On rejection, the follower's term at `prev_log_index` if it has that entry
    pub conflict_term: Option<u64>,
}

/// RequestVote RPC request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// RequestVote RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// InstallSnapshot RPC request, one chunk of the snapshot image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub meta: SnapshotMeta,
    /// Byte offset of `data` within the image
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

/// InstallSnapshot RPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    /// Offset the follower expects next. Equals `offset + data.len()` when the chunk was accepted
    pub next_offset: u64,
}

/// Client operations a follower hands to the leader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForwardRequest {
    Write(Command),
    AddLearner { id: NodeId, address: String },
    AddVoter { id: NodeId, address: String },
    RemoveServer { id: NodeId },
}

/// Outcome of a forwarded operation: the log index it was applied at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardResponse {
    pub result: Result<u64, RemoteError>,
}
