//! Raft timing and compaction settings

use std::time::Duration;

use crate::error::{RaftError, RaftResult};
use crate::message::ForwardRequest;
use dcache_core::NodeId;

/// Configuration for a Raft node
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Unique ID for this node
    pub node_id: NodeId,
    /// Election timeout range (randomized between min and max)
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    /// Heartbeat interval
    pub heartbeat_interval: Duration,
    /// Deadline for a single RPC round trip
    pub rpc_timeout: Duration,
    /// How long a write waits for commit and apply
    pub apply_timeout: Duration,
    /// Periodic snapshot check
    pub snapshot_interval: Duration,
    /// Applied entries since the last snapshot that force a new one
    pub snapshot_threshold: u64,
    /// Entries kept behind the snapshot point
    pub trailing_logs: u64,
    /// Maximum entries per AppendEntries request
    pub max_append_entries: usize,
    /// Bytes per InstallSnapshot chunk
    pub snapshot_chunk_size: usize,
    /// A learner within this many entries of the leader may be promoted
    pub learner_catchup_lag: u64,
    pub learner_catchup_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: "node0".to_string(),
            election_timeout_min: Duration::from_millis(1000),
            election_timeout_max: Duration::from_millis(2000),
            heartbeat_interval: Duration::from_millis(300),
            rpc_timeout: Duration::from_secs(2),
            apply_timeout: Duration::from_secs(5),
            snapshot_interval: Duration::from_secs(30),
            snapshot_threshold: 5,
            trailing_logs: 1024,
            max_append_entries: 64,
            snapshot_chunk_size: 64 * 1024,
            learner_catchup_lag: 8,
            learner_catchup_timeout: Duration::from_secs(10),
        }
    }
}

impl RaftConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// How long a follower waits for the leader to finish a forwarded request.
    /// Adding a voter commits twice and waits for the learner to catch up in between.
    pub fn forward_timeout(&self, request: &ForwardRequest) -> Duration {
        match request {
            ForwardRequest::AddVoter { .. } => {
                self.apply_timeout * 2 + self.learner_catchup_timeout + self.rpc_timeout
            }
            ForwardRequest::Write(_) | ForwardRequest::AddLearner { .. } | ForwardRequest::RemoveServer { .. } => {
                self.apply_timeout + self.rpc_timeout
            }
        }
    }

    /// Reject settings that cannot produce a working cluster
    pub fn validate(&self) -> RaftResult<()> {
        if self.node_id.is_empty() {
            return Err(RaftError::Config("node_id must not be empty".into()));
        }
        if self.election_timeout_min.is_zero() || self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::Config(format!(
                "election timeout range {:?}..{:?} is invalid",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::Config(format!(
                "heartbeat interval {:?} must be below the minimum election timeout {:?}",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.snapshot_interval.is_zero() {
            return Err(RaftError::Config("snapshot_interval must be positive".into()));
        }
        if self.snapshot_threshold == 0 {
            return Err(RaftError::Config("snapshot_threshold must be positive".into()));
        }
        if self.max_append_entries == 0 || self.snapshot_chunk_size == 0 {
            return Err(RaftError::Config(
                "max_append_entries and snapshot_chunk_size must be positive".into(),
            ));
        }
        Ok(())
    }
}
