//! Replicated log and cluster membership types

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StorageResult;

/// Unique identifier of a server in the cluster
pub type NodeId = String;

/// Position of an entry in the log, named by term and index.
///
/// `LogId::default()` (term 0, index 0) stands for the empty log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// What an entry's payload carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Empty entry appended by a new leader at the start of its term
    Blank,
    /// Encoded [`crate::Command`]
    Command,
    /// Encoded [`Configuration`]
    Configuration,
}

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The term when the entry was created by the leader
    pub term: u64,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn blank(term: u64, index: u64) -> Self {
        Self {
            index,
            term,
            kind: EntryKind::Blank,
            payload: Vec::new(),
        }
    }

    pub fn command(term: u64, index: u64, payload: Vec<u8>) -> Self {
        Self {
            index,
            term,
            kind: EntryKind::Command,
            payload,
        }
    }

    pub fn configuration(term: u64, index: u64, config: &Configuration) -> StorageResult<Self> {
        Ok(Self {
            index,
            term,
            kind: EntryKind::Configuration,
            payload: config.encode()?,
        })
    }

    pub fn log_id(&self) -> LogId {
        LogId::new(self.term, self.index)
    }
}

/// Whether a server takes part in elections and commit quorums
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerRole {
    Voter,
    /// Learner: receives the log but is not counted in any quorum
    NonVoter,
}

/// A member of the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Server {
    pub id: NodeId,
    /// Raft transport address (host:port)
    pub address: String,
    pub role: ServerRole,
}

impl Server {
    pub fn voter(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            role: ServerRole::Voter,
        }
    }

    pub fn non_voter(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            role: ServerRole::NonVoter,
        }
    }

    pub fn is_voter(&self) -> bool {
        self.role == ServerRole::Voter
    }
}

/// Ordered set of servers in effect from the log index that carries it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub servers: Vec<Server>,
}

impl Configuration {
    pub fn new(servers: Vec<Server>) -> Self {
        Self { servers }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn is_voter(&self, id: &str) -> bool {
        self.get(id).map(Server::is_voter).unwrap_or(false)
    }

    pub fn voters(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter().filter(|s| s.is_voter())
    }

    pub fn voter_count(&self) -> usize {
        self.voters().count()
    }

    /// Strict majority of the voting servers
    pub fn quorum(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    /// Returns a copy with `server` inserted, replacing any entry with the same id in place
    pub fn with_server(&self, server: Server) -> Self {
        let mut servers = self.servers.clone();
        match servers.iter_mut().find(|s| s.id == server.id) {
            Some(existing) => *existing = server,
            None => servers.push(server),
        }
        Self { servers }
    }

    /// Returns a copy without the server `id`
    pub fn without(&self, id: &str) -> Self {
        Self {
            servers: self.servers.iter().filter(|s| s.id != id).cloned().collect(),
        }
    }

    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> StorageResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Term and vote, persisted before any vote is answered
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// Describes what a snapshot subsumes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Last log entry folded into the snapshot
    pub last_included: LogId,
    /// Membership in effect at `last_included`
    pub configuration: Configuration,
    /// Index of the entry that carried `configuration`
    pub configuration_index: u64,
}

/// A point-in-time image of the key-value store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}
