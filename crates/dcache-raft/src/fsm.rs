//! State machine interface and entry decoding

use crate::error::{RaftError, RaftResult};
use dcache_core::{Command, Configuration, EntryKind, KvStore, LogEntry, StorageResult};

/// Trait for the replicated state machine.
///
/// Methods take `&self`; implementations synchronize internally so readers can
/// share the state machine with the applier.
pub trait StateMachine: Send + Sync + 'static {
    /// Apply a committed command
    fn apply(&self, command: &Command);

    /// Serialize the current state
    fn snapshot(&self) -> StorageResult<Vec<u8>>;

    /// Replace the current state with a snapshot image
    fn restore(&self, data: &[u8]) -> StorageResult<()>;
}

impl StateMachine for KvStore {
    fn apply(&self, command: &Command) {
        match command {
            Command::Put { key, value } => self.put(key.clone(), value.clone()),
        }
    }

    fn snapshot(&self) -> StorageResult<Vec<u8>> {
        self.marshal()
    }

    fn restore(&self, data: &[u8]) -> StorageResult<()> {
        self.unmarshal(data)
    }
}

/// A log entry decoded once into what it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Decoded {
    Blank,
    Command(Command),
    Configuration(Configuration),
}

impl Decoded {
    pub(crate) fn decode(entry: &LogEntry) -> RaftResult<Self> {
        match entry.kind {
            EntryKind::Blank => Ok(Decoded::Blank),
            EntryKind::Command => Command::decode(&entry.payload)
                .map(Decoded::Command)
                .map_err(|e| RaftError::Decode(format!("command at {}: {}", entry.index, e))),
            EntryKind::Configuration => Configuration::decode(&entry.payload)
                .map(Decoded::Configuration)
                .map_err(|e| RaftError::Decode(format!("configuration at {}: {}", entry.index, e))),
        }
    }
}
