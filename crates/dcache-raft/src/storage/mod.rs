//! Storage seams used by the consensus module
//!
//! All operations are synchronous and must be durable before they return.
//! Implementations use interior mutability so one store can be shared by the
//! consensus core, the replicators and the applier.

mod memory;

pub use memory::{MemLogStore, MemSnapshotStore, MemStableStore};

use dcache_core::{HardState, LogEntry, LogId, Snapshot, SnapshotMeta, StorageResult};

/// Bounds of the stored log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogState {
    /// Last entry removed by prefix truncation, `(0, 0)` if none
    pub last_purged: LogId,
    /// Last entry in the log, or `last_purged` when the log is empty
    pub last: LogId,
}

/// Durable, append-only log
pub trait LogStore: Send + Sync + 'static {
    fn state(&self) -> StorageResult<LogState>;

    fn get(&self, index: u64) -> StorageResult<Option<LogEntry>>;

    /// Entries with `lo <= index < hi`, stopping at the first gap
    fn range(&self, lo: u64, hi: u64) -> StorageResult<Vec<LogEntry>>;

    /// Append entries that directly follow the current last entry
    fn append(&self, entries: &[LogEntry]) -> StorageResult<()>;

    /// Delete every entry with `index >= from`
    fn truncate_suffix(&self, from: u64) -> StorageResult<()>;

    /// Delete every entry with `index <= upto.index` and remember `upto` as purged
    fn truncate_prefix(&self, upto: LogId) -> StorageResult<()>;

    fn flush(&self) -> StorageResult<()>;
}

/// Durable term and vote
pub trait StableStore: Send + Sync + 'static {
    fn save_hard_state(&self, state: &HardState) -> StorageResult<()>;

    fn load_hard_state(&self) -> StorageResult<HardState>;
}

/// Durable store of compacted state
pub trait SnapshotStore: Send + Sync + 'static {
    fn save(&self, snapshot: &Snapshot) -> StorageResult<()>;

    fn latest(&self) -> StorageResult<Option<Snapshot>>;

    fn latest_meta(&self) -> StorageResult<Option<SnapshotMeta>> {
        Ok(self.latest()?.map(|s| s.meta))
    }
}

/// Term of the entry at `index`, using the purge marker for the compaction boundary.
///
/// Returns `None` when the entry is missing or compacted away.
pub fn term_at(log: &dyn LogStore, index: u64) -> StorageResult<Option<u64>> {
    if index == 0 {
        return Ok(Some(0));
    }
    let state = log.state()?;
    if index == state.last_purged.index {
        return Ok(Some(state.last_purged.term));
    }
    if index < state.last_purged.index {
        return Ok(None);
    }
    Ok(log.get(index)?.map(|entry| entry.term))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_at_compaction_boundary() {
        let log = MemLogStore::new();
        let entries: Vec<_> = (1..=5).map(|i| LogEntry::blank(i / 3 + 1, i)).collect();
        log.append(&entries).unwrap();
        log.truncate_prefix(LogId::new(2, 3)).unwrap();

        assert_eq!(term_at(&log, 0).unwrap(), Some(0));
        assert_eq!(term_at(&log, 2).unwrap(), None);
        assert_eq!(term_at(&log, 3).unwrap(), Some(2));
        assert_eq!(term_at(&log, 5).unwrap(), Some(2));
        assert_eq!(term_at(&log, 6).unwrap(), None);
    }
}
