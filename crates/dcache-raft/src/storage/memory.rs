//! In-memory stores for tests and single-process clusters

use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::{LogState, LogStore, SnapshotStore, StableStore};
use dcache_core::{HardState, LogEntry, LogId, Snapshot, StorageError, StorageResult};

#[derive(Debug, Default)]
struct MemLog {
    entries: BTreeMap<u64, LogEntry>,
    last_purged: LogId,
}

impl MemLog {
    fn last(&self) -> LogId {
        self.entries
            .values()
            .next_back()
            .map(LogEntry::log_id)
            .unwrap_or(self.last_purged)
    }
}

/// Log store backed by a `BTreeMap`
#[derive(Debug, Default)]
pub struct MemLogStore {
    inner: RwLock<MemLog>,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemLogStore {
    fn state(&self) -> StorageResult<LogState> {
        let inner = self.inner.read();
        Ok(LogState {
            last_purged: inner.last_purged,
            last: inner.last(),
        })
    }

    fn get(&self, index: u64) -> StorageResult<Option<LogEntry>> {
        Ok(self.inner.read().entries.get(&index).cloned())
    }

    fn range(&self, lo: u64, hi: u64) -> StorageResult<Vec<LogEntry>> {
        if lo >= hi {
            return Ok(Vec::new());
        }
        let inner = self.inner.read();
        let mut out = Vec::new();
        let mut expected = lo;
        for (index, entry) in inner.entries.range(lo..hi) {
            if *index != expected {
                break;
            }
            out.push(entry.clone());
            expected += 1;
        }
        Ok(out)
    }

    fn append(&self, entries: &[LogEntry]) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let mut next = inner.last().index + 1;
        for entry in entries {
            if entry.index != next {
                return Err(StorageError::Corrupt(format!(
                    "append at index {} but next index is {}",
                    entry.index, next
                )));
            }
            inner.entries.insert(entry.index, entry.clone());
            next += 1;
        }
        Ok(())
    }

    fn truncate_suffix(&self, from: u64) -> StorageResult<()> {
        let mut inner = self.inner.write();
        inner.entries.retain(|index, _| *index < from);
        Ok(())
    }

    fn truncate_prefix(&self, upto: LogId) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let kept = inner.entries.split_off(&(upto.index + 1));
        inner.entries = kept;
        if upto.index > inner.last_purged.index {
            inner.last_purged = upto;
        }
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Stable store holding the hard state in memory
#[derive(Debug, Default)]
pub struct MemStableStore {
    state: RwLock<HardState>,
}

impl MemStableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StableStore for MemStableStore {
    fn save_hard_state(&self, state: &HardState) -> StorageResult<()> {
        *self.state.write() = state.clone();
        Ok(())
    }

    fn load_hard_state(&self) -> StorageResult<HardState> {
        Ok(self.state.read().clone())
    }
}

/// Snapshot store keeping only the newest snapshot in memory
#[derive(Debug, Default)]
pub struct MemSnapshotStore {
    latest: RwLock<Option<Snapshot>>,
}

impl MemSnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemSnapshotStore {
    fn save(&self, snapshot: &Snapshot) -> StorageResult<()> {
        *self.latest.write() = Some(snapshot.clone());
        Ok(())
    }

    fn latest(&self) -> StorageResult<Option<Snapshot>> {
        Ok(self.latest.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<LogEntry> {
        range.map(|i| LogEntry::command(term, i, vec![i as u8])).collect()
    }

    #[test]
    fn test_append_must_be_contiguous() {
        let log = MemLogStore::new();
        log.append(&entries(1..=3, 1)).unwrap();
        assert!(log.append(&entries(5..=5, 1)).is_err());
        assert_eq!(log.state().unwrap().last, LogId::new(1, 3));
    }

    #[test]
    fn test_truncate_suffix_then_reappend() {
        let log = MemLogStore::new();
        log.append(&entries(1..=5, 1)).unwrap();
        log.truncate_suffix(4).unwrap();
        log.append(&entries(4..=4, 2)).unwrap();

        assert_eq!(log.state().unwrap().last, LogId::new(2, 4));
        assert_eq!(log.range(1, 10).unwrap().len(), 4);
    }

    #[test]
    fn test_truncate_prefix_everything() {
        let log = MemLogStore::new();
        log.append(&entries(1..=5, 1)).unwrap();
        log.truncate_prefix(LogId::new(1, 5)).unwrap();

        let state = log.state().unwrap();
        assert_eq!(state.last_purged, LogId::new(1, 5));
        assert_eq!(state.last, LogId::new(1, 5));
        assert!(log.get(3).unwrap().is_none());
        log.append(&entries(6..=6, 2)).unwrap();
        assert_eq!(log.state().unwrap().last, LogId::new(2, 6));
    }

    #[test]
    fn test_stable_store_roundtrip() {
        let stable = MemStableStore::new();
        assert_eq!(stable.load_hard_state().unwrap(), HardState::default());
        let state = HardState {
            current_term: 4,
            voted_for: Some("node1".into()),
        };
        stable.save_hard_state(&state).unwrap();
        assert_eq!(stable.load_hard_state().unwrap(), state);
    }
}
