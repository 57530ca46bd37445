use dcache_core::{HardState, LogEntry, LogId, StorageError, StorageResult};
use dcache_raft::{LogState, LogStore, StableStore};
use parking_lot::Mutex;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Options, WriteBatch, WriteOptions, DB};
use std::path::Path;
use tracing::{debug, info};

/// Column family names
const CF_LOGS: &str = "logs";
const CF_META: &str = "meta";
const CF_STABLE: &str = "stable";

const KEY_LAST_PURGED: &[u8] = b"last_purged";
const KEY_HARD_STATE: &[u8] = b"hard_state";

fn backend(e: rocksdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn index_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

fn decode_index(key: &[u8]) -> StorageResult<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| StorageError::Corrupt(format!("invalid log key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Raft log and hard state stored in RocksDB
///
/// Log entries live in the `logs` column family keyed by big-endian index, so
/// iteration order is log order. Every mutation is a single synced
/// `WriteBatch`.
pub struct RocksStore {
    db: DB,
    /// Cached bounds; the lock also serializes mutations
    state: Mutex<LogState>,
}

impl RocksStore {
    /// Open or create the store at `path`
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_LOGS, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
            ColumnFamilyDescriptor::new(CF_STABLE, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors).map_err(backend)?;

        let store = Self {
            db,
            state: Mutex::new(LogState::default()),
        };
        let state = store.load_state()?;
        *store.state.lock() = state;

        info!(
            "Opened raft store at {:?} (purged through {}, last {})",
            path, state.last_purged, state.last
        );
        Ok(store)
    }

    fn cf(&self, name: &str) -> StorageResult<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Backend(format!("column family {} not found", name)))
    }

    fn write(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        self.db.write_opt(batch, &opts).map_err(backend)
    }

    fn load_state(&self) -> StorageResult<LogState> {
        let last_purged = match self.db.get_cf(self.cf(CF_META)?, KEY_LAST_PURGED).map_err(backend)? {
            Some(bytes) => bincode::deserialize::<LogId>(&bytes)?,
            None => LogId::default(),
        };

        let mut iter = self.db.raw_iterator_cf(self.cf(CF_LOGS)?);
        iter.seek_to_last();
        let last = match iter.value() {
            Some(value) => bincode::deserialize::<LogEntry>(value)?.log_id(),
            None => last_purged,
        };
        iter.status().map_err(backend)?;

        Ok(LogState {
            last_purged,
            last: if last.index > last_purged.index { last } else { last_purged },
        })
    }
}

impl LogStore for RocksStore {
    fn state(&self) -> StorageResult<LogState> {
        Ok(*self.state.lock())
    }

    fn get(&self, index: u64) -> StorageResult<Option<LogEntry>> {
        match self.db.get_cf(self.cf(CF_LOGS)?, index_key(index)).map_err(backend)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn range(&self, lo: u64, hi: u64) -> StorageResult<Vec<LogEntry>> {
        let mut entries = Vec::new();
        if lo >= hi {
            return Ok(entries);
        }

        let mut iter = self.db.raw_iterator_cf(self.cf(CF_LOGS)?);
        iter.seek(index_key(lo));
        let mut expected = lo;
        while iter.valid() && expected < hi {
            let (Some(key), Some(value)) = (iter.key(), iter.value()) else {
                break;
            };
            if decode_index(key)? != expected {
                break;
            }
            entries.push(bincode::deserialize(value)?);
            expected += 1;
            iter.next();
        }
        iter.status().map_err(backend)?;
        Ok(entries)
    }

    fn append(&self, entries: &[LogEntry]) -> StorageResult<()> {
        let Some(last_entry) = entries.last() else {
            return Ok(());
        };

        let mut state = self.state.lock();
        let cf = self.cf(CF_LOGS)?;
        let mut batch = WriteBatch::default();
        let mut next = state.last.index + 1;
        for entry in entries {
            if entry.index != next {
                return Err(StorageError::Corrupt(format!(
                    "append at index {} but next index is {}",
                    entry.index, next
                )));
            }
            batch.put_cf(cf, index_key(entry.index), bincode::serialize(entry)?);
            next += 1;
        }
        self.write(batch)?;

        state.last = last_entry.log_id();
        Ok(())
    }

    fn truncate_suffix(&self, from: u64) -> StorageResult<()> {
        let mut state = self.state.lock();
        if from > state.last.index {
            return Ok(());
        }

        let mut batch = WriteBatch::default();
        batch.delete_range_cf(self.cf(CF_LOGS)?, index_key(from), index_key(state.last.index + 1));
        self.write(batch)?;

        let prev = from.saturating_sub(1);
        state.last = if prev > state.last_purged.index {
            self.get(prev)?
                .map(|entry| entry.log_id())
                .ok_or_else(|| StorageError::Corrupt(format!("entry {} missing after truncation", prev)))?
        } else {
            state.last_purged
        };
        debug!("Truncated log from {} (last now {})", from, state.last);
        Ok(())
    }

    fn truncate_prefix(&self, upto: LogId) -> StorageResult<()> {
        let mut state = self.state.lock();

        let mut batch = WriteBatch::default();
        batch.delete_range_cf(self.cf(CF_LOGS)?, index_key(0), index_key(upto.index + 1));
        let purged = if upto.index > state.last_purged.index {
            batch.put_cf(self.cf(CF_META)?, KEY_LAST_PURGED, bincode::serialize(&upto)?);
            upto
        } else {
            state.last_purged
        };
        self.write(batch)?;

        state.last_purged = purged;
        if state.last.index <= purged.index {
            state.last = purged;
        }
        debug!("Purged log through {}", purged);
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        self.db.flush_wal(true).map_err(backend)
    }
}

impl StableStore for RocksStore {
    fn save_hard_state(&self, state: &HardState) -> StorageResult<()> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_STABLE)?, KEY_HARD_STATE, bincode::serialize(state)?);
        self.write(batch)
    }

    fn load_hard_state(&self) -> StorageResult<HardState> {
        match self.db.get_cf(self.cf(CF_STABLE)?, KEY_HARD_STATE).map_err(backend)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(HardState::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entries(range: std::ops::RangeInclusive<u64>, term: u64) -> Vec<LogEntry> {
        range.map(|i| LogEntry::command(term, i, format!("cmd{}", i).into_bytes())).collect()
    }

    #[test]
    fn test_open_empty() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        assert_eq!(store.state().unwrap(), LogState::default());
        assert!(store.get(1).unwrap().is_none());
        assert_eq!(store.load_hard_state().unwrap(), HardState::default());
    }

    #[test]
    fn test_append_and_range() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        store.append(&entries(1..=10, 1)).unwrap();

        assert_eq!(store.state().unwrap().last, LogId::new(1, 10));
        assert_eq!(store.get(4).unwrap().unwrap().payload, b"cmd4");

        let range = store.range(3, 7).unwrap();
        assert_eq!(range.iter().map(|e| e.index).collect::<Vec<_>>(), vec![3, 4, 5, 6]);
        assert_eq!(store.range(8, 100).unwrap().len(), 3);
        assert!(store.range(11, 20).unwrap().is_empty());
    }

    #[test]
    fn test_append_rejects_gap() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        store.append(&entries(1..=2, 1)).unwrap();

        let err = store.append(&entries(4..=4, 1)).unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(_)));
        assert_eq!(store.state().unwrap().last, LogId::new(1, 2));
    }

    #[test]
    fn test_truncate_suffix() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        store.append(&entries(1..=5, 1)).unwrap();

        store.truncate_suffix(3).unwrap();
        assert_eq!(store.state().unwrap().last, LogId::new(1, 2));
        assert!(store.get(3).unwrap().is_none());

        store.append(&entries(3..=3, 2)).unwrap();
        assert_eq!(store.state().unwrap().last, LogId::new(2, 3));
    }

    #[test]
    fn test_truncate_prefix_keeps_marker() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        store.append(&entries(1..=5, 1)).unwrap();

        store.truncate_prefix(LogId::new(1, 3)).unwrap();
        let state = store.state().unwrap();
        assert_eq!(state.last_purged, LogId::new(1, 3));
        assert_eq!(state.last, LogId::new(1, 5));
        assert!(store.get(3).unwrap().is_none());
        assert_eq!(store.range(1, 10).unwrap().len(), 0);
        assert_eq!(store.range(4, 10).unwrap().len(), 2);

        // Purging past the end leaves an empty log positioned at the marker
        store.truncate_prefix(LogId::new(2, 8)).unwrap();
        let state = store.state().unwrap();
        assert_eq!(state.last, LogId::new(2, 8));
        store.append(&entries(9..=9, 2)).unwrap();
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            store.append(&entries(1..=6, 2)).unwrap();
            store.truncate_prefix(LogId::new(2, 2)).unwrap();
            store.truncate_suffix(6).unwrap();
            store
                .save_hard_state(&HardState {
                    current_term: 3,
                    voted_for: Some("node2".into()),
                })
                .unwrap();
            store.flush().unwrap();
        }

        let store = RocksStore::open(dir.path()).unwrap();
        let state = store.state().unwrap();
        assert_eq!(state.last_purged, LogId::new(2, 2));
        assert_eq!(state.last, LogId::new(2, 5));
        assert_eq!(store.range(3, 6).unwrap().len(), 3);
        let hard = store.load_hard_state().unwrap();
        assert_eq!(hard.current_term, 3);
        assert_eq!(hard.voted_for.as_deref(), Some("node2"));
    }
}
