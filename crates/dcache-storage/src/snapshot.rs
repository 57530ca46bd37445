//! Snapshots stored as directories on the local filesystem
//!
//! Layout: `<dir>/<term>-<index>-<unix_millis>/{meta.json,state.bin}`. A
//! snapshot is written under a `.tmp` name, synced and then renamed into
//! place, so a crash never leaves a partial snapshot visible.

use chrono::Utc;
use dcache_core::{Snapshot, SnapshotMeta, StorageError, StorageResult};
use dcache_raft::SnapshotStore;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.bin";
const TMP_SUFFIX: &str = ".tmp";

/// Number of snapshots kept by default
pub const DEFAULT_RETAIN: usize = 2;

/// Contents of `meta.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileMeta {
    #[serde(flatten)]
    meta: SnapshotMeta,
    size: u64,
    created_at: i64,
}

/// Snapshot directory name parsed into its sort key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SnapshotName {
    term: u64,
    index: u64,
    created_at: i64,
}

impl SnapshotName {
    fn parse(name: &str) -> Option<Self> {
        let mut parts = name.splitn(3, '-');
        Some(Self {
            term: parts.next()?.parse().ok()?,
            index: parts.next()?.parse().ok()?,
            created_at: parts.next()?.parse().ok()?,
        })
    }

    fn dir_name(&self) -> String {
        format!("{}-{}-{}", self.term, self.index, self.created_at)
    }
}

/// Snapshot store that keeps the newest `retain` snapshots in a directory
pub struct FileSnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl FileSnapshotStore {
    /// Open the store at `dir`, removing leftovers of interrupted writes
    pub fn open(dir: impl Into<PathBuf>, retain: usize) -> StorageResult<Self> {
        let dir = dir.into();
        if retain == 0 {
            return Err(StorageError::Backend("snapshot retain count must be at least 1".to_string()));
        }
        fs::create_dir_all(&dir)?;

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() && path.to_string_lossy().ends_with(TMP_SUFFIX) {
                warn!("Removing incomplete snapshot {:?}", path);
                fs::remove_dir_all(&path)?;
            }
        }

        info!("Opened snapshot store at {:?} (retain {})", dir, retain);
        Ok(Self { dir, retain })
    }

    /// Metadata of every stored snapshot, newest first
    pub fn list(&self) -> StorageResult<Vec<SnapshotMeta>> {
        let mut metas = Vec::new();
        for name in self.names()? {
            match self.read_meta(&name) {
                Ok(file_meta) => metas.push(file_meta.meta),
                Err(e) => warn!("Skipping unreadable snapshot {}: {}", name.dir_name(), e),
            }
        }
        Ok(metas)
    }

    /// Completed snapshot directories, newest first
    fn names(&self) -> StorageResult<Vec<SnapshotName>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str().and_then(SnapshotName::parse) {
                names.push(name);
            }
        }
        names.sort_by(|a, b| b.cmp(a));
        Ok(names)
    }

    fn read_meta(&self, name: &SnapshotName) -> StorageResult<FileMeta> {
        let bytes = fs::read(self.dir.join(name.dir_name()).join(META_FILE))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn read(&self, name: &SnapshotName) -> StorageResult<Snapshot> {
        let file_meta = self.read_meta(name)?;
        let data = fs::read(self.dir.join(name.dir_name()).join(STATE_FILE))?;
        if data.len() as u64 != file_meta.size {
            return Err(StorageError::Corrupt(format!(
                "snapshot {} has {} bytes, expected {}",
                name.dir_name(),
                data.len(),
                file_meta.size
            )));
        }
        Ok(Snapshot {
            meta: file_meta.meta,
            data,
        })
    }

    /// Delete all but the newest `retain` snapshots
    fn prune(&self) -> StorageResult<()> {
        for name in self.names()?.into_iter().skip(self.retain) {
            let path = self.dir.join(name.dir_name());
            debug!("Removing old snapshot {:?}", path);
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, snapshot: &Snapshot) -> StorageResult<()> {
        let id = snapshot.meta.last_included;
        let name = SnapshotName {
            term: id.term,
            index: id.index,
            created_at: Utc::now().timestamp_millis(),
        };
        let final_path = self.dir.join(name.dir_name());
        let tmp_path = self.dir.join(format!("{}{}", name.dir_name(), TMP_SUFFIX));
        if tmp_path.exists() {
            fs::remove_dir_all(&tmp_path)?;
        }
        fs::create_dir_all(&tmp_path)?;

        let file_meta = FileMeta {
            meta: snapshot.meta.clone(),
            size: snapshot.data.len() as u64,
            created_at: name.created_at,
        };
        write_synced(&tmp_path.join(STATE_FILE), &snapshot.data)?;
        write_synced(&tmp_path.join(META_FILE), &serde_json::to_vec_pretty(&file_meta)?)?;

        if final_path.exists() {
            fs::remove_dir_all(&final_path)?;
        }
        fs::rename(&tmp_path, &final_path)?;
        File::open(&self.dir)?.sync_all()?;

        info!("Saved snapshot {} to {:?}", id, final_path);
        self.prune()
    }

    fn latest(&self) -> StorageResult<Option<Snapshot>> {
        for name in self.names()? {
            match self.read(&name) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => warn!("Skipping unreadable snapshot {}: {}", name.dir_name(), e),
            }
        }
        Ok(None)
    }

    fn latest_meta(&self) -> StorageResult<Option<SnapshotMeta>> {
        Ok(self.list()?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcache_core::{Configuration, LogId, Server};
    use tempfile::TempDir;

    fn snapshot(term: u64, index: u64, data: &[u8]) -> Snapshot {
        Snapshot {
            meta: SnapshotMeta {
                last_included: LogId::new(term, index),
                configuration: Configuration::new(vec![Server::voter("node0", "127.0.0.1:7000")]),
                configuration_index: 1,
            },
            data: data.to_vec(),
        }
    }

    #[test]
    fn test_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::open(dir.path(), DEFAULT_RETAIN).unwrap();
        assert!(store.latest().unwrap().is_none());
        assert!(store.latest_meta().unwrap().is_none());
    }

    #[test]
    fn test_latest_is_highest_index() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::open(dir.path(), 3).unwrap();
        store.save(&snapshot(1, 10, b"ten")).unwrap();
        store.save(&snapshot(2, 30, b"thirty")).unwrap();
        store.save(&snapshot(2, 20, b"twenty")).unwrap();

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.meta.last_included, LogId::new(2, 30));
        assert_eq!(latest.data, b"thirty");
        assert_eq!(latest.meta.configuration.voter_count(), 1);
    }

    #[test]
    fn test_prunes_to_retain_count() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::open(dir.path(), 2).unwrap();
        for index in 1..=5 {
            store.save(&snapshot(1, index * 10, b"state")).unwrap();
        }

        let indexes: Vec<u64> = store.list().unwrap().iter().map(|m| m.last_included.index).collect();
        assert_eq!(indexes, vec![50, 40]);
    }

    #[test]
    fn test_truncated_state_falls_back_to_older() {
        let dir = TempDir::new().unwrap();
        let store = FileSnapshotStore::open(dir.path(), 2).unwrap();
        store.save(&snapshot(1, 10, b"older")).unwrap();
        store.save(&snapshot(1, 20, b"newer")).unwrap();

        let newest = store.names().unwrap().remove(0);
        fs::write(dir.path().join(newest.dir_name()).join(STATE_FILE), b"ne").unwrap();

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.meta.last_included.index, 10);
        assert_eq!(latest.data, b"older");
    }

    #[test]
    fn test_incomplete_write_is_ignored_and_cleaned() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileSnapshotStore::open(dir.path(), 2).unwrap();
            store.save(&snapshot(1, 10, b"good")).unwrap();
        }
        let tmp = dir.path().join(format!("1-99-0{}", TMP_SUFFIX));
        fs::create_dir_all(&tmp).unwrap();
        fs::write(tmp.join(STATE_FILE), b"partial").unwrap();

        let store = FileSnapshotStore::open(dir.path(), 2).unwrap();
        assert!(!tmp.exists());
        assert_eq!(store.latest().unwrap().unwrap().meta.last_included.index, 10);
    }

    #[test]
    fn test_zero_retain_is_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(FileSnapshotStore::open(dir.path(), 0).is_err());
    }
}
