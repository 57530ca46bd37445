//! On-disk storage for dcache nodes
//!
//! - [`RocksStore`]: the Raft log and hard state in RocksDB
//! - [`FileSnapshotStore`]: snapshots as synced directories on disk

mod rocks;
mod snapshot;

pub use rocks::RocksStore;
pub use snapshot::{FileSnapshotStore, DEFAULT_RETAIN};

use dcache_core::StorageResult;
use dcache_raft::RaftStorage;
use std::path::Path;
use std::sync::Arc;

/// Open the stores for a node rooted at `data_dir`: `raft/` for the log and
/// `snapshots/` for snapshots
pub fn open_storage(data_dir: impl AsRef<Path>, retain: usize) -> StorageResult<RaftStorage> {
    let data_dir = data_dir.as_ref();
    let rocks = Arc::new(RocksStore::open(data_dir.join("raft"))?);
    let snapshots = Arc::new(FileSnapshotStore::open(data_dir.join("snapshots"), retain)?);
    Ok(RaftStorage {
        log: rocks.clone(),
        stable: rocks,
        snapshots,
    })
}
