//! In-memory key-value store mutated by the applier

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StorageResult;

/// Thread-safe string map.
///
/// Cloning is cheap and shares the underlying map, so the HTTP layer can
/// read from the same store the applier writes to.
#[derive(Debug, Clone, Default)]
pub struct KvStore {
    data: Arc<RwLock<HashMap<String, String>>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value for `key`, or an empty string when absent
    pub fn get(&self, key: &str) -> String {
        self.data.read().get(key).cloned().unwrap_or_default()
    }

    pub fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        self.data.write().insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Serialize the whole map for a snapshot
    pub fn marshal(&self) -> StorageResult<Vec<u8>> {
        let data = self.data.read();
        Ok(serde_json::to_vec(&*data)?)
    }

    /// Replace the whole map with a serialized image
    pub fn unmarshal(&self, bytes: &[u8]) -> StorageResult<()> {
        let restored: HashMap<String, String> = if bytes.is_empty() {
            HashMap::new()
        } else {
            serde_json::from_slice(bytes)?
        };
        *self.data.write() = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_get_missing_key_is_empty() {
        let store = KvStore::new();
        assert_eq!(store.get("nope"), "");
        store.put("k", "v");
        assert_eq!(store.get("k"), "v");
    }

    #[test]
    fn test_clone_shares_data() {
        let store = KvStore::new();
        let reader = store.clone();
        store.put("a", "1");
        assert_eq!(reader.get("a"), "1");
    }

    #[test]
    fn test_unmarshal_replaces_contents() {
        let source = KvStore::new();
        source.put("a", "1");
        let image = source.marshal().unwrap();

        let target = KvStore::new();
        target.put("stale", "x");
        target.unmarshal(&image).unwrap();
        assert_eq!(target.get("a"), "1");
        assert_eq!(target.get("stale"), "");
        assert_eq!(target.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_snapshot_restores_last_write_wins(
            writes in proptest::collection::vec(("[a-d]{1,2}", "[a-z0-9]{0,8}"), 0..40)
        ) {
            let store = KvStore::new();
            let mut expected = HashMap::new();
            for (k, v) in &writes {
                store.put(k.clone(), v.clone());
                expected.insert(k.clone(), v.clone());
            }

            let restored = KvStore::new();
            restored.unmarshal(&store.marshal().unwrap()).unwrap();
            prop_assert_eq!(restored.len(), expected.len());
            for (k, v) in &expected {
                prop_assert_eq!(restored.get(k), v.clone());
            }
        }
    }
}
