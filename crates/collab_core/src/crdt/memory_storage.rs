//! In-memory storage implementation.
//!
//! This provides a simple in-memory implementation of [`DocumentStore`]
//! for tests, development, and servers started without a database path.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;

use super::storage::{DocumentStore, StorageResult, poisoned};
use super::types::{StoredUpdate, UpdateOrigin};
use crate::versions::{NewVersion, VersionInfo, VersionSnapshot};

#[derive(Debug, Default)]
struct DocRecord {
    updates: Vec<StoredUpdate>,
    versions: Vec<VersionSnapshot>,
}

/// In-memory document store.
///
/// All data lives in one `RwLock`-protected map, so version numbering is
/// atomic. Data is lost when dropped.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    docs: Arc<RwLock<HashMap<String, DocRecord>>>,

    /// Counter for generating update IDs
    next_id: Arc<RwLock<i64>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_update_id(&self) -> StorageResult<i64> {
        let mut id = self.next_id.write().map_err(poisoned)?;
        *id += 1;
        Ok(*id)
    }
}

impl DocumentStore for MemoryStore {
    fn list_docs(&self) -> StorageResult<Vec<String>> {
        let docs = self.docs.read().map_err(poisoned)?;
        let mut names: Vec<String> = docs.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> StorageResult<i64> {
        let id = self.next_update_id()?;
        let stored = StoredUpdate {
            update_id: id,
            doc_name: name.to_string(),
            data: update.to_vec(),
            timestamp: Utc::now().timestamp_millis(),
            origin,
        };

        let mut docs = self.docs.write().map_err(poisoned)?;
        docs.entry(name.to_string()).or_default().updates.push(stored);

        Ok(id)
    }

    fn get_updates_since(&self, name: &str, since_id: i64) -> StorageResult<Vec<StoredUpdate>> {
        let docs = self.docs.read().map_err(poisoned)?;
        Ok(docs
            .get(name)
            .map(|doc| {
                doc.updates
                    .iter()
                    .filter(|u| u.update_id > since_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_latest_update_id(&self, name: &str) -> StorageResult<i64> {
        let docs = self.docs.read().map_err(poisoned)?;
        Ok(docs
            .get(name)
            .and_then(|doc| doc.updates.last())
            .map(|u| u.update_id)
            .unwrap_or(0))
    }

    fn compact(&self, name: &str, merged: &[u8], up_to_id: i64) -> StorageResult<()> {
        let id = self.next_update_id()?;
        let mut docs = self.docs.write().map_err(poisoned)?;
        let Some(doc) = docs.get_mut(name) else {
            return Ok(());
        };
        doc.updates.retain(|u| u.update_id > up_to_id);
        doc.updates.push(StoredUpdate {
            update_id: id,
            doc_name: name.to_string(),
            data: merged.to_vec(),
            timestamp: Utc::now().timestamp_millis(),
            origin: UpdateOrigin::Sync,
        });
        Ok(())
    }

    fn insert_version(&self, name: &str, version: NewVersion) -> StorageResult<VersionSnapshot> {
        let mut docs = self.docs.write().map_err(poisoned)?;
        let doc = docs.entry(name.to_string()).or_default();
        let number = doc.versions.last().map(|v| v.version).unwrap_or(0) + 1;
        let snapshot = version.into_snapshot(number, Utc::now());
        doc.versions.push(snapshot.clone());
        Ok(snapshot)
    }

    fn list_versions(&self, name: &str) -> StorageResult<Vec<VersionInfo>> {
        let docs = self.docs.read().map_err(poisoned)?;
        Ok(docs
            .get(name)
            .map(|doc| doc.versions.iter().map(VersionSnapshot::info).collect())
            .unwrap_or_default())
    }

    fn get_version(&self, name: &str, version: u64) -> StorageResult<Option<VersionSnapshot>> {
        let docs = self.docs.read().map_err(poisoned)?;
        Ok(docs
            .get(name)
            .and_then(|doc| doc.versions.iter().find(|v| v.version == version))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::StateVector;
    use crate::model::DocumentNode;

    fn draft(name: &str) -> NewVersion {
        NewVersion::new(
            Some(name.to_string()),
            "user-1",
            DocumentNode::empty_doc(),
            &StateVector::new(),
        )
    }

    #[test]
    fn test_append_and_get_updates() {
        let storage = MemoryStore::new();

        let id1 = storage.append_update("test", b"update1", UpdateOrigin::Local).unwrap();
        let id2 = storage.append_update("test", b"update2", UpdateOrigin::Remote).unwrap();
        let id3 = storage.append_update("test", b"update3", UpdateOrigin::Sync).unwrap();

        assert!(id1 < id2);
        assert!(id2 < id3);

        let all = storage.get_all_updates("test").unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].origin, UpdateOrigin::Local);
        assert_eq!(all[1].origin, UpdateOrigin::Remote);

        let since_id1 = storage.get_updates_since("test", id1).unwrap();
        assert_eq!(since_id1.len(), 2);
        assert_eq!(storage.get_latest_update_id("test").unwrap(), id3);
        assert_eq!(storage.get_latest_update_id("other").unwrap(), 0);
    }

    #[test]
    fn test_compact_replaces_old_updates() {
        let storage = MemoryStore::new();
        storage.append_update("doc", b"a", UpdateOrigin::Remote).unwrap();
        let id2 = storage.append_update("doc", b"b", UpdateOrigin::Remote).unwrap();
        storage.append_update("doc", b"c", UpdateOrigin::Remote).unwrap();

        storage.compact("doc", b"ab", id2).unwrap();

        let data: Vec<Vec<u8>> = storage
            .get_all_updates("doc")
            .unwrap()
            .into_iter()
            .map(|u| u.data)
            .collect();
        assert_eq!(data, vec![b"c".to_vec(), b"ab".to_vec()]);
        assert_eq!(storage.update_count("doc").unwrap(), 2);
    }

    #[test]
    fn test_version_numbers_are_monotonic_per_doc() {
        let storage = MemoryStore::new();
        assert_eq!(storage.insert_version("a", draft("one")).unwrap().version, 1);
        assert_eq!(storage.insert_version("a", draft("two")).unwrap().version, 2);
        assert_eq!(storage.insert_version("b", draft("other")).unwrap().version, 1);

        let listed: Vec<u64> = storage
            .list_versions("a")
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(listed, vec![1, 2]);
        assert_eq!(
            storage.get_version("a", 2).unwrap().unwrap().name.as_deref(),
            Some("two")
        );
        assert!(storage.get_version("a", 3).unwrap().is_none());
        assert_eq!(storage.list_docs().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_concurrent_inserts_get_distinct_numbers() {
        let storage = MemoryStore::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let storage = storage.clone();
                std::thread::spawn(move || {
                    storage
                        .insert_version("doc", draft(&format!("v{}", i)))
                        .unwrap()
                        .version
                })
            })
            .collect();
        let mut numbers: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        numbers.sort();
        assert_eq!(numbers, (1..=8).collect::<Vec<_>>());
    }
}
