//! Storage abstraction for the durable document log.
//!
//! This module defines the [`DocumentStore`] trait which abstracts over
//! different storage backends (SQLite, in-memory) for persisting change
//! batches and version snapshots.

use super::types::{StoredUpdate, UpdateOrigin};
use crate::error::CollabError;
use crate::versions::{NewVersion, VersionInfo, VersionSnapshot};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, CollabError>;

/// Trait for durable document storage backends.
///
/// # Storage Model
///
/// The store keeps two kinds of data per document:
/// 1. **Update log**: encoded change batches in arrival order. Replaying
///    every update of a document (in any order) rebuilds its replica.
/// 2. **Versions**: append-only named snapshots with monotonic numbers.
pub trait DocumentStore: Send + Sync {
    /// List all document names that have updates or versions.
    fn list_docs(&self) -> StorageResult<Vec<String>>;

    /// Append an encoded change batch to the update log.
    ///
    /// Returns the ID of the newly created update record.
    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> StorageResult<i64>;

    /// Get all updates for a document with an ID greater than `since_id`.
    fn get_updates_since(&self, name: &str, since_id: i64) -> StorageResult<Vec<StoredUpdate>>;

    /// Get all updates for a document.
    fn get_all_updates(&self, name: &str) -> StorageResult<Vec<StoredUpdate>> {
        self.get_updates_since(name, 0)
    }

    /// Get the latest update ID for a document.
    ///
    /// Returns 0 if no updates exist.
    fn get_latest_update_id(&self, name: &str) -> StorageResult<i64>;

    /// Number of update records of a document.
    fn update_count(&self, name: &str) -> StorageResult<usize> {
        Ok(self.get_all_updates(name)?.len())
    }

    /// Replace every update with an ID up to `up_to_id` by one record
    /// holding `merged`, which must contain all of their changes.
    fn compact(&self, name: &str, merged: &[u8], up_to_id: i64) -> StorageResult<()>;

    /// Store a new version, assigning it the next version number of the
    /// document. Numbering is atomic: concurrent inserts get distinct,
    /// increasing numbers.
    fn insert_version(&self, name: &str, version: NewVersion) -> StorageResult<VersionSnapshot>;

    /// All versions of a document in ascending version order.
    fn list_versions(&self, name: &str) -> StorageResult<Vec<VersionInfo>>;

    /// A single version, `None` if the number is unknown.
    fn get_version(&self, name: &str, version: u64) -> StorageResult<Option<VersionSnapshot>>;
}

/// Map a poisoned lock to a storage error.
pub(crate) fn poisoned<T>(_: std::sync::PoisonError<T>) -> CollabError {
    CollabError::Storage("storage lock poisoned".to_string())
}
