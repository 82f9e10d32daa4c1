//! The durable snapshot service seen from a client.
//!
//! ## Object safety
//!
//! `SnapshotService` is used behind `Arc<dyn SnapshotService>` by the
//! [`VersionManager`](super::VersionManager), so every method returns a
//! boxed future.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::snapshot::{NewVersion, VersionInfo, VersionSnapshot};
use crate::crdt::DocumentStore;
use crate::error::{CollabError, Result};

/// A boxed future for object-safe async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[cfg(test)]
pub(crate) fn block_on_test<F: Future>(f: F) -> F::Output {
    futures_lite::future::block_on(f)
}

/// Create, list and fetch immutable document versions.
pub trait SnapshotService: Send + Sync {
    /// Store a new version. The service assigns the next number.
    fn create_version<'a>(
        &'a self,
        document: &'a str,
        version: NewVersion,
    ) -> BoxFuture<'a, Result<VersionSnapshot>>;

    /// All versions in ascending order.
    fn list_versions<'a>(&'a self, document: &'a str) -> BoxFuture<'a, Result<Vec<VersionInfo>>>;

    /// One version with its content. Unknown numbers fail with
    /// [`CollabError::VersionNotFound`].
    fn fetch_version<'a>(
        &'a self,
        document: &'a str,
        version: u64,
    ) -> BoxFuture<'a, Result<VersionSnapshot>>;
}

/// Snapshot service backed directly by a [`DocumentStore`].
///
/// Used by the server behind its REST endpoints and by tests as an
/// in-process service.
#[derive(Clone)]
pub struct StoreSnapshotService {
    store: Arc<dyn DocumentStore>,
}

impl StoreSnapshotService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }
}

impl SnapshotService for StoreSnapshotService {
    fn create_version<'a>(
        &'a self,
        document: &'a str,
        version: NewVersion,
    ) -> BoxFuture<'a, Result<VersionSnapshot>> {
        Box::pin(async move {
            let snapshot = self.store.insert_version(document, version)?;
            log::debug!(
                "[Versions] stored version {} of '{}'",
                snapshot.version,
                document
            );
            Ok(snapshot)
        })
    }

    fn list_versions<'a>(&'a self, document: &'a str) -> BoxFuture<'a, Result<Vec<VersionInfo>>> {
        Box::pin(async move { self.store.list_versions(document) })
    }

    fn fetch_version<'a>(
        &'a self,
        document: &'a str,
        version: u64,
    ) -> BoxFuture<'a, Result<VersionSnapshot>> {
        Box::pin(async move {
            self.store
                .get_version(document, version)?
                .ok_or(CollabError::VersionNotFound(version))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{MemoryStore, StateVector};
    use crate::model::DocumentNode;

    #[test]
    fn test_store_service_numbers_and_fetches() {
        let service = StoreSnapshotService::new(Arc::new(MemoryStore::new()));
        let new = || NewVersion::new(None, "u1", DocumentNode::empty_doc(), &StateVector::new());

        block_on_test(async {
            let first = service.create_version("doc", new()).await.unwrap();
            let second = service.create_version("doc", new()).await.unwrap();
            assert_eq!((first.version, second.version), (1, 2));

            let listed = service.list_versions("doc").await.unwrap();
            assert_eq!(listed.iter().map(|v| v.version).collect::<Vec<_>>(), [1, 2]);

            assert!(matches!(
                service.fetch_version("doc", 9).await,
                Err(CollabError::VersionNotFound(9))
            ));
        });
    }
}
