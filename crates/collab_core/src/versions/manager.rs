//! Version history of one document session.
//!
//! [`VersionManager`] talks to a [`SnapshotService`] and keeps the local
//! session state around it: what was last saved, the preview panel, and
//! the auto-versioning toggle. Capturing the live document is the caller's
//! job (see `EditorSession`); the manager only receives a [`Capture`].
//!
//! Preview requests hand out a [`PreviewHandle`]. Starting a new preview
//! or closing the panel cancels the previous handle, and a fetch that
//! completes for a cancelled handle reports [`PreviewOutcome::Superseded`]
//! instead of replacing what is shown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use super::service::SnapshotService;
use super::snapshot::{NewVersion, VersionInfo, VersionSnapshot};
use crate::crdt::{StateVector, poisoned};
use crate::error::{CollabError, Result};
use crate::model::DocumentNode;
use crate::sync::ConnectionStatus;

/// Default auto-versioning interval (30 seconds).
pub const DEFAULT_AUTO_VERSION_INTERVAL_MS: i64 = 30_000;

/// The live document at the moment a version is saved.
#[derive(Debug, Clone)]
pub struct Capture {
    pub content: DocumentNode,
    pub state_vector: StateVector,
    pub status: ConnectionStatus,
    pub author_id: String,
}

/// Cancellable handle of one preview request.
#[derive(Debug, Clone)]
pub struct PreviewHandle {
    token: Uuid,
    version: u64,
    cancelled: Arc<AtomicBool>,
}

impl PreviewHandle {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Result of a preview fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum PreviewOutcome {
    /// Render this read-only.
    Ready(VersionSnapshot),
    /// A newer request or `close_preview` replaced this one. Discard.
    Superseded,
    /// The fetch failed; the panel shows the version as unavailable.
    Unavailable(String),
}

/// What the preview panel currently shows.
#[derive(Debug, Clone, PartialEq)]
pub enum PreviewState {
    Idle,
    Loading { version: u64 },
    Showing { version: u64 },
    Unavailable { version: u64 },
}

/// A fetched revert target waiting for the user's confirmation.
#[derive(Debug, Clone)]
pub struct RevertRequest {
    snapshot: VersionSnapshot,
}

impl RevertRequest {
    pub fn version(&self) -> u64 {
        self.snapshot.version
    }

    pub fn snapshot(&self) -> &VersionSnapshot {
        &self.snapshot
    }

    /// The user confirmed the revert.
    pub fn confirm(self) -> ConfirmedRevert {
        ConfirmedRevert {
            snapshot: self.snapshot,
        }
    }
}

/// A revert the user confirmed. Only this type can be applied.
#[derive(Debug, Clone)]
pub struct ConfirmedRevert {
    snapshot: VersionSnapshot,
}

impl ConfirmedRevert {
    pub fn version(&self) -> u64 {
        self.snapshot.version
    }

    pub fn target(&self) -> &DocumentNode {
        &self.snapshot.content
    }
}

struct ManagerState {
    /// State vector of the last local save
    last_saved: Option<StateVector>,
    last_version: Option<u64>,
    last_save_ms: i64,
    auto_enabled: bool,
    preview: PreviewState,
    preview_handle: Option<PreviewHandle>,
}

pub struct VersionManager {
    service: Arc<dyn SnapshotService>,
    document: String,
    auto_interval_ms: i64,
    state: Mutex<ManagerState>,
}

impl std::fmt::Debug for VersionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionManager")
            .field("document", &self.document)
            .field("auto_interval_ms", &self.auto_interval_ms)
            .finish()
    }
}

impl VersionManager {
    pub fn new(
        service: Arc<dyn SnapshotService>,
        document: impl Into<String>,
        auto_interval_ms: i64,
        auto_enabled: bool,
    ) -> Self {
        Self {
            service,
            document: document.into(),
            auto_interval_ms,
            state: Mutex::new(ManagerState {
                last_saved: None,
                last_version: None,
                last_save_ms: Utc::now().timestamp_millis(),
                auto_enabled,
                preview: PreviewState::Idle,
                preview_handle: None,
            }),
        }
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ManagerState>> {
        self.state.lock().map_err(poisoned)
    }

    /// Whether the capture differs from the last local save.
    pub fn has_unsaved_changes(&self, state_vector: &StateVector) -> Result<bool> {
        let state = self.lock()?;
        Ok(match &state.last_saved {
            Some(saved) => saved != state_vector,
            None => !state_vector.is_empty(),
        })
    }

    // ------------------------------------------------------------------
    // Save / list
    // ------------------------------------------------------------------

    /// Save the capture as the next version.
    ///
    /// Fails with [`CollabError::NotConnected`] below `Connected`, and with
    /// [`CollabError::EmptyDocument`] when nothing changed since the last
    /// save of this session.
    pub async fn save_version(&self, name: Option<String>, capture: Capture) -> Result<VersionInfo> {
        if !capture.status.is_connected() {
            return Err(CollabError::NotConnected);
        }
        {
            let state = self.lock()?;
            if state.last_saved.as_ref() == Some(&capture.state_vector) {
                return Err(CollabError::EmptyDocument {
                    since_version: state.last_version,
                });
            }
        }

        let new = NewVersion::new(
            name,
            capture.author_id,
            capture.content,
            &capture.state_vector,
        );
        let snapshot = self.service.create_version(&self.document, new).await?;

        let mut state = self.lock()?;
        state.last_saved = Some(capture.state_vector);
        state.last_version = Some(snapshot.version);
        state.last_save_ms = Utc::now().timestamp_millis();
        log::info!(
            "[Versions] saved version {} of '{}'",
            snapshot.version,
            self.document
        );
        Ok(snapshot.info())
    }

    /// All versions, oldest first.
    pub async fn list_versions(&self) -> Result<Vec<VersionInfo>> {
        let mut versions = self.service.list_versions(&self.document).await?;
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }

    // ------------------------------------------------------------------
    // Preview
    // ------------------------------------------------------------------

    pub fn preview_state(&self) -> Result<PreviewState> {
        Ok(self.lock()?.preview.clone())
    }

    /// Start previewing `version`, superseding any earlier request.
    pub fn begin_preview(&self, version: u64) -> Result<PreviewHandle> {
        let handle = PreviewHandle {
            token: Uuid::new_v4(),
            version,
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        let mut state = self.lock()?;
        if let Some(previous) = state.preview_handle.replace(handle.clone()) {
            previous.cancel();
        }
        state.preview = PreviewState::Loading { version };
        Ok(handle)
    }

    /// Fetch the content for a preview handle.
    pub async fn fetch_preview(&self, handle: &PreviewHandle) -> Result<PreviewOutcome> {
        let fetched = self
            .service
            .fetch_version(&self.document, handle.version)
            .await;

        let mut state = self.lock()?;
        let current = state
            .preview_handle
            .as_ref()
            .is_some_and(|h| h.token == handle.token);
        if !current || handle.is_cancelled() {
            log::debug!(
                "[Versions] discarding stale preview of version {}",
                handle.version
            );
            return Ok(PreviewOutcome::Superseded);
        }
        Ok(match fetched {
            Ok(snapshot) => {
                state.preview = PreviewState::Showing {
                    version: handle.version,
                };
                PreviewOutcome::Ready(snapshot)
            }
            Err(e) => {
                log::warn!(
                    "[Versions] preview of version {} unavailable: {}",
                    handle.version,
                    e
                );
                state.preview = PreviewState::Unavailable {
                    version: handle.version,
                };
                PreviewOutcome::Unavailable(e.to_string())
            }
        })
    }

    /// Begin and fetch in one call.
    pub async fn preview_version(&self, version: u64) -> Result<PreviewOutcome> {
        let handle = self.begin_preview(version)?;
        self.fetch_preview(&handle).await
    }

    /// Return to idle, cancelling any outstanding request.
    pub fn close_preview(&self) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(handle) = state.preview_handle.take() {
            handle.cancel();
        }
        state.preview = PreviewState::Idle;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Revert
    // ------------------------------------------------------------------

    /// Fetch the revert target. The returned request must be confirmed
    /// before anything is applied.
    pub async fn request_revert(&self, version: u64) -> Result<RevertRequest> {
        let snapshot = self.service.fetch_version(&self.document, version).await?;
        Ok(RevertRequest { snapshot })
    }

    // ------------------------------------------------------------------
    // Auto-versioning
    // ------------------------------------------------------------------

    pub fn auto_versioning_enabled(&self) -> Result<bool> {
        Ok(self.lock()?.auto_enabled)
    }

    pub fn set_auto_versioning(&self, enabled: bool) -> Result<()> {
        let mut state = self.lock()?;
        if state.auto_enabled != enabled {
            log::debug!("[Versions] auto-versioning {}", if enabled { "on" } else { "off" });
        }
        state.auto_enabled = enabled;
        Ok(())
    }

    /// Enabled, connected, the interval elapsed since the last save, and
    /// the document changed since then.
    pub fn auto_version_due(
        &self,
        state_vector: &StateVector,
        status: ConnectionStatus,
        now_ms: i64,
    ) -> Result<bool> {
        let state = self.lock()?;
        if !state.auto_enabled || !status.is_connected() {
            return Ok(false);
        }
        if now_ms - state.last_save_ms < self.auto_interval_ms {
            return Ok(false);
        }
        Ok(match &state.last_saved {
            Some(saved) => saved != state_vector,
            None => !state_vector.is_empty(),
        })
    }

    /// Save if the policy says so. Nothing to save is not an error here.
    pub async fn auto_save(&self, capture: Capture, now_ms: i64) -> Result<Option<VersionInfo>> {
        if !self.auto_version_due(&capture.state_vector, capture.status, now_ms)? {
            return Ok(None);
        }
        match self.save_version(None, capture).await {
            Ok(info) => Ok(Some(info)),
            Err(CollabError::EmptyDocument { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{MemoryStore, ReplicaId};
    use crate::versions::service::{StoreSnapshotService, block_on_test};

    fn manager() -> VersionManager {
        let service = StoreSnapshotService::new(Arc::new(MemoryStore::new()));
        VersionManager::new(Arc::new(service), "doc", 1_000, false)
    }

    fn capture(seq: u64, status: ConnectionStatus) -> Capture {
        let sv: StateVector = [(ReplicaId(1), seq)].into_iter().collect();
        Capture {
            content: DocumentNode::empty_doc(),
            state_vector: sv,
            status,
            author_id: "u1".into(),
        }
    }

    #[test]
    fn test_save_requires_connection() {
        let m = manager();
        let result = block_on_test(m.save_version(None, capture(1, ConnectionStatus::Connecting)));
        assert!(matches!(result, Err(CollabError::NotConnected)));
    }

    #[test]
    fn test_unchanged_save_is_empty() {
        let m = manager();
        block_on_test(async {
            let v1 = m
                .save_version(Some("a".into()), capture(1, ConnectionStatus::Synced))
                .await
                .unwrap();
            assert_eq!(v1.version, 1);
            let again = m.save_version(None, capture(1, ConnectionStatus::Synced)).await;
            assert!(matches!(
                again,
                Err(CollabError::EmptyDocument {
                    since_version: Some(1)
                })
            ));
            let v2 = m
                .save_version(None, capture(2, ConnectionStatus::Connected))
                .await
                .unwrap();
            assert_eq!(v2.version, 2);
        });
    }

    #[test]
    fn test_superseded_preview_is_discarded() {
        let m = manager();
        block_on_test(async {
            m.save_version(None, capture(1, ConnectionStatus::Synced))
                .await
                .unwrap();
            let first = m.begin_preview(1).unwrap();
            let second = m.begin_preview(1).unwrap();
            assert!(first.is_cancelled());
            assert_eq!(
                m.fetch_preview(&first).await.unwrap(),
                PreviewOutcome::Superseded
            );
            assert!(matches!(
                m.fetch_preview(&second).await.unwrap(),
                PreviewOutcome::Ready(_)
            ));
            assert_eq!(
                m.preview_state().unwrap(),
                PreviewState::Showing { version: 1 }
            );

            m.close_preview().unwrap();
            assert!(second.is_cancelled());
            assert_eq!(m.preview_state().unwrap(), PreviewState::Idle);
        });
    }

    #[test]
    fn test_preview_unknown_version_is_unavailable() {
        let m = manager();
        let outcome = block_on_test(m.preview_version(42)).unwrap();
        assert!(matches!(outcome, PreviewOutcome::Unavailable(_)));
        assert_eq!(
            m.preview_state().unwrap(),
            PreviewState::Unavailable { version: 42 }
        );
    }

    #[test]
    fn test_revert_unknown_version() {
        let m = manager();
        assert!(matches!(
            block_on_test(m.request_revert(3)),
            Err(CollabError::VersionNotFound(3))
        ));
    }

    #[test]
    fn test_auto_versioning_policy() {
        let m = manager();
        let later = Utc::now().timestamp_millis() + 5_000;
        let sv = capture(1, ConnectionStatus::Synced).state_vector;

        assert!(!m.auto_version_due(&sv, ConnectionStatus::Synced, later).unwrap());
        m.set_auto_versioning(true).unwrap();
        assert!(m.auto_version_due(&sv, ConnectionStatus::Synced, later).unwrap());
        assert!(
            !m.auto_version_due(&sv, ConnectionStatus::Disconnected, later)
                .unwrap()
        );
        assert!(
            !m.auto_version_due(&StateVector::new(), ConnectionStatus::Synced, later)
                .unwrap()
        );

        block_on_test(async {
            let saved = m
                .auto_save(capture(1, ConnectionStatus::Synced), later)
                .await
                .unwrap();
            assert_eq!(saved.map(|v| v.version), Some(1));
            // Nothing changed since: skipped without an error.
            let skipped = m
                .auto_save(capture(1, ConnectionStatus::Synced), later + 10_000)
                .await
                .unwrap();
            assert!(skipped.is_none());
        });
    }
}
