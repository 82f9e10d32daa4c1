//! One open document, as seen by an editor host.
//!
//! [`EditorSession`] ties together the sync session, undo history, version
//! history and presence of a document. Every method takes `&self`; state
//! lives behind locks so that a transport driver, timers and the UI can
//! share the session through an `Arc`. No lock is held across an `.await`.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::Serialize;

use crate::awareness::AwarenessEntry;
use crate::config::{CollabConfig, EditorCapabilities};
use crate::crdt::{StateVector, poisoned};
use crate::error::{CollabError, Result};
use crate::identity::{ProjectMetadata, UserIdentity};
use crate::model::{DocumentNode, Operation, Position, UndoManager, diff};
use crate::sync::{ConnectionStatus, SessionEvent, SessionOptions, StatelessMessage, SyncSession};
use crate::versions::{
    Capture, ConfirmedRevert, PreviewHandle, PreviewOutcome, PreviewState, RevertRequest,
    SnapshotService, VersionInfo, VersionManager,
};

/// Callback receiving session events.
pub type EventCallback = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Called when frames are waiting to be sent.
pub type OutboundWaker = Arc<dyn Fn() + Send + Sync>;

/// What a full revert did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevertOutcome {
    /// Version capturing unsaved changes before the revert
    pub backup: Option<VersionInfo>,
    /// Number of operations applied
    pub applied: usize,
    /// Version capturing the reverted document
    pub saved: Option<VersionInfo>,
}

pub struct EditorSession {
    config: CollabConfig,
    identity: UserIdentity,
    project: ProjectMetadata,
    capabilities: EditorCapabilities,
    session: Mutex<SyncSession>,
    undo: Mutex<UndoManager>,
    versions: VersionManager,
    event_callback: RwLock<Option<EventCallback>>,
    outbound_waker: RwLock<Option<OutboundWaker>>,
}

impl std::fmt::Debug for EditorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditorSession")
            .field("project", &self.project.project_id)
            .field("user", &self.identity.user_id)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl EditorSession {
    /// Open a document of `project` for `identity`.
    ///
    /// Fails with [`CollabError::Authorization`] unless the user is the
    /// owner or a collaborator of the project.
    pub fn new(
        config: CollabConfig,
        identity: UserIdentity,
        project: ProjectMetadata,
        capabilities: EditorCapabilities,
        token: impl Into<String>,
        snapshots: Arc<dyn SnapshotService>,
    ) -> Result<Self> {
        project.authorize(&identity)?;

        let document = config.document_name(&project.project_id);
        let mut options = SessionOptions::new(document.clone(), token);
        options.throttle_ms = config.awareness_throttle_ms;
        options.timeout_ms = config.awareness_timeout_ms;
        options.initial_content = capabilities.initial_content.clone();

        let mut session = SyncSession::new(options);
        if capabilities.cursors {
            session.set_local_user(identity.awareness_user());
        }

        let versions = VersionManager::new(
            snapshots,
            document,
            config.auto_version_interval_ms,
            capabilities.auto_versioning,
        );

        log::info!(
            "[Editor] opened '{}' for {}",
            session.document_name(),
            identity.user_id
        );

        Ok(Self {
            config,
            identity,
            project,
            capabilities,
            session: Mutex::new(session),
            undo: Mutex::new(UndoManager::default()),
            versions,
            event_callback: RwLock::new(None),
            outbound_waker: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    pub fn project(&self) -> &ProjectMetadata {
        &self.project
    }

    pub fn capabilities(&self) -> &EditorCapabilities {
        &self.capabilities
    }

    pub fn versions(&self) -> &VersionManager {
        &self.versions
    }

    fn session(&self) -> Result<MutexGuard<'_, SyncSession>> {
        self.session.lock().map_err(poisoned)
    }

    fn undo_stack(&self) -> Result<MutexGuard<'_, UndoManager>> {
        self.undo.lock().map_err(poisoned)
    }

    /// Run `f` with exclusive access to the sync session, then deliver the
    /// events it produced.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut SyncSession) -> R) -> Result<R> {
        let result = {
            let mut session = self.session()?;
            f(&mut session)
        };
        self.dispatch_events()?;
        Ok(result)
    }

    pub fn document_name(&self) -> Result<String> {
        Ok(self.session()?.document_name().to_string())
    }

    pub fn status(&self) -> Result<ConnectionStatus> {
        Ok(self.session()?.status())
    }

    /// The current merged document.
    pub fn document(&self) -> Result<DocumentNode> {
        Ok(self.session()?.document())
    }

    pub fn state_vector(&self) -> Result<StateVector> {
        Ok(self.session()?.replica().state_vector().clone())
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Set a callback receiving every [`SessionEvent`].
    pub fn set_event_callback(&self, callback: EventCallback) -> Result<()> {
        *self.event_callback.write().map_err(poisoned)? = Some(callback);
        Ok(())
    }

    pub fn clear_event_callback(&self) -> Result<()> {
        *self.event_callback.write().map_err(poisoned)? = None;
        Ok(())
    }

    /// Set the hook telling a transport that frames are waiting.
    pub fn set_outbound_waker(&self, waker: Option<OutboundWaker>) -> Result<()> {
        *self.outbound_waker.write().map_err(poisoned)? = waker;
        Ok(())
    }

    fn wake_outbound(&self) -> Result<()> {
        let waker = self.outbound_waker.read().map_err(poisoned)?.clone();
        if let Some(waker) = waker {
            waker();
        }
        Ok(())
    }

    /// Deliver pending session events to the callback. Called with no
    /// session lock held, so callbacks may call back into the editor.
    fn dispatch_events(&self) -> Result<()> {
        let events = self.session()?.drain_events();
        if events.is_empty() {
            return Ok(());
        }
        let callback = self.event_callback.read().map_err(poisoned)?.clone();
        for event in &events {
            if let SessionEvent::Stateless(StatelessMessage::VersionCreated { version }) = event {
                log::debug!("[Editor] peer saved version {}", version);
            }
            if let Some(callback) = &callback {
                callback(event);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Editing
    // ------------------------------------------------------------------

    /// Apply one user action. It becomes one undo group.
    pub fn apply(&self, ops: &[Operation]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        self.session()?.apply_local(ops)?;
        if self.capabilities.undo {
            self.undo_stack()?.record(ops.to_vec());
        }
        self.dispatch_events()?;
        self.wake_outbound()
    }

    pub fn can_undo(&self) -> Result<bool> {
        Ok(self.capabilities.undo && self.undo_stack()?.can_undo())
    }

    pub fn can_redo(&self) -> Result<bool> {
        Ok(self.capabilities.undo && self.undo_stack()?.can_redo())
    }

    /// Undo the last local action. Returns false when there is nothing to
    /// undo.
    pub fn undo(&self) -> Result<bool> {
        self.replay_history(true)
    }

    pub fn redo(&self) -> Result<bool> {
        self.replay_history(false)
    }

    fn replay_history(&self, undo: bool) -> Result<bool> {
        if !self.capabilities.undo {
            return Err(CollabError::Disabled("undo".to_string()));
        }
        let group = {
            let stack = self.undo_stack()?;
            if undo {
                stack.peek_undo()
            } else {
                stack.peek_redo()
            }
        };
        let Some(group) = group else {
            return Ok(false);
        };
        let applied = self.session()?.apply_local(&group);
        let mut stack = self.undo_stack()?;
        match applied {
            Ok(_) if undo => stack.commit_undo(),
            Ok(_) => stack.commit_redo(),
            Err(e) => {
                // Remote edits moved the content the group refers to.
                log::warn!("[Editor] history no longer applies: {}", e);
                stack.clear();
                return Err(e);
            }
        }
        drop(stack);
        self.dispatch_events()?;
        self.wake_outbound()?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// Publish the local selection.
    pub fn set_cursor(&self, anchor: &Position, head: &Position) -> Result<()> {
        if !self.capabilities.cursors {
            return Ok(());
        }
        self.session()?.set_local_cursor(anchor, head)
    }

    /// Remote peers and their resolved selections.
    pub fn remote_cursors(&self) -> Result<Vec<(AwarenessEntry, Option<(Position, Position)>)>> {
        if !self.capabilities.cursors {
            return Ok(Vec::new());
        }
        Ok(self.session()?.remote_cursors())
    }

    /// Run the awareness timers.
    pub fn tick(&self, now_ms: i64) -> Result<()> {
        self.with_session(|s| s.tick(now_ms))
    }

    /// Leave the document. Frames queued here still need to be sent.
    pub fn close(&self) -> Result<()> {
        self.with_session(|s| s.close())?;
        self.versions.close_preview()?;
        self.wake_outbound()
    }

    // ------------------------------------------------------------------
    // Versions
    // ------------------------------------------------------------------

    fn versions_enabled(&self) -> Result<&VersionManager> {
        if self.capabilities.version_history {
            Ok(&self.versions)
        } else {
            Err(CollabError::Disabled("version history".to_string()))
        }
    }

    /// The live document and its state, attributed to the local user.
    pub fn capture(&self) -> Result<Capture> {
        let session = self.session()?;
        Ok(Capture {
            content: session.document(),
            state_vector: session.replica().state_vector().clone(),
            status: session.status(),
            author_id: self.identity.user_id.clone(),
        })
    }

    pub async fn save_version(&self, name: Option<String>) -> Result<VersionInfo> {
        let versions = self.versions_enabled()?;
        let capture = self.capture()?;
        versions.save_version(name, capture).await
    }

    pub async fn list_versions(&self) -> Result<Vec<VersionInfo>> {
        self.versions_enabled()?.list_versions().await
    }

    pub fn begin_preview(&self, version: u64) -> Result<PreviewHandle> {
        self.versions_enabled()?.begin_preview(version)
    }

    pub async fn fetch_preview(&self, handle: &PreviewHandle) -> Result<PreviewOutcome> {
        self.versions_enabled()?.fetch_preview(handle).await
    }

    /// Read-only content of a version. Never touches the live document.
    pub async fn preview_version(&self, version: u64) -> Result<PreviewOutcome> {
        self.versions_enabled()?.preview_version(version).await
    }

    pub fn close_preview(&self) -> Result<()> {
        self.versions.close_preview()
    }

    pub fn preview_state(&self) -> Result<PreviewState> {
        self.versions.preview_state()
    }

    pub async fn request_revert(&self, version: u64) -> Result<RevertRequest> {
        self.versions_enabled()?.request_revert(version).await
    }

    /// Apply a confirmed revert as one new local batch.
    ///
    /// The batch is the difference between the live document and the
    /// target, so history only grows and the revert can be undone.
    pub fn apply_revert(&self, revert: &ConfirmedRevert) -> Result<Vec<Operation>> {
        self.versions_enabled()?;
        let ops = {
            let mut session = self.session()?;
            if !session.status().is_connected() {
                return Err(CollabError::NotConnected);
            }
            let ops = diff(&session.document(), revert.target())?;
            if !ops.is_empty() {
                session.apply_local(&ops)?;
            }
            let announce = StatelessMessage::VersionReverted {
                version: revert.version(),
            };
            if let Err(e) = session.broadcast_stateless(&announce) {
                log::debug!("[Editor] revert not announced: {}", e);
            }
            ops
        };
        if self.capabilities.undo && !ops.is_empty() {
            self.undo_stack()?.record(ops.clone());
        }
        log::info!(
            "[Editor] reverted to version {} ({} operations)",
            revert.version(),
            ops.len()
        );
        self.dispatch_events()?;
        self.wake_outbound()?;
        Ok(ops)
    }

    /// Save unsaved work, apply the revert, then save the result.
    pub async fn revert_to_version(&self, revert: ConfirmedRevert) -> Result<RevertOutcome> {
        let versions = self.versions_enabled()?;
        if !self.status()?.is_connected() {
            return Err(CollabError::NotConnected);
        }
        let version = revert.version();

        let capture = self.capture()?;
        let backup = if versions.has_unsaved_changes(&capture.state_vector)? {
            let name = format!("Unsaved changes before revert to version {}", version);
            tolerate_empty(versions.save_version(Some(name), capture).await)?
        } else {
            None
        };

        let applied = self.apply_revert(&revert)?.len();

        let name = format!("Revert to version {}", version);
        let saved = tolerate_empty(versions.save_version(Some(name), self.capture()?).await)?;

        Ok(RevertOutcome {
            backup,
            applied,
            saved,
        })
    }

    pub fn auto_versioning_enabled(&self) -> Result<bool> {
        self.versions.auto_versioning_enabled()
    }

    pub fn set_auto_versioning(&self, enabled: bool) -> Result<()> {
        self.versions_enabled()?.set_auto_versioning(enabled)
    }

    /// Save a version if the auto-versioning policy is due.
    pub async fn auto_version_tick(&self, now_ms: i64) -> Result<Option<VersionInfo>> {
        if !self.capabilities.version_history {
            return Ok(None);
        }
        let capture = self.capture()?;
        self.versions.auto_save(capture, now_ms).await
    }
}

fn tolerate_empty(result: Result<VersionInfo>) -> Result<Option<VersionInfo>> {
    match result {
        Ok(info) => Ok(Some(info)),
        Err(CollabError::EmptyDocument { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{connect_editor, test_editor};
    use crate::versions::service::block_on_test;

    #[test]
    fn test_non_member_is_rejected() {
        let mut identity = crate::test_utils::identity("u9");
        identity.email = "stranger@example.com".into();
        let result = EditorSession::new(
            CollabConfig::default(),
            identity,
            crate::test_utils::project(),
            EditorCapabilities::default(),
            "t",
            crate::test_utils::snapshot_service(),
        );
        assert!(matches!(result, Err(CollabError::Authorization(_))));
    }

    #[test]
    fn test_undo_and_redo_local_edit() {
        let editor = test_editor("u1");
        connect_editor(&editor);
        let before = editor.document().unwrap();

        editor
            .apply(&[Operation::insert_text(Position::new(vec![1], 0), "hi")])
            .unwrap();
        assert_ne!(editor.document().unwrap(), before);

        assert!(editor.undo().unwrap());
        assert_eq!(editor.document().unwrap(), before);
        assert!(editor.redo().unwrap());
        assert!(editor.document().unwrap().plain_text().contains("hi"));
        assert!(!editor.redo().unwrap());
    }

    #[test]
    fn test_revert_is_blocked_while_disconnected() {
        let editor = test_editor("u1");
        connect_editor(&editor);
        block_on_test(async {
            editor.save_version(Some("v1".into())).await.unwrap();
            let request = editor.request_revert(1).await.unwrap();
            editor.with_session(|s| s.on_close()).unwrap();
            assert!(matches!(
                editor.apply_revert(&request.confirm()),
                Err(CollabError::NotConnected)
            ));
        });
    }

    #[test]
    fn test_revert_to_identical_content_applies_nothing() {
        let editor = test_editor("u1");
        connect_editor(&editor);
        block_on_test(async {
            editor.save_version(Some("v1".into())).await.unwrap();
            let before = editor.document().unwrap();
            let queued = editor.with_session(|s| s.unacknowledged()).unwrap();

            let request = editor.request_revert(1).await.unwrap();
            let ops = editor.apply_revert(&request.confirm()).unwrap();
            assert!(ops.is_empty());
            assert_eq!(editor.document().unwrap(), before);
            assert_eq!(editor.with_session(|s| s.unacknowledged()).unwrap(), queued);
            // Nothing to undo either.
            assert!(!editor.undo().unwrap());
        });
    }

    #[test]
    fn test_events_reach_callback() {
        let editor = test_editor("u1");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        editor
            .set_event_callback(Arc::new(move |event: &SessionEvent| {
                sink.lock().unwrap().push(event.clone());
            }))
            .unwrap();
        connect_editor(&editor);
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&SessionEvent::StatusChanged(ConnectionStatus::Synced)));
        assert!(seen.contains(&SessionEvent::Seeded));
    }

    #[test]
    fn test_disabled_version_history() {
        let editor = crate::test_utils::editor_with(
            "u1",
            EditorCapabilities {
                version_history: false,
                ..EditorCapabilities::default()
            },
        );
        connect_editor(&editor);
        assert!(matches!(
            block_on_test(editor.save_version(None)),
            Err(CollabError::Disabled(_))
        ));
        assert_eq!(block_on_test(editor.auto_version_tick(i64::MAX)).unwrap(), None);
    }
}
