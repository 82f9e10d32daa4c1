//! Test utilities for collab_core
//!
//! This module provides shared testing infrastructure: fixture identities
//! and projects, editor sessions backed by an in-memory snapshot service,
//! and [`LoopbackHub`], an in-process stand-in for the sync service that
//! routes frames between sessions.

use std::sync::Arc;

use crate::config::{CollabConfig, EditorCapabilities};
use crate::crdt::{MemoryStore, ReplicaId, ReplicaState, decode_state_vector, encode_state_vector};
use crate::editor::EditorSession;
use crate::identity::{ProjectMetadata, UserIdentity};
use crate::sync::{AuthMessage, Frame, MessageBody, SyncMessage, SyncSession};
use crate::versions::{SnapshotService, StoreSnapshotService};

/// Fixture user `<id>@example.com`.
pub fn identity(user_id: &str) -> UserIdentity {
    UserIdentity {
        user_id: user_id.to_string(),
        display_name: format!("User {}", user_id),
        avatar_url: None,
        email: format!("{}@example.com", user_id),
    }
}

/// Project owned by u1 with collaborators u2 and u3.
pub fn project() -> ProjectMetadata {
    ProjectMetadata {
        project_id: "project-1".to_string(),
        title: "Test Project".to_string(),
        collaborator_emails: vec!["u2@example.com".to_string(), "U3@Example.com".to_string()],
        owner_email: "u1@example.com".to_string(),
    }
}

/// Snapshot service over a fresh in-memory store.
pub fn snapshot_service() -> Arc<dyn SnapshotService> {
    Arc::new(StoreSnapshotService::new(Arc::new(MemoryStore::new())))
}

pub fn editor_with_service(
    user_id: &str,
    capabilities: EditorCapabilities,
    snapshots: Arc<dyn SnapshotService>,
) -> EditorSession {
    EditorSession::new(
        CollabConfig::default(),
        identity(user_id),
        project(),
        capabilities,
        format!("token-{}", user_id),
        snapshots,
    )
    .unwrap()
}

pub fn editor_with(user_id: &str, capabilities: EditorCapabilities) -> EditorSession {
    editor_with_service(user_id, capabilities, snapshot_service())
}

/// Editor with default capabilities and its own snapshot service.
pub fn test_editor(user_id: &str) -> EditorSession {
    editor_with(user_id, EditorCapabilities::default())
}

/// Run the handshake against an empty service, leaving the editor synced.
pub fn connect_editor(editor: &EditorSession) {
    editor
        .with_session(|s| {
            let name = s.document_name().to_string();
            s.begin_connect();
            s.on_open();
            s.handle_frame(
                &Frame::new(
                    name.clone(),
                    MessageBody::Auth(AuthMessage::Authenticated("readwrite".into())),
                )
                .encode(),
                0,
            )
            .unwrap();
            let empty = ReplicaState::new(ReplicaId(u64::MAX)).encode_state();
            s.handle_frame(
                &Frame::new(name, MessageBody::Sync(SyncMessage::Step2(empty))).encode(),
                0,
            )
            .unwrap();
            s.drain_outbound();
        })
        .unwrap();
}

/// Something the [`LoopbackHub`] can route frames to.
pub trait HubPeer {
    fn take_outbound(&mut self) -> Vec<Vec<u8>>;
    fn deliver(&mut self, frame: &[u8], now_ms: i64);
    fn is_online(&self) -> bool;
}

impl HubPeer for SyncSession {
    fn take_outbound(&mut self) -> Vec<Vec<u8>> {
        self.drain_outbound()
    }

    fn deliver(&mut self, frame: &[u8], now_ms: i64) {
        self.handle_frame(frame, now_ms).unwrap();
    }

    fn is_online(&self) -> bool {
        self.status().is_connected()
    }
}

impl HubPeer for &EditorSession {
    fn take_outbound(&mut self) -> Vec<Vec<u8>> {
        self.with_session(|s| s.drain_outbound()).unwrap()
    }

    fn deliver(&mut self, frame: &[u8], now_ms: i64) {
        self.with_session(|s| s.handle_frame(frame, now_ms))
            .unwrap()
            .unwrap();
    }

    fn is_online(&self) -> bool {
        self.status().unwrap().is_connected()
    }
}

/// In-process sync service for one document.
///
/// Accepts every token, merges updates into its own replica, acknowledges
/// them and relays them to the other online peers.
pub struct LoopbackHub {
    pub replica: ReplicaState,
    pub now_ms: i64,
    /// Number of Update frames acknowledged so far
    pub acknowledged: usize,
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self {
            replica: ReplicaState::new(ReplicaId(u64::MAX)),
            now_ms: 0,
            acknowledged: 0,
        }
    }

    /// Handle one frame from a peer: (reply to sender, relay to others).
    pub fn handle(&mut self, data: &[u8]) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let frame = Frame::decode(data).unwrap();
        let doc = frame.document.clone();
        let reply = |body| Frame::new(doc.clone(), body).encode();
        match frame.body {
            MessageBody::Auth(AuthMessage::Token(_)) => (
                vec![reply(MessageBody::Auth(AuthMessage::Authenticated(
                    "readwrite".into(),
                )))],
                vec![],
            ),
            MessageBody::Sync(SyncMessage::Step1(sv)) => {
                let remote = decode_state_vector(&sv).unwrap();
                let own = encode_state_vector(self.replica.state_vector());
                (
                    vec![
                        reply(MessageBody::Sync(SyncMessage::Step2(
                            self.replica.encode_diff(&remote),
                        ))),
                        reply(MessageBody::Sync(SyncMessage::Step1(own))),
                    ],
                    vec![],
                )
            }
            MessageBody::Sync(SyncMessage::Step2(update)) => {
                let report = self.replica.apply_update(&update).unwrap();
                let relay = if report.integrated.is_empty() {
                    vec![]
                } else {
                    vec![reply(MessageBody::Sync(SyncMessage::Update(update)))]
                };
                (vec![], relay)
            }
            MessageBody::Sync(SyncMessage::Update(update)) => {
                let applied = self.replica.apply_update(&update).is_ok();
                self.acknowledged += 1;
                let relay = if applied {
                    vec![reply(MessageBody::Sync(SyncMessage::Update(update)))]
                } else {
                    vec![]
                };
                (vec![reply(MessageBody::SyncStatus(applied))], relay)
            }
            MessageBody::Awareness(update) => {
                (vec![], vec![reply(MessageBody::Awareness(update))])
            }
            MessageBody::BroadcastStateless(payload) => (
                vec![],
                vec![reply(MessageBody::BroadcastStateless(payload))],
            ),
            _ => (vec![], vec![]),
        }
    }

    /// Route frames until every peer is quiet.
    pub fn pump(&mut self, peers: &mut [&mut dyn HubPeer]) {
        loop {
            let mut moved = false;
            for i in 0..peers.len() {
                for data in peers[i].take_outbound() {
                    moved = true;
                    let (replies, relay) = self.handle(&data);
                    for reply in replies {
                        peers[i].deliver(&reply, self.now_ms);
                    }
                    for j in 0..peers.len() {
                        if j != i && peers[j].is_online() {
                            for frame in &relay {
                                peers[j].deliver(frame, self.now_ms);
                            }
                        }
                    }
                }
            }
            if !moved {
                break;
            }
        }
    }
}
