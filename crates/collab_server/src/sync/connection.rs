use super::room::{RoomMessage, SyncRoom, SyncState};
use crate::auth::TokenRegistry;
use collab_core::Result;
use collab_core::awareness::ClientId;
use collab_core::sync::{AuthMessage, Frame, MessageBody, StatelessMessage, SyncMessage};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub type ConnectionId = u64;

/// Scope reported to authenticated clients.
const SCOPE_READ_WRITE: &str = "read-write";

/// The document a connection authenticated for.
struct Binding {
    user_id: String,
    room: Arc<SyncRoom>,
    broadcast_rx: broadcast::Receiver<RoomMessage>,
    /// Awareness clients announced over this connection
    clients: BTreeSet<ClientId>,
}

/// Represents a connected client
///
/// A connection serves one document. It starts unauthenticated; the first
/// `Auth` frame with a valid token binds it to the named document's room.
pub struct ClientConnection {
    id: ConnectionId,
    state: Arc<SyncState>,
    tokens: Arc<TokenRegistry>,
    binding: Option<Binding>,
    closed: bool,
}

impl ClientConnection {
    pub fn new(state: Arc<SyncState>, tokens: Arc<TokenRegistry>) -> Self {
        Self {
            id: state.next_connection_id(),
            state,
            tokens,
            binding: None,
            closed: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.user_id.as_str())
    }

    pub fn document(&self) -> Option<&str> {
        self.binding.as_ref().map(|b| b.room.name())
    }

    /// Whether the client sent a Close frame.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Handle an incoming frame and return the replies for this client.
    ///
    /// Malformed frames are logged and ignored. An error means the room
    /// could not serve the document and the connection should be dropped.
    pub async fn handle_message(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let frame = match Frame::decode(data) {
            Ok(f) => f,
            Err(e) => {
                warn!(connection = self.id, "dropping malformed frame: {}", e);
                return Ok(Vec::new());
            }
        };

        if let MessageBody::Auth(AuthMessage::Token(token)) = &frame.body {
            return self.authenticate(&frame.document, token).await;
        }
        if let MessageBody::Close { code, reason } = &frame.body {
            debug!(connection = self.id, code, reason = %reason, "client closed");
            self.closed = true;
            return Ok(Vec::new());
        }

        let Some(binding) = self.binding.as_mut() else {
            return Ok(vec![permission_denied(
                &frame.document,
                "authenticate first",
            )]);
        };
        let room = binding.room.clone();
        if frame.document != room.name() {
            debug!(
                connection = self.id,
                document = %frame.document,
                "ignoring frame for another document"
            );
            return Ok(Vec::new());
        }

        let mut replies = Vec::new();
        match frame.body {
            MessageBody::Sync(SyncMessage::Step1(sv)) => match room.diff_for(&sv) {
                Ok(diff) => {
                    replies.push(room.frame(MessageBody::Sync(SyncMessage::Step2(diff))));
                    replies.push(
                        room.frame(MessageBody::Sync(SyncMessage::Step1(room.state_vector()?))),
                    );
                }
                Err(e) => warn!(connection = self.id, "bad state vector: {}", e),
            },
            MessageBody::Sync(SyncMessage::Step2(update)) => {
                if let Err(e) = room.apply_update(&update, self.id) {
                    warn!(connection = self.id, "rejected sync step 2: {}", e);
                }
            }
            MessageBody::Sync(SyncMessage::Update(update)) => {
                let accepted = match room.apply_update(&update, self.id) {
                    Ok(count) => {
                        debug!(connection = self.id, changes = count, "applied update");
                        true
                    }
                    Err(e) => {
                        warn!(connection = self.id, "rejected update: {}", e);
                        false
                    }
                };
                replies.push(room.frame(MessageBody::SyncStatus(accepted)));
            }
            MessageBody::Awareness(update) => match room.apply_awareness(&update, self.id) {
                Ok(clients) => binding.clients.extend(clients),
                Err(e) => warn!(connection = self.id, "bad awareness update: {}", e),
            },
            MessageBody::QueryAwareness => {
                replies.push(room.frame(MessageBody::Awareness(room.awareness_state()?)));
            }
            MessageBody::Stateless(payload) => {
                if let Some(reply) = self.answer_stateless(&room, &payload)? {
                    replies.push(reply);
                }
            }
            MessageBody::BroadcastStateless(payload) => {
                room.broadcast(MessageBody::BroadcastStateless(payload), self.id);
            }
            other => debug!(connection = self.id, "ignoring {} frame", other.name()),
        }
        Ok(replies)
    }

    async fn authenticate(&mut self, document: &str, token: &str) -> Result<Vec<Vec<u8>>> {
        let Some(user_id) = self.tokens.validate(token) else {
            warn!(connection = self.id, document, "rejected invalid token");
            return Ok(vec![permission_denied(document, "invalid token")]);
        };

        if let Some(binding) = &self.binding {
            if binding.room.name() != document {
                return Ok(vec![permission_denied(
                    document,
                    "connection is bound to another document",
                )]);
            }
        } else {
            let room = self.state.get_or_create_room(document).await?;
            let broadcast_rx = room.subscribe();
            info!(
                connection = self.id,
                user = %user_id,
                document,
                connections = room.connection_count(),
                "client authenticated"
            );
            self.binding = Some(Binding {
                user_id,
                room,
                broadcast_rx,
                clients: BTreeSet::new(),
            });
        }

        Ok(vec![
            Frame::new(
                document,
                MessageBody::Auth(AuthMessage::Authenticated(SCOPE_READ_WRITE.to_string())),
            )
            .encode(),
        ])
    }

    fn answer_stateless(&self, room: &SyncRoom, payload: &str) -> Result<Option<Vec<u8>>> {
        match StatelessMessage::from_json(payload) {
            Ok(StatelessMessage::VersionPreview { version }) => {
                let content = room.preview(version)?;
                let answer = StatelessMessage::VersionPreviewContent { version, content };
                Ok(Some(room.frame(MessageBody::Stateless(answer.to_json()?))))
            }
            Ok(other) => {
                debug!(connection = self.id, "unanswered stateless message {:?}", other);
                Ok(None)
            }
            Err(e) => {
                debug!(connection = self.id, "ignoring stateless payload: {}", e);
                Ok(None)
            }
        }
    }

    /// Receive the next frame relayed from another connection.
    ///
    /// Never resolves before the connection is authenticated.
    pub async fn recv_broadcast(&mut self) -> Option<Vec<u8>> {
        let Some(binding) = self.binding.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            match binding.broadcast_rx.recv().await {
                Ok(msg) if msg.from == self.id => continue,
                Ok(msg) => return Some(msg.frame.as_ref().clone()),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        connection = self.id,
                        skipped = n,
                        "client lagged, sending full state"
                    );
                    let state = binding.room.full_state().ok()?;
                    return Some(
                        binding
                            .room
                            .frame(MessageBody::Sync(SyncMessage::Update(state))),
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

fn permission_denied(document: &str, reason: &str) -> Vec<u8> {
    Frame::new(
        document,
        MessageBody::Auth(AuthMessage::PermissionDenied(reason.to_string())),
    )
    .encode()
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(binding) = self.binding.take() {
            let clients: Vec<ClientId> = binding.clients.into_iter().collect();
            if let Err(e) = binding.room.remove_clients(&clients, self.id) {
                warn!(connection = self.id, "could not clear presence: {}", e);
            }
            binding.room.unsubscribe();
            debug!(
                connection = self.id,
                user = %binding.user_id,
                document = binding.room.name(),
                "client disconnected"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collab_core::awareness::{Awareness, AwarenessState, AwarenessUser, decode_records};
    use collab_core::crdt::{
        MemoryStore, ReplicaId, ReplicaState, encode_changes, encode_state_vector,
    };
    use collab_core::model::{DocumentNode, Operation, Position};
    use collab_core::versions::NewVersion;

    const DOC: &str = "projects/p1";

    fn setup() -> (Arc<SyncState>, Arc<TokenRegistry>) {
        let state = Arc::new(SyncState::new(Arc::new(MemoryStore::new()), 0));
        let tokens = Arc::new(TokenRegistry::new(
            [("t1".to_string(), "u1".to_string()), ("t2".to_string(), "u2".to_string())]
                .into_iter()
                .collect(),
        ));
        (state, tokens)
    }

    fn frame(body: MessageBody) -> Vec<u8> {
        Frame::new(DOC, body).encode()
    }

    fn bodies(replies: Vec<Vec<u8>>) -> Vec<MessageBody> {
        replies
            .iter()
            .map(|r| Frame::decode(r).unwrap().body)
            .collect()
    }

    async fn connect(state: &Arc<SyncState>, tokens: &Arc<TokenRegistry>, token: &str) -> ClientConnection {
        let mut conn = ClientConnection::new(state.clone(), tokens.clone());
        let replies = conn
            .handle_message(&frame(MessageBody::Auth(AuthMessage::Token(token.into()))))
            .await
            .unwrap();
        assert_eq!(
            bodies(replies),
            vec![MessageBody::Auth(AuthMessage::Authenticated(
                SCOPE_READ_WRITE.into()
            ))]
        );
        conn
    }

    fn paragraph_update(replica: &mut ReplicaState, text: &str) -> Vec<u8> {
        let changes = replica
            .apply_local(&[Operation::InsertNodes {
                at: Position::root(0),
                nodes: vec![DocumentNode::paragraph(vec![DocumentNode::text(text)])],
            }])
            .unwrap();
        encode_changes(&changes)
    }

    #[tokio::test]
    async fn test_rejects_unknown_token_and_unauthenticated_frames() {
        let (state, tokens) = setup();
        let mut conn = ClientConnection::new(state.clone(), tokens);

        let replies = conn
            .handle_message(&frame(MessageBody::Sync(SyncMessage::Step1(vec![0]))))
            .await
            .unwrap();
        assert!(matches!(
            bodies(replies).as_slice(),
            [MessageBody::Auth(AuthMessage::PermissionDenied(_))]
        ));

        let replies = conn
            .handle_message(&frame(MessageBody::Auth(AuthMessage::Token("bad".into()))))
            .await
            .unwrap();
        assert!(matches!(
            bodies(replies).as_slice(),
            [MessageBody::Auth(AuthMessage::PermissionDenied(_))]
        ));
        assert!(conn.document().is_none());
        assert_eq!(state.stats().await.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_update_is_acknowledged_and_relayed() {
        let (state, tokens) = setup();
        let mut a = connect(&state, &tokens, "t1").await;
        let mut b = connect(&state, &tokens, "t2").await;
        assert_eq!(a.user_id(), Some("u1"));
        assert_eq!(state.stats().await.active_connections, 2);

        let mut peer = ReplicaState::new(ReplicaId(9));
        let update = paragraph_update(&mut peer, "hi");
        let replies = a
            .handle_message(&frame(MessageBody::Sync(SyncMessage::Update(update))))
            .await
            .unwrap();
        assert_eq!(bodies(replies), vec![MessageBody::SyncStatus(true)]);

        let relayed = Frame::decode(&b.recv_broadcast().await.unwrap()).unwrap();
        let MessageBody::Sync(SyncMessage::Update(relayed)) = relayed.body else {
            panic!("expected update");
        };
        let mut other = ReplicaState::new(ReplicaId(10));
        other.apply_update(&relayed).unwrap();
        assert_eq!(other.document(), peer.document());

        let replies = a
            .handle_message(&frame(MessageBody::Sync(SyncMessage::Update(vec![1, 255]))))
            .await
            .unwrap();
        assert_eq!(bodies(replies), vec![MessageBody::SyncStatus(false)]);
    }

    #[tokio::test]
    async fn test_step1_answered_with_diff_and_own_state() {
        let (state, tokens) = setup();
        let mut a = connect(&state, &tokens, "t1").await;
        let mut peer = ReplicaState::new(ReplicaId(9));
        let update = paragraph_update(&mut peer, "hi");
        a.handle_message(&frame(MessageBody::Sync(SyncMessage::Update(update))))
            .await
            .unwrap();

        let mut b = connect(&state, &tokens, "t2").await;
        let empty = encode_state_vector(&Default::default());
        let replies = bodies(
            b.handle_message(&frame(MessageBody::Sync(SyncMessage::Step1(empty))))
                .await
                .unwrap(),
        );
        assert_eq!(replies.len(), 2);
        let MessageBody::Sync(SyncMessage::Step2(diff)) = &replies[0] else {
            panic!("expected step 2");
        };
        let mut fresh = ReplicaState::new(ReplicaId(11));
        fresh.apply_update(diff).unwrap();
        assert_eq!(fresh.document(), peer.document());
        assert_eq!(
            replies[1],
            MessageBody::Sync(SyncMessage::Step1(encode_state_vector(peer.state_vector())))
        );
    }

    #[tokio::test]
    async fn test_presence_relayed_and_cleared_on_drop() {
        let (state, tokens) = setup();
        let mut a = connect(&state, &tokens, "t1").await;
        let mut b = connect(&state, &tokens, "t2").await;

        let mut presence = Awareness::new(42, 0, 30_000);
        presence.set_local_state(AwarenessState {
            user: AwarenessUser::new("u1", "Ann", None),
            cursor: None,
        });
        a.handle_message(&frame(MessageBody::Awareness(presence.encode_local())))
            .await
            .unwrap();
        assert!(matches!(
            Frame::decode(&b.recv_broadcast().await.unwrap()).unwrap().body,
            MessageBody::Awareness(_)
        ));

        let replies = bodies(
            b.handle_message(&frame(MessageBody::QueryAwareness))
                .await
                .unwrap(),
        );
        let [MessageBody::Awareness(all)] = replies.as_slice() else {
            panic!("expected awareness");
        };
        assert_eq!(decode_records(all).unwrap()[0].client_id, 42);

        drop(a);
        let leave = Frame::decode(&b.recv_broadcast().await.unwrap()).unwrap();
        let MessageBody::Awareness(leave) = leave.body else {
            panic!("expected awareness leave");
        };
        let records = decode_records(&leave).unwrap();
        assert_eq!(records[0].client_id, 42);
        assert!(records[0].state.is_none());
        assert_eq!(state.stats().await.active_connections, 1);
    }

    #[tokio::test]
    async fn test_preview_request_answered() {
        let (state, tokens) = setup();
        state
            .store()
            .insert_version(
                DOC,
                NewVersion::new(
                    Some("draft".into()),
                    "u1",
                    DocumentNode::doc(vec![DocumentNode::paragraph(vec![DocumentNode::text(
                        "v1",
                    )])]),
                    &Default::default(),
                ),
            )
            .unwrap();
        let mut a = connect(&state, &tokens, "t1").await;

        for (version, found) in [(1, true), (5, false)] {
            let request = StatelessMessage::VersionPreview { version }.to_json().unwrap();
            let replies = bodies(
                a.handle_message(&frame(MessageBody::Stateless(request)))
                    .await
                    .unwrap(),
            );
            let [MessageBody::Stateless(answer)] = replies.as_slice() else {
                panic!("expected stateless answer");
            };
            match StatelessMessage::from_json(answer).unwrap() {
                StatelessMessage::VersionPreviewContent { version: v, content } => {
                    assert_eq!(v, version);
                    assert_eq!(content.is_some(), found);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_close_frame_marks_connection_closed() {
        let (state, tokens) = setup();
        let mut a = connect(&state, &tokens, "t1").await;
        a.handle_message(&frame(MessageBody::Close {
            code: collab_core::sync::CLOSE_NORMAL,
            reason: "bye".into(),
        }))
        .await
        .unwrap();
        assert!(a.is_closed());
    }
}
