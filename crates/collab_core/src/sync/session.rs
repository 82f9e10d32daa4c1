//! Sans-IO sync session for one open document.
//!
//! [`SyncSession`] owns the document's [`ReplicaState`] and [`Awareness`].
//! It consumes frames received from the sync service, queues frames to
//! send, and reports what happened as [`SessionEvent`]s. The transport
//! (see `CollabClient`) only moves bytes and calls the lifecycle hooks:
//!
//! ```text
//! begin_connect() -> Connecting
//! on_open()       -> sends Auth(Token)
//! Authenticated   -> Connected, sends Step1 and replays unacknowledged batches
//! Step2           -> Synced, seeds an empty document, sends buffered batches
//! on_close()      -> Disconnected
//! ```
//!
//! Local edits are applied immediately. Their batches stay in an
//! unacknowledged queue until the service answers each Update with a
//! SyncStatus frame; after a reconnect the whole queue is sent again. The
//! service ignores changes it already has, so replay never duplicates.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use super::protocol::{AuthMessage, Frame, MessageBody, StatelessMessage, SyncMessage};
use crate::awareness::{
    Awareness, AwarenessChange, AwarenessEntry, AwarenessUser, AwarenessState, ClientId,
    CursorState, DEFAULT_THROTTLE_MS, DEFAULT_TIMEOUT_MS,
};
use crate::crdt::{
    Change, MergeReport, ReplicaId, ReplicaState, UpdateOrigin, decode_state_vector,
    encode_changes, encode_state_vector,
};
use crate::error::{CollabError, Result};
use crate::model::{DocumentNode, Operation, Position};

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    /// Authenticated, initial state exchange still running
    Connected,
    /// Caught up with the service
    Synced,
}

impl ConnectionStatus {
    /// Connected or synced.
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionStatus::Connected | ConnectionStatus::Synced)
    }
}

/// Something the owner of a session should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StatusChanged(ConnectionStatus),
    /// Remote changes were merged; re-render the document.
    RemoteChange { count: usize },
    /// A remote change was dropped. The session keeps going.
    MergeWarning(String),
    AwarenessChanged(AwarenessChange),
    Stateless(StatelessMessage),
    /// The service made local batches durable.
    Acknowledged { unacknowledged: usize },
    /// The empty document was seeded with initial content.
    Seeded,
    /// The service rejected the credentials. No retry should follow.
    AuthorizationFailed(String),
}

/// Static parameters of a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Fully qualified document name (namespace prefix + id)
    pub document: String,
    /// Bearer token presented in the Auth frame
    pub token: String,
    pub replica: ReplicaId,
    pub throttle_ms: i64,
    pub timeout_ms: i64,
    /// Content written once into a document found empty after syncing
    pub initial_content: Option<DocumentNode>,
}

impl SessionOptions {
    pub fn new(document: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            document: document.into(),
            token: token.into(),
            replica: ReplicaId::random(),
            throttle_ms: DEFAULT_THROTTLE_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            initial_content: None,
        }
    }
}

pub struct SyncSession {
    document: String,
    token: String,
    status: ConnectionStatus,
    replica: ReplicaState,
    awareness: Awareness,
    initial_content: Option<DocumentNode>,
    /// Encoded local batches not yet acknowledged, oldest first.
    unacked: VecDeque<Vec<u8>>,
    /// How many of `unacked` were sent on the current connection.
    in_flight: usize,
    outbound: VecDeque<Vec<u8>>,
    events: VecDeque<SessionEvent>,
    auth_error: Option<String>,
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("document", &self.document)
            .field("status", &self.status)
            .field("unacked", &self.unacked.len())
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl SyncSession {
    pub fn new(options: SessionOptions) -> Self {
        let client_id: ClientId = options.replica.0;
        Self {
            document: options.document,
            token: options.token,
            status: ConnectionStatus::Disconnected,
            replica: ReplicaState::new(options.replica),
            awareness: Awareness::new(client_id, options.throttle_ms, options.timeout_ms),
            initial_content: options.initial_content,
            unacked: VecDeque::new(),
            in_flight: 0,
            outbound: VecDeque::new(),
            events: VecDeque::new(),
            auth_error: None,
        }
    }

    pub fn document_name(&self) -> &str {
        &self.document
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn replica(&self) -> &ReplicaState {
        &self.replica
    }

    /// The current merged document.
    pub fn document(&self) -> DocumentNode {
        self.replica.document()
    }

    pub fn awareness(&self) -> &Awareness {
        &self.awareness
    }

    pub fn awareness_mut(&mut self) -> &mut Awareness {
        &mut self.awareness
    }

    /// Local batches the service has not acknowledged yet.
    pub fn unacknowledged(&self) -> usize {
        self.unacked.len()
    }

    /// Reason of the last authentication failure, if any.
    pub fn authorization_error(&self) -> Option<&str> {
        self.auth_error.as_deref()
    }

    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = token.into();
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            log::debug!(
                "[Sync] '{}' {:?} -> {:?}",
                self.document,
                self.status,
                status
            );
            self.status = status;
            self.events.push_back(SessionEvent::StatusChanged(status));
        }
    }

    fn send(&mut self, body: MessageBody) {
        self.outbound
            .push_back(Frame::new(self.document.clone(), body).encode());
    }

    /// Frames to write to the transport, in order.
    pub fn drain_outbound(&mut self) -> Vec<Vec<u8>> {
        self.outbound.drain(..).collect()
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.events.drain(..).collect()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// A connection attempt started.
    pub fn begin_connect(&mut self) {
        self.auth_error = None;
        self.set_status(ConnectionStatus::Connecting);
    }

    /// The transport is open: authenticate.
    pub fn on_open(&mut self) {
        if self.status == ConnectionStatus::Disconnected {
            self.set_status(ConnectionStatus::Connecting);
        }
        let token = self.token.clone();
        self.send(MessageBody::Auth(AuthMessage::Token(token)));
    }

    /// The transport closed or failed.
    pub fn on_close(&mut self) {
        self.in_flight = 0;
        self.outbound.clear();
        let change = self.awareness.clear_remote();
        if !change.is_empty() {
            self.events.push_back(SessionEvent::AwarenessChanged(change));
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    /// Leave the document: announce the awareness leave and go offline.
    /// The frames queued here must be flushed before the transport closes.
    pub fn close(&mut self) {
        if self.status.is_connected() {
            let leave = self.awareness.leave();
            self.send(MessageBody::Awareness(leave));
        }
        let pending = self.drain_outbound();
        self.on_close();
        self.outbound.extend(pending);
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Process one binary message from the service.
    pub fn handle_frame(&mut self, data: &[u8], now_ms: i64) -> Result<()> {
        let frame = Frame::decode(data)?;
        if frame.document != self.document {
            log::debug!(
                "[Sync] ignoring {} for other document '{}'",
                frame.body.name(),
                frame.document
            );
            return Ok(());
        }
        match frame.body {
            MessageBody::Auth(AuthMessage::Authenticated(scope)) => {
                log::debug!("[Sync] '{}' authenticated ({})", self.document, scope);
                self.set_status(ConnectionStatus::Connected);
                let sv = encode_state_vector(self.replica.state_vector());
                self.send(MessageBody::Sync(SyncMessage::Step1(sv)));
                self.send_unsent();
                if self.awareness.local_state().is_some() {
                    let local = self.awareness.encode_local();
                    self.send(MessageBody::Awareness(local));
                }
                self.send(MessageBody::QueryAwareness);
            }
            MessageBody::Auth(AuthMessage::PermissionDenied(reason)) => {
                log::warn!("[Sync] '{}' permission denied: {}", self.document, reason);
                self.auth_error = Some(reason.clone());
                self.events
                    .push_back(SessionEvent::AuthorizationFailed(reason));
                self.on_close();
            }
            MessageBody::Auth(AuthMessage::Token(_)) => {}
            MessageBody::Sync(SyncMessage::Step1(sv)) => {
                let remote = decode_state_vector(&sv)?;
                let diff = self.replica.encode_diff(&remote);
                self.send(MessageBody::Sync(SyncMessage::Step2(diff)));
            }
            MessageBody::Sync(SyncMessage::Step2(update)) => {
                let report = self.replica.apply_update(&update)?;
                self.report_merge(report, UpdateOrigin::Sync);
                if self.status == ConnectionStatus::Connected {
                    self.set_status(ConnectionStatus::Synced);
                    self.seed_if_empty()?;
                    self.flush();
                }
            }
            MessageBody::Sync(SyncMessage::Update(update)) => {
                let report = self.replica.apply_update(&update)?;
                self.report_merge(report, UpdateOrigin::Remote);
            }
            MessageBody::Awareness(update) => {
                let change = self.awareness.apply_update(&update, now_ms)?;
                if !change.is_empty() {
                    self.events.push_back(SessionEvent::AwarenessChanged(change));
                }
            }
            MessageBody::QueryAwareness => {
                if self.awareness.local_state().is_some() {
                    let local = self.awareness.encode_local();
                    self.send(MessageBody::Awareness(local));
                }
            }
            MessageBody::Stateless(payload) | MessageBody::BroadcastStateless(payload) => {
                match StatelessMessage::from_json(&payload) {
                    Ok(msg) => self.events.push_back(SessionEvent::Stateless(msg)),
                    Err(e) => log::debug!("[Sync] ignoring stateless payload: {}", e),
                }
            }
            MessageBody::Close { code, reason } => {
                log::info!(
                    "[Sync] '{}' closed by service ({}): {}",
                    self.document,
                    code,
                    reason
                );
                self.on_close();
            }
            MessageBody::SyncStatus(applied) => {
                if self.in_flight == 0 {
                    log::warn!("[Sync] acknowledgement without a batch in flight");
                    return Ok(());
                }
                self.in_flight -= 1;
                let batch = self.unacked.pop_front();
                if !applied {
                    // Sent again with the next flush or after reconnecting.
                    log::warn!("[Sync] service rejected a local batch, keeping it queued");
                    self.unacked.extend(batch);
                }
                self.events.push_back(SessionEvent::Acknowledged {
                    unacknowledged: self.unacked.len(),
                });
            }
        }
        Ok(())
    }

    fn report_merge(&mut self, report: MergeReport, origin: UpdateOrigin) {
        for warning in report.warnings.iter() {
            self.events
                .push_back(SessionEvent::MergeWarning(warning.to_string()));
        }
        for discarded in report.discarded.iter() {
            log::warn!("[Sync] '{}' discarded a change: {}", self.document, discarded);
        }
        if report.changed() {
            let count = report.integrated.len() - report.warnings.len();
            log::debug!(
                "[Sync] '{}' merged {} {} changes",
                self.document,
                count,
                origin
            );
            self.events.push_back(SessionEvent::RemoteChange { count });
        }
    }

    /// Seed the document if the service had nothing for it. Seed changes
    /// are deterministic, so peers seeding concurrently converge.
    fn seed_if_empty(&mut self) -> Result<()> {
        if !self.replica.is_pristine() {
            return Ok(());
        }
        let Some(content) = self.initial_content.clone() else {
            return Ok(());
        };
        let seed = ReplicaState::seed_changes(&content)?;
        if seed.is_empty() {
            return Ok(());
        }
        let report = self.replica.apply_remote(seed);
        if !report.integrated.is_empty() {
            log::info!("[Sync] seeded empty document '{}'", self.document);
            self.unacked.push_back(encode_changes(&report.integrated));
            self.events.push_back(SessionEvent::Seeded);
        }
        Ok(())
    }

    /// Send buffered batches once synced.
    fn flush(&mut self) {
        if self.status == ConnectionStatus::Synced {
            self.send_unsent();
        }
    }

    /// Send every unacknowledged batch not sent on this connection.
    fn send_unsent(&mut self) {
        let unsent: Vec<Vec<u8>> = self.unacked.iter().skip(self.in_flight).cloned().collect();
        self.in_flight = self.unacked.len();
        for batch in unsent {
            self.send(MessageBody::Sync(SyncMessage::Update(batch)));
        }
    }

    // ------------------------------------------------------------------
    // Local actions
    // ------------------------------------------------------------------

    /// Apply local operations as one batch. Sent right away when synced,
    /// buffered otherwise.
    pub fn apply_local(&mut self, ops: &[Operation]) -> Result<Vec<Change>> {
        let changes = self.replica.apply_local(ops)?;
        if !changes.is_empty() {
            self.unacked.push_back(encode_changes(&changes));
            self.flush();
        }
        Ok(changes)
    }

    /// Publish who is editing.
    pub fn set_local_user(&mut self, user: AwarenessUser) {
        let cursor = self.awareness.local_state().and_then(|s| s.cursor);
        self.awareness
            .set_local_state(AwarenessState { user, cursor });
    }

    /// Publish the local selection.
    pub fn set_local_cursor(&mut self, anchor: &Position, head: &Position) -> Result<()> {
        let cursor = CursorState {
            anchor: self.replica.relative_position(anchor)?,
            head: self.replica.relative_position(head)?,
        };
        self.awareness.set_local_cursor(Some(cursor));
        Ok(())
    }

    pub fn clear_local_cursor(&mut self) {
        self.awareness.set_local_cursor(None);
    }

    /// Remote peers with their selections resolved against the current
    /// document.
    pub fn remote_cursors(&self) -> Vec<(AwarenessEntry, Option<(Position, Position)>)> {
        self.awareness
            .entries()
            .into_iter()
            .map(|entry| {
                let selection = entry.state.cursor.and_then(|cursor| {
                    Some((
                        self.replica.resolve_relative(&cursor.anchor)?,
                        self.replica.resolve_relative(&cursor.head)?,
                    ))
                });
                (entry, selection)
            })
            .collect()
    }

    /// Timers: throttled awareness broadcast and peer eviction.
    pub fn tick(&mut self, now_ms: i64) {
        if self.status.is_connected()
            && let Some(update) = self.awareness.poll_local_update(now_ms)
        {
            self.send(MessageBody::Awareness(update));
        }
        let change = self.awareness.remove_stale(now_ms);
        if !change.is_empty() {
            self.events.push_back(SessionEvent::AwarenessChanged(change));
        }
    }

    /// Send an application message to the service.
    pub fn send_stateless(&mut self, msg: &StatelessMessage) -> Result<()> {
        if !self.status.is_connected() {
            return Err(CollabError::NotConnected);
        }
        let payload = msg.to_json()?;
        self.send(MessageBody::Stateless(payload));
        Ok(())
    }

    /// Send an application message to every other peer of the document.
    pub fn broadcast_stateless(&mut self, msg: &StatelessMessage) -> Result<()> {
        if !self.status.is_connected() {
            return Err(CollabError::NotConnected);
        }
        let payload = msg.to_json()?;
        self.send(MessageBody::BroadcastStateless(payload));
        Ok(())
    }
}
