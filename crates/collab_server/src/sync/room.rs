use collab_core::awareness::{Awareness, ClientId, decode_records};
use collab_core::crdt::{
    DocumentStore, ReplicaId, ReplicaState, UpdateOrigin, decode_state_vector, encode_changes,
    encode_state_vector,
};
use collab_core::model::DocumentNode;
use collab_core::sync::{Frame, MessageBody, StatelessMessage, SyncMessage};
use collab_core::{CollabError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use super::connection::ConnectionId;

/// Replica id of the service. It never authors changes.
const SERVICE_REPLICA: ReplicaId = ReplicaId(u64::MAX);

/// Awareness client id of the service. It never publishes a state.
const SERVICE_CLIENT: ClientId = u64::MAX;

/// Sender id for frames that originate from the service itself.
pub const SERVICE_ORIGIN: ConnectionId = 0;

const BROADCAST_CAPACITY: usize = 256;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| CollabError::Storage("room lock poisoned".to_string()))
}

/// A frame fanned out to every connection of a room except its sender.
#[derive(Debug, Clone)]
pub struct RoomMessage {
    pub from: ConnectionId,
    pub frame: Arc<Vec<u8>>,
}

/// Statistics about the sync state
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub active_connections: usize,
    pub active_rooms: usize,
}

/// Global sync state managing all rooms
pub struct SyncState {
    /// Map of document name to room
    rooms: RwLock<HashMap<String, Arc<SyncRoom>>>,
    store: Arc<dyn DocumentStore>,
    compact_threshold: usize,
    next_connection: AtomicU64,
}

impl SyncState {
    pub fn new(store: Arc<dyn DocumentStore>, compact_threshold: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            compact_threshold,
            next_connection: AtomicU64::new(SERVICE_ORIGIN + 1),
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Get or create the room of a document, rebuilding it from the log.
    pub async fn get_or_create_room(&self, name: &str) -> Result<Arc<SyncRoom>> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return Ok(room.clone());
            }
        }

        let mut rooms = self.rooms.write().await;

        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(name) {
            return Ok(room.clone());
        }

        let room = Arc::new(SyncRoom::load(
            name,
            self.store.clone(),
            self.compact_threshold,
        )?);
        rooms.insert(name.to_string(), room.clone());
        info!(document = name, "created sync room");
        Ok(room)
    }

    /// The room of a document, if one is open.
    pub async fn room(&self, name: &str) -> Option<Arc<SyncRoom>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Remove a room if it has no active connections
    pub async fn maybe_remove_room(&self, name: &str) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(name).is_some_and(|room| room.connection_count() == 0) {
            rooms.remove(name);
            info!(document = name, "removed idle sync room");
        }
    }

    /// Get statistics about the sync state
    pub async fn stats(&self) -> SyncStats {
        let rooms = self.rooms.read().await;
        SyncStats {
            active_connections: rooms.values().map(|r| r.connection_count()).sum(),
            active_rooms: rooms.len(),
        }
    }
}

/// One document shared by any number of connections.
///
/// The room replica is the authority that validates updates before they
/// are persisted and relayed. Awareness is only relayed; the room keeps a
/// table so that late joiners can query it and so that a dropped
/// connection's peers can be announced as gone.
pub struct SyncRoom {
    name: String,
    store: Arc<dyn DocumentStore>,
    compact_threshold: usize,
    replica: Mutex<ReplicaState>,
    awareness: Mutex<Awareness>,
    broadcast_tx: broadcast::Sender<RoomMessage>,
    connections: AtomicUsize,
}

impl SyncRoom {
    /// Rebuild a room from the document's update log.
    pub fn load(
        name: &str,
        store: Arc<dyn DocumentStore>,
        compact_threshold: usize,
    ) -> Result<Self> {
        let mut replica = ReplicaState::new(SERVICE_REPLICA);
        let updates = store.get_all_updates(name)?;
        for update in &updates {
            if let Err(e) = replica.apply_update(&update.data) {
                warn!(
                    document = name,
                    update_id = update.update_id,
                    "skipping unreadable update: {}",
                    e
                );
            }
        }
        debug!(
            document = name,
            updates = updates.len(),
            changes = replica.log_len(),
            "rebuilt room replica"
        );

        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Ok(Self {
            name: name.to_string(),
            store,
            compact_threshold,
            replica: Mutex::new(replica),
            awareness: Mutex::new(Awareness::new(SERVICE_CLIENT, 0, i64::MAX)),
            broadcast_tx,
            connections: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomMessage> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        self.broadcast_tx.subscribe()
    }

    pub fn unsubscribe(&self) {
        let _ = self
            .connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Encode a frame for this room's document.
    pub fn frame(&self, body: MessageBody) -> Vec<u8> {
        Frame::new(self.name.clone(), body).encode()
    }

    /// Send a frame to every connection except `from`.
    pub fn broadcast(&self, body: MessageBody, from: ConnectionId) {
        let frame = Arc::new(self.frame(body));
        // No receivers is fine
        let _ = self.broadcast_tx.send(RoomMessage { from, frame });
    }

    pub fn broadcast_stateless(&self, msg: &StatelessMessage, from: ConnectionId) -> Result<()> {
        self.broadcast(MessageBody::Stateless(msg.to_json()?), from);
        Ok(())
    }

    /// Encoded state vector of the room replica.
    pub fn state_vector(&self) -> Result<Vec<u8>> {
        Ok(encode_state_vector(lock(&self.replica)?.state_vector()))
    }

    /// Changes a peer at the encoded state vector `remote` is missing.
    pub fn diff_for(&self, remote: &[u8]) -> Result<Vec<u8>> {
        let remote = decode_state_vector(remote)?;
        Ok(lock(&self.replica)?.encode_diff(&remote))
    }

    /// Every change of the document.
    pub fn full_state(&self) -> Result<Vec<u8>> {
        Ok(lock(&self.replica)?.encode_state())
    }

    pub fn document(&self) -> Result<DocumentNode> {
        Ok(lock(&self.replica)?.document())
    }

    /// Merge an update from a connection, persist the new changes and relay
    /// them to everyone else. Returns how many changes were new.
    ///
    /// The merge happens on a copy of the replica that replaces it only once
    /// the new changes are in the store. A failed write leaves the room as
    /// it was, so a resend of the same update is applied again.
    pub fn apply_update(&self, update: &[u8], from: ConnectionId) -> Result<usize> {
        let mut replica = lock(&self.replica)?;
        let mut staged = replica.clone();
        let report = staged.apply_update(update)?;
        for warning in &report.warnings {
            debug!(document = %self.name, "merge warning: {}", warning);
        }
        for discarded in &report.discarded {
            warn!(document = %self.name, "discarded change: {}", discarded);
        }
        if report.integrated.is_empty() {
            *replica = staged;
            return Ok(0);
        }

        let encoded = encode_changes(&report.integrated);
        self.store
            .append_update(&self.name, &encoded, UpdateOrigin::Remote)?;
        *replica = staged;
        if let Err(e) = self.maybe_compact(&replica) {
            warn!(document = %self.name, "compaction failed: {}", e);
        }
        drop(replica);

        self.broadcast(MessageBody::Sync(SyncMessage::Update(encoded)), from);
        Ok(report.integrated.len())
    }

    /// Fold the log into one record once it grows past the threshold.
    fn maybe_compact(&self, replica: &ReplicaState) -> Result<()> {
        if self.compact_threshold == 0 {
            return Ok(());
        }
        let count = self.store.update_count(&self.name)?;
        if count <= self.compact_threshold {
            return Ok(());
        }
        let latest = self.store.get_latest_update_id(&self.name)?;
        self.store
            .compact(&self.name, &replica.encode_state(), latest)?;
        info!(document = %self.name, updates = count, "compacted update log");
        Ok(())
    }

    /// Record an awareness update and relay it. Returns the client ids it
    /// mentions so the connection can announce them gone when it drops.
    pub fn apply_awareness(&self, update: &[u8], from: ConnectionId) -> Result<Vec<ClientId>> {
        let clients = decode_records(update)?
            .into_iter()
            .map(|r| r.client_id)
            .collect();
        lock(&self.awareness)?.apply_update(update, now_ms())?;
        self.broadcast(MessageBody::Awareness(update.to_vec()), from);
        Ok(clients)
    }

    /// Every known presence entry.
    pub fn awareness_state(&self) -> Result<Vec<u8>> {
        Ok(lock(&self.awareness)?.encode_all())
    }

    /// Drop the presence of a closed connection and tell everyone else.
    pub fn remove_clients(&self, clients: &[ClientId], from: ConnectionId) -> Result<()> {
        if clients.is_empty() {
            return Ok(());
        }
        let (change, update) = lock(&self.awareness)?.remove_clients(clients);
        debug!(document = %self.name, removed = change.removed.len(), "cleared presence");
        self.broadcast(MessageBody::Awareness(update), from);
        Ok(())
    }

    /// Content of a stored version, `None` if there is no such version.
    pub fn preview(&self, version: u64) -> Result<Option<DocumentNode>> {
        Ok(self
            .store
            .get_version(&self.name, version)?
            .map(|snapshot| snapshot.content))
    }
}
