//! Ephemeral presence shared between the peers of a document.
//!
//! Every peer owns one entry keyed by its client id and versioned by a
//! per-client clock. Remote entries merge last-writer-wins on that clock.
//! Nothing here is persisted: entries decay after a timeout, disappear on
//! an explicit leave (a `null` state), and are rebuilt from the live peer
//! set after a reconnect.
//!
//! # Wire Format
//!
//! Compatible with y-protocols awareness updates:
//!
//! ```text
//! varUint(count)
//! per client: varUint(clientId) varUint(clock) varString(JSON state | "null")
//! ```
//!
//! The JSON state is `{"user": {id, name, color, avatarUrl}, "cursor":
//! {anchor, head} | null}`.
//!
//! All timing functions take the current time in milliseconds so callers
//! (and tests) control the clock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::crdt::{Decoder, RelativePosition, write_var_string, write_var_uint};
use crate::error::Result;

/// Identifier of one awareness participant (one session).
pub type ClientId = u64;

/// Handle returned by [`Awareness::on_change`].
pub type SubscriptionId = u64;

/// Default minimum interval between two local broadcasts.
pub const DEFAULT_THROTTLE_MS: i64 = 100;

/// Default time after which a silent peer is evicted.
pub const DEFAULT_TIMEOUT_MS: i64 = 30_000;

/// Cursor colors handed out per user.
pub const PALETTE: [&str; 8] = [
    "#958DF1", "#F98181", "#FBBC88", "#FAF594", "#70CFF8", "#94FADB", "#B9F18D", "#C3E2C2",
];

/// The person behind an awareness entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct AwarenessUser {
    pub id: String,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl AwarenessUser {
    /// A user with the palette color assigned to `id`.
    pub fn new(id: &str, name: &str, avatar_url: Option<String>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            color: color_for(id).to_string(),
            avatar_url,
        }
    }

    /// Up to two uppercase initials of the display name.
    pub fn initials(&self) -> String {
        let initials: String = self
            .name
            .split_whitespace()
            .filter_map(|word| word.chars().next())
            .take(2)
            .flat_map(char::to_uppercase)
            .collect();
        if initials.is_empty() {
            "?".to_string()
        } else {
            initials
        }
    }
}

/// Stable palette color for a user id.
pub fn color_for(user_id: &str) -> &'static str {
    // FNV-1a
    let hash = user_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
            (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
        });
    PALETTE[(hash % PALETTE.len() as u64) as usize]
}

/// A selection anchored on item ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    pub anchor: RelativePosition,
    pub head: RelativePosition,
}

/// What one peer publishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub user: AwarenessUser,
    #[serde(default)]
    pub cursor: Option<CursorState>,
}

/// A known remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub clock: u64,
    pub state: AwarenessState,
    /// When the entry was last renewed (milliseconds)
    pub last_updated_ms: i64,
}

/// Which peers changed, plus a snapshot of all remote entries after the
/// change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// One decoded record of an awareness update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessRecord {
    pub client_id: ClientId,
    pub clock: u64,
    /// `None` means the client left.
    pub state: Option<AwarenessState>,
}

type Observer = Arc<dyn Fn(&AwarenessChange) + Send + Sync>;

/// Local and remote presence of one document session.
pub struct Awareness {
    client_id: ClientId,
    clock: u64,
    local: Option<AwarenessState>,
    remote: BTreeMap<ClientId, AwarenessEntry>,
    /// Last clock seen per remote client, kept after removal so that a
    /// late update cannot resurrect a peer that left.
    clocks: HashMap<ClientId, u64>,
    throttle_ms: i64,
    timeout_ms: i64,
    dirty: bool,
    last_broadcast_ms: Option<i64>,
    observers: Vec<(SubscriptionId, Observer)>,
    next_subscription: SubscriptionId,
}

impl std::fmt::Debug for Awareness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awareness")
            .field("client_id", &self.client_id)
            .field("clock", &self.clock)
            .field("local", &self.local)
            .field("remote", &self.remote.len())
            .finish()
    }
}

impl Awareness {
    pub fn new(client_id: ClientId, throttle_ms: i64, timeout_ms: i64) -> Self {
        Self {
            client_id,
            clock: 0,
            local: None,
            remote: BTreeMap::new(),
            clocks: HashMap::new(),
            throttle_ms,
            timeout_ms,
            dirty: false,
            last_broadcast_ms: None,
            observers: Vec::new(),
            next_subscription: 1,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn local_state(&self) -> Option<&AwarenessState> {
        self.local.as_ref()
    }

    /// Snapshot of all remote peers, ordered by client id.
    pub fn entries(&self) -> Vec<AwarenessEntry> {
        self.remote.values().cloned().collect()
    }

    pub fn get(&self, client_id: ClientId) -> Option<&AwarenessEntry> {
        self.remote.get(&client_id)
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Register a callback invoked after every effective remote change.
    pub fn on_change(&mut self, callback: Arc<dyn Fn(&AwarenessChange) + Send + Sync>) -> SubscriptionId {
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.observers.push((id, callback));
        id
    }

    /// Returns whether the subscription existed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(sub, _)| *sub != id);
        self.observers.len() != before
    }

    fn notify(&self, mut change: AwarenessChange) -> AwarenessChange {
        if change.is_empty() {
            return change;
        }
        change.entries = self.entries();
        for (_, observer) in &self.observers {
            observer(&change);
        }
        change
    }

    // ------------------------------------------------------------------
    // Local state
    // ------------------------------------------------------------------

    /// Replace the local state. Broadcast happens on the next
    /// [`Awareness::poll_local_update`].
    pub fn set_local_state(&mut self, state: AwarenessState) {
        if self.local.as_ref() == Some(&state) {
            return;
        }
        self.local = Some(state);
        self.clock += 1;
        self.dirty = true;
    }

    /// Update only the cursor of the local state. No-op before a local
    /// state was set.
    pub fn set_local_cursor(&mut self, cursor: Option<CursorState>) {
        if let Some(mut state) = self.local.clone() {
            state.cursor = cursor;
            self.set_local_state(state);
        }
    }

    /// The local update to broadcast now, if any.
    ///
    /// Changes are coalesced to at most one update per throttle interval.
    /// An unchanged state is renewed every half timeout so peers do not
    /// evict it.
    pub fn poll_local_update(&mut self, now_ms: i64) -> Option<Vec<u8>> {
        self.local.as_ref()?;
        let since = self.last_broadcast_ms.map(|last| now_ms - last);
        let due = if self.dirty {
            since.is_none_or(|elapsed| elapsed >= self.throttle_ms)
        } else {
            since.is_none_or(|elapsed| elapsed >= self.timeout_ms / 2)
        };
        if !due {
            return None;
        }
        if !self.dirty {
            self.clock += 1;
        }
        self.dirty = false;
        self.last_broadcast_ms = Some(now_ms);
        Some(self.encode_local())
    }

    /// Encode the local entry regardless of throttling.
    pub fn encode_local(&self) -> Vec<u8> {
        encode_records(&[AwarenessRecord {
            client_id: self.client_id,
            clock: self.clock,
            state: self.local.clone(),
        }])
    }

    /// Drop the local state and return the leave update to broadcast.
    pub fn leave(&mut self) -> Vec<u8> {
        self.local = None;
        self.clock += 1;
        self.dirty = false;
        self.encode_local()
    }

    // ------------------------------------------------------------------
    // Remote state
    // ------------------------------------------------------------------

    /// Merge a remote update.
    pub fn apply_update(&mut self, update: &[u8], now_ms: i64) -> Result<AwarenessChange> {
        let records = decode_records(update)?;
        let mut change = AwarenessChange::default();
        for record in records {
            if record.client_id == self.client_id {
                continue;
            }
            let known = self.clocks.get(&record.client_id).copied();
            let newer = known.is_none_or(|clock| record.clock > clock);
            // Equal clock with a null state is a removal of a live entry.
            let leaving = known == Some(record.clock)
                && record.state.is_none()
                && self.remote.contains_key(&record.client_id);
            if !newer && !leaving {
                continue;
            }
            self.clocks.insert(record.client_id, record.clock);
            match record.state {
                None => {
                    if self.remote.remove(&record.client_id).is_some() {
                        change.removed.push(record.client_id);
                    }
                }
                Some(state) => {
                    let entry = AwarenessEntry {
                        client_id: record.client_id,
                        clock: record.clock,
                        state,
                        last_updated_ms: now_ms,
                    };
                    match self.remote.insert(record.client_id, entry) {
                        None => change.added.push(record.client_id),
                        Some(previous) => {
                            if self.remote.get(&record.client_id).map(|e| &e.state)
                                != Some(&previous.state)
                            {
                                change.updated.push(record.client_id);
                            }
                        }
                    }
                }
            }
        }
        Ok(self.notify(change))
    }

    /// Evict peers silent for longer than the timeout.
    pub fn remove_stale(&mut self, now_ms: i64) -> AwarenessChange {
        let stale: Vec<ClientId> = self
            .remote
            .values()
            .filter(|e| now_ms - e.last_updated_ms >= self.timeout_ms)
            .map(|e| e.client_id)
            .collect();
        if !stale.is_empty() {
            log::debug!("[Awareness] evicting {} silent peers", stale.len());
        }
        for client in &stale {
            self.remote.remove(client);
        }
        self.notify(AwarenessChange {
            removed: stale,
            ..Default::default()
        })
    }

    /// Forget every remote peer, e.g. after the connection dropped.
    pub fn clear_remote(&mut self) -> AwarenessChange {
        let removed: Vec<ClientId> = self.remote.keys().copied().collect();
        self.remote.clear();
        self.clocks.clear();
        self.notify(AwarenessChange {
            removed,
            ..Default::default()
        })
    }

    /// Remove the given peers and return an update announcing their leave
    /// to everyone else. Used by relays when a connection closes.
    pub fn remove_clients(&mut self, clients: &[ClientId]) -> (AwarenessChange, Vec<u8>) {
        let mut records = Vec::new();
        let mut removed = Vec::new();
        for client in clients {
            let clock = self.clocks.get(client).copied().unwrap_or(0).saturating_add(1);
            self.clocks.insert(*client, clock);
            if self.remote.remove(client).is_some() {
                removed.push(*client);
            }
            records.push(AwarenessRecord {
                client_id: *client,
                clock,
                state: None,
            });
        }
        let change = self.notify(AwarenessChange {
            removed,
            ..Default::default()
        });
        (change, encode_records(&records))
    }

    /// Encode the local entry and every remote entry.
    pub fn encode_all(&self) -> Vec<u8> {
        let mut records = Vec::with_capacity(self.remote.len() + 1);
        if self.local.is_some() {
            records.push(AwarenessRecord {
                client_id: self.client_id,
                clock: self.clock,
                state: self.local.clone(),
            });
        }
        records.extend(self.remote.values().map(|e| AwarenessRecord {
            client_id: e.client_id,
            clock: e.clock,
            state: Some(e.state.clone()),
        }));
        encode_records(&records)
    }
}

/// Encode awareness records.
pub fn encode_records(records: &[AwarenessRecord]) -> Vec<u8> {
    let mut buf = Vec::new();
    write_var_uint(&mut buf, records.len() as u64);
    for record in records {
        write_var_uint(&mut buf, record.client_id);
        write_var_uint(&mut buf, record.clock);
        let json = match &record.state {
            Some(state) => serde_json::to_string(state).unwrap_or_else(|_| "null".to_string()),
            None => "null".to_string(),
        };
        write_var_string(&mut buf, &json);
    }
    buf
}

/// Decode awareness records. States that do not parse are treated as
/// absent.
pub fn decode_records(update: &[u8]) -> Result<Vec<AwarenessRecord>> {
    let mut dec = Decoder::new(update);
    let count = dec.read_len()?;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let client_id = dec.read_var_uint()?;
        let clock = dec.read_var_uint()?;
        let json = dec.read_var_string()?;
        let state = match json.as_str() {
            "null" => None,
            _ => match serde_json::from_str(&json) {
                Ok(state) => Some(state),
                Err(e) => {
                    log::warn!("[Awareness] ignoring state of client {}: {}", client_id, e);
                    None
                }
            },
        };
        records.push(AwarenessRecord {
            client_id,
            clock,
            state,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::{OpId, ReplicaId};
    use std::sync::Mutex;

    fn state(name: &str) -> AwarenessState {
        AwarenessState {
            user: AwarenessUser::new(&format!("id-{}", name), name, None),
            cursor: None,
        }
    }

    fn peer(client: ClientId, name: &str) -> Awareness {
        let mut a = Awareness::new(client, DEFAULT_THROTTLE_MS, DEFAULT_TIMEOUT_MS);
        a.set_local_state(state(name));
        a
    }

    #[test]
    fn test_initials_and_color() {
        let user = AwarenessUser::new("u1", "ada lovelace", None);
        assert_eq!(user.initials(), "AL");
        assert_eq!(AwarenessUser::new("u2", "", None).initials(), "?");
        assert_eq!(user.color, color_for("u1"));
        assert!(PALETTE.contains(&user.color.as_str()));
    }

    #[test]
    fn test_state_json_shape() {
        let mut s = state("Bo");
        let pos = RelativePosition {
            container: OpId::new(ReplicaId(1), 1),
            left: None,
        };
        s.cursor = Some(CursorState {
            anchor: pos,
            head: pos,
        });
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["user"]["name"], "Bo");
        assert!(json["user"]["avatarUrl"].is_null());
        assert!(json["cursor"]["anchor"].is_object());
    }

    #[test]
    fn test_throttle_and_renewal() {
        let mut a = peer(1, "A");
        assert!(a.poll_local_update(0).is_some());

        a.set_local_cursor(None);
        a.set_local_state(state("A2"));
        assert!(a.poll_local_update(50).is_none());
        assert!(a.poll_local_update(100).is_some());

        // Nothing changed: only renewed after half the timeout.
        assert!(a.poll_local_update(5_000).is_none());
        assert!(a.poll_local_update(100 + DEFAULT_TIMEOUT_MS / 2).is_some());
    }

    #[test]
    fn test_last_writer_wins_by_clock() {
        let mut a = peer(1, "A");
        let mut b = peer(2, "B");
        let first = b.encode_local();
        b.set_local_state(state("B renamed"));
        let second = b.encode_local();

        let change = a.apply_update(&second, 0).unwrap();
        assert_eq!(change.added, vec![2]);
        // Older update arrives late and is ignored.
        let change = a.apply_update(&first, 1).unwrap();
        assert!(change.is_empty());
        assert_eq!(a.get(2).unwrap().state.user.name, "B renamed");
    }

    #[test]
    fn test_leave_and_timeout_evict() {
        let mut a = peer(1, "A");
        let mut b = peer(2, "B");
        let c = peer(3, "C");
        a.apply_update(&b.encode_local(), 0).unwrap();
        a.apply_update(&c.encode_local(), 0).unwrap();
        assert_eq!(a.entries().len(), 2);

        let change = a.apply_update(&b.leave(), 10).unwrap();
        assert_eq!(change.removed, vec![2]);

        let change = a.remove_stale(DEFAULT_TIMEOUT_MS);
        assert_eq!(change.removed, vec![3]);
        assert!(a.entries().is_empty());

        // Own entry echoed back is ignored.
        assert!(a.apply_update(&a.encode_local(), 0).unwrap().is_empty());
    }

    #[test]
    fn test_subscribers_receive_snapshots() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut a = peer(1, "A");
        let sub = a.on_change(Arc::new(move |change: &AwarenessChange| {
            sink.lock().unwrap().push(change.entries.len());
        }));
        a.apply_update(&peer(2, "B").encode_local(), 0).unwrap();
        a.clear_remote();
        assert!(a.unsubscribe(sub));
        assert!(!a.unsubscribe(sub));
        a.apply_update(&peer(3, "C").encode_local(), 0).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_relay_removes_clients_of_closed_connection() {
        let mut relay = Awareness::new(0, 0, DEFAULT_TIMEOUT_MS);
        let b = peer(2, "B");
        relay.apply_update(&b.encode_local(), 0).unwrap();
        let mut other = peer(3, "C");
        other.apply_update(&relay.encode_all(), 0).unwrap();
        assert_eq!(other.entries().len(), 1);

        let (change, leave) = relay.remove_clients(&[2]);
        assert_eq!(change.removed, vec![2]);
        let change = other.apply_update(&leave, 1).unwrap();
        assert_eq!(change.removed, vec![2]);
    }

    #[test]
    fn test_removing_client_at_clock_limit() {
        let mut relay = Awareness::new(0, 0, DEFAULT_TIMEOUT_MS);
        let maxed = encode_records(&[AwarenessRecord {
            client_id: 2,
            clock: u64::MAX,
            state: Some(state("B")),
        }]);
        relay.apply_update(&maxed, 0).unwrap();
        let mut other = peer(3, "C");
        other.apply_update(&maxed, 0).unwrap();

        let (change, leave) = relay.remove_clients(&[2]);
        assert_eq!(change.removed, vec![2]);
        // Equal clock with a null state still removes the live entry.
        let change = other.apply_update(&leave, 1).unwrap();
        assert_eq!(change.removed, vec![2]);
        assert!(other.entries().is_empty());
    }
}
