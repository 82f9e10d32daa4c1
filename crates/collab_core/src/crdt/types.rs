//! Records shared by the replica and the durable log.

use serde::{Deserialize, Serialize};

use super::ids::OpId;

/// A logged batch of encoded changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredUpdate {
    /// Unique, increasing identifier for this update
    pub update_id: i64,

    /// Name of the document this update belongs to
    pub doc_name: String,

    /// Encoded change batch
    pub data: Vec<u8>,

    /// Unix timestamp when this update was stored (milliseconds)
    pub timestamp: i64,

    /// Origin of this update (local edit, remote peer, etc.)
    pub origin: UpdateOrigin,
}

/// Origin of an update, used to distinguish local vs remote changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOrigin {
    /// Update originated from local user action
    Local,

    /// Update received from a remote peer
    Remote,

    /// Update from the initial sync handshake
    Sync,
}

impl std::fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateOrigin::Local => write!(f, "local"),
            UpdateOrigin::Remote => write!(f, "remote"),
            UpdateOrigin::Sync => write!(f, "sync"),
        }
    }
}

impl std::str::FromStr for UpdateOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(UpdateOrigin::Local),
            "remote" => Ok(UpdateOrigin::Remote),
            "sync" => Ok(UpdateOrigin::Sync),
            _ => Err(format!("Unknown update origin: {}", s)),
        }
    }
}

/// Notification emitted by a replica after its document changed or a
/// change was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaEvent {
    /// `count` changes were integrated and the document should be re-rendered.
    Changed { origin: UpdateOrigin, count: usize },
    /// A change was consumed but could not be applied.
    Dropped { id: OpId, reason: String },
}
