//! Version snapshot records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::crdt::{StateVector, decode_state_vector, encode_state_vector};
use crate::model::DocumentNode;

/// Serde helper storing bytes as standard base64.
pub(crate) mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// An immutable, numbered capture of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSnapshot {
    /// Monotonic per document, starting at 1
    pub version: u64,
    /// Optional human-readable name
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub author_id: String,
    /// The document as it was when the snapshot was taken
    pub content: DocumentNode,
    /// Encoded state vector of the replica at capture time
    #[serde(with = "base64_bytes")]
    pub state_vector: Vec<u8>,
}

impl VersionSnapshot {
    pub fn info(&self) -> VersionInfo {
        VersionInfo {
            version: self.version,
            name: self.name.clone(),
            created_at: self.created_at,
            author_id: self.author_id.clone(),
        }
    }

    /// Decoded capture state vector. Empty if it cannot be decoded.
    pub fn state(&self) -> StateVector {
        decode_state_vector(&self.state_vector).unwrap_or_default()
    }
}

/// Listing form of a version, without its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "bindings/")]
pub struct VersionInfo {
    pub version: u64,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub author_id: String,
}

/// A version about to be stored. The store assigns the number and time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVersion {
    pub name: Option<String>,
    pub author_id: String,
    pub content: DocumentNode,
    #[serde(with = "base64_bytes")]
    pub state_vector: Vec<u8>,
}

impl NewVersion {
    pub fn new(
        name: Option<String>,
        author_id: impl Into<String>,
        content: DocumentNode,
        state: &StateVector,
    ) -> Self {
        Self {
            name,
            author_id: author_id.into(),
            content,
            state_vector: encode_state_vector(state),
        }
    }

    /// Turn into a stored snapshot with the assigned number.
    pub fn into_snapshot(self, version: u64, created_at: DateTime<Utc>) -> VersionSnapshot {
        VersionSnapshot {
            version,
            name: self.name,
            created_at,
            author_id: self.author_id,
            content: self.content,
            state_vector: self.state_vector,
        }
    }
}
