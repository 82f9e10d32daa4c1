use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crdt::OpId;

/// Unified error type for collaborative editing operations
#[derive(Debug, Error)]
pub enum CollabError {
    // Document model errors
    #[error("Malformed operation: {0}")]
    MalformedOperation(String),

    // Merge errors (soft: reported, never fatal to the session)
    #[error("Unknown or collected anchor {0}")]
    UnknownAnchor(OpId),

    // Session errors
    #[error("Authorization rejected: {0}")]
    Authorization(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Not connected to the sync service")]
    NotConnected,

    #[error("{0} is disabled for this session")]
    Disabled(String),

    // Version history errors
    #[error("Version {0} not found")]
    VersionNotFound(u64),

    #[error("Nothing changed since {}", since_label(.since_version))]
    EmptyDocument {
        /// Version number of the last snapshot, if any
        since_version: Option<u64>,
    },

    // Wire and codec errors
    #[error("Decode error: {0}")]
    Decode(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    // IO and serialization errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(String),
}

fn since_label(version: &Option<u64>) -> String {
    match version {
        Some(v) => format!("version {}", v),
        None => "the document was opened".to_string(),
    }
}

/// Result type alias for collaborative editing operations
pub type Result<T> = std::result::Result<T, CollabError>;

impl CollabError {
    /// Whether the error is transient and the operation may be retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CollabError::Connection(_) | CollabError::NotConnected | CollabError::Http(_)
        )
    }

    /// Convert to a serializable representation for JSON transport
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}

/// A serializable representation of CollabError for REST bodies and IPC
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
}

impl From<&CollabError> for SerializableError {
    fn from(err: &CollabError) -> Self {
        let kind = match err {
            CollabError::MalformedOperation(_) => "MalformedOperation",
            CollabError::UnknownAnchor(_) => "UnknownAnchor",
            CollabError::Authorization(_) => "Authorization",
            CollabError::Connection(_) => "Connection",
            CollabError::NotConnected => "NotConnected",
            CollabError::Disabled(_) => "Disabled",
            CollabError::VersionNotFound(_) => "VersionNotFound",
            CollabError::EmptyDocument { .. } => "EmptyDocument",
            CollabError::Decode(_) => "Decode",
            CollabError::Storage(_) => "Storage",
            #[cfg(feature = "sqlite")]
            CollabError::Sqlite(_) => "Sqlite",
            CollabError::Io(_) => "Io",
            CollabError::Json(_) => "Json",
            CollabError::ConfigParse(_) => "ConfigParse",
            CollabError::Http(_) => "Http",
        }
        .to_string();

        Self {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<CollabError> for SerializableError {
    fn from(err: CollabError) -> Self {
        SerializableError::from(&err)
    }
}

impl SerializableError {
    /// Rebuild the closest matching error on the receiving side.
    ///
    /// Variants carrying payloads that do not survive JSON are mapped onto
    /// their message; unknown kinds become [`CollabError::Http`].
    pub fn into_error(self) -> CollabError {
        match self.kind.as_str() {
            "MalformedOperation" => CollabError::MalformedOperation(self.message),
            "Authorization" => CollabError::Authorization(self.message),
            "Connection" => CollabError::Connection(self.message),
            "NotConnected" => CollabError::NotConnected,
            "VersionNotFound" => match trailing_number(&self.message) {
                Some(v) => CollabError::VersionNotFound(v),
                None => CollabError::Http(self.message),
            },
            "EmptyDocument" => CollabError::EmptyDocument {
                since_version: trailing_number(&self.message),
            },
            "Decode" => CollabError::Decode(self.message),
            "Storage" | "Sqlite" => CollabError::Storage(self.message),
            _ => CollabError::Http(self.message),
        }
    }
}

/// Find the first number in an error message ("Version 3 not found" -> 3).
fn trailing_number(message: &str) -> Option<u64> {
    message
        .split(|c: char| !c.is_ascii_digit())
        .find(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializable_kind() {
        let err = CollabError::VersionNotFound(7);
        let ser = err.to_serializable();
        assert_eq!(ser.kind, "VersionNotFound");
        assert_eq!(ser.message, "Version 7 not found");
    }

    #[test]
    fn test_serializable_round_trip_keeps_variant() {
        let ser = CollabError::VersionNotFound(12).to_serializable();
        assert!(matches!(ser.into_error(), CollabError::VersionNotFound(12)));

        let ser = CollabError::EmptyDocument {
            since_version: Some(4),
        }
        .to_serializable();
        assert!(matches!(
            ser.into_error(),
            CollabError::EmptyDocument {
                since_version: Some(4)
            }
        ));

        let ser = CollabError::EmptyDocument {
            since_version: None,
        }
        .to_serializable();
        assert!(matches!(
            ser.into_error(),
            CollabError::EmptyDocument {
                since_version: None
            }
        ));
    }

    #[test]
    fn test_transient_errors() {
        assert!(CollabError::NotConnected.is_transient());
        assert!(CollabError::Connection("reset".into()).is_transient());
        assert!(!CollabError::Authorization("nope".into()).is_transient());
        assert!(!CollabError::VersionNotFound(1).is_transient());
    }
}
