//! Configuration types.
//!
//! [`CollabConfig`] holds where the sync service lives and the session
//! timings. It is usually loaded from TOML; every key is optional and falls
//! back to its default.
//!
//! ```toml
//! api_base_url = "https://collab.example.org"
//! document_prefix = "acme:"
//! awareness_timeout_ms = 20000
//! ```
//!
//! [`EditorCapabilities`] replaces the scattered feature switches of an
//! editor host: it is resolved once when an `EditorSession` is created.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::awareness::{DEFAULT_THROTTLE_MS, DEFAULT_TIMEOUT_MS};
use crate::error::Result;
use crate::model::DocumentNode;
use crate::versions::DEFAULT_AUTO_VERSION_INTERVAL_MS;

const DEFAULT_API_BASE_URL: &str = "http://localhost:3030";

/// Connection and timing settings of the collaborative editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    /// Base URL of the sync service (e.g. "https://collab.example.org").
    /// The WebSocket endpoint is derived from it.
    pub api_base_url: String,

    /// Namespace prefix of document names. The document name of a project
    /// is `document_prefix + project_id`.
    pub document_prefix: String,

    /// Endpoint returning a bearer token for the current user, relative to
    /// `api_base_url` unless absolute
    pub token_endpoint: String,

    /// Minimum delay between two local awareness broadcasts
    pub awareness_throttle_ms: i64,

    /// Remote peers silent for this long are evicted
    pub awareness_timeout_ms: i64,

    /// Auto-versioning interval
    pub auto_version_interval_ms: i64,

    /// First reconnect delay; doubled after every failed attempt
    pub reconnect_initial_delay_ms: u64,

    /// Upper bound of the reconnect delay
    pub reconnect_max_delay_ms: u64,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            document_prefix: String::new(),
            token_endpoint: "/api/token".to_string(),
            awareness_throttle_ms: DEFAULT_THROTTLE_MS,
            awareness_timeout_ms: DEFAULT_TIMEOUT_MS,
            auto_version_interval_ms: DEFAULT_AUTO_VERSION_INTERVAL_MS,
            reconnect_initial_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
        }
    }
}

impl CollabConfig {
    /// Parse a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Fully qualified document name of a project.
    pub fn document_name(&self, project_id: &str) -> String {
        format!("{}{}", self.document_prefix, project_id)
    }

    /// WebSocket URL of the sync endpoint.
    pub fn websocket_url(&self) -> String {
        let base = self.api_base_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/sync", base)
    }

    /// Absolute URL of the token endpoint.
    pub fn token_url(&self) -> String {
        if self.token_endpoint.starts_with("http://") || self.token_endpoint.starts_with("https://")
        {
            self.token_endpoint.clone()
        } else {
            format!(
                "{}/{}",
                self.api_base_url.trim_end_matches('/'),
                self.token_endpoint.trim_start_matches('/')
            )
        }
    }
}

/// Feature switches of one editor session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EditorCapabilities {
    /// Connect to the sync service. Off means a local-only document.
    pub collaboration: bool,
    /// Publish and show cursors
    pub cursors: bool,
    pub version_history: bool,
    /// Initial state of the auto-versioning toggle
    pub auto_versioning: bool,
    pub undo: bool,
    /// Content written into a document found empty on first sync
    pub initial_content: Option<DocumentNode>,
}

impl Default for EditorCapabilities {
    fn default() -> Self {
        Self {
            collaboration: true,
            cursors: true,
            version_history: true,
            auto_versioning: false,
            undo: true,
            initial_content: Some(default_initial_content()),
        }
    }
}

/// A heading and an empty paragraph.
pub fn default_initial_content() -> DocumentNode {
    DocumentNode::doc(vec![
        DocumentNode::heading(1, vec![DocumentNode::text("Untitled")]),
        DocumentNode::paragraph(Vec::new()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_keys_use_defaults() {
        let config = CollabConfig::from_toml(
            r#"
            api_base_url = "https://collab.example.org/"
            document_prefix = "acme:"
            awareness_timeout_ms = 20000
            "#,
        )
        .unwrap();
        assert_eq!(config.awareness_timeout_ms, 20_000);
        assert_eq!(config.awareness_throttle_ms, DEFAULT_THROTTLE_MS);
        assert_eq!(config.reconnect_max_delay_ms, 30_000);
        assert_eq!(config.document_name("p1"), "acme:p1");
        assert_eq!(config.websocket_url(), "wss://collab.example.org/sync");
        assert_eq!(
            config.token_url(),
            "https://collab.example.org/api/token"
        );
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            CollabConfig::from_toml("awareness_timeout_ms = \"soon\""),
            Err(crate::error::CollabError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_capabilities_from_json() {
        let caps: EditorCapabilities =
            serde_json::from_str(r#"{"cursors": false, "autoVersioning": true}"#).unwrap();
        assert!(caps.collaboration);
        assert!(!caps.cursors);
        assert!(caps.auto_versioning);
        assert!(caps.initial_content.is_some());
    }
}
