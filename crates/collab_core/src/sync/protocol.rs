//! Wire protocol between sessions and the sync service.
//!
//! Every WebSocket binary message is one [`Frame`], compatible with the
//! Hocuspocus framing of y-sync:
//!
//! ```text
//! varString(documentName) varUint(messageType) payload
//! ```
//!
//! | type | message | payload |
//! |---|---|---|
//! | 0 | Sync | `varUint(0 Step1 / 1 Step2 / 2 Update)` + `varBytes` |
//! | 1 | Awareness | `varBytes` awareness update |
//! | 2 | Auth | `varUint(0 Token / 1 PermissionDenied / 2 Authenticated)` + `varString` |
//! | 3 | QueryAwareness | empty |
//! | 5 | Stateless | `varString` JSON |
//! | 6 | BroadcastStateless | `varString` JSON |
//! | 7 | Close | `varUint` code + `varString` reason |
//! | 8 | SyncStatus | `varUint` 1 applied / 0 rejected |
//!
//! Step1 carries an encoded state vector; Step2 and Update carry encoded
//! change batches. The service acknowledges every Update it receives with
//! exactly one SyncStatus frame, in order.

use serde::{Deserialize, Serialize};

use crate::crdt::{Decoder, write_var_byte_array, write_var_string, write_var_uint};
use crate::error::{CollabError, Result};
use crate::model::DocumentNode;

/// Message type tags.
mod msg_type {
    pub const SYNC: u64 = 0;
    pub const AWARENESS: u64 = 1;
    pub const AUTH: u64 = 2;
    pub const QUERY_AWARENESS: u64 = 3;
    pub const STATELESS: u64 = 5;
    pub const BROADCAST_STATELESS: u64 = 6;
    pub const CLOSE: u64 = 7;
    pub const SYNC_STATUS: u64 = 8;
}

/// Sync sub-message types.
mod sync_type {
    /// SyncStep1: Initial state vector exchange
    pub const STEP1: u64 = 0;
    /// SyncStep2: Missing updates response
    pub const STEP2: u64 = 1;
    /// Update: Incremental update
    pub const UPDATE: u64 = 2;
}

mod auth_type {
    pub const TOKEN: u64 = 0;
    pub const PERMISSION_DENIED: u64 = 1;
    pub const AUTHENTICATED: u64 = 2;
}

/// Close code sent when a document session ends normally.
pub const CLOSE_NORMAL: u64 = 1000;

/// Document sync messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// SyncStep1 contains a state vector
    Step1(Vec<u8>),
    /// SyncStep2 contains the changes the peer is missing
    Step2(Vec<u8>),
    /// Update contains an incremental change batch
    Update(Vec<u8>),
}

/// Authentication messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMessage {
    /// Client credentials (a bearer token)
    Token(String),
    /// Server rejection with a reason
    PermissionDenied(String),
    /// Server acceptance with the granted scope
    Authenticated(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Sync(SyncMessage),
    Awareness(Vec<u8>),
    Auth(AuthMessage),
    QueryAwareness,
    Stateless(String),
    BroadcastStateless(String),
    Close { code: u64, reason: String },
    SyncStatus(bool),
}

impl MessageBody {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            MessageBody::Sync(SyncMessage::Step1(_)) => "SyncStep1",
            MessageBody::Sync(SyncMessage::Step2(_)) => "SyncStep2",
            MessageBody::Sync(SyncMessage::Update(_)) => "Update",
            MessageBody::Awareness(_) => "Awareness",
            MessageBody::Auth(_) => "Auth",
            MessageBody::QueryAwareness => "QueryAwareness",
            MessageBody::Stateless(_) => "Stateless",
            MessageBody::BroadcastStateless(_) => "BroadcastStateless",
            MessageBody::Close { .. } => "Close",
            MessageBody::SyncStatus(_) => "SyncStatus",
        }
    }
}

/// One framed protocol message addressed to a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub document: String,
    pub body: MessageBody,
}

impl Frame {
    pub fn new(document: impl Into<String>, body: MessageBody) -> Self {
        Self {
            document: document.into(),
            body,
        }
    }

    /// Encode the frame to bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_var_string(&mut buf, &self.document);
        match &self.body {
            MessageBody::Sync(msg) => {
                write_var_uint(&mut buf, msg_type::SYNC);
                let (sub, payload) = match msg {
                    SyncMessage::Step1(sv) => (sync_type::STEP1, sv),
                    SyncMessage::Step2(update) => (sync_type::STEP2, update),
                    SyncMessage::Update(update) => (sync_type::UPDATE, update),
                };
                write_var_uint(&mut buf, sub);
                write_var_byte_array(&mut buf, payload);
            }
            MessageBody::Awareness(update) => {
                write_var_uint(&mut buf, msg_type::AWARENESS);
                write_var_byte_array(&mut buf, update);
            }
            MessageBody::Auth(auth) => {
                write_var_uint(&mut buf, msg_type::AUTH);
                let (sub, text) = match auth {
                    AuthMessage::Token(token) => (auth_type::TOKEN, token),
                    AuthMessage::PermissionDenied(reason) => (auth_type::PERMISSION_DENIED, reason),
                    AuthMessage::Authenticated(scope) => (auth_type::AUTHENTICATED, scope),
                };
                write_var_uint(&mut buf, sub);
                write_var_string(&mut buf, text);
            }
            MessageBody::QueryAwareness => write_var_uint(&mut buf, msg_type::QUERY_AWARENESS),
            MessageBody::Stateless(payload) => {
                write_var_uint(&mut buf, msg_type::STATELESS);
                write_var_string(&mut buf, payload);
            }
            MessageBody::BroadcastStateless(payload) => {
                write_var_uint(&mut buf, msg_type::BROADCAST_STATELESS);
                write_var_string(&mut buf, payload);
            }
            MessageBody::Close { code, reason } => {
                write_var_uint(&mut buf, msg_type::CLOSE);
                write_var_uint(&mut buf, *code);
                write_var_string(&mut buf, reason);
            }
            MessageBody::SyncStatus(applied) => {
                write_var_uint(&mut buf, msg_type::SYNC_STATUS);
                write_var_uint(&mut buf, *applied as u64);
            }
        }
        buf
    }

    /// Decode a frame.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(data);
        let document = dec.read_var_string()?;
        let msg_type = dec.read_var_uint()?;
        let body = match msg_type {
            msg_type::SYNC => {
                let sub = dec.read_var_uint()?;
                let payload = dec.read_var_byte_array()?.to_vec();
                MessageBody::Sync(match sub {
                    sync_type::STEP1 => SyncMessage::Step1(payload),
                    sync_type::STEP2 => SyncMessage::Step2(payload),
                    sync_type::UPDATE => SyncMessage::Update(payload),
                    other => {
                        return Err(CollabError::Decode(format!("Unknown sync type: {}", other)));
                    }
                })
            }
            msg_type::AWARENESS => MessageBody::Awareness(dec.read_var_byte_array()?.to_vec()),
            msg_type::AUTH => {
                let sub = dec.read_var_uint()?;
                let text = dec.read_var_string()?;
                MessageBody::Auth(match sub {
                    auth_type::TOKEN => AuthMessage::Token(text),
                    auth_type::PERMISSION_DENIED => AuthMessage::PermissionDenied(text),
                    auth_type::AUTHENTICATED => AuthMessage::Authenticated(text),
                    other => {
                        return Err(CollabError::Decode(format!("Unknown auth type: {}", other)));
                    }
                })
            }
            msg_type::QUERY_AWARENESS => MessageBody::QueryAwareness,
            msg_type::STATELESS => MessageBody::Stateless(dec.read_var_string()?),
            msg_type::BROADCAST_STATELESS => MessageBody::BroadcastStateless(dec.read_var_string()?),
            msg_type::CLOSE => {
                let code = dec.read_var_uint()?;
                let reason = dec.read_var_string()?;
                MessageBody::Close { code, reason }
            }
            msg_type::SYNC_STATUS => MessageBody::SyncStatus(dec.read_var_uint()? == 1),
            other => {
                return Err(CollabError::Decode(format!("Unknown message type: {}", other)));
            }
        };
        log::debug!(
            "[Sync] Decoded {} for '{}' ({} bytes)",
            body.name(),
            document,
            data.len()
        );
        Ok(Self { document, body })
    }
}

/// Application messages carried by Stateless frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum StatelessMessage {
    /// Ask the service for the content of a version.
    #[serde(rename = "version.preview")]
    VersionPreview { version: u64 },
    /// The service's answer. `content` is absent if the version is unknown.
    #[serde(rename = "version.preview.content")]
    VersionPreviewContent {
        version: u64,
        #[serde(default)]
        content: Option<DocumentNode>,
    },
    /// A new version was stored.
    #[serde(rename = "version.created")]
    VersionCreated { version: u64 },
    /// Someone reverted the document to a version.
    #[serde(rename = "version.reverted")]
    VersionReverted { version: u64 },
}

impl StatelessMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}
