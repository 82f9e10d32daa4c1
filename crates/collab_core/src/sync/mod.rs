//! Sync transport session.
//!
//! [`protocol`] defines the binary frames exchanged with the sync service,
//! [`SyncSession`] is the transport-independent state machine of one open
//! document, and `CollabClient` (feature `native-sync`) drives a session
//! over a WebSocket.

#[cfg(feature = "native-sync")]
mod client;
pub mod protocol;
mod session;

#[cfg(feature = "native-sync")]
pub use client::{CollabClient, fetch_token};
pub use protocol::{AuthMessage, CLOSE_NORMAL, Frame, MessageBody, StatelessMessage, SyncMessage};
pub use session::{ConnectionStatus, SessionEvent, SessionOptions, SyncSession};
