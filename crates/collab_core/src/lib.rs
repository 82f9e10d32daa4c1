#![doc = include_str!("../README.md")]

/// Awareness (who is here, and where their cursor is)
pub mod awareness;

/// Configuration options
pub mod config;

/// Replicated document state (CRDT, codec, durable log)
pub mod crdt;

/// Editor session facade tying sync, undo, presence and versions together
pub mod editor;

/// Error (common error types)
pub mod error;

/// User identity and project membership
pub mod identity;

/// Structured document model and invertible operations
pub mod model;

/// Sync transport session and wire protocol
pub mod sync;

/// Version snapshots, preview and revert
pub mod versions;

pub use editor::{EditorSession, RevertOutcome};
pub use error::{CollabError, Result};

/// Shared fixtures for unit and integration tests
#[doc(hidden)]
pub mod test_utils;
