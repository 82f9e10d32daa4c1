//! Replicated document state.
//!
//! [`ReplicaState`] merges local and remote [`Change`]s into one document
//! that converges on every replica. Changes travel as compact binary
//! batches ([`encode_changes`]) and are persisted through a
//! [`DocumentStore`].

mod change;
mod codec;
mod ids;
mod memory_storage;
mod replica;
#[cfg(feature = "sqlite")]
mod sqlite_storage;
mod storage;
mod types;

pub use change::{Change, ChangeKind};
pub use codec::{
    Decoder, decode_changes, decode_state_vector, encode_changes, encode_state_vector,
    read_var_uint, write_var_byte_array, write_var_string, write_var_uint,
};
pub use ids::{OpId, OrderKey, ReplicaId, StateVector};
pub use memory_storage::MemoryStore;
pub use replica::{MergeReport, RelativePosition, ReplicaState};
#[cfg(feature = "sqlite")]
pub use sqlite_storage::SqliteStore;
pub(crate) use storage::poisoned;
pub use storage::{DocumentStore, StorageResult};
pub use types::{ReplicaEvent, StoredUpdate, UpdateOrigin};
