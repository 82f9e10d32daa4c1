mod connection;
mod room;

pub use connection::{ClientConnection, ConnectionId};
pub use room::{RoomMessage, SERVICE_ORIGIN, SyncRoom, SyncState, SyncStats};
