//! Version history: immutable numbered snapshots of a document.

#[cfg(feature = "native-sync")]
mod http;
mod manager;
pub(crate) mod service;
mod snapshot;

#[cfg(feature = "native-sync")]
pub use http::HttpSnapshotService;
pub use manager::{
    Capture, ConfirmedRevert, DEFAULT_AUTO_VERSION_INTERVAL_MS, PreviewHandle, PreviewOutcome,
    PreviewState, RevertRequest, VersionManager,
};
pub use service::{BoxFuture, SnapshotService, StoreSnapshotService};
pub use snapshot::{NewVersion, VersionInfo, VersionSnapshot};
