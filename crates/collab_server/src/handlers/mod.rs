pub mod api;
pub mod error;
pub mod versions;
pub mod ws;

use std::sync::Arc;

use axum::extract::FromRef;
use collab_core::crdt::DocumentStore;
use collab_core::versions::StoreSnapshotService;

use crate::auth::TokenRegistry;
use crate::config::Config;
use crate::sync::SyncState;

pub use api::api_routes;
pub use error::ApiError;
pub use versions::version_routes;
pub use ws::ws_handler;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub tokens: Arc<TokenRegistry>,
    pub sync_state: Arc<SyncState>,
    pub snapshots: Arc<StoreSnapshotService>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn DocumentStore>) -> Self {
        let tokens = Arc::new(TokenRegistry::new(config.auth_tokens.clone()));
        let sync_state = Arc::new(SyncState::new(store.clone(), config.compact_threshold));
        Self {
            config: Arc::new(config),
            tokens,
            sync_state,
            snapshots: Arc::new(StoreSnapshotService::new(store)),
        }
    }
}

impl FromRef<AppState> for Arc<TokenRegistry> {
    fn from_ref(state: &AppState) -> Self {
        state.tokens.clone()
    }
}
