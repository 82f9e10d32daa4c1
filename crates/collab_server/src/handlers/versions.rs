//! Version snapshot endpoints.
//!
//! ```text
//! POST /api/documents/{doc}/versions            NewVersion -> 201 VersionSnapshot
//! GET  /api/documents/{doc}/versions            -> [VersionInfo]
//! GET  /api/documents/{doc}/versions/{version}  -> VersionSnapshot
//! ```

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use collab_core::sync::StatelessMessage;
use collab_core::versions::{NewVersion, SnapshotService};
use tracing::{info, warn};

use super::{ApiError, AppState};
use crate::auth::RequireAuth;
use crate::sync::SERVICE_ORIGIN;

/// Create the version routes, mounted under `/api`.
pub fn version_routes(state: AppState) -> Router {
    Router::new()
        .route("/documents/{doc}/versions", get(list_versions).post(create_version))
        .route("/documents/{doc}/versions/{version}", get(get_version))
        .with_state(state)
}

/// POST /api/documents/{doc}/versions - Store a new version
async fn create_version(
    State(state): State<AppState>,
    RequireAuth(user_id): RequireAuth,
    Path(doc): Path<String>,
    Json(mut version): Json<NewVersion>,
) -> Result<impl IntoResponse, ApiError> {
    if version.author_id.is_empty() {
        version.author_id = user_id.clone();
    }
    let snapshot = state.snapshots.create_version(&doc, version).await?;
    info!(
        document = %doc,
        version = snapshot.version,
        user = %user_id,
        "stored version"
    );

    if let Some(room) = state.sync_state.room(&doc).await {
        let announcement = StatelessMessage::VersionCreated {
            version: snapshot.version,
        };
        if let Err(e) = room.broadcast_stateless(&announcement, SERVICE_ORIGIN) {
            warn!(document = %doc, "could not announce version: {}", e);
        }
    }

    Ok((StatusCode::CREATED, Json(snapshot)))
}

/// GET /api/documents/{doc}/versions - List versions in ascending order
async fn list_versions(
    State(state): State<AppState>,
    RequireAuth(_): RequireAuth,
    Path(doc): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.snapshots.list_versions(&doc).await?))
}

/// GET /api/documents/{doc}/versions/{version} - One version with content
async fn get_version(
    State(state): State<AppState>,
    RequireAuth(_): RequireAuth,
    Path((doc, version)): Path<(String, u64)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.snapshots.fetch_version(&doc, version).await?))
}
