use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use collab_core::CollabError;
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState};

/// Server status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub version: String,
    pub active_connections: usize,
    pub active_rooms: usize,
}

/// Body of a token request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
}

/// Create API routes
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/token", post(issue_token))
        .with_state(state)
}

/// GET /api/status - Get server status (public endpoint)
async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.sync_state.stats().await;

    Json(StatusResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_connections: stats.active_connections,
        active_rooms: stats.active_rooms,
    })
}

/// POST /api/token - Mint a token for a user (only when enabled)
async fn issue_token(
    State(state): State<AppState>,
    Json(request): Json<TokenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.config.allow_token_issue {
        return Err(CollabError::Authorization("token issuing is disabled".to_string()).into());
    }
    if request.user_id.trim().is_empty() {
        return Err(CollabError::Authorization("missing user id".to_string()).into());
    }
    let token = state
        .tokens
        .issue(request.user_id.trim())
        .ok_or_else(|| CollabError::Storage("token registry unavailable".to_string()))?;
    Ok((StatusCode::CREATED, Json(TokenResponse { token })))
}
