//! Collab Sync Server
//!
//! The shared service collaborative editors connect to.
//!
//! ## Features
//!
//! - **Real-time sync**: WebSocket endpoint (`/sync`) speaking the frame
//!   protocol of `collab_core::sync`; one room per document validates,
//!   persists and relays updates and presence
//! - **Version history**: REST endpoints for numbered snapshots under
//!   `/api/documents/{doc}/versions`
//! - **Persistent storage**: SQLite durable log with compaction, or memory
//!
//! ## Environment Variables
//!
//! - `HOST`: Server host (default: 0.0.0.0)
//! - `PORT`: Server port (default: 3030)
//! - `DATABASE_PATH`: Path to SQLite database (unset: in-memory)
//! - `AUTH_TOKENS`: Comma-separated `token:user_id` pairs
//! - `ALLOW_TOKEN_ISSUE`: Enable `POST /api/token` (default: false)
//! - `CORS_ORIGINS`: Comma-separated list of allowed origins
//! - `COMPACT_THRESHOLD`: Updates per document before compaction (default: 500)

pub mod auth;
pub mod config;
pub mod handlers;
pub mod sync;

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    routing::get,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub use config::Config;
pub use handlers::AppState;

/// Build the full router for a server state.
pub fn app(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        // Health check
        .route("/", get(|| async { "Collab Sync Server" }))
        .route("/health", get(|| async { "OK" }))
        // WebSocket sync endpoint
        .route("/sync", get(handlers::ws_handler).with_state(state.clone()))
        .nest(
            "/api",
            handlers::api_routes(state.clone()).merge(handlers::version_routes(state)),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(origins)
    }
}
