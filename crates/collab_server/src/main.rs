use collab_core::crdt::{DocumentStore, MemoryStore, SqliteStore};
use collab_server::{AppState, Config, app};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Collab Sync Server v{}", env!("CARGO_PKG_VERSION"));
    info!("CORS origins: {:?}", config.cors_origins);
    if config.auth_tokens.is_empty() && !config.allow_token_issue {
        warn!("No AUTH_TOKENS configured and token issuing is off; every client will be rejected");
    }

    // Open the durable log
    let store: Arc<dyn DocumentStore> = match &config.database_path {
        Some(path) => {
            info!("Database path: {:?}", path);
            match SqliteStore::open(path) {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    error!("Failed to open database: {}", e);
                    std::process::exit(1);
                }
            }
        }
        None => {
            warn!("DATABASE_PATH not set; documents are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let addr = config.server_addr();
    let router = app(AppState::new(config, store));

    // Create listener
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Server listening on http://{}", addr);

    // Run server with graceful shutdown
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        std::process::exit(1);
    }

    info!("Server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
