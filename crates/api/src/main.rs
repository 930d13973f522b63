//! Classbook API server

use std::sync::Arc;

use anyhow::Context;
use classbook_api::{config::Config, routes::create_router, state::AppState, telemetry::init_tracing};
use classbook_shared::{create_pool, run_migrations, DocumentStore, MemoryDocumentStore, PgDocumentStore};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(config.log_json);
    info!("Configuration loaded. Starting Classbook API...");

    let store: Arc<dyn DocumentStore> = match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let pool = create_pool(url, config.database_max_connections)
                .await
                .context("Failed to connect to database")?;
            info!("Running database migrations...");
            run_migrations(&pool).await.context("Failed to run migrations")?;
            Arc::new(PgDocumentStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store; data is lost on restart");
            Arc::new(MemoryDocumentStore::new())
        }
    };

    let bind_address = config.bind_address.clone();
    let state = AppState::new(config, store).context("Failed to build application state")?;
    let app = create_router(state);

    info!("Listening on {}", bind_address);
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
