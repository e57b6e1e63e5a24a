// src/main.rs
// Storefront customer-service assistant engine: HTTP + WebSocket server.

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use sqlx::sqlite::{SqlitePoolOptions, SqliteConnectOptions};
use std::str::FromStr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use storefront_engine::api::http::{catalog_webhook, health_check, send_message};
use storefront_engine::api::ws::ws_chat_handler;
use storefront_engine::config::CONFIG;
use storefront_engine::knowledge::validate_dir_exists;
use storefront_engine::metrics::{init_metrics, metrics_handler};
use storefront_engine::tasks::TaskManager;
use storefront_engine::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(CONFIG.logging.level.clone())
        .init();

    info!("starting storefront engine");

    let connect_options = SqliteConnectOptions::from_str(&CONFIG.database.url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(CONFIG.database.max_connections)
        .connect_with(connect_options)
        .await?;

    info!("running migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    init_metrics();

    let app_state = Arc::new(AppState::new(pool).await?);

    let knowledge_dir = std::path::PathBuf::from(&CONFIG.knowledge.directory);
    if validate_dir_exists(&knowledge_dir).is_ok() {
        match app_state.knowledge_loader.reload(&knowledge_dir).await {
            Ok(count) => info!(count, "loaded knowledge base on startup"),
            Err(e) => tracing::warn!(error = %e, "failed to load knowledge base on startup"),
        }
    } else {
        info!(dir = %knowledge_dir.display(), "knowledge directory not present, skipping initial load");
    }

    let mut tasks = TaskManager::new(app_state.clone());
    tasks.start().await;

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/api/chat", post(send_message))
        .route("/webhooks/catalog", post(catalog_webhook))
        .route("/ws/chat/{client_id}", get(ws_chat_handler))
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let bind_address = CONFIG.bind_address();
    info!(%bind_address, "listening");
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    axum::serve(listener, app).await?;

    tasks.shutdown().await;
    Ok(())
}
