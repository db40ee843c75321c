//! Planloom - planner/evaluator conversation backend
//!
//! Persists multi-session conversations as a per-session step graph and
//! drives planner/evaluator model turns over it.

mod api;
mod db;
mod graph;
mod llm;
mod session;
mod views;

use api::{create_router, AppState};
use db::Database;
use llm::{LlmConfig, ModelRegistry};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "planloom=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // Configuration
    let db_path = std::env::var("PLANLOOM_DB_PATH").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.planloom/planloom.db")
    });

    let port: u16 = std::env::var("PLANLOOM_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Initialize database
    tracing::info!(path = %db_path, "Opening database");
    let db = Database::open(&db_path)?;

    // Initialize the model registry and mirror it into the catalog
    let llm_config = LlmConfig::from_env();
    let registry = Arc::new(ModelRegistry::new(&llm_config));
    registry.sync_catalog(&db)?;

    if registry.has_models() {
        tracing::info!(
            models = ?registry.available_models(),
            planner = ?registry.default_planner_model_id(),
            evaluator = ?registry.default_evaluator_model_id(),
            "Model registry initialized"
        );
    } else {
        tracing::warn!("No model API keys configured. Set ANTHROPIC_API_KEY or OPENAI_API_KEY.");
    }

    // Create application state and router
    let state = AppState::new(db, registry);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Planloom server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
