//! HTTP API
//!
//! Thin transport over the session, graph, and view operations.

mod handlers;
mod types;

pub use handlers::create_router;

use crate::db::Database;
use crate::graph::StepGraph;
use crate::llm::ModelRegistry;
use crate::session::SessionManager;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub graph: StepGraph,
    pub sessions: SessionManager,
    pub registry: Arc<ModelRegistry>,
}

impl AppState {
    pub fn new(db: Database, registry: Arc<ModelRegistry>) -> Self {
        Self {
            graph: StepGraph::new(db.clone()),
            sessions: SessionManager::new(db.clone()),
            db,
            registry,
        }
    }
}
