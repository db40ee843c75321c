//! HTTP request handlers

use super::types::{
    AppendStepRequest, ChatRequest, CreateSessionRequest, CreateUserRequest, ErrorResponse,
    EvaluateRequest, IterationResponse, ModelsResponse, SessionListResponse, SessionResponse,
    StepListResponse, StepResponse, SuccessResponse, TurnResponse, UserResponse,
};
use super::AppState;
use crate::db::DbError;
use crate::views;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/version", get(get_version))
        // Users (auth itself is out of scope; callers pass a resolved user_id)
        .route("/api/users", post(create_user))
        // Session lifecycle
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route("/api/sessions/:id/deactivate", post(deactivate_session))
        // Projections
        .route("/api/sessions/:id/history", get(session_history))
        .route("/api/sessions/:id/latest-iteration", get(latest_iteration))
        // Step graph
        .route("/api/sessions/:id/steps", post(append_step))
        .route("/api/sessions/:id/chat", post(chat))
        .route("/api/sessions/:id/evaluate", post(evaluate))
        .route("/api/steps/:id/subtree", get(step_subtree))
        .route("/api/steps/:id/delete", post(delete_step))
        // Model catalog
        .route("/api/models", get(list_models))
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn get_version() -> &'static str {
    concat!("planloom ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Users
// ============================================================

async fn create_user(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<UserResponse>, AppError> {
    let user = state.db.create_user(&req.username, &req.email, &req.password)?;
    Ok(Json(UserResponse { user }))
}

// ============================================================
// Session Lifecycle
// ============================================================

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    let planner = req
        .planner_model_id
        .as_deref()
        .or_else(|| state.registry.default_planner_model_id())
        .ok_or_else(|| AppError::BadRequest("No planner model configured".to_string()))?;
    let evaluator = req
        .evaluator_model_id
        .as_deref()
        .or_else(|| state.registry.default_evaluator_model_id())
        .ok_or_else(|| AppError::BadRequest("No evaluator model configured".to_string()))?;

    let session = state.sessions.create_session(
        req.user_id,
        &req.title,
        planner,
        evaluator,
        req.description.as_deref(),
    )?;

    Ok(Json(SessionResponse { session }))
}

#[derive(Debug, Deserialize)]
struct ListSessionsQuery {
    user_id: i64,
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<SessionListResponse>, AppError> {
    let sessions = views::active_sessions(&state.db, query.user_id)?;
    Ok(Json(SessionListResponse { sessions }))
}

async fn deactivate_session(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<SuccessResponse>, AppError> {
    state.sessions.deactivate_session(id)?;
    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================
// Projections
// ============================================================

async fn session_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<StepListResponse>, AppError> {
    let steps = views::history(&state.db, id)?;
    Ok(Json(StepListResponse { steps }))
}

async fn latest_iteration(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<IterationResponse>, AppError> {
    let view = views::latest_iteration_view(&state.db, id)?;
    Ok(Json(IterationResponse { view }))
}

// ============================================================
// Step Graph
// ============================================================

async fn append_step(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<AppendStepRequest>,
) -> Result<Json<StepResponse>, AppError> {
    let step = state.graph.append_step(
        id,
        req.step_type,
        &req.content,
        req.metadata.as_ref(),
        req.parent_step_id,
        req.iteration,
    )?;
    Ok(Json(StepResponse { step }))
}

async fn chat(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<TurnResponse>, AppError> {
    let turn = state.graph.run_plan_turn(id, &req.prompt, &state.registry).await?;
    Ok(Json(TurnResponse {
        prompt: turn.prompt,
        plan: turn.response,
    }))
}

async fn evaluate(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<EvaluateRequest>,
) -> Result<Json<StepResponse>, AppError> {
    let step = state
        .graph
        .run_evaluation_turn(id, req.plan_step_id, &state.registry)
        .await?;
    Ok(Json(StepResponse { step }))
}

async fn step_subtree(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<StepListResponse>, AppError> {
    let steps = state.graph.subtree(id)?;
    Ok(Json(StepListResponse { steps }))
}

async fn delete_step(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<SuccessResponse>, AppError> {
    state.graph.delete_step(id)?;
    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================
// Model Catalog
// ============================================================

async fn list_models(State(state): State<AppState>) -> Result<Json<ModelsResponse>, AppError> {
    let models = state.db.list_model_configs()?;
    Ok(Json(ModelsResponse {
        models,
        default_planner: state.registry.default_planner_model_id().map(String::from),
        default_evaluator: state.registry.default_evaluator_model_id().map(String::from),
    }))
}

// ============================================================
// Error Handling
// ============================================================

enum AppError {
    BadRequest(String),
    Conflict(String),
    NotFound(String),
    Internal(String),
}

impl From<DbError> for AppError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::UserNotFound(_) | DbError::SessionNotFound(_) | DbError::StepNotFound(_) => {
                AppError::NotFound(e.to_string())
            }
            DbError::EmailExists(_) => AppError::Conflict(e.to_string()),
            DbError::InvalidParent { .. }
            | DbError::InvalidIteration(_)
            | DbError::UnknownModel(_)
            | DbError::SessionInactive(_)
            | DbError::ReferentialIntegrity(_) => AppError::BadRequest(e.to_string()),
            DbError::Sqlite(_) => AppError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}
