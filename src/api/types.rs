//! API request and response types

use crate::db::{ConversationStep, ModelConfig, Session, StepKind, User};
use crate::views::IterationView;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request to create a user
#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// Request to create a session
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub user_id: i64,
    pub title: String,
    pub description: Option<String>,
    /// Falls back to the registry's default planner when omitted
    pub planner_model_id: Option<String>,
    /// Falls back to the registry's default evaluator when omitted
    pub evaluator_model_id: Option<String>,
}

/// Request to append a step
#[derive(Debug, Deserialize)]
pub struct AppendStepRequest {
    pub step_type: StepKind,
    pub content: String,
    pub metadata: Option<Value>,
    pub parent_step_id: Option<i64>,
    pub iteration: Option<i64>,
}

/// Request to run a planning turn
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub prompt: String,
}

/// Request to evaluate a plan step
#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    pub plan_step_id: i64,
}

/// Response with a created user
#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub user: User,
}

/// Response with a single session
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session: Session,
}

/// Response with a list of sessions
#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<Session>,
}

/// Response with a single step
#[derive(Debug, Serialize)]
pub struct StepResponse {
    pub step: ConversationStep,
}

/// Response with an ordered list of steps
#[derive(Debug, Serialize)]
pub struct StepListResponse {
    pub steps: Vec<ConversationStep>,
}

/// Response for a completed planning turn
#[derive(Debug, Serialize)]
pub struct TurnResponse {
    pub prompt: ConversationStep,
    pub plan: ConversationStep,
}

/// Response with the latest iteration and its steps
#[derive(Debug, Serialize)]
pub struct IterationResponse {
    #[serde(flatten)]
    pub view: IterationView,
}

/// Response with the model catalog
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelConfig>,
    pub default_planner: Option<String>,
    pub default_evaluator: Option<String>,
}

/// Response for lifecycle actions
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
