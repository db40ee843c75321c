//! Database schema and record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    session_id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    title TEXT NOT NULL,
    description TEXT,
    planner_model_id TEXT NOT NULL,
    evaluator_model_id TEXT NOT NULL,
    is_active BOOLEAN NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    FOREIGN KEY (user_id) REFERENCES users(user_id)
);

CREATE INDEX IF NOT EXISTS idx_sessions_user_updated ON sessions(user_id, updated_at DESC);

CREATE TABLE IF NOT EXISTS conversation_steps (
    step_id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    step_type TEXT NOT NULL,
    content TEXT NOT NULL,
    metadata TEXT,
    parent_step_id INTEGER,
    iteration INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,

    FOREIGN KEY (session_id) REFERENCES sessions(session_id),
    FOREIGN KEY (parent_step_id)
        REFERENCES conversation_steps(step_id) ON DELETE CASCADE,
    CHECK (step_type IN ('prompt', 'plan', 'evaluation', 'user_feedback')),
    CHECK (iteration >= 1)
);

CREATE INDEX IF NOT EXISTS idx_steps_session_created ON conversation_steps(session_id, created_at, step_id);
CREATE INDEX IF NOT EXISTS idx_steps_parent ON conversation_steps(parent_step_id);
CREATE INDEX IF NOT EXISTS idx_steps_session_type ON conversation_steps(session_id, step_type);

CREATE TABLE IF NOT EXISTS model_configs (
    model_id TEXT PRIMARY KEY,
    role TEXT NOT NULL,
    config TEXT,
    is_active BOOLEAN NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,

    CHECK (role IN ('planner', 'evaluator'))
);
"#;

/// User record
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub user_id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Session record
///
/// One bounded conversation thread, owning a forest of conversation steps.
/// Deactivation is a soft delete: history stays queryable.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: i64,
    pub user_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub planner_model_id: String,
    pub evaluator_model_id: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Conversation step record
///
/// A node in the per-session step graph. Immutable once created; the parent
/// link always points at a step created strictly earlier in the same
/// session, so the graph is a forest by construction.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationStep {
    pub step_id: i64,
    pub session_id: i64,
    pub step_type: StepKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub parent_step_id: Option<i64>,
    pub iteration: i64,
    pub created_at: DateTime<Utc>,
}

/// Model catalog entry
#[derive(Debug, Clone, Serialize)]
pub struct ModelConfig {
    pub model_id: String,
    pub role: ModelRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Step kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Prompt,
    Plan,
    Evaluation,
    UserFeedback,
}

impl StepKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prompt" => Some(StepKind::Prompt),
            "plan" => Some(StepKind::Plan),
            "evaluation" => Some(StepKind::Evaluation),
            "user_feedback" => Some(StepKind::UserFeedback),
            _ => None,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Prompt => write!(f, "prompt"),
            StepKind::Plan => write!(f, "plan"),
            StepKind::Evaluation => write!(f, "evaluation"),
            StepKind::UserFeedback => write!(f, "user_feedback"),
        }
    }
}

/// Model role in the planner/evaluator loop
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    Planner,
    Evaluator,
}

impl ModelRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planner" => Some(ModelRole::Planner),
            "evaluator" => Some(ModelRole::Evaluator),
            _ => None,
        }
    }
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelRole::Planner => write!(f, "planner"),
            ModelRole::Evaluator => write!(f, "evaluator"),
        }
    }
}
