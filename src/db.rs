//! Entity store
//!
//! Durable records for users, sessions, conversation steps, and the model
//! catalog, backed by SQLite.

mod schema;

pub use schema::*;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Referential integrity violation: {0}")]
    ReferentialIntegrity(String),
    #[error("Email already registered: {0}")]
    EmailExists(String),
    #[error("User not found: {0}")]
    UserNotFound(i64),
    #[error("Session not found: {0}")]
    SessionNotFound(i64),
    #[error("Step not found: {0}")]
    StepNotFound(i64),
    #[error("Unknown or inactive model: {0}")]
    UnknownModel(String),
    #[error("Iteration must be a positive integer, got {0}")]
    InvalidIteration(i64),
    #[error("Parent step {parent_step_id} is not part of session {session_id}")]
    InvalidParent {
        parent_step_id: i64,
        session_id: i64,
    },
    #[error("Session {0} is not active")]
    SessionInactive(i64),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
///
/// All writers share one connection behind a mutex, so read-then-write
/// sequences performed under a single lock scope are atomic with respect to
/// other callers.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        // Cascade deletes on parent_step_id depend on FK enforcement
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Acquire the connection for a compound read-then-write sequence.
    ///
    /// Holding the guard serializes against every other database operation,
    /// which is what gives `append_step` and `delete_step` their
    /// single-transaction semantics.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ==================== User Operations ====================

    /// Create a new user. The credential is stored hashed, never verbatim.
    pub fn create_user(&self, username: &str, email: &str, password: &str) -> DbResult<User> {
        let conn = self.lock();
        let now = Utc::now();
        let password_hash = hash_credential(password);

        conn.execute(
            "INSERT INTO users (username, email, password_hash, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![username, email, password_hash, now.to_rfc3339()],
        )
        .map_err(|e| match constraint_detail(&e) {
            Some(detail) if detail.contains("users.email") => {
                DbError::EmailExists(email.to_string())
            }
            Some(detail) => DbError::ReferentialIntegrity(detail),
            None => DbError::Sqlite(e),
        })?;

        Ok(User {
            user_id: conn.last_insert_rowid(),
            username: username.to_string(),
            email: email.to_string(),
            password_hash,
            created_at: now,
        })
    }

    /// Get user by ID
    pub fn get_user(&self, user_id: i64) -> DbResult<User> {
        let conn = self.lock();
        conn.query_row(
            "SELECT user_id, username, email, password_hash, created_at
             FROM users WHERE user_id = ?1",
            params![user_id],
            map_user,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::UserNotFound(user_id),
            other => DbError::Sqlite(other),
        })
    }

    // ==================== Model Catalog Operations ====================

    /// Insert or refresh a catalog entry, preserving its creation timestamp.
    pub fn upsert_model_config(
        &self,
        model_id: &str,
        role: ModelRole,
        config: Option<&serde_json::Value>,
        is_active: bool,
    ) -> DbResult<ModelConfig> {
        let conn = self.lock();
        let now = Utc::now();
        let config_str = config.map(|v| serde_json::to_string(v).unwrap_or_default());

        conn.execute(
            "INSERT INTO model_configs (model_id, role, config, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(model_id) DO UPDATE SET
                 role = excluded.role,
                 config = excluded.config,
                 is_active = excluded.is_active,
                 updated_at = excluded.updated_at",
            params![model_id, role.to_string(), config_str, is_active, now.to_rfc3339()],
        )?;

        conn.query_row(
            "SELECT model_id, role, config, is_active, created_at, updated_at
             FROM model_configs WHERE model_id = ?1",
            params![model_id],
            map_model_config,
        )
        .map_err(DbError::from)
    }

    /// Get a catalog entry by model ID
    pub fn get_model_config(&self, model_id: &str) -> DbResult<ModelConfig> {
        let conn = self.lock();
        conn.query_row(
            "SELECT model_id, role, config, is_active, created_at, updated_at
             FROM model_configs WHERE model_id = ?1",
            params![model_id],
            map_model_config,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DbError::UnknownModel(model_id.to_string()),
            other => DbError::Sqlite(other),
        })
    }

    /// List the full model catalog, active entries first
    pub fn list_model_configs(&self) -> DbResult<Vec<ModelConfig>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT model_id, role, config, is_active, created_at, updated_at
             FROM model_configs ORDER BY is_active DESC, model_id ASC",
        )?;
        let rows = stmt.query_map([], map_model_config)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Check that a model ID is present and active in the catalog
    pub fn model_available(&self, model_id: &str) -> DbResult<bool> {
        let conn = self.lock();
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM model_configs WHERE model_id = ?1 AND is_active = 1)",
            params![model_id],
            |row| row.get(0),
        )
        .map_err(DbError::from)
    }

    // ==================== Row Lookups ====================

    /// Get session by ID
    pub fn get_session(&self, session_id: i64) -> DbResult<Session> {
        let conn = self.lock();
        get_session_on(&conn, session_id)
    }

    /// Get step by ID
    pub fn get_step(&self, step_id: i64) -> DbResult<ConversationStep> {
        let conn = self.lock();
        get_step_on(&conn, step_id)
    }
}

/// Session lookup on an already-held connection
pub(crate) fn get_session_on(conn: &Connection, session_id: i64) -> DbResult<Session> {
    conn.query_row(
        "SELECT session_id, user_id, title, description, planner_model_id,
                evaluator_model_id, is_active, created_at, updated_at
         FROM sessions WHERE session_id = ?1",
        params![session_id],
        map_session,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => DbError::SessionNotFound(session_id),
        other => DbError::Sqlite(other),
    })
}

/// Step lookup on an already-held connection
pub(crate) fn get_step_on(conn: &Connection, step_id: i64) -> DbResult<ConversationStep> {
    conn.query_row(
        "SELECT step_id, session_id, step_type, content, metadata, parent_step_id,
                iteration, created_at
         FROM conversation_steps WHERE step_id = ?1",
        params![step_id],
        map_step,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => DbError::StepNotFound(step_id),
        other => DbError::Sqlite(other),
    })
}

pub(crate) fn map_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        user_id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        created_at: parse_datetime(4, &row.get::<_, String>(4)?)?,
    })
}

pub(crate) fn map_session(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        session_id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        planner_model_id: row.get(4)?,
        evaluator_model_id: row.get(5)?,
        is_active: row.get(6)?,
        created_at: parse_datetime(7, &row.get::<_, String>(7)?)?,
        updated_at: parse_datetime(8, &row.get::<_, String>(8)?)?,
    })
}

pub(crate) fn map_step(row: &Row<'_>) -> rusqlite::Result<ConversationStep> {
    let kind_raw = row.get::<_, String>(2)?;
    Ok(ConversationStep {
        step_id: row.get(0)?,
        session_id: row.get(1)?,
        step_type: StepKind::parse(&kind_raw)
            .ok_or_else(|| text_conversion_error(2, format!("unknown step type: {kind_raw}")))?,
        content: row.get(3)?,
        metadata: row
            .get::<_, Option<String>>(4)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        parent_step_id: row.get(5)?,
        iteration: row.get(6)?,
        created_at: parse_datetime(7, &row.get::<_, String>(7)?)?,
    })
}

fn map_model_config(row: &Row<'_>) -> rusqlite::Result<ModelConfig> {
    let role_raw = row.get::<_, String>(1)?;
    Ok(ModelConfig {
        model_id: row.get(0)?,
        role: ModelRole::parse(&role_raw)
            .ok_or_else(|| text_conversion_error(1, format!("unknown model role: {role_raw}")))?,
        config: row
            .get::<_, Option<String>>(2)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        is_active: row.get(3)?,
        created_at: parse_datetime(4, &row.get::<_, String>(4)?)?,
        updated_at: parse_datetime(5, &row.get::<_, String>(5)?)?,
    })
}

/// Extract the detail message of a constraint violation, if that is what
/// the error is.
fn constraint_detail(e: &rusqlite::Error) -> Option<String> {
    match e {
        rusqlite::Error::SqliteFailure(err, msg)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Some(msg.clone().unwrap_or_else(|| "constraint violation".to_string()))
        }
        _ => None,
    }
}

/// Stored values outside the expected domain surface as conversion errors
/// rather than being silently rewritten.
fn text_conversion_error(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, message.into())
}

fn parse_datetime(column: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| text_conversion_error(column, format!("bad timestamp {s:?}: {e}")))
}

fn hash_credential(password: &str) -> String {
    BASE64.encode(Sha256::digest(password.as_bytes()))
}
