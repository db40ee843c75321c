//! Session lifecycle
//!
//! Creates sessions bound to a planner/evaluator model pair, deactivates
//! them (soft delete), and bumps their recency timestamp on activity.

use crate::db::{Database, DbError, DbResult, Session};
use chrono::Utc;
use rusqlite::{params, Connection};

/// Session lifecycle manager
#[derive(Clone)]
pub struct SessionManager {
    db: Database,
}

impl SessionManager {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a session for a user.
    ///
    /// Both model IDs must be present and active in the catalog, otherwise
    /// the call fails with `UnknownModel` before anything is written.
    pub fn create_session(
        &self,
        user_id: i64,
        title: &str,
        planner_model_id: &str,
        evaluator_model_id: &str,
        description: Option<&str>,
    ) -> DbResult<Session> {
        let conn = self.db.lock();

        let user_exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE user_id = ?1)",
            params![user_id],
            |row| row.get(0),
        )?;
        if !user_exists {
            return Err(DbError::UserNotFound(user_id));
        }

        for model_id in [planner_model_id, evaluator_model_id] {
            let available: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM model_configs WHERE model_id = ?1 AND is_active = 1)",
                params![model_id],
                |row| row.get(0),
            )?;
            if !available {
                return Err(DbError::UnknownModel(model_id.to_string()));
            }
        }

        let now = Utc::now();
        conn.execute(
            "INSERT INTO sessions (user_id, title, description, planner_model_id,
                                   evaluator_model_id, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
            params![
                user_id,
                title,
                description,
                planner_model_id,
                evaluator_model_id,
                now.to_rfc3339()
            ],
        )?;

        Ok(Session {
            session_id: conn.last_insert_rowid(),
            user_id,
            title: title.to_string(),
            description: description.map(String::from),
            planner_model_id: planner_model_id.to_string(),
            evaluator_model_id: evaluator_model_id.to_string(),
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }

    /// Deactivate a session. Idempotent; history stays queryable.
    pub fn deactivate_session(&self, session_id: i64) -> DbResult<()> {
        let conn = self.db.lock();
        let now = Utc::now();

        let updated = conn.execute(
            "UPDATE sessions SET is_active = 0, updated_at = ?1 WHERE session_id = ?2",
            params![now.to_rfc3339(), session_id],
        )?;

        if updated == 0 {
            return Err(DbError::SessionNotFound(session_id));
        }
        Ok(())
    }

    /// Bump a session's `updated_at`. Called implicitly by every successful
    /// step append.
    pub fn touch(&self, session_id: i64) -> DbResult<()> {
        let conn = self.db.lock();
        touch_on(&conn, session_id)
    }

    /// Get session by ID
    pub fn get_session(&self, session_id: i64) -> DbResult<Session> {
        self.db.get_session(session_id)
    }
}

/// Timestamp bump on an already-held connection
pub(crate) fn touch_on(conn: &Connection, session_id: i64) -> DbResult<()> {
    let now = Utc::now();
    let updated = conn.execute(
        "UPDATE sessions SET updated_at = ?1 WHERE session_id = ?2",
        params![now.to_rfc3339(), session_id],
    )?;
    if updated == 0 {
        return Err(DbError::SessionNotFound(session_id));
    }
    Ok(())
}
