//! Ordered projections over sessions and steps
//!
//! Everything here is a plain read: re-invoking any view on an unmodified
//! session returns an identical sequence.

use crate::db::{self, ConversationStep, Database, DbResult, Session};
use crate::graph;
use rusqlite::params;
use serde::Serialize;

/// The latest iteration and its steps in creation order
#[derive(Debug, Serialize)]
pub struct IterationView {
    pub iteration: i64,
    pub steps: Vec<ConversationStep>,
}

/// Full chronological history of a session, tie-broken by step ID.
pub fn history(db: &Database, session_id: i64) -> DbResult<Vec<ConversationStep>> {
    let conn = db.lock();
    db::get_session_on(&conn, session_id)?;

    let mut stmt = conn.prepare(
        "SELECT step_id, session_id, step_type, content, metadata, parent_step_id,
                iteration, created_at
         FROM conversation_steps
         WHERE session_id = ?1
         ORDER BY created_at ASC, step_id ASC",
    )?;
    let rows = stmt.query_map(params![session_id], db::map_step)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

/// A user's active sessions, most recently touched first.
pub fn active_sessions(db: &Database, user_id: i64) -> DbResult<Vec<Session>> {
    let conn = db.lock();
    let mut stmt = conn.prepare(
        "SELECT session_id, user_id, title, description, planner_model_id,
                evaluator_model_id, is_active, created_at, updated_at
         FROM sessions
         WHERE user_id = ?1 AND is_active = 1
         ORDER BY updated_at DESC, session_id DESC",
    )?;
    let rows = stmt.query_map(params![user_id], db::map_session)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
}

/// The session's latest iteration together with its steps.
pub fn latest_iteration_view(db: &Database, session_id: i64) -> DbResult<IterationView> {
    let conn = db.lock();
    db::get_session_on(&conn, session_id)?;

    let iteration = graph::max_iteration_on(&conn, session_id)?;
    if iteration == 0 {
        return Ok(IterationView {
            iteration: 0,
            steps: Vec::new(),
        });
    }

    let mut stmt = conn.prepare(
        "SELECT step_id, session_id, step_type, content, metadata, parent_step_id,
                iteration, created_at
         FROM conversation_steps
         WHERE session_id = ?1 AND iteration = ?2
         ORDER BY created_at ASC, step_id ASC",
    )?;
    let rows = stmt.query_map(params![session_id, iteration], db::map_step)?;
    let steps = rows.collect::<Result<Vec<_>, _>>()?;

    Ok(IterationView { iteration, steps })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DbError, ModelRole, StepKind};
    use crate::graph::StepGraph;
    use crate::session::SessionManager;

    fn fixture() -> (Database, StepGraph, SessionManager, i64, i64) {
        let db = Database::open_in_memory().unwrap();
        let user = db.create_user("alice", "alice@example.com", "pw").unwrap();
        db.upsert_model_config("model-a", ModelRole::Planner, None, true)
            .unwrap();
        db.upsert_model_config("model-b", ModelRole::Evaluator, None, true)
            .unwrap();
        let sessions = SessionManager::new(db.clone());
        let session = sessions
            .create_session(user.user_id, "t", "model-a", "model-b", None)
            .unwrap();
        (
            db.clone(),
            StepGraph::new(db),
            sessions,
            user.user_id,
            session.session_id,
        )
    }

    #[test]
    fn test_history_is_stable_and_total() {
        let (db, graph, _sessions, _uid, sid) = fixture();
        let prompt = graph
            .append_step(sid, StepKind::Prompt, "p", None, None, None)
            .unwrap();
        graph
            .append_step(sid, StepKind::Plan, "a", None, Some(prompt.step_id), None)
            .unwrap();
        graph
            .append_step(sid, StepKind::UserFeedback, "b", None, Some(prompt.step_id), None)
            .unwrap();

        let first: Vec<i64> = history(&db, sid).unwrap().iter().map(|s| s.step_id).collect();
        let second: Vec<i64> = history(&db, sid).unwrap().iter().map(|s| s.step_id).collect();

        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(first, sorted);
    }

    #[test]
    fn test_history_unknown_session() {
        let (db, _graph, _sessions, _uid, _sid) = fixture();
        assert!(matches!(
            history(&db, 404),
            Err(DbError::SessionNotFound(404))
        ));
    }

    #[test]
    fn test_active_sessions_recency_order() {
        let (db, graph, sessions, uid, first_sid) = fixture();
        let second = sessions
            .create_session(uid, "second", "model-a", "model-b", None)
            .unwrap();
        let third = sessions
            .create_session(uid, "third", "model-a", "model-b", None)
            .unwrap();

        // Appending touches the session, promoting it to the front
        std::thread::sleep(std::time::Duration::from_millis(5));
        graph
            .append_step(first_sid, StepKind::Prompt, "p", None, None, None)
            .unwrap();

        let listed = active_sessions(&db, uid).unwrap();
        let ids: Vec<i64> = listed.iter().map(|s| s.session_id).collect();
        assert_eq!(ids[0], first_sid);
        assert!(ids.contains(&second.session_id));
        assert!(ids.contains(&third.session_id));

        sessions.deactivate_session(second.session_id).unwrap();
        let listed = active_sessions(&db, uid).unwrap();
        assert!(!listed.iter().any(|s| s.session_id == second.session_id));
    }

    #[test]
    fn test_latest_iteration_view() {
        let (db, graph, _sessions, _uid, sid) = fixture();

        let empty = latest_iteration_view(&db, sid).unwrap();
        assert_eq!(empty.iteration, 0);
        assert!(empty.steps.is_empty());

        let p1 = graph
            .append_step(sid, StepKind::Prompt, "p1", None, None, None)
            .unwrap();
        graph
            .append_step(sid, StepKind::Plan, "plan1", None, Some(p1.step_id), None)
            .unwrap();
        let p2 = graph
            .append_step(sid, StepKind::Prompt, "p2", None, None, None)
            .unwrap();
        let plan2 = graph
            .append_step(sid, StepKind::Plan, "plan2", None, Some(p2.step_id), None)
            .unwrap();

        let view = latest_iteration_view(&db, sid).unwrap();
        assert_eq!(view.iteration, 2);
        let ids: Vec<i64> = view.steps.iter().map(|s| s.step_id).collect();
        assert_eq!(ids, vec![p2.step_id, plan2.step_id]);
    }
}
