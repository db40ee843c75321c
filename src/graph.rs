//! Step graph
//!
//! Builds and queries the parent-linked tree of conversation steps within a
//! session. Steps are immutable once written and a parent must already
//! exist, so following parent links can never cycle or cross a session
//! boundary.

use crate::db::{
    self, ConversationStep, Database, DbError, DbResult, StepKind,
};
use crate::llm::ModelRegistry;
use crate::session;
use chrono::Utc;
use rusqlite::{params, Connection};

/// One prompt/response exchange recorded by a turn
#[derive(Debug)]
pub struct Turn {
    pub prompt: ConversationStep,
    pub response: ConversationStep,
}

/// Step graph manager
#[derive(Clone)]
pub struct StepGraph {
    db: Database,
}

impl StepGraph {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a step to a session's graph.
    ///
    /// The session must be active and the parent, if given, must belong to
    /// the same session. Iteration defaults to the explicit value, then the
    /// parent's, then for a fresh top-level prompt one past the session's
    /// latest iteration, and otherwise the latest iteration unchanged.
    pub fn append_step(
        &self,
        session_id: i64,
        step_type: StepKind,
        content: &str,
        metadata: Option<&serde_json::Value>,
        parent_step_id: Option<i64>,
        iteration: Option<i64>,
    ) -> DbResult<ConversationStep> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        let session = db::get_session_on(&tx, session_id)?;
        if !session.is_active {
            return Err(DbError::SessionInactive(session_id));
        }

        let parent = match parent_step_id {
            Some(parent_id) => {
                let parent = db::get_step_on(&tx, parent_id).map_err(|e| match e {
                    DbError::StepNotFound(_) => DbError::InvalidParent {
                        parent_step_id: parent_id,
                        session_id,
                    },
                    other => other,
                })?;
                if parent.session_id != session_id {
                    return Err(DbError::InvalidParent {
                        parent_step_id: parent_id,
                        session_id,
                    });
                }
                Some(parent)
            }
            None => None,
        };

        let latest = max_iteration_on(&tx, session_id)?;
        let iteration = match (iteration, &parent) {
            (Some(explicit), _) if explicit < 1 => {
                return Err(DbError::InvalidIteration(explicit));
            }
            (Some(explicit), _) => explicit,
            (None, Some(parent)) => parent.iteration,
            (None, None) if step_type == StepKind::Prompt => latest + 1,
            (None, None) => latest.max(1),
        };

        // A prompt may not continue its parent prompt's iteration; it has to
        // open a new one explicitly.
        if step_type == StepKind::Prompt {
            if let Some(parent) = &parent {
                if parent.step_type == StepKind::Prompt && iteration <= parent.iteration {
                    return Err(DbError::InvalidParent {
                        parent_step_id: parent.step_id,
                        session_id,
                    });
                }
            }
        }

        // Child creation time may never precede the parent's
        let now = Utc::now();
        let created_at = match &parent {
            Some(parent) => now.max(parent.created_at),
            None => now,
        };

        let metadata_str = metadata.map(|v| serde_json::to_string(v).unwrap_or_default());
        tx.execute(
            "INSERT INTO conversation_steps
                 (session_id, step_type, content, metadata, parent_step_id, iteration, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session_id,
                step_type.to_string(),
                content,
                metadata_str,
                parent_step_id,
                iteration,
                created_at.to_rfc3339()
            ],
        )?;
        let step_id = tx.last_insert_rowid();

        session::touch_on(&tx, session_id)?;
        tx.commit()?;

        Ok(ConversationStep {
            step_id,
            session_id,
            step_type,
            content: content.to_string(),
            metadata: metadata.cloned(),
            parent_step_id,
            iteration,
            created_at,
        })
    }

    /// Maximum iteration recorded for a session, 0 when it has no steps.
    pub fn latest_iteration(&self, session_id: i64) -> DbResult<i64> {
        let conn = self.db.lock();
        db::get_session_on(&conn, session_id)?;
        max_iteration_on(&conn, session_id)
    }

    /// A step and all of its descendants, in creation order.
    ///
    /// Creation-time order (tie-broken by step ID) is the single source of
    /// truth; tree shape does not influence the sequence.
    pub fn subtree(&self, step_id: i64) -> DbResult<Vec<ConversationStep>> {
        let conn = self.db.lock();
        db::get_step_on(&conn, step_id)?;

        let mut stmt = conn.prepare(
            "WITH RECURSIVE descendants(id) AS (
                 SELECT step_id FROM conversation_steps WHERE step_id = ?1
                 UNION ALL
                 SELECT s.step_id FROM conversation_steps s
                 JOIN descendants d ON s.parent_step_id = d.id
             )
             SELECT step_id, session_id, step_type, content, metadata, parent_step_id,
                    iteration, created_at
             FROM conversation_steps
             WHERE step_id IN (SELECT id FROM descendants)
             ORDER BY created_at ASC, step_id ASC",
        )?;
        let rows = stmt.query_map(params![step_id], db::map_step)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Delete a step and its entire subtree in one transaction.
    pub fn delete_step(&self, step_id: i64) -> DbResult<()> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;

        db::get_step_on(&tx, step_id)?;
        // Descendants go with the root via the parent-link CASCADE
        tx.execute(
            "DELETE FROM conversation_steps WHERE step_id = ?1",
            params![step_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Record a full planning turn: append the prompt, invoke the session's
    /// planner model, and append the plan as a child of the prompt.
    ///
    /// The model call happens between the two write transactions so no lock
    /// is held across network latency. A provider failure is not fatal: its
    /// error text becomes the plan step's content, keeping history complete.
    pub async fn run_plan_turn(
        &self,
        session_id: i64,
        prompt_text: &str,
        registry: &ModelRegistry,
    ) -> DbResult<Turn> {
        let session = self.db.get_session(session_id)?;
        if !session.is_active {
            return Err(DbError::SessionInactive(session_id));
        }
        if !self.db.model_available(&session.planner_model_id)? {
            return Err(DbError::UnknownModel(session.planner_model_id));
        }

        let prompt = self.append_step(session_id, StepKind::Prompt, prompt_text, None, None, None)?;

        let (content, failed) =
            generate_or_record(registry, &session.planner_model_id, prompt_text).await;

        let metadata = serde_json::json!({
            "model_id": session.planner_model_id,
            "generation_failed": failed,
        });
        let response = self.append_step(
            session_id,
            StepKind::Plan,
            &content,
            Some(&metadata),
            Some(prompt.step_id),
            None,
        )?;

        Ok(Turn { prompt, response })
    }

    /// Evaluate an existing plan step with the session's evaluator model.
    ///
    /// The evaluation is appended as a child of the plan; failures are
    /// recorded the same way as in `run_plan_turn`.
    pub async fn run_evaluation_turn(
        &self,
        session_id: i64,
        plan_step_id: i64,
        registry: &ModelRegistry,
    ) -> DbResult<ConversationStep> {
        let session = self.db.get_session(session_id)?;
        if !session.is_active {
            return Err(DbError::SessionInactive(session_id));
        }
        if !self.db.model_available(&session.evaluator_model_id)? {
            return Err(DbError::UnknownModel(session.evaluator_model_id));
        }

        let plan = self.db.get_step(plan_step_id)?;
        if plan.session_id != session_id || plan.step_type != StepKind::Plan {
            return Err(DbError::InvalidParent {
                parent_step_id: plan_step_id,
                session_id,
            });
        }

        let (content, failed) =
            generate_or_record(registry, &session.evaluator_model_id, &plan.content).await;

        let metadata = serde_json::json!({
            "model_id": session.evaluator_model_id,
            "generation_failed": failed,
        });
        self.append_step(
            session_id,
            StepKind::Evaluation,
            &content,
            Some(&metadata),
            Some(plan_step_id),
            None,
        )
    }
}

/// Invoke a model and fold a failure into recordable content.
async fn generate_or_record(
    registry: &ModelRegistry,
    model_id: &str,
    prompt: &str,
) -> (String, bool) {
    let Some(service) = registry.get(model_id) else {
        return (format!("Error: model {model_id} has no configured provider"), true);
    };
    match service.generate(prompt).await {
        Ok(text) => (text, false),
        Err(e) => {
            tracing::warn!(model = %model_id, error = %e, "generation failed, recording error text");
            (format!("Error: {e}"), true)
        }
    }
}

/// Single ordered MAX query; correct under concurrent appends because the
/// caller already holds the connection.
pub(crate) fn max_iteration_on(conn: &Connection, session_id: i64) -> DbResult<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(iteration), 0) FROM conversation_steps WHERE session_id = ?1",
        params![session_id],
        |row| row.get(0),
    )
    .map_err(DbError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ModelRole;
    use crate::llm::{LlmError, LlmService, Provider};
    use crate::session::SessionManager;
    use async_trait::async_trait;
    use std::sync::Arc;

    fn fixture() -> (Database, StepGraph, i64) {
        let db = Database::open_in_memory().unwrap();
        let user = db.create_user("alice", "alice@example.com", "pw").unwrap();
        db.upsert_model_config("model-a", ModelRole::Planner, None, true)
            .unwrap();
        db.upsert_model_config("model-b", ModelRole::Evaluator, None, true)
            .unwrap();
        let session = SessionManager::new(db.clone())
            .create_session(user.user_id, "t", "model-a", "model-b", None)
            .unwrap();
        (db.clone(), StepGraph::new(db), session.session_id)
    }

    struct StubService {
        model_id: String,
        reply: Result<String, String>,
    }

    #[async_trait]
    impl LlmService for StubService {
        async fn generate(&self, _prompt: &str) -> Result<String, LlmError> {
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(msg) => Err(LlmError::Server(msg.clone())),
            }
        }

        fn model_id(&self) -> &str {
            &self.model_id
        }

        fn provider(&self) -> Provider {
            Provider::Anthropic
        }
    }

    fn stub_registry(model_id: &str, reply: Result<&str, &str>) -> ModelRegistry {
        let mut registry = ModelRegistry::new_empty();
        registry.insert(Arc::new(StubService {
            model_id: model_id.to_string(),
            reply: reply.map(String::from).map_err(String::from),
        }));
        registry
    }

    #[test]
    fn test_iteration_defaults() {
        let (_db, graph, sid) = fixture();

        assert_eq!(graph.latest_iteration(sid).unwrap(), 0);

        let prompt1 = graph
            .append_step(sid, StepKind::Prompt, "Plan a trip", None, None, None)
            .unwrap();
        assert_eq!(prompt1.iteration, 1);

        let plan = graph
            .append_step(sid, StepKind::Plan, "Day 1...", None, Some(prompt1.step_id), None)
            .unwrap();
        assert_eq!(plan.iteration, 1);

        let prompt2 = graph
            .append_step(sid, StepKind::Prompt, "Make it cheaper", None, None, None)
            .unwrap();
        assert_eq!(prompt2.iteration, 2);

        assert_eq!(graph.latest_iteration(sid).unwrap(), 2);
    }

    #[test]
    fn test_non_prompt_without_parent_joins_current_iteration() {
        let (_db, graph, sid) = fixture();

        // On an empty session, iteration still has to be positive
        let feedback = graph
            .append_step(sid, StepKind::UserFeedback, "looks off", None, None, None)
            .unwrap();
        assert_eq!(feedback.iteration, 1);

        graph
            .append_step(sid, StepKind::Prompt, "p", None, None, Some(3))
            .unwrap();
        let note = graph
            .append_step(sid, StepKind::UserFeedback, "more", None, None, None)
            .unwrap();
        assert_eq!(note.iteration, 3);
    }

    #[test]
    fn test_non_positive_explicit_iteration_rejected() {
        let (_db, graph, sid) = fixture();

        let err = graph
            .append_step(sid, StepKind::Prompt, "p", None, None, Some(0))
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidIteration(0)));

        let err = graph
            .append_step(sid, StepKind::UserFeedback, "f", None, None, Some(-3))
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidIteration(-3)));

        // Nothing was written
        assert_eq!(graph.latest_iteration(sid).unwrap(), 0);
    }

    #[test]
    fn test_parent_from_other_session_rejected() {
        let (db, graph, sid) = fixture();
        let other = SessionManager::new(db.clone())
            .create_session(
                db.create_user("bob", "bob@example.com", "pw").unwrap().user_id,
                "other",
                "model-a",
                "model-b",
                None,
            )
            .unwrap();

        let foreign = graph
            .append_step(other.session_id, StepKind::Prompt, "hi", None, None, None)
            .unwrap();

        let err = graph
            .append_step(sid, StepKind::Plan, "x", None, Some(foreign.step_id), None)
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidParent { .. }));

        // Never silently reassigned
        assert_eq!(graph.latest_iteration(sid).unwrap(), 0);
    }

    #[test]
    fn test_missing_parent_rejected() {
        let (_db, graph, sid) = fixture();
        let err = graph
            .append_step(sid, StepKind::Plan, "x", None, Some(999), None)
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidParent { .. }));
    }

    #[test]
    fn test_prompt_under_prompt_needs_new_iteration() {
        let (_db, graph, sid) = fixture();
        let prompt = graph
            .append_step(sid, StepKind::Prompt, "p1", None, None, None)
            .unwrap();

        let err = graph
            .append_step(sid, StepKind::Prompt, "p2", None, Some(prompt.step_id), None)
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidParent { .. }));

        let follow_up = graph
            .append_step(sid, StepKind::Prompt, "p2", None, Some(prompt.step_id), Some(2))
            .unwrap();
        assert_eq!(follow_up.iteration, 2);
    }

    #[test]
    fn test_append_to_inactive_session_fails() {
        let (db, graph, sid) = fixture();
        graph
            .append_step(sid, StepKind::Prompt, "p", None, None, None)
            .unwrap();

        SessionManager::new(db).deactivate_session(sid).unwrap();

        let err = graph
            .append_step(sid, StepKind::Prompt, "q", None, None, None)
            .unwrap_err();
        assert!(matches!(err, DbError::SessionInactive(_)));
    }

    #[test]
    fn test_inactive_session_history_stays_queryable() {
        let (db, graph, sid) = fixture();
        graph
            .append_step(sid, StepKind::Prompt, "p", None, None, None)
            .unwrap();
        SessionManager::new(db.clone()).deactivate_session(sid).unwrap();

        let history = crate::views::history(&db, sid).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_child_created_at_never_precedes_parent() {
        let (_db, graph, sid) = fixture();
        let parent = graph
            .append_step(sid, StepKind::Prompt, "p", None, None, None)
            .unwrap();
        let child = graph
            .append_step(sid, StepKind::Plan, "c", None, Some(parent.step_id), None)
            .unwrap();
        assert!(child.created_at >= parent.created_at);
    }

    #[test]
    fn test_subtree_creation_order() {
        let (_db, graph, sid) = fixture();
        let prompt = graph
            .append_step(sid, StepKind::Prompt, "p", None, None, None)
            .unwrap();
        let plan1 = graph
            .append_step(sid, StepKind::Plan, "plan-1", None, Some(prompt.step_id), None)
            .unwrap();
        let eval1 = graph
            .append_step(sid, StepKind::Evaluation, "eval-1", None, Some(plan1.step_id), None)
            .unwrap();
        let plan2 = graph
            .append_step(sid, StepKind::Plan, "plan-2", None, Some(prompt.step_id), None)
            .unwrap();

        let steps = graph.subtree(prompt.step_id).unwrap();
        let ids: Vec<i64> = steps.iter().map(|s| s.step_id).collect();
        assert_eq!(ids, vec![prompt.step_id, plan1.step_id, eval1.step_id, plan2.step_id]);

        // Restartable: re-query yields the same sequence
        let again: Vec<i64> = graph
            .subtree(prompt.step_id)
            .unwrap()
            .iter()
            .map(|s| s.step_id)
            .collect();
        assert_eq!(ids, again);

        // A mid-tree subtree excludes siblings
        let sub = graph.subtree(plan1.step_id).unwrap();
        let sub_ids: Vec<i64> = sub.iter().map(|s| s.step_id).collect();
        assert_eq!(sub_ids, vec![plan1.step_id, eval1.step_id]);
    }

    #[test]
    fn test_delete_cascades_without_orphans() {
        let (db, graph, sid) = fixture();
        let prompt = graph
            .append_step(sid, StepKind::Prompt, "p", None, None, None)
            .unwrap();
        let plan = graph
            .append_step(sid, StepKind::Plan, "plan", None, Some(prompt.step_id), None)
            .unwrap();
        let eval = graph
            .append_step(sid, StepKind::Evaluation, "eval", None, Some(plan.step_id), None)
            .unwrap();
        let other_root = graph
            .append_step(sid, StepKind::Prompt, "other", None, None, None)
            .unwrap();

        graph.delete_step(plan.step_id).unwrap();

        assert!(matches!(db.get_step(plan.step_id), Err(DbError::StepNotFound(_))));
        assert!(matches!(db.get_step(eval.step_id), Err(DbError::StepNotFound(_))));
        assert!(db.get_step(prompt.step_id).is_ok());
        assert!(db.get_step(other_root.step_id).is_ok());

        // No dangling parent links remain
        let orphans: i64 = db
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM conversation_steps c
                 WHERE c.parent_step_id IS NOT NULL
                   AND NOT EXISTS (SELECT 1 FROM conversation_steps p
                                   WHERE p.step_id = c.parent_step_id)",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[test]
    fn test_delete_missing_step() {
        let (_db, graph, _sid) = fixture();
        assert!(matches!(graph.delete_step(404), Err(DbError::StepNotFound(404))));
    }

    #[tokio::test]
    async fn test_plan_turn_success() {
        let (_db, graph, sid) = fixture();
        let registry = stub_registry("model-a", Ok("Here is the plan"));

        let turn = graph.run_plan_turn(sid, "Plan a trip", &registry).await.unwrap();

        assert_eq!(turn.prompt.step_type, StepKind::Prompt);
        assert_eq!(turn.prompt.iteration, 1);
        assert_eq!(turn.response.step_type, StepKind::Plan);
        assert_eq!(turn.response.content, "Here is the plan");
        assert_eq!(turn.response.parent_step_id, Some(turn.prompt.step_id));
    }

    #[tokio::test]
    async fn test_plan_turn_records_provider_failure() {
        let (db, graph, sid) = fixture();
        let registry = stub_registry("model-a", Err("upstream exploded"));

        let turn = graph.run_plan_turn(sid, "Plan a trip", &registry).await.unwrap();

        assert!(turn.response.content.starts_with("Error:"));
        assert!(turn.response.content.contains("upstream exploded"));
        let failed = turn
            .response
            .metadata
            .as_ref()
            .and_then(|m| m.get("generation_failed"))
            .and_then(serde_json::Value::as_bool);
        assert_eq!(failed, Some(true));

        // History still contains exactly the two steps of the turn
        let history = crate::views::history(&db, sid).unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_plan_turn_checks_catalog_before_invocation() {
        let (db, graph, sid) = fixture();
        db.upsert_model_config("model-a", ModelRole::Planner, None, false)
            .unwrap();
        let registry = stub_registry("model-a", Ok("unused"));

        let err = graph.run_plan_turn(sid, "p", &registry).await.unwrap_err();
        assert!(matches!(err, DbError::UnknownModel(_)));

        // Nothing was written
        assert_eq!(crate::views::history(&db, sid).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_evaluation_turn() {
        let (_db, graph, sid) = fixture();
        let plan_registry = stub_registry("model-a", Ok("the plan"));
        let turn = graph.run_plan_turn(sid, "p", &plan_registry).await.unwrap();

        let eval_registry = stub_registry("model-b", Ok("solid plan"));
        let eval = graph
            .run_evaluation_turn(sid, turn.response.step_id, &eval_registry)
            .await
            .unwrap();

        assert_eq!(eval.step_type, StepKind::Evaluation);
        assert_eq!(eval.parent_step_id, Some(turn.response.step_id));
        assert_eq!(eval.iteration, turn.response.iteration);
    }

    #[tokio::test]
    async fn test_evaluation_turn_rejects_non_plan_target() {
        let (_db, graph, sid) = fixture();
        let prompt = graph
            .append_step(sid, StepKind::Prompt, "p", None, None, None)
            .unwrap();
        let registry = stub_registry("model-b", Ok("unused"));

        let err = graph
            .run_evaluation_turn(sid, prompt.step_id, &registry)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidParent { .. }));
    }
}
