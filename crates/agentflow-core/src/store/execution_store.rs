use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::execution::{Execution, ExecutionStatus, TriggerType};

#[derive(Clone)]
pub struct ExecutionStore {
    db: Database,
}

impl ExecutionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        workflow_id: &str,
        user_id: &str,
        trigger: TriggerType,
        session_id: Option<String>,
        runtime_inputs: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Execution, ServerError> {
        let now = Utc::now();
        let e = Execution {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            user_id: user_id.to_string(),
            session_id,
            trigger,
            status: ExecutionStatus::Pending,
            started_at: None,
            completed_at: None,
            steps_completed: Vec::new(),
            steps_failed: Vec::new(),
            steps_skipped: Vec::new(),
            step_outputs: HashMap::new(),
            runtime_inputs,
            resume_from: None,
            tokens_used: 0,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        let ec = e.clone();
        let inputs_json = serde_json::Value::Object(ec.runtime_inputs.clone()).to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO executions (id, workflow_id, user_id, session_id, trigger, status, \
                     runtime_inputs, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        ec.id,
                        ec.workflow_id,
                        ec.user_id,
                        ec.session_id,
                        ec.trigger.as_str(),
                        ec.status.as_str(),
                        inputs_json,
                        ec.created_at.timestamp_millis(),
                        ec.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(e)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Execution>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM executions WHERE id = ?1", COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_execution(row)),
                )
                .optional()
            })
            .await
    }

    /// Defense-in-depth for the scheduler: is any run of this workflow
    /// still pending, running, or waiting?
    pub async fn has_active(&self, workflow_id: &str) -> Result<bool, ServerError> {
        let wf = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM executions \
                     WHERE workflow_id = ?1 AND status IN ('pending', 'running', 'waiting')",
                    rusqlite::params![wf],
                    |row| row.get(0),
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Runs suspended on a decision, for the scheduler's expiry sweep.
    pub async fn list_waiting(&self) -> Result<Vec<Execution>, ServerError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM executions WHERE status = 'waiting' ORDER BY created_at",
                    COLUMNS
                ))?;
                let rows = stmt.query_map([], |row| Ok(row_to_execution(row)))?;
                rows.collect()
            })
            .await
    }

    pub async fn mark_started(&self, id: &str, started_at: DateTime<Utc>) -> Result<(), ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE executions SET status = 'running', started_at = ?2, updated_at = ?3 \
                     WHERE id = ?1 AND completed_at IS NULL",
                    rusqlite::params![
                        id,
                        started_at.timestamp_millis(),
                        Utc::now().timestamp_millis()
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Persist the run snapshot: per-step lists, recorded outputs, token
    /// count, resume index, and (non-terminal) status.
    pub async fn save_progress(&self, e: &Execution) -> Result<(), ServerError> {
        let ec = e.clone();
        let outputs_json = serde_json::to_string(&ec.step_outputs)
            .map_err(|err| ServerError::Internal(format!("serialize outputs: {}", err)))?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE executions SET status = ?2, steps_completed = ?3, steps_failed = ?4, \
                     steps_skipped = ?5, step_outputs = ?6, resume_from = ?7, tokens_used = ?8, \
                     updated_at = ?9 \
                     WHERE id = ?1 AND completed_at IS NULL",
                    rusqlite::params![
                        ec.id,
                        ec.status.as_str(),
                        serde_json::to_string(&ec.steps_completed).unwrap_or_default(),
                        serde_json::to_string(&ec.steps_failed).unwrap_or_default(),
                        serde_json::to_string(&ec.steps_skipped).unwrap_or_default(),
                        outputs_json,
                        ec.resume_from.map(|i| i as i64),
                        ec.tokens_used as i64,
                        Utc::now().timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Set the terminal fields exactly once. The `completed_at IS NULL`
    /// predicate makes finalization idempotent: a second call is a no-op.
    pub async fn finalize(&self, e: &Execution) -> Result<(), ServerError> {
        let ec = e.clone();
        let outputs_json = serde_json::to_string(&ec.step_outputs)
            .map_err(|err| ServerError::Internal(format!("serialize outputs: {}", err)))?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE executions SET status = ?2, completed_at = ?3, steps_completed = ?4, \
                     steps_failed = ?5, steps_skipped = ?6, step_outputs = ?7, resume_from = NULL, \
                     tokens_used = ?8, output = ?9, error = ?10, updated_at = ?11 \
                     WHERE id = ?1 AND completed_at IS NULL",
                    rusqlite::params![
                        ec.id,
                        ec.status.as_str(),
                        ec.completed_at.map(|t| t.timestamp_millis()),
                        serde_json::to_string(&ec.steps_completed).unwrap_or_default(),
                        serde_json::to_string(&ec.steps_failed).unwrap_or_default(),
                        serde_json::to_string(&ec.steps_skipped).unwrap_or_default(),
                        outputs_json,
                        ec.tokens_used as i64,
                        ec.output.as_ref().map(|v| v.to_string()),
                        ec.error,
                        Utc::now().timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }
}

const COLUMNS: &str = "id, workflow_id, user_id, session_id, trigger, status, started_at, \
     completed_at, steps_completed, steps_failed, steps_skipped, step_outputs, runtime_inputs, \
     resume_from, tokens_used, output, error, created_at, updated_at";

fn row_to_execution(row: &rusqlite::Row<'_>) -> Execution {
    let to_dt = |ms: Option<i64>| ms.and_then(|v| Utc.timestamp_millis_opt(v).single());
    let json_list = |s: Option<String>| -> Vec<String> {
        s.and_then(|v| serde_json::from_str(&v).ok()).unwrap_or_default()
    };

    let status: String = row.get(5).unwrap_or_default();
    let trigger: String = row.get(4).unwrap_or_default();
    let outputs: Option<String> = row.get(11).unwrap_or(None);
    let inputs: Option<String> = row.get(12).unwrap_or(None);
    let output: Option<String> = row.get(15).unwrap_or(None);

    Execution {
        id: row.get(0).unwrap_or_default(),
        workflow_id: row.get(1).unwrap_or_default(),
        user_id: row.get(2).unwrap_or_default(),
        session_id: row.get(3).unwrap_or(None),
        trigger: TriggerType::parse(&trigger),
        status: ExecutionStatus::parse(&status),
        started_at: to_dt(row.get(6).unwrap_or(None)),
        completed_at: to_dt(row.get(7).unwrap_or(None)),
        steps_completed: json_list(row.get(8).unwrap_or(None)),
        steps_failed: json_list(row.get(9).unwrap_or(None)),
        steps_skipped: json_list(row.get(10).unwrap_or(None)),
        step_outputs: outputs
            .and_then(|v| serde_json::from_str(&v).ok())
            .unwrap_or_default(),
        runtime_inputs: inputs
            .and_then(|v| serde_json::from_str(&v).ok())
            .unwrap_or_default(),
        resume_from: row.get::<_, Option<i64>>(13).unwrap_or(None).map(|v| v as usize),
        tokens_used: row.get::<_, i64>(14).unwrap_or(0) as u64,
        output: output.and_then(|v| serde_json::from_str(&v).ok()),
        error: row.get(16).unwrap_or(None),
        created_at: to_dt(row.get(17).ok()).unwrap_or_else(Utc::now),
        updated_at: to_dt(row.get(18).ok()).unwrap_or_else(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::workflow_store::WorkflowStore;

    async fn setup() -> (ExecutionStore, String) {
        let db = Database::open_in_memory().unwrap();
        let workflows = WorkflowStore::new(db.clone());
        let def = crate::models::workflow::WorkflowDefinition::from_yaml(
            "name: t\nsteps:\n  - kind: transform\n    id: shape\n    op: merge\n",
        )
        .unwrap();
        let wf = workflows.create("u1", def).await.unwrap();
        (ExecutionStore::new(db), wf.id)
    }

    #[tokio::test]
    async fn test_finalize_is_set_exactly_once() {
        let (store, wf_id) = setup().await;
        let mut e = store
            .create(&wf_id, "u1", TriggerType::Manual, None, Default::default())
            .await
            .unwrap();

        e.status = ExecutionStatus::Completed;
        e.completed_at = Some(Utc::now());
        e.output = Some(serde_json::json!({"n": 1}));
        store.finalize(&e).await.unwrap();

        // A second finalize with different values must not overwrite.
        e.status = ExecutionStatus::Failed;
        e.output = Some(serde_json::json!({"n": 2}));
        store.finalize(&e).await.unwrap();

        let loaded = store.get(&e.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.output, Some(serde_json::json!({"n": 1})));
    }

    #[tokio::test]
    async fn test_has_active_tracks_status() {
        let (store, wf_id) = setup().await;
        let mut e = store
            .create(&wf_id, "u1", TriggerType::Schedule, None, Default::default())
            .await
            .unwrap();
        assert!(store.has_active(&wf_id).await.unwrap());

        e.status = ExecutionStatus::Failed;
        e.completed_at = Some(Utc::now());
        store.finalize(&e).await.unwrap();
        assert!(!store.has_active(&wf_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let (store, wf_id) = setup().await;
        let mut inputs = serde_json::Map::new();
        inputs.insert("who".into(), serde_json::json!("world"));
        let mut e = store
            .create(&wf_id, "u1", TriggerType::Manual, Some("s-1".into()), inputs)
            .await
            .unwrap();
        e.status = ExecutionStatus::Waiting;
        e.steps_completed.push("shape".into());
        e.step_outputs
            .insert("shape".into(), serde_json::json!({"ok": true}));
        e.resume_from = Some(1);
        e.tokens_used = 42;
        store.save_progress(&e).await.unwrap();

        let loaded = store.get(&e.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Waiting);
        assert_eq!(loaded.resume_from, Some(1));
        assert_eq!(loaded.tokens_used, 42);
        assert_eq!(loaded.session_id.as_deref(), Some("s-1"));
        assert_eq!(loaded.runtime_inputs["who"], serde_json::json!("world"));
        assert_eq!(loaded.step_outputs["shape"], serde_json::json!({"ok": true}));
    }
}
