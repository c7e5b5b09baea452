use chrono::{Duration, TimeZone, Utc};
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::decision::{
    DecisionAction, DecisionRequest, DecisionStatus, DECISION_TTL_SECS,
};

#[derive(Clone)]
pub struct DecisionStore {
    db: Database,
}

impl DecisionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a pending request with the fixed TTL. The partial unique
    /// index on (execution_id, step_id) WHERE pending turns a concurrent
    /// duplicate into a constraint error, surfaced as a conflict.
    pub async fn create(
        &self,
        execution_id: &str,
        step_id: &str,
        context: serde_json::Value,
    ) -> Result<DecisionRequest, ServerError> {
        let now = Utc::now();
        let r = DecisionRequest {
            id: Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            step_id: step_id.to_string(),
            context,
            status: DecisionStatus::Pending,
            action: None,
            remember: false,
            created_at: now,
            expires_at: now + Duration::seconds(DECISION_TTL_SECS),
            responded_at: None,
        };
        let rc = r.clone();
        let result = self
            .db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO decision_requests \
                     (id, execution_id, step_id, context, status, remember, created_at, expires_at) \
                     VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6)",
                    rusqlite::params![
                        rc.id,
                        rc.execution_id,
                        rc.step_id,
                        rc.context.to_string(),
                        rc.created_at.timestamp_millis(),
                        rc.expires_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await;
        match result {
            Ok(()) => Ok(r),
            Err(ServerError::Database(msg)) if msg.contains("UNIQUE") => Err(ServerError::Conflict(
                format!(
                    "a pending decision already exists for execution {} step {}",
                    execution_id, step_id
                ),
            )),
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<DecisionRequest>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM decision_requests WHERE id = ?1", COLUMNS),
                    rusqlite::params![id],
                    |row| Ok(row_to_request(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn list_pending(
        &self,
        execution_id: &str,
    ) -> Result<Vec<DecisionRequest>, ServerError> {
        let exec = execution_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM decision_requests \
                     WHERE execution_id = ?1 AND status = 'pending' ORDER BY created_at",
                    COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![exec], |row| Ok(row_to_request(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Latest request for an (execution, step) pair, any status.
    pub async fn latest_for_step(
        &self,
        execution_id: &str,
        step_id: &str,
    ) -> Result<Option<DecisionRequest>, ServerError> {
        let exec = execution_id.to_string();
        let step = step_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM decision_requests \
                         WHERE execution_id = ?1 AND step_id = ?2 \
                         ORDER BY created_at DESC LIMIT 1",
                        COLUMNS
                    ),
                    rusqlite::params![exec, step],
                    |row| Ok(row_to_request(row)),
                )
                .optional()
            })
            .await
    }

    /// Transition pending → responded. Returns None when the request is
    /// missing or no longer pending (the conditional UPDATE affected no
    /// rows).
    pub async fn respond(
        &self,
        id: &str,
        action: DecisionAction,
        remember: bool,
    ) -> Result<Option<DecisionRequest>, ServerError> {
        let rid = id.to_string();
        let updated = self
            .db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "UPDATE decision_requests \
                     SET status = 'responded', action = ?2, remember = ?3, responded_at = ?4 \
                     WHERE id = ?1 AND status = 'pending'",
                    rusqlite::params![
                        rid,
                        action.as_str(),
                        remember as i64,
                        Utc::now().timestamp_millis(),
                    ],
                )?;
                Ok(n > 0)
            })
            .await?;
        if !updated {
            return Ok(None);
        }
        self.get(id).await
    }

    /// Transition pending → expired.
    pub async fn expire(&self, id: &str) -> Result<(), ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE decision_requests SET status = 'expired' \
                     WHERE id = ?1 AND status = 'pending'",
                    rusqlite::params![id],
                )?;
                Ok(())
            })
            .await
    }
}

const COLUMNS: &str =
    "id, execution_id, step_id, context, status, action, remember, created_at, expires_at, responded_at";

fn row_to_request(row: &rusqlite::Row<'_>) -> DecisionRequest {
    let to_dt = |ms: Option<i64>| ms.and_then(|v| Utc.timestamp_millis_opt(v).single());
    let status: String = row.get(4).unwrap_or_default();
    let action: Option<String> = row.get(5).unwrap_or(None);
    let context: Option<String> = row.get(3).unwrap_or(None);
    DecisionRequest {
        id: row.get(0).unwrap_or_default(),
        execution_id: row.get(1).unwrap_or_default(),
        step_id: row.get(2).unwrap_or_default(),
        context: context
            .and_then(|v| serde_json::from_str(&v).ok())
            .unwrap_or(serde_json::Value::Null),
        status: DecisionStatus::parse(&status),
        action: action.as_deref().and_then(DecisionAction::parse),
        remember: row.get::<_, i64>(6).unwrap_or(0) != 0,
        created_at: to_dt(row.get(7).ok()).unwrap_or_else(Utc::now),
        expires_at: to_dt(row.get(8).ok()).unwrap_or_else(Utc::now),
        responded_at: to_dt(row.get(9).unwrap_or(None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::execution::TriggerType;
    use crate::store::execution_store::ExecutionStore;
    use crate::store::workflow_store::WorkflowStore;

    async fn setup() -> (DecisionStore, String) {
        let db = Database::open_in_memory().unwrap();
        let workflows = WorkflowStore::new(db.clone());
        let def = crate::models::workflow::WorkflowDefinition::from_yaml(
            "name: t\nsteps:\n  - kind: transform\n    id: shape\n    op: merge\n",
        )
        .unwrap();
        let wf = workflows.create("u1", def).await.unwrap();
        let exec = ExecutionStore::new(db.clone())
            .create(&wf.id, "u1", TriggerType::Manual, None, Default::default())
            .await
            .unwrap();
        (DecisionStore::new(db), exec.id)
    }

    #[tokio::test]
    async fn test_one_pending_per_step() {
        let (store, exec_id) = setup().await;
        store
            .create(&exec_id, "classify", serde_json::json!({"q": "which?"}))
            .await
            .unwrap();
        let err = store
            .create(&exec_id, "classify", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_respond_only_while_pending() {
        let (store, exec_id) = setup().await;
        let r = store
            .create(&exec_id, "classify", serde_json::json!({}))
            .await
            .unwrap();

        let responded = store
            .respond(&r.id, DecisionAction::Continue, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(responded.status, DecisionStatus::Responded);
        assert_eq!(responded.action, Some(DecisionAction::Continue));
        assert!(responded.remember);

        // Second respond hits a non-pending row.
        assert!(store
            .respond(&r.id, DecisionAction::Skip, false)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_expire_then_new_request_allowed() {
        let (store, exec_id) = setup().await;
        let r = store
            .create(&exec_id, "classify", serde_json::json!({}))
            .await
            .unwrap();
        store.expire(&r.id).await.unwrap();
        // Pending uniqueness only applies to pending rows.
        store
            .create(&exec_id, "classify", serde_json::json!({}))
            .await
            .unwrap();
    }
}
