//! Schedule state store. The `claim` here is the sole correctness
//! mechanism preventing duplicate scheduled runs: a single conditional
//! UPDATE predicated on the previously observed `next_run` value. Zero
//! rows affected means another scheduler invocation won the race.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::schedule::ScheduleState;

#[derive(Clone)]
pub struct ScheduleStore {
    db: Database,
}

impl ScheduleStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create or replace the schedule row for a workflow.
    pub async fn upsert(
        &self,
        workflow_id: &str,
        expression: &str,
        timezone: &str,
        enabled: bool,
        next_run: Option<DateTime<Utc>>,
    ) -> Result<ScheduleState, ServerError> {
        let now = Utc::now();
        let s = ScheduleState {
            workflow_id: workflow_id.to_string(),
            expression: expression.to_string(),
            timezone: timezone.to_string(),
            enabled,
            next_run,
            last_run: None,
            created_at: now,
            updated_at: now,
        };
        let sc = s.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO schedule_state (workflow_id, expression, timezone, enabled, \
                     next_run, last_run, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?6) \
                     ON CONFLICT(workflow_id) DO UPDATE SET \
                       expression = ?2, timezone = ?3, enabled = ?4, next_run = ?5, updated_at = ?6",
                    rusqlite::params![
                        sc.workflow_id,
                        sc.expression,
                        sc.timezone,
                        sc.enabled as i64,
                        sc.next_run.map(|t| t.timestamp_millis()),
                        now.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(s)
    }

    pub async fn get(&self, workflow_id: &str) -> Result<Option<ScheduleState>, ServerError> {
        let id = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT workflow_id, expression, timezone, enabled, next_run, last_run, \
                     created_at, updated_at FROM schedule_state WHERE workflow_id = ?1",
                    rusqlite::params![id],
                    |row| Ok(row_to_schedule(row)),
                )
                .optional()
            })
            .await
    }

    /// All enabled schedules whose `next_run` is at or before `now`.
    pub async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleState>, ServerError> {
        let now_ms = now.timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT workflow_id, expression, timezone, enabled, next_run, last_run, \
                     created_at, updated_at FROM schedule_state \
                     WHERE enabled = 1 AND next_run IS NOT NULL AND next_run <= ?1",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![now_ms], |row| Ok(row_to_schedule(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Atomically claim a due run: advance `next_run`/`last_run` only if
    /// `next_run` still holds the value this scheduler invocation observed.
    /// Returns false when the compare-and-swap loses the race.
    pub async fn claim(
        &self,
        workflow_id: &str,
        observed_next_run: DateTime<Utc>,
        new_next_run: DateTime<Utc>,
        run_at: DateTime<Utc>,
    ) -> Result<bool, ServerError> {
        let id = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "UPDATE schedule_state SET next_run = ?2, last_run = ?3, updated_at = ?4 \
                     WHERE workflow_id = ?1 AND next_run = ?5 AND enabled = 1",
                    rusqlite::params![
                        id,
                        new_next_run.timestamp_millis(),
                        run_at.timestamp_millis(),
                        Utc::now().timestamp_millis(),
                        observed_next_run.timestamp_millis(),
                    ],
                )?;
                Ok(n > 0)
            })
            .await
    }

    /// Roll a claim back after a downstream failure, restoring the
    /// pre-claim values so the workflow stays eligible for the next pass.
    pub async fn restore_claim(
        &self,
        workflow_id: &str,
        prev_next_run: Option<DateTime<Utc>>,
        prev_last_run: Option<DateTime<Utc>>,
    ) -> Result<(), ServerError> {
        let id = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "UPDATE schedule_state SET next_run = ?2, last_run = ?3, updated_at = ?4 \
                     WHERE workflow_id = ?1",
                    rusqlite::params![
                        id,
                        prev_next_run.map(|t| t.timestamp_millis()),
                        prev_last_run.map(|t| t.timestamp_millis()),
                        Utc::now().timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn set_enabled(&self, workflow_id: &str, enabled: bool) -> Result<bool, ServerError> {
        let id = workflow_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute(
                    "UPDATE schedule_state SET enabled = ?2, updated_at = ?3 WHERE workflow_id = ?1",
                    rusqlite::params![id, enabled as i64, Utc::now().timestamp_millis()],
                )?;
                Ok(n > 0)
            })
            .await
    }
}

fn row_to_schedule(row: &rusqlite::Row<'_>) -> ScheduleState {
    let to_dt = |ms: Option<i64>| ms.and_then(|v| Utc.timestamp_millis_opt(v).single());
    ScheduleState {
        workflow_id: row.get(0).unwrap_or_default(),
        expression: row.get(1).unwrap_or_default(),
        timezone: row.get(2).unwrap_or_else(|_| "UTC".to_string()),
        enabled: row.get::<_, i64>(3).unwrap_or(0) != 0,
        next_run: to_dt(row.get(4).unwrap_or(None)),
        last_run: to_dt(row.get(5).unwrap_or(None)),
        created_at: to_dt(row.get(6).ok()).unwrap_or_else(Utc::now),
        updated_at: to_dt(row.get(7).ok()).unwrap_or_else(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::workflow_store::WorkflowStore;
    use chrono::Duration;

    async fn setup() -> (ScheduleStore, String) {
        let db = Database::open_in_memory().unwrap();
        let workflows = WorkflowStore::new(db.clone());
        let def = crate::models::workflow::WorkflowDefinition::from_yaml(
            "name: t\nsteps:\n  - kind: transform\n    id: shape\n    op: merge\n",
        )
        .unwrap();
        let wf = workflows.create("u1", def).await.unwrap();
        (ScheduleStore::new(db), wf.id)
    }

    #[tokio::test]
    async fn test_claim_succeeds_exactly_once() {
        let (store, wf_id) = setup().await;
        let due = Utc::now() - Duration::minutes(1);
        store
            .upsert(&wf_id, "*/5 * * * *", "UTC", true, Some(due))
            .await
            .unwrap();

        let now = Utc::now();
        let next = now + Duration::minutes(5);
        // Both claimants observed the same next_run; only one may win.
        let first = store.claim(&wf_id, due, next, now).await.unwrap();
        let second = store.claim(&wf_id, due, next, now).await.unwrap();
        assert!(first);
        assert!(!second);

        let s = store.get(&wf_id).await.unwrap().unwrap();
        assert_eq!(
            s.next_run.unwrap().timestamp_millis(),
            next.timestamp_millis()
        );
        assert!(s.next_run.unwrap() > due, "next_run must strictly advance");
    }

    #[tokio::test]
    async fn test_restore_claim_rolls_back() {
        let (store, wf_id) = setup().await;
        let due = Utc::now() - Duration::minutes(1);
        store
            .upsert(&wf_id, "*/5 * * * *", "UTC", true, Some(due))
            .await
            .unwrap();

        let now = Utc::now();
        assert!(store
            .claim(&wf_id, due, now + Duration::minutes(5), now)
            .await
            .unwrap());
        store.restore_claim(&wf_id, Some(due), None).await.unwrap();

        let s = store.get(&wf_id).await.unwrap().unwrap();
        assert_eq!(
            s.next_run.unwrap().timestamp_millis(),
            due.timestamp_millis()
        );
        assert!(s.last_run.is_none());
    }

    #[tokio::test]
    async fn test_list_due_filters_disabled() {
        let (store, wf_id) = setup().await;
        let due = Utc::now() - Duration::minutes(1);
        store
            .upsert(&wf_id, "0 * * * *", "UTC", true, Some(due))
            .await
            .unwrap();
        assert_eq!(store.list_due(Utc::now()).await.unwrap().len(), 1);

        store.set_enabled(&wf_id, false).await.unwrap();
        assert!(store.list_due(Utc::now()).await.unwrap().is_empty());
    }
}
