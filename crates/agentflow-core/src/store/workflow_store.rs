use chrono::{TimeZone, Utc};
use rusqlite::OptionalExtension;
use uuid::Uuid;

use crate::db::Database;
use crate::error::ServerError;
use crate::models::workflow::{Workflow, WorkflowDefinition};

#[derive(Clone)]
pub struct WorkflowStore {
    db: Database,
}

impl WorkflowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Validate and persist a definition for a user.
    pub async fn create(
        &self,
        user_id: &str,
        mut definition: WorkflowDefinition,
    ) -> Result<Workflow, ServerError> {
        definition.validate()?;
        let now = Utc::now();
        let wf = Workflow {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            definition,
            created_at: now,
            updated_at: now,
        };
        let w = wf.clone();
        let def_json = serde_json::to_string(&w.definition)
            .map_err(|e| ServerError::Internal(format!("serialize definition: {}", e)))?;
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflows (id, user_id, name, trigger_mode, definition, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        w.id,
                        w.user_id,
                        w.definition.name,
                        w.definition.trigger.as_str(),
                        def_json,
                        w.created_at.timestamp_millis(),
                        w.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(wf)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Workflow>, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT id, user_id, definition, created_at, updated_at \
                     FROM workflows WHERE id = ?1",
                    rusqlite::params![id],
                    |row| Ok(row_to_workflow(row)),
                )
                .optional()
            })
            .await
    }

    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<Workflow>, ServerError> {
        let user = user_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, definition, created_at, updated_at \
                     FROM workflows WHERE user_id = ?1 ORDER BY created_at DESC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![user], |row| Ok(row_to_workflow(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<bool, ServerError> {
        let id = id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let n = conn.execute("DELETE FROM workflows WHERE id = ?1", rusqlite::params![id])?;
                Ok(n > 0)
            })
            .await
    }
}

fn row_to_workflow(row: &rusqlite::Row<'_>) -> Workflow {
    let to_dt = |ms: i64| Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now);
    let def_json: String = row.get(2).unwrap_or_default();
    let definition: WorkflowDefinition =
        serde_json::from_str(&def_json).unwrap_or_else(|_| WorkflowDefinition {
            name: String::new(),
            description: None,
            version: "1.0".into(),
            trigger: Default::default(),
            required_integrations: Vec::new(),
            steps: Vec::new(),
            input_schema: None,
            output_schema: None,
        });
    Workflow {
        id: row.get(0).unwrap_or_default(),
        user_id: row.get(1).unwrap_or_default(),
        definition,
        created_at: to_dt(row.get(3).unwrap_or(0)),
        updated_at: to_dt(row.get(4).unwrap_or(0)),
    }
}
