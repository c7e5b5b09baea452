//! SQLite database layer for the Agentflow backend.
//!
//! Uses rusqlite with WAL mode for concurrent read performance.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::ServerError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, ServerError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| ServerError::Database(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| ServerError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, ServerError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ServerError::Database(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| ServerError::Database(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ServerError::Database(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| ServerError::Database(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| ServerError::Database(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), ServerError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflows (
                    id              TEXT PRIMARY KEY,
                    user_id         TEXT NOT NULL,
                    name            TEXT NOT NULL,
                    trigger_mode    TEXT NOT NULL DEFAULT 'manual',
                    definition      TEXT NOT NULL,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_workflows_user ON workflows(user_id);

                CREATE TABLE IF NOT EXISTS executions (
                    id              TEXT PRIMARY KEY,
                    workflow_id     TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
                    user_id         TEXT NOT NULL,
                    session_id      TEXT,
                    trigger         TEXT NOT NULL DEFAULT 'manual',
                    status          TEXT NOT NULL DEFAULT 'pending',
                    started_at      INTEGER,
                    completed_at    INTEGER,
                    steps_completed TEXT NOT NULL DEFAULT '[]',
                    steps_failed    TEXT NOT NULL DEFAULT '[]',
                    steps_skipped   TEXT NOT NULL DEFAULT '[]',
                    step_outputs    TEXT NOT NULL DEFAULT '{}',
                    runtime_inputs  TEXT NOT NULL DEFAULT '{}',
                    resume_from     INTEGER,
                    tokens_used     INTEGER NOT NULL DEFAULT 0,
                    output          TEXT,
                    error           TEXT,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_executions_workflow ON executions(workflow_id);
                CREATE INDEX IF NOT EXISTS idx_executions_active
                    ON executions(workflow_id) WHERE status IN ('pending', 'running', 'waiting');

                CREATE TABLE IF NOT EXISTS schedule_state (
                    workflow_id     TEXT PRIMARY KEY REFERENCES workflows(id) ON DELETE CASCADE,
                    expression      TEXT NOT NULL,
                    timezone        TEXT NOT NULL DEFAULT 'UTC',
                    enabled         INTEGER NOT NULL DEFAULT 1,
                    next_run        INTEGER,
                    last_run        INTEGER,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_schedule_next_run
                    ON schedule_state(next_run) WHERE enabled = 1;

                CREATE TABLE IF NOT EXISTS integration_connections (
                    user_id         TEXT NOT NULL,
                    integration     TEXT NOT NULL,
                    access_token    TEXT NOT NULL,
                    refresh_token   TEXT,
                    expires_at      INTEGER,
                    status          TEXT NOT NULL DEFAULT 'active',
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL,
                    PRIMARY KEY (user_id, integration)
                );

                CREATE TABLE IF NOT EXISTS decision_requests (
                    id              TEXT PRIMARY KEY,
                    execution_id    TEXT NOT NULL REFERENCES executions(id) ON DELETE CASCADE,
                    step_id         TEXT NOT NULL,
                    context         TEXT NOT NULL DEFAULT '{}',
                    status          TEXT NOT NULL DEFAULT 'pending',
                    action          TEXT,
                    remember        INTEGER NOT NULL DEFAULT 0,
                    created_at      INTEGER NOT NULL,
                    expires_at      INTEGER NOT NULL,
                    responded_at    INTEGER
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_decisions_one_pending
                    ON decision_requests(execution_id, step_id) WHERE status = 'pending';
                CREATE INDEX IF NOT EXISTS idx_decisions_execution
                    ON decision_requests(execution_id);
                ",
            )
        })
    }
}
