//! Execution — one run of a workflow definition.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    /// Suspended on a pending human decision.
    Waiting,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Waiting => "waiting",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => ExecutionStatus::Running,
            "waiting" => ExecutionStatus::Waiting,
            "completed" => ExecutionStatus::Completed,
            "failed" => ExecutionStatus::Failed,
            _ => ExecutionStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Webhook,
    Schedule,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Manual => "manual",
            TriggerType::Webhook => "webhook",
            TriggerType::Schedule => "schedule",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "webhook" => TriggerType::Webhook,
            "schedule" => TriggerType::Schedule,
            _ => TriggerType::Manual,
        }
    }
}

/// One run of a workflow. Terminal fields are set exactly once; the row is
/// never mutated after reaching a terminal status. Step outputs and runtime
/// inputs are persisted so a suspended run can be resumed without
/// re-executing completed steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub workflow_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub trigger: TriggerType,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub steps_completed: Vec<String>,
    pub steps_failed: Vec<String>,
    pub steps_skipped: Vec<String>,
    /// Recorded outputs keyed by step id.
    #[serde(default, skip_serializing)]
    pub step_outputs: HashMap<String, serde_json::Value>,
    /// Runtime inputs the run was started with (needed for resume).
    #[serde(default, skip_serializing)]
    pub runtime_inputs: serde_json::Map<String, serde_json::Value>,
    /// Index of the step to resume from, when suspended or continued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<usize>,
    pub tokens_used: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-facing summary of a run, returned by the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub status: ExecutionStatus,
    pub steps_completed: Vec<String>,
    pub steps_failed: Vec<String>,
    pub steps_skipped: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    pub tokens_used: u64,
    pub execution_id: String,
}

impl ExecutionResult {
    pub fn from_execution(e: &Execution) -> Self {
        Self {
            success: e.status == ExecutionStatus::Completed,
            status: e.status,
            steps_completed: e.steps_completed.clone(),
            steps_failed: e.steps_failed.clone(),
            steps_skipped: e.steps_skipped.clone(),
            output: e.output.clone(),
            tokens_used: e.tokens_used,
            execution_id: e.id.clone(),
        }
    }
}
