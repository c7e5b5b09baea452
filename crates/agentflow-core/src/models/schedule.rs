//! Per-workflow schedule state. `next_run` is the sole concurrency-control
//! field: scheduler instances claim a due run with a compare-and-swap on
//! its previously observed value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleState {
    pub workflow_id: String,
    /// 5-field cron expression.
    pub expression: String,
    /// IANA timezone the expression is evaluated in.
    pub timezone: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
