//! Decision requests — the pause/resume records behind the decision gate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed TTL for a pending request.
pub const DECISION_TTL_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Pending,
    Responded,
    Expired,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Pending => "pending",
            DecisionStatus::Responded => "responded",
            DecisionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "responded" => DecisionStatus::Responded,
            "expired" => DecisionStatus::Expired,
            _ => DecisionStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Continue,
    Stop,
    Skip,
}

impl DecisionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionAction::Continue => "continue",
            DecisionAction::Stop => "stop",
            DecisionAction::Skip => "skip",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "continue" => Some(DecisionAction::Continue),
            "stop" => Some(DecisionAction::Stop),
            "skip" => Some(DecisionAction::Skip),
            _ => None,
        }
    }
}

/// A pending question for the run's owner. At most one pending request may
/// exist per (execution, step) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    pub id: String,
    pub execution_id: String,
    pub step_id: String,
    /// Structured description of the ambiguity and options.
    pub context: serde_json::Value,
    pub status: DecisionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<DecisionAction>,
    pub remember: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
}

impl DecisionRequest {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == DecisionStatus::Pending && self.expires_at <= now
    }
}
