//! Decision gate — suspends a step on a pending human decision.
//!
//! A step that cannot resolve on its own files a request here and the run
//! suspends without failing. Responding is only valid while the request is
//! pending and the caller owns the execution. Requests not answered within
//! the TTL resolve to `skip` when the engine resumes.

use chrono::Utc;

use crate::error::ServerError;
use crate::models::decision::{DecisionAction, DecisionRequest, DecisionStatus};
use crate::store::{DecisionStore, ExecutionStore};

#[derive(Clone)]
pub struct DecisionGate {
    decisions: DecisionStore,
    executions: ExecutionStore,
}

impl DecisionGate {
    pub fn new(decisions: DecisionStore, executions: ExecutionStore) -> Self {
        Self {
            decisions,
            executions,
        }
    }

    /// File a pending request for (execution, step). When one is already
    /// pending, the existing request is returned so a re-suspending engine
    /// never errors on its own earlier request.
    pub async fn request(
        &self,
        execution_id: &str,
        step_id: &str,
        context: serde_json::Value,
    ) -> Result<DecisionRequest, ServerError> {
        match self.decisions.create(execution_id, step_id, context).await {
            Ok(request) => Ok(request),
            Err(ServerError::Conflict(_)) => self
                .decisions
                .latest_for_step(execution_id, step_id)
                .await?
                .filter(|r| r.status == DecisionStatus::Pending)
                .ok_or_else(|| {
                    ServerError::Internal("pending decision request disappeared".into())
                }),
            Err(e) => Err(e),
        }
    }

    /// Pending requests for an execution, gated on ownership.
    pub async fn list_pending(
        &self,
        execution_id: &str,
        user_id: &str,
    ) -> Result<Vec<DecisionRequest>, ServerError> {
        self.check_ownership(execution_id, user_id).await?;
        self.decisions.list_pending(execution_id).await
    }

    /// Record the caller's action. Valid only while pending and only for
    /// the execution owner; an expired request is closed out instead.
    pub async fn respond(
        &self,
        request_id: &str,
        user_id: &str,
        action: DecisionAction,
        remember: bool,
    ) -> Result<DecisionRequest, ServerError> {
        let request = self
            .decisions
            .get(request_id)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("decision {} not found", request_id)))?;

        self.check_ownership(&request.execution_id, user_id).await?;

        if request.status == DecisionStatus::Pending && request.is_expired_at(Utc::now()) {
            self.decisions.expire(request_id).await?;
            return Err(ServerError::NotFound(format!(
                "decision {} has expired",
                request_id
            )));
        }

        self.decisions
            .respond(request_id, action, remember)
            .await?
            .ok_or_else(|| {
                ServerError::NotFound(format!("decision {} is not pending", request_id))
            })
    }

    /// How a suspended step should proceed:
    /// - responded  → the chosen action
    /// - expired    → implicit skip
    /// - pending    → `None`, keep waiting
    /// - no request → implicit skip (nothing left to wait on)
    pub async fn resolve_for_resume(
        &self,
        execution_id: &str,
        step_id: &str,
    ) -> Result<Option<DecisionAction>, ServerError> {
        let Some(request) = self.decisions.latest_for_step(execution_id, step_id).await? else {
            return Ok(Some(DecisionAction::Skip));
        };
        match request.status {
            DecisionStatus::Responded => {
                Ok(Some(request.action.unwrap_or(DecisionAction::Skip)))
            }
            DecisionStatus::Expired => Ok(Some(DecisionAction::Skip)),
            DecisionStatus::Pending => {
                if request.is_expired_at(Utc::now()) {
                    self.decisions.expire(&request.id).await?;
                    Ok(Some(DecisionAction::Skip))
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn check_ownership(&self, execution_id: &str, user_id: &str) -> Result<(), ServerError> {
        let execution = self
            .executions
            .get(execution_id)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("execution {} not found", execution_id)))?;
        if execution.user_id != user_id {
            return Err(ServerError::Unauthorized(
                "caller does not own this execution".into(),
            ));
        }
        Ok(())
    }
}
