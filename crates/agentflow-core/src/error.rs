//! Core error types for the Agentflow platform.
//!
//! `ServerError` is used throughout the core domain (stores, scheduler,
//! planner, etc.). When the `axum` feature is enabled, it also implements
//! `IntoResponse` so it can be used directly as an axum handler error type.
//!
//! `StepError` is the step-level taxonomy: it classifies what went wrong
//! inside a single step so the executor can decide between retrying,
//! failing the step, or suspending the run for a human decision.

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error raised by a single workflow step.
///
/// Transient errors are retried with backoff; everything else fails the
/// step (never the whole run). `NeedsDecision` is not a failure at all:
/// it suspends the run until a human responds or the request expires.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("integration '{0}' is not connected")]
    NotConnected(String),

    #[error("reauthorization required for integration '{0}'")]
    ReauthorizationRequired(String),

    #[error("transient integration error: {0}")]
    Transient(String),

    #[error("human decision required")]
    NeedsDecision(serde_json::Value),

    #[error("{0}")]
    Terminal(String),
}

impl StepError {
    /// Whether the executor should retry this error with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StepError::Transient(_))
    }

    /// Stable machine-readable kind, surfaced to API callers and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::Validation(_) => "validation_error",
            StepError::NotConnected(_) => "not_connected",
            StepError::ReauthorizationRequired(_) => "reauthorization_required",
            StepError::Transient(_) => "transient_integration_error",
            StepError::NeedsDecision(_) => "needs_decision",
            StepError::Terminal(_) => "terminal",
        }
    }
}

// ---------------------------------------------------------------------------
// axum integration (opt-in via feature flag)
// ---------------------------------------------------------------------------

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for ServerError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, message) = match &self {
            ServerError::Database(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            ServerError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ServerError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ServerError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            ServerError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            ServerError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_classification() {
        assert!(StepError::Transient("rate limited".into()).is_transient());
        assert!(!StepError::Terminal("boom".into()).is_transient());
        assert_eq!(
            StepError::ReauthorizationRequired("mail".into()).kind(),
            "reauthorization_required"
        );
        assert_eq!(
            StepError::Transient("timeout".into()).kind(),
            "transient_integration_error"
        );
    }
}
