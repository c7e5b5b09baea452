pub mod decisions;
pub mod executions;
pub mod integrations;
pub mod plans;
pub mod scheduler;
pub mod webhooks;
pub mod workflows;

use axum::http::HeaderMap;
use axum::Router;

use agentflow_core::error::ServerError;
use agentflow_core::state::AppState;

/// Build the complete API router with all sub-routes.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/api/workflows", workflows::router())
        .nest("/api/webhooks", webhooks::router())
        .nest("/api/scheduler", scheduler::router())
        .nest("/api/executions", executions::router())
        .nest("/api/decisions", decisions::router())
        .nest("/api/plans", plans::router())
        .nest("/api/integrations", integrations::router())
}

/// Caller identity comes from the `x-user-id` header set by the fronting
/// auth proxy. Requests without it are rejected.
pub(crate) fn require_user(headers: &HeaderMap) -> Result<String, ServerError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or_else(|| ServerError::Unauthorized("missing x-user-id header".into()))
}
