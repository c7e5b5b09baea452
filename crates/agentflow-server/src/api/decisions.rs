use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use agentflow_core::error::ServerError;
use agentflow_core::models::decision::DecisionAction;
use agentflow_core::state::AppState;

use super::require_user;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_pending))
        .route("/{id}/respond", post(respond))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    execution_id: String,
}

/// GET /api/decisions?executionId= — pending requests for an execution.
async fn list_pending(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user_id = require_user(&headers)?;
    let decisions = state.gate.list_pending(&q.execution_id, &user_id).await?;
    Ok(Json(serde_json::json!({ "decisions": decisions })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RespondBody {
    action: String,
    #[serde(default)]
    remember: bool,
}

/// POST /api/decisions/{id}/respond — record the caller's action and
/// resume the suspended run in the background.
async fn respond(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<RespondBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user_id = require_user(&headers)?;
    let action = DecisionAction::parse(&body.action).ok_or_else(|| {
        ServerError::BadRequest(format!(
            "unknown action '{}': expected continue, stop or skip",
            body.action
        ))
    })?;

    let decision = state
        .gate
        .respond(&id, &user_id, action, body.remember)
        .await?;

    let engine = state.engine.clone();
    let execution_id = decision.execution_id.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.resume(&execution_id).await {
            tracing::error!(execution_id = %execution_id, error = %e, "resume failed");
        }
    });

    Ok(Json(serde_json::json!({ "decision": decision })))
}
