use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
use serde::Deserialize;

use agentflow_core::error::ServerError;
use agentflow_core::state::AppState;

use super::require_user;

pub fn router() -> Router<AppState> {
    Router::new().route("/", post(generate_plan))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanBody {
    goal: String,
    #[serde(default)]
    available_integrations: Vec<String>,
}

/// POST /api/plans — generate a validated step graph for a goal.
async fn generate_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PlanBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    require_user(&headers)?;
    let outcome = state
        .planner
        .generate(&body.goal, &body.available_integrations)
        .await?;
    Ok(Json(serde_json::json!({ "plan": outcome })))
}
