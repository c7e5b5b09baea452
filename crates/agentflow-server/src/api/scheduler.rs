use axum::{extract::State, http::HeaderMap, routing::get, Json, Router};

use agentflow_core::error::ServerError;
use agentflow_core::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/tick", get(tick))
}

/// GET /api/scheduler/tick — one scheduler pass, invoked by an external
/// timer. Bearer-token authenticated when a token is configured.
async fn tick(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ServerError> {
    if let Some(expected) = &state.config.scheduler_token {
        let presented = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if presented != Some(expected.as_str()) {
            return Err(ServerError::Unauthorized(
                "invalid or missing scheduler token".into(),
            ));
        }
    }

    let report = state.scheduler.tick().await?;
    Ok(Json(serde_json::json!(report)))
}
