use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{delete, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use agentflow_core::error::ServerError;
use agentflow_core::state::AppState;

use super::require_user;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{key}/connect", post(connect))
        .route("/{key}", delete(disconnect))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectBody {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

/// POST /api/integrations/{key}/connect — store (or replace) the caller's
/// credential for an integration.
async fn connect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key): Path<String>,
    Json(body): Json<ConnectBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user_id = require_user(&headers)?;
    let connection = state
        .broker
        .connect(
            &user_id,
            &key,
            &body.access_token,
            body.refresh_token,
            body.expires_at,
        )
        .await?;
    Ok(Json(serde_json::json!({ "connection": connection })))
}

/// DELETE /api/integrations/{key} — soft-invalidate the credential.
async fn disconnect(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user_id = require_user(&headers)?;
    let disconnected = state.broker.disconnect(&user_id, &key).await?;
    Ok(Json(serde_json::json!({ "disconnected": disconnected })))
}
