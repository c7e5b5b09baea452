use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};

use agentflow_core::error::ServerError;
use agentflow_core::models::execution::TriggerType;
use agentflow_core::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/{workflow_id}", post(trigger_webhook))
}

/// POST /api/webhooks/{workflow_id} — accept the trigger, create the run
/// record, and execute asynchronously. The JSON body becomes the run's
/// runtime inputs.
async fn trigger_webhook(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    body: Option<Json<serde_json::Value>>,
) -> Result<(StatusCode, Json<serde_json::Value>), ServerError> {
    let workflow = state
        .workflow_store
        .get(&workflow_id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("Workflow {} not found", workflow_id)))?;

    let runtime_inputs = body
        .and_then(|Json(v)| v.as_object().cloned())
        .unwrap_or_default();

    let execution = state
        .execution_store
        .create(
            &workflow.id,
            &workflow.user_id,
            TriggerType::Webhook,
            None,
            runtime_inputs,
        )
        .await?;

    let engine = state.engine.clone();
    let execution_id = execution.id.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.execute_claimed(&execution_id).await {
            tracing::error!(execution_id = %execution_id, error = %e, "webhook run failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "executionId": execution.id })),
    ))
}
