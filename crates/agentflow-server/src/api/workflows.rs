use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use agentflow_core::error::ServerError;
use agentflow_core::models::execution::TriggerType;
use agentflow_core::models::workflow::{Workflow, WorkflowDefinition};
use agentflow_core::state::AppState;

use super::require_user;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workflows).post(create_workflow))
        .route("/{id}", get(get_workflow).delete(delete_workflow))
        .route("/{id}/run", post(run_workflow))
}

/// The definition can be submitted as structured JSON or as a YAML
/// document string.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWorkflowBody {
    definition: Option<serde_json::Value>,
    yaml: Option<String>,
}

async fn create_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateWorkflowBody>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user_id = require_user(&headers)?;
    let definition = match (body.definition, body.yaml) {
        (Some(json), _) => WorkflowDefinition::from_json(json)?,
        (None, Some(yaml)) => WorkflowDefinition::from_yaml(&yaml)?,
        (None, None) => {
            return Err(ServerError::BadRequest(
                "provide either 'definition' or 'yaml'".into(),
            ))
        }
    };

    let workflow = state.workflow_store.create(&user_id, definition).await?;
    state.scheduler.sync_schedule(&workflow).await?;
    Ok(Json(serde_json::json!({ "workflow": workflow })))
}

async fn list_workflows(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user_id = require_user(&headers)?;
    let workflows = state.workflow_store.list_by_user(&user_id).await?;
    Ok(Json(serde_json::json!({ "workflows": workflows })))
}

async fn get_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user_id = require_user(&headers)?;
    let workflow = owned_workflow(&state, &id, &user_id).await?;
    let schedule = state.schedule_store.get(&id).await?;
    Ok(Json(serde_json::json!({
        "workflow": workflow,
        "schedule": schedule,
    })))
}

async fn delete_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user_id = require_user(&headers)?;
    owned_workflow(&state, &id, &user_id).await?;
    let deleted = state.workflow_store.delete(&id).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunBody {
    #[serde(default)]
    runtime_inputs: serde_json::Map<String, serde_json::Value>,
    session_id: Option<String>,
}

/// POST /api/workflows/{id}/run — accept a manual trigger, create the run
/// record, and execute asynchronously.
async fn run_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<RunBody>>,
) -> Result<(StatusCode, Json<serde_json::Value>), ServerError> {
    let user_id = require_user(&headers)?;
    let workflow = owned_workflow(&state, &id, &user_id).await?;
    let Json(body) = body.unwrap_or_default();

    let execution = state
        .execution_store
        .create(
            &workflow.id,
            &user_id,
            TriggerType::Manual,
            body.session_id,
            body.runtime_inputs,
        )
        .await?;

    let engine = state.engine.clone();
    let execution_id = execution.id.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.execute_claimed(&execution_id).await {
            tracing::error!(execution_id = %execution_id, error = %e, "manual run failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "executionId": execution.id })),
    ))
}

async fn owned_workflow(
    state: &AppState,
    id: &str,
    user_id: &str,
) -> Result<Workflow, ServerError> {
    let workflow = state
        .workflow_store
        .get(id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("Workflow {} not found", id)))?;
    if workflow.user_id != user_id {
        return Err(ServerError::NotFound(format!("Workflow {} not found", id)));
    }
    Ok(workflow)
}
