use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::sse::{Event, Sse},
    routing::get,
    Json, Router,
};
use tokio_stream::Stream;

use agentflow_core::error::ServerError;
use agentflow_core::models::execution::Execution;
use agentflow_core::state::AppState;

use super::require_user;

/// Observation deadline: a stream with no terminal event within this
/// window is force-closed. The run itself is unaffected.
const STREAM_DEADLINE: Duration = Duration::from_secs(300);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(get_execution))
        .route("/{id}/events", get(execution_events))
}

async fn get_execution(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let user_id = require_user(&headers)?;
    let execution = owned_execution(&state, &id, &user_id).await?;
    Ok(Json(serde_json::json!({ "execution": execution })))
}

/// GET /api/executions/{id}/events — SSE stream of run progress.
///
/// Emits a snapshot of the current execution first, then live events
/// until the terminal event, the observation deadline, or the client
/// disconnecting. Disconnection only releases the subscription; the run
/// keeps going.
async fn execution_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServerError> {
    let user_id = require_user(&headers)?;
    let execution = owned_execution(&state, &id, &user_id).await?;
    let rx = state.hub.subscribe(&id).await;

    let stream = async_stream::stream! {
        let snapshot = serde_json::json!({
            "type": "snapshot",
            "execution": execution,
        });
        yield Ok::<_, Infallible>(Event::default().data(snapshot.to_string()));

        // No live channel means the run already reached a terminal state.
        let Some(mut rx) = rx else { return };

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let deadline = tokio::time::sleep(STREAM_DEADLINE);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    yield Ok(Event::default().comment("stream deadline reached"));
                    break;
                }
                _ = heartbeat.tick() => {
                    yield Ok(Event::default().comment("heartbeat"));
                }
                msg = rx.recv() => match msg {
                    Ok(event) => {
                        let terminal = event.kind.is_terminal();
                        if let Ok(data) = serde_json::to_string(&event) {
                            yield Ok(Event::default().data(data));
                        }
                        if terminal {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(execution_id = %id, skipped, "event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    };

    Ok(Sse::new(stream))
}

async fn owned_execution(
    state: &AppState,
    id: &str,
    user_id: &str,
) -> Result<Execution, ServerError> {
    let execution = state
        .execution_store
        .get(id)
        .await?
        .ok_or_else(|| ServerError::NotFound(format!("Execution {} not found", id)))?;
    if execution.user_id != user_id {
        return Err(ServerError::NotFound(format!("Execution {} not found", id)));
    }
    Ok(execution)
}
