//! Per-execution progress events.
//!
//! Each run gets its own broadcast channel, created when the run starts
//! and torn down at the terminal event. The hub lives in `AppState` and
//! is shared by the engine (producer) and the HTTP streaming layer
//! (consumers); there is no process-wide emitter registry. Emission is
//! fire-and-forget: a send with no subscribers is not an error, and no
//! emission failure may abort execution.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

use crate::models::execution::ExecutionStatus;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEventKind {
    StepStarted {
        step_id: String,
    },
    StepCompleted {
        step_id: String,
    },
    StepFailed {
        step_id: String,
        error_kind: String,
        error: String,
    },
    StepSkipped {
        step_id: String,
        reason: String,
    },
    DecisionRequested {
        step_id: String,
        request_id: String,
    },
    ExecutionComplete {
        status: ExecutionStatus,
        steps_completed: usize,
        steps_failed: usize,
        steps_skipped: usize,
        tokens_used: u64,
    },
}

impl ExecutionEventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionEventKind::ExecutionComplete { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ExecutionEventKind,
}

/// Registry of live per-execution channels.
#[derive(Clone, Default)]
pub struct EventHub {
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<ExecutionEvent>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the channel for a run, returning an emitter handle.
    /// Re-opening (resume, continuation) reuses the existing channel so
    /// attached observers keep their subscription.
    pub async fn open(&self, execution_id: &str) -> ExecutionEmitter {
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(execution_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        ExecutionEmitter {
            execution_id: execution_id.to_string(),
            tx,
        }
    }

    /// Subscribe to a run's events; None when no channel is live.
    pub async fn subscribe(
        &self,
        execution_id: &str,
    ) -> Option<broadcast::Receiver<ExecutionEvent>> {
        let channels = self.channels.read().await;
        channels.get(execution_id).map(|tx| tx.subscribe())
    }

    /// Tear the channel down after the terminal event. Receivers observe
    /// a closed stream once they drain buffered events.
    pub async fn close(&self, execution_id: &str) {
        let mut channels = self.channels.write().await;
        channels.remove(execution_id);
    }
}

/// Producer handle bound to one execution.
#[derive(Clone)]
pub struct ExecutionEmitter {
    execution_id: String,
    tx: broadcast::Sender<ExecutionEvent>,
}

impl ExecutionEmitter {
    pub fn emit(&self, kind: ExecutionEventKind) {
        let event = ExecutionEvent {
            execution_id: self.execution_id.clone(),
            timestamp: Utc::now(),
            kind,
        };
        // No subscribers is fine; the run never depends on observers.
        let _ = self.tx.send(event);
    }
}
