//! End-to-end engine scenarios over an in-memory database.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;

use agentflow_core::db::Database;
use agentflow_core::error::{ServerError, StepError};
use agentflow_core::integrations::{
    AdapterRegistry, IntegrationAdapter, IntegrationKind, RefreshedCredential,
};
use agentflow_core::models::connection::IntegrationConnection;
use agentflow_core::models::decision::DecisionAction;
use agentflow_core::models::execution::{ExecutionStatus, TriggerType};
use agentflow_core::models::workflow::WorkflowDefinition;
use agentflow_core::planner::{ModelClient, ModelReply};
use agentflow_core::state::{AppConfig, AppStateInner};

/// Adapter that echoes params back, failing terminally when the params
/// contain the string "bad" anywhere.
struct TestAdapter {
    kind: IntegrationKind,
    fail_always: bool,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl IntegrationAdapter for TestAdapter {
    fn kind(&self) -> IntegrationKind {
        self.kind
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<RefreshedCredential, StepError> {
        Err(StepError::Terminal("refresh unsupported".into()))
    }

    async fn invoke(
        &self,
        _connection: &IntegrationConnection,
        action: &str,
        params: &Value,
    ) -> Result<Value, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_always {
            return Err(StepError::Terminal("service rejected the request".into()));
        }
        if params.to_string().contains("bad") {
            return Err(StepError::Terminal("item rejected".into()));
        }
        Ok(serde_json::json!({ "action": action, "params": params }))
    }
}

struct CannedModel {
    reply: String,
}

#[async_trait]
impl ModelClient for CannedModel {
    async fn complete(
        &self,
        model: &str,
        _system: &str,
        _prompt: &str,
        _max_tokens: u32,
    ) -> Result<ModelReply, StepError> {
        Ok(ModelReply {
            content: self.reply.clone(),
            model: model.to_string(),
            tokens_used: 10,
        })
    }
}

async fn state_with(
    mail_fails: bool,
    model_reply: &str,
) -> (Arc<AppStateInner>, Arc<AtomicU32>) {
    let db = Database::open_in_memory().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(TestAdapter {
        kind: IntegrationKind::Mail,
        fail_always: mail_fails,
        calls: calls.clone(),
    }));
    registry.register(Arc::new(TestAdapter {
        kind: IntegrationKind::Chat,
        fail_always: false,
        calls: calls.clone(),
    }));
    let state = Arc::new(AppStateInner::new(
        db,
        Arc::new(registry),
        Arc::new(CannedModel {
            reply: model_reply.to_string(),
        }),
        AppConfig::default(),
    ));
    state
        .connection_store
        .upsert("u1", "mail", "tok", None, None)
        .await
        .unwrap();
    state
        .connection_store
        .upsert("u1", "chat", "tok", None, None)
        .await
        .unwrap();
    (state, calls)
}

fn triage_definition() -> WorkflowDefinition {
    WorkflowDefinition::from_yaml(
        r#"
name: "Invoice triage"
steps:
  - kind: api_call
    id: fetch
    integration: mail
    action: list_messages
    params:
      folder: inbox
  - kind: llm_decision
    id: classify
    inputs:
      messages: { from: step, step: fetch }
    prompt: "Classify: ${messages}"
  - kind: api_call
    id: notify
    integration: chat
    action: post_message
    inputs:
      summary: { from: step, step: classify }
    params:
      text: "${summary.category}"
"#,
    )
    .unwrap()
}

#[tokio::test]
async fn failed_fetch_cascades_to_dependents() {
    let (state, _) = state_with(true, r#"{"category": "billing"}"#).await;
    let wf = state
        .workflow_store
        .create("u1", triage_definition())
        .await
        .unwrap();

    let result = state
        .engine
        .execute(&wf, TriggerType::Manual, serde_json::Map::new(), None)
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.steps_failed, vec!["fetch"]);
    assert_eq!(result.steps_skipped, vec!["classify", "notify"]);
    assert!(result.steps_completed.is_empty());
}

#[tokio::test]
async fn happy_path_completes_all_steps() {
    let (state, _) = state_with(false, r#"{"category": "billing"}"#).await;
    let wf = state
        .workflow_store
        .create("u1", triage_definition())
        .await
        .unwrap();

    let result = state
        .engine
        .execute(&wf, TriggerType::Manual, serde_json::Map::new(), None)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.steps_completed, vec!["fetch", "classify", "notify"]);
    assert_eq!(result.tokens_used, 10);

    let execution = state
        .execution_store
        .get(&result.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert!(execution.completed_at.is_some());
    // The notify step saw the rendered classify output.
    assert_eq!(
        execution.step_outputs["notify"]["params"]["text"],
        serde_json::json!("billing")
    );
}

#[tokio::test]
async fn skip_sets_are_deterministic_across_runs() {
    let (state, _) = state_with(true, r#"{"category": "billing"}"#).await;
    let wf = state
        .workflow_store
        .create("u1", triage_definition())
        .await
        .unwrap();

    let first = state
        .engine
        .execute(&wf, TriggerType::Manual, serde_json::Map::new(), None)
        .await
        .unwrap();
    let second = state
        .engine
        .execute(&wf, TriggerType::Manual, serde_json::Map::new(), None)
        .await
        .unwrap();

    assert_eq!(first.steps_completed, second.steps_completed);
    assert_eq!(first.steps_failed, second.steps_failed);
    assert_eq!(first.steps_skipped, second.steps_skipped);
}

#[tokio::test]
async fn loop_isolates_iteration_failures() {
    let (state, calls) = state_with(false, "{}").await;
    let def = WorkflowDefinition::from_yaml(
        r#"
name: "Per-recipient notify"
steps:
  - kind: loop
    id: each
    items: recipients
    inputs:
      recipients: { from: runtime, key: recipients }
    maxConcurrent: 2
    body:
      - kind: api_call
        id: send
        integration: chat
        action: post_message
        inputs:
          item: { from: runtime, key: item }
        params:
          to: "${item}"
"#,
    )
    .unwrap();
    let wf = state.workflow_store.create("u1", def).await.unwrap();

    let mut inputs = serde_json::Map::new();
    inputs.insert(
        "recipients".into(),
        serde_json::json!(["alice", "bad", "carol"]),
    );
    let result = state
        .engine
        .execute(&wf, TriggerType::Manual, inputs, None)
        .await
        .unwrap();

    // The loop step completes even though one iteration failed.
    assert!(result.success);
    assert_eq!(result.steps_completed, vec!["each"]);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let execution = state
        .execution_store
        .get(&result.execution_id)
        .await
        .unwrap()
        .unwrap();
    let output = &execution.step_outputs["each"];
    assert_eq!(output["succeeded"], serde_json::json!(2));
    assert_eq!(output["failed"], serde_json::json!(1));
    let iterations = output["iterations"].as_array().unwrap();
    assert_eq!(iterations.len(), 3);
    assert_eq!(iterations[1]["success"], serde_json::json!(false));
}

#[tokio::test]
async fn approval_suspends_then_continue_resumes() {
    let (state, _) = state_with(false, r#"{"category": "billing"}"#).await;
    let def = WorkflowDefinition::from_yaml(
        r#"
name: "Guarded triage"
steps:
  - kind: llm_decision
    id: classify
    prompt: "Classify the inbox"
    requireApproval: true
  - kind: api_call
    id: notify
    integration: chat
    action: post_message
    inputs:
      summary: { from: step, step: classify }
    params:
      text: "${summary.category}"
"#,
    )
    .unwrap();
    let wf = state.workflow_store.create("u1", def).await.unwrap();

    let result = state
        .engine
        .execute(&wf, TriggerType::Manual, serde_json::Map::new(), None)
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Waiting);

    let pending = state
        .gate
        .list_pending(&result.execution_id, "u1")
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].step_id, "classify");

    state
        .gate
        .respond(&pending[0].id, "u1", DecisionAction::Continue, false)
        .await
        .unwrap();

    let resumed = state.engine.resume(&result.execution_id).await.unwrap();
    assert!(resumed.success);
    assert_eq!(resumed.steps_completed, vec!["classify", "notify"]);
}

#[tokio::test]
async fn expired_decision_resolves_to_skip() {
    let (state, _) = state_with(false, r#"{"category": "billing"}"#).await;
    let def = WorkflowDefinition::from_yaml(
        r#"
name: "Guarded triage"
steps:
  - kind: llm_decision
    id: classify
    prompt: "Classify the inbox"
    requireApproval: true
  - kind: api_call
    id: notify
    integration: chat
    action: post_message
    inputs:
      summary: { from: step, step: classify }
    params:
      text: "${summary.category}"
"#,
    )
    .unwrap();
    let wf = state.workflow_store.create("u1", def).await.unwrap();

    let result = state
        .engine
        .execute(&wf, TriggerType::Manual, serde_json::Map::new(), None)
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Waiting);

    let pending = state
        .gate
        .list_pending(&result.execution_id, "u1")
        .await
        .unwrap();
    state.decision_store.expire(&pending[0].id).await.unwrap();

    let resumed = state.engine.resume(&result.execution_id).await.unwrap();
    // classify skipped, notify cascades.
    assert_eq!(resumed.steps_skipped, vec!["classify", "notify"]);
    assert_eq!(resumed.status, ExecutionStatus::Completed);
}

/// A run whose decision expires with nobody responding must not stay
/// `waiting`: the scheduler sweep picks it up and resumes it to skip.
#[tokio::test]
async fn tick_sweep_resumes_run_with_expired_decision() {
    let (state, _) = state_with(false, r#"{"category": "billing"}"#).await;
    let def = WorkflowDefinition::from_yaml(
        r#"
name: "Guarded triage"
steps:
  - kind: llm_decision
    id: classify
    prompt: "Classify the inbox"
    requireApproval: true
  - kind: api_call
    id: notify
    integration: chat
    action: post_message
    inputs:
      summary: { from: step, step: classify }
    params:
      text: "${summary.category}"
"#,
    )
    .unwrap();
    let wf = state.workflow_store.create("u1", def).await.unwrap();

    let result = state
        .engine
        .execute(&wf, TriggerType::Manual, serde_json::Map::new(), None)
        .await
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Waiting);

    let pending = state
        .gate
        .list_pending(&result.execution_id, "u1")
        .await
        .unwrap();
    state.decision_store.expire(&pending[0].id).await.unwrap();

    // A late response is rejected; the run must not depend on one arriving.
    let err = state
        .gate
        .respond(&pending[0].id, "u1", DecisionAction::Continue, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::NotFound(_)));

    let report = state.scheduler.tick().await.unwrap();
    assert_eq!(report.resumed, 1);

    let execution = state
        .execution_store
        .get(&result.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.steps_skipped, vec!["classify", "notify"]);
}

#[tokio::test]
async fn racing_ticks_claim_exactly_once() {
    let (state, _) = state_with(false, "{}").await;
    let def = WorkflowDefinition::from_yaml(
        r#"
name: "Nightly"
trigger:
  mode: scheduled
  expression: "*/5 * * * *"
steps:
  - kind: transform
    id: shape
    op: merge
"#,
    )
    .unwrap();
    let wf = state.workflow_store.create("u1", def).await.unwrap();
    state
        .schedule_store
        .upsert(
            &wf.id,
            "*/5 * * * *",
            "UTC",
            true,
            Some(Utc::now() - Duration::minutes(1)),
        )
        .await
        .unwrap();

    let (a, b) = tokio::join!(state.scheduler.tick(), state.scheduler.tick());
    let claimed = a.unwrap().claimed + b.unwrap().claimed;
    assert_eq!(claimed, 1, "exactly one invocation may claim the run");
}
