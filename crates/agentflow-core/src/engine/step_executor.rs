//! Single-step execution, polymorphic over step kind.
//!
//! The executor receives fully resolved inputs and returns one outcome;
//! traversal, skip cascades and loop fan-out are the engine's business.
//! Transient errors are retried here with exponential backoff before
//! being surfaced.

use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::time::{sleep, Duration};

use crate::engine::bindings::{render_params, render_template};
use crate::error::StepError;
use crate::integrations::IntegrationBroker;
use crate::models::workflow::{
    ConditionalStep, Guard, GuardOp, LlmDecisionStep, Step, TransformOp, TransformStep,
};
use crate::planner::ModelClient;

/// Bounded retry for transient errors.
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// What running a step produced.
#[derive(Debug)]
pub enum StepOutcome {
    Completed {
        output: Value,
        tokens: u64,
    },
    /// The step needs a human decision before it can act; the run
    /// suspends at this step.
    NeedsDecision {
        context: Value,
    },
    /// A conditional whose guard evaluated false.
    Skipped {
        reason: String,
    },
}

#[derive(Clone)]
pub struct StepExecutor {
    broker: IntegrationBroker,
    model: Arc<dyn ModelClient>,
    default_model: String,
}

impl StepExecutor {
    pub fn new(broker: IntegrationBroker, model: Arc<dyn ModelClient>, default_model: String) -> Self {
        Self {
            broker,
            model,
            default_model,
        }
    }

    /// Run one step, retrying transient failures with backoff.
    pub async fn run_with_retry(
        &self,
        user_id: &str,
        step: &Step,
        inputs: &Map<String, Value>,
    ) -> Result<StepOutcome, StepError> {
        let mut attempt = 1u32;
        loop {
            match self.run(user_id, step, inputs).await {
                Err(e) if e.is_transient() && attempt < MAX_ATTEMPTS => {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                    tracing::debug!(
                        step_id = step.id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient step error, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn run(
        &self,
        user_id: &str,
        step: &Step,
        inputs: &Map<String, Value>,
    ) -> Result<StepOutcome, StepError> {
        match step {
            Step::ApiCall(s) => {
                let params = render_params(&s.params, inputs);
                let output = self
                    .broker
                    .invoke(user_id, &s.integration, &s.action, &params)
                    .await?;
                Ok(StepOutcome::Completed { output, tokens: 0 })
            }
            Step::Transform(s) => run_transform(s, inputs),
            Step::Conditional(s) => run_conditional(s, inputs),
            Step::LlmDecision(s) => self.run_llm_decision(s, inputs).await,
            Step::Loop(s) => Err(StepError::Validation(format!(
                "loop step '{}' cannot be executed directly",
                s.id
            ))),
        }
    }

    async fn run_llm_decision(
        &self,
        step: &LlmDecisionStep,
        inputs: &Map<String, Value>,
    ) -> Result<StepOutcome, StepError> {
        // A "decision" input is injected by the engine when the run
        // resumes after an approval; its presence means the gate has
        // already been passed for this step.
        let decision = inputs.get("decision");

        let mut prompt = render_template(&step.prompt, inputs);
        if let Some(d) = decision {
            prompt.push_str(&format!("\n\nHuman decision: {}", d));
        }

        let model = step.model.as_deref().unwrap_or(&self.default_model);
        let reply = self
            .model
            .complete(model, "", &prompt, step.max_tokens)
            .await?;

        let parsed = extract_json(&reply.content);

        if decision.is_none() {
            // The model can itself ask for human input by replying with a
            // needs_decision object.
            if let Some(context) = parsed
                .as_ref()
                .and_then(|v| v.get("needs_decision"))
                .filter(|v| !v.is_null())
            {
                return Ok(StepOutcome::NeedsDecision {
                    context: context.clone(),
                });
            }
            if step.require_approval {
                return Ok(StepOutcome::NeedsDecision {
                    context: serde_json::json!({
                        "proposed": parsed.clone().unwrap_or(Value::String(reply.content.clone())),
                        "step_id": step.id,
                    }),
                });
            }
        }

        let output = parsed.unwrap_or_else(|| serde_json::json!({ "text": reply.content }));
        Ok(StepOutcome::Completed {
            output,
            tokens: reply.tokens_used,
        })
    }
}

fn run_transform(
    step: &TransformStep,
    inputs: &Map<String, Value>,
) -> Result<StepOutcome, StepError> {
    let output = match &step.op {
        TransformOp::Template { template } => {
            serde_json::json!({ "value": render_template(template, inputs) })
        }
        TransformOp::Merge => Value::Object(merge_inputs(inputs)),
        TransformOp::Pick { fields } => {
            let merged = merge_inputs(inputs);
            let mut picked = Map::new();
            for field in fields {
                if let Some(v) = merged.get(field) {
                    picked.insert(field.clone(), v.clone());
                }
            }
            Value::Object(picked)
        }
    };
    Ok(StepOutcome::Completed { output, tokens: 0 })
}

/// Object-valued inputs are merged key by key; scalar inputs land under
/// their binding name. Later bindings win on key collisions.
fn merge_inputs(inputs: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = Map::new();
    for (name, value) in inputs {
        match value {
            Value::Object(obj) => {
                for (k, v) in obj {
                    merged.insert(k.clone(), v.clone());
                }
            }
            other => {
                merged.insert(name.clone(), other.clone());
            }
        }
    }
    merged
}

fn run_conditional(
    step: &ConditionalStep,
    inputs: &Map<String, Value>,
) -> Result<StepOutcome, StepError> {
    if evaluate_guard(&step.guard, inputs) {
        // Pass inputs through so dependents can bind across the gate.
        let mut output = inputs.clone();
        output.insert("passed".to_string(), Value::Bool(true));
        Ok(StepOutcome::Completed {
            output: Value::Object(output),
            tokens: 0,
        })
    } else {
        Ok(StepOutcome::Skipped {
            reason: format!("guard on '{}' evaluated false", step.guard.input),
        })
    }
}

fn evaluate_guard(guard: &Guard, inputs: &Map<String, Value>) -> bool {
    let actual = inputs.get(&guard.input);
    match guard.op {
        GuardOp::Exists => actual.is_some(),
        GuardOp::Truthy => actual.map(is_truthy).unwrap_or(false),
        GuardOp::Eq => actual == guard.value.as_ref(),
        GuardOp::Ne => actual.is_some() && actual != guard.value.as_ref(),
        GuardOp::Contains => match (actual, &guard.value) {
            (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
            (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
            _ => false,
        },
        GuardOp::Gt => compare(actual, guard.value.as_ref()).map(|o| o.is_gt()).unwrap_or(false),
        GuardOp::Lt => compare(actual, guard.value.as_ref()).map(|o| o.is_lt()).unwrap_or(false),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn compare(actual: Option<&Value>, expected: Option<&Value>) -> Option<std::cmp::Ordering> {
    let a = actual?.as_f64()?;
    let b = expected?.as_f64()?;
    a.partial_cmp(&b)
}

/// Pull a JSON object out of model output, tolerating fences and prose.
fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    serde_json::from_str(&trimmed[start..=end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::integrations::{
        AdapterRegistry, IntegrationAdapter, IntegrationKind, RefreshedCredential,
    };
    use crate::models::connection::IntegrationConnection;
    use crate::planner::ModelReply;
    use crate::store::ConnectionStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyAdapter {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl IntegrationAdapter for FlakyAdapter {
        fn kind(&self) -> IntegrationKind {
            IntegrationKind::Mail
        }

        async fn refresh(&self, _: &str) -> Result<RefreshedCredential, StepError> {
            Err(StepError::Terminal("no refresh".into()))
        }

        async fn invoke(
            &self,
            _connection: &IntegrationConnection,
            _action: &str,
            params: &Value,
        ) -> Result<Value, StepError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(StepError::Transient("rate limited".into()))
            } else {
                Ok(serde_json::json!({ "echo": params }))
            }
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
                tokens_used: 42,
            })
        }
    }

    async fn executor(adapter: FlakyAdapter, model_reply: &str) -> StepExecutor {
        let store = ConnectionStore::new(Database::open_in_memory().unwrap());
        store.upsert("u1", "mail", "tok", None, None).await.unwrap();
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(adapter));
        StepExecutor::new(
            IntegrationBroker::new(store, Arc::new(registry)),
            Arc::new(CannedModel {
                reply: model_reply.to_string(),
            }),
            "test-model".to_string(),
        )
    }

    fn inputs(json: Value) -> Map<String, Value> {
        json.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_api_error_retried_then_succeeds() {
        let exec = executor(
            FlakyAdapter {
                fail_first: 2,
                calls: AtomicU32::new(0),
            },
            "{}",
        )
        .await;
        let step: Step = serde_json::from_value(serde_json::json!({
            "kind": "api_call", "id": "fetch",
            "integration": "mail", "action": "list_messages",
            "params": { "folder": "inbox" }
        }))
        .unwrap();

        let outcome = exec.run_with_retry("u1", &step, &Map::new()).await.unwrap();
        match outcome {
            StepOutcome::Completed { output, .. } => {
                assert_eq!(output["echo"]["folder"], serde_json::json!("inbox"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_surface_transient_error() {
        let exec = executor(
            FlakyAdapter {
                fail_first: 10,
                calls: AtomicU32::new(0),
            },
            "{}",
        )
        .await;
        let step: Step = serde_json::from_value(serde_json::json!({
            "kind": "api_call", "id": "fetch",
            "integration": "mail", "action": "list_messages"
        }))
        .unwrap();
        let err = exec.run_with_retry("u1", &step, &Map::new()).await.unwrap_err();
        assert_eq!(err.kind(), "transient_integration_error");
    }

    #[tokio::test]
    async fn test_transform_template_and_pick() {
        let exec = executor(
            FlakyAdapter {
                fail_first: 0,
                calls: AtomicU32::new(0),
            },
            "{}",
        )
        .await;
        let ins = inputs(serde_json::json!({
            "msg": { "subject": "invoice", "from": "a@b.c", "size": 3 }
        }));

        let template: Step = serde_json::from_value(serde_json::json!({
            "kind": "transform", "id": "t", "op": "template",
            "template": "re: ${msg.subject}"
        }))
        .unwrap();
        match exec.run_with_retry("u1", &template, &ins).await.unwrap() {
            StepOutcome::Completed { output, .. } => {
                assert_eq!(output["value"], serde_json::json!("re: invoice"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let pick: Step = serde_json::from_value(serde_json::json!({
            "kind": "transform", "id": "p", "op": "pick",
            "fields": ["subject", "size"]
        }))
        .unwrap();
        match exec.run_with_retry("u1", &pick, &ins).await.unwrap() {
            StepOutcome::Completed { output, .. } => {
                assert_eq!(
                    output,
                    serde_json::json!({ "subject": "invoice", "size": 3 })
                );
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_conditional_false_guard_skips() {
        let exec = executor(
            FlakyAdapter {
                fail_first: 0,
                calls: AtomicU32::new(0),
            },
            "{}",
        )
        .await;
        let step: Step = serde_json::from_value(serde_json::json!({
            "kind": "conditional", "id": "c",
            "inputs": { "count": { "from": "literal", "value": 0 } },
            "guard": { "input": "count", "op": "gt", "value": 5 }
        }))
        .unwrap();
        let ins = inputs(serde_json::json!({ "count": 0 }));
        match exec.run_with_retry("u1", &step, &ins).await.unwrap() {
            StepOutcome::Skipped { reason } => assert!(reason.contains("count")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_guard_ops() {
        let ins = inputs(serde_json::json!({
            "n": 7, "s": "hello world", "tags": ["a", "b"], "empty": ""
        }));
        let guard = |input: &str, op: GuardOp, value: Option<Value>| Guard {
            input: input.to_string(),
            op,
            value,
        };
        assert!(evaluate_guard(&guard("n", GuardOp::Gt, Some(serde_json::json!(5))), &ins));
        assert!(!evaluate_guard(&guard("n", GuardOp::Lt, Some(serde_json::json!(5))), &ins));
        assert!(evaluate_guard(
            &guard("s", GuardOp::Contains, Some(serde_json::json!("world"))),
            &ins
        ));
        assert!(evaluate_guard(
            &guard("tags", GuardOp::Contains, Some(serde_json::json!("b"))),
            &ins
        ));
        assert!(evaluate_guard(&guard("s", GuardOp::Truthy, None), &ins));
        assert!(!evaluate_guard(&guard("empty", GuardOp::Truthy, None), &ins));
        assert!(evaluate_guard(&guard("empty", GuardOp::Exists, None), &ins));
        assert!(!evaluate_guard(&guard("missing", GuardOp::Exists, None), &ins));
        assert!(evaluate_guard(
            &guard("n", GuardOp::Eq, Some(serde_json::json!(7))),
            &ins
        ));
    }

    #[tokio::test]
    async fn test_llm_decision_model_requests_decision() {
        let exec = executor(
            FlakyAdapter {
                fail_first: 0,
                calls: AtomicU32::new(0),
            },
            r#"{"needs_decision": {"question": "archive or delete?", "options": ["archive", "delete"]}}"#,
        )
        .await;
        let step: Step = serde_json::from_value(serde_json::json!({
            "kind": "llm_decision", "id": "classify", "prompt": "Decide."
        }))
        .unwrap();
        match exec.run_with_retry("u1", &step, &Map::new()).await.unwrap() {
            StepOutcome::NeedsDecision { context } => {
                assert_eq!(context["question"], serde_json::json!("archive or delete?"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_llm_decision_with_injected_decision_completes() {
        let exec = executor(
            FlakyAdapter {
                fail_first: 0,
                calls: AtomicU32::new(0),
            },
            r#"{"category": "archive"}"#,
        )
        .await;
        let step: Step = serde_json::from_value(serde_json::json!({
            "kind": "llm_decision", "id": "classify", "prompt": "Decide.",
            "requireApproval": true
        }))
        .unwrap();

        // Without a decision the approval gate suspends the step.
        match exec.run_with_retry("u1", &step, &Map::new()).await.unwrap() {
            StepOutcome::NeedsDecision { .. } => {}
            other => panic!("unexpected outcome: {:?}", other),
        }

        // With the engine-injected decision it completes.
        let ins = inputs(serde_json::json!({ "decision": { "action": "continue" } }));
        match exec.run_with_retry("u1", &step, &ins).await.unwrap() {
            StepOutcome::Completed { output, tokens } => {
                assert_eq!(output["category"], serde_json::json!("archive"));
                assert_eq!(tokens, 42);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
