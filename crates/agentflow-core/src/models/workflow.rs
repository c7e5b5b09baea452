//! Workflow definition schema — a declarative, ordered graph of typed steps.
//!
//! A definition can be written in YAML or JSON:
//!
//! ```yaml
//! name: "Invoice triage"
//! trigger:
//!   mode: scheduled
//!   expression: "0 9 * * 1-5"
//!   timezone: "Europe/Berlin"
//!
//! steps:
//!   - kind: api_call
//!     id: fetch
//!     integration: mail
//!     action: list_messages
//!     params:
//!       folder: inbox
//!
//!   - kind: llm_decision
//!     id: classify
//!     inputs:
//!       messages: { from: step, step: fetch }
//!     prompt: "Classify these messages: ${messages}"
//!
//!   - kind: api_call
//!     id: notify
//!     integration: chat
//!     action: post_message
//!     inputs:
//!       summary: { from: step, step: classify }
//!     params:
//!       text: "${summary}"
//! ```
//!
//! Invariants enforced by [`WorkflowDefinition::validate`]: step ids are
//! unique and well-formed, and every step-output binding references an
//! *earlier* step — no forward references, which also rules out cycles.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// Upper bound on steps in a single definition (loop bodies included).
pub const MAX_STEPS: usize = 50;
/// Hard cap on declared loop concurrency.
pub const MAX_LOOP_CONCURRENCY: usize = 5;
/// Hard cap on loop iterations.
pub const MAX_LOOP_ITERATIONS: usize = 100;

/// Top-level workflow definition document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub trigger: TriggerMode,

    /// Integration keys this workflow needs. Filled from `api_call` steps
    /// when omitted.
    #[serde(default)]
    pub required_integrations: Vec<String>,

    /// Ordered step graph.
    pub steps: Vec<Step>,

    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,

    #[serde(default)]
    pub output_schema: Option<serde_json::Value>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// How the workflow is started.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TriggerMode {
    #[default]
    Manual,
    Scheduled {
        /// 5-field cron expression.
        expression: String,
        #[serde(default = "default_timezone")]
        timezone: String,
    },
    /// Started by an inbound webhook.
    Triggered,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl TriggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::Manual => "manual",
            TriggerMode::Scheduled { .. } => "scheduled",
            TriggerMode::Triggered => "triggered",
        }
    }
}

/// Where a step input value comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum BindingSource {
    /// A key in the run's runtime inputs.
    Runtime { key: String },
    /// The recorded output of an earlier step, optionally narrowed by a
    /// dotted path into the output object.
    Step {
        step: String,
        #[serde(default)]
        path: Option<String>,
    },
    /// A constant embedded in the definition.
    Literal { value: serde_json::Value },
}

pub type Bindings = BTreeMap<String, BindingSource>;

/// One typed step. The closed enum gives the executor exhaustive dispatch
/// over step kinds instead of runtime string inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    ApiCall(ApiCallStep),
    Transform(TransformStep),
    Conditional(ConditionalStep),
    LlmDecision(LlmDecisionStep),
    Loop(LoopStep),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCallStep {
    pub id: String,
    #[serde(default)]
    pub inputs: Bindings,
    /// Integration key, e.g. "mail". Parsed into a typed kind at the
    /// broker boundary.
    pub integration: String,
    pub action: String,
    /// Action parameters; string values support `${input}` templates.
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformStep {
    pub id: String,
    #[serde(default)]
    pub inputs: Bindings,
    #[serde(flatten)]
    pub op: TransformOp,
}

/// Pure data reshaping — deterministic, no I/O.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformOp {
    /// Render a `${...}` template over the resolved inputs; output is
    /// `{"value": <string>}`.
    Template { template: String },
    /// Keep only the named fields of the merged input object.
    Pick { fields: Vec<String> },
    /// Merge all object-valued inputs into one object.
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalStep {
    pub id: String,
    #[serde(default)]
    pub inputs: Bindings,
    pub guard: Guard,
}

/// Boolean guard over one resolved input. Never performs I/O.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Guard {
    /// Name of the input binding to test.
    pub input: String,
    #[serde(default)]
    pub op: GuardOp,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GuardOp {
    /// Non-null, non-false, non-empty.
    #[default]
    Truthy,
    Eq,
    Ne,
    Contains,
    Gt,
    Lt,
    Exists,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmDecisionStep {
    pub id: String,
    #[serde(default)]
    pub inputs: Bindings,
    /// Prompt template over the resolved inputs.
    pub prompt: String,
    /// Bounded token budget for the reasoning call.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Model override; engine default when unset.
    #[serde(default)]
    pub model: Option<String>,
    /// Always route through the decision gate before acting.
    #[serde(default)]
    pub require_approval: bool,
}

fn default_max_tokens() -> u32 {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStep {
    pub id: String,
    #[serde(default)]
    pub inputs: Bindings,
    /// Name of the input binding that yields the iteration array.
    pub items: String,
    /// Runtime-input key the current item is bound to inside the body.
    #[serde(default = "default_item_var")]
    pub item_var: String,
    /// Body steps executed once per item.
    pub body: Vec<Step>,
    #[serde(default = "default_loop_concurrency")]
    pub max_concurrent: usize,
    #[serde(default = "default_loop_iterations")]
    pub max_iterations: usize,
}

fn default_item_var() -> String {
    "item".to_string()
}

fn default_loop_concurrency() -> usize {
    3
}

fn default_loop_iterations() -> usize {
    25
}

impl Step {
    pub fn id(&self) -> &str {
        match self {
            Step::ApiCall(s) => &s.id,
            Step::Transform(s) => &s.id,
            Step::Conditional(s) => &s.id,
            Step::LlmDecision(s) => &s.id,
            Step::Loop(s) => &s.id,
        }
    }

    pub fn inputs(&self) -> &Bindings {
        match self {
            Step::ApiCall(s) => &s.inputs,
            Step::Transform(s) => &s.inputs,
            Step::Conditional(s) => &s.inputs,
            Step::LlmDecision(s) => &s.inputs,
            Step::Loop(s) => &s.inputs,
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Step::ApiCall(_) => "api_call",
            Step::Transform(_) => "transform",
            Step::Conditional(_) => "conditional",
            Step::LlmDecision(_) => "llm_decision",
            Step::Loop(_) => "loop",
        }
    }
}

impl WorkflowDefinition {
    /// Parse a definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ServerError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ServerError::BadRequest(format!("Failed to parse workflow YAML: {}", e)))
    }

    /// Parse a definition from a JSON value.
    pub fn from_json(json: serde_json::Value) -> Result<Self, ServerError> {
        serde_json::from_value(json)
            .map_err(|e| ServerError::BadRequest(format!("Failed to parse workflow JSON: {}", e)))
    }

    /// Validate the step graph and fill `required_integrations` when empty.
    pub fn validate(&mut self) -> Result<(), ServerError> {
        validate_steps(&self.steps)?;
        if self.required_integrations.is_empty() {
            self.required_integrations = collect_integrations(&self.steps);
        }
        if let TriggerMode::Scheduled { expression, .. } = &self.trigger {
            if expression.trim().is_empty() {
                return Err(ServerError::BadRequest(
                    "scheduled trigger requires a cron expression".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Structural validation of a step graph. Also used by the plan generator
/// to vet model-produced candidates.
pub fn validate_steps(steps: &[Step]) -> Result<(), ServerError> {
    if steps.is_empty() {
        return Err(ServerError::BadRequest("workflow has no steps".into()));
    }
    if count_steps(steps) > MAX_STEPS {
        return Err(ServerError::BadRequest(format!(
            "workflow exceeds the {} step limit",
            MAX_STEPS
        )));
    }
    let mut seen: HashSet<&str> = HashSet::new();
    validate_scope(steps, &mut seen)
}

fn count_steps(steps: &[Step]) -> usize {
    steps
        .iter()
        .map(|s| match s {
            Step::Loop(l) => 1 + count_steps(&l.body),
            _ => 1,
        })
        .sum()
}

fn validate_scope<'a>(steps: &'a [Step], seen: &mut HashSet<&'a str>) -> Result<(), ServerError> {
    for step in steps {
        let id = step.id();
        if !is_valid_id(id) {
            return Err(ServerError::BadRequest(format!(
                "invalid step id '{}': expected [a-z][a-z0-9_-]*, max 64 chars",
                id
            )));
        }
        if !seen.insert(id) {
            return Err(ServerError::BadRequest(format!("duplicate step id '{}'", id)));
        }
        for (name, source) in step.inputs() {
            if let BindingSource::Step { step: target, .. } = source {
                if !seen.contains(target.as_str()) || target == id {
                    return Err(ServerError::BadRequest(format!(
                        "step '{}' input '{}' references '{}', which is not an earlier step",
                        id, name, target
                    )));
                }
            }
        }
        match step {
            Step::Conditional(c) => {
                if !c.inputs.contains_key(&c.guard.input) {
                    return Err(ServerError::BadRequest(format!(
                        "conditional '{}' guards on undeclared input '{}'",
                        c.id, c.guard.input
                    )));
                }
            }
            Step::Loop(l) => {
                if !l.inputs.contains_key(&l.items) {
                    return Err(ServerError::BadRequest(format!(
                        "loop '{}' iterates over undeclared input '{}'",
                        l.id, l.items
                    )));
                }
                if l.max_concurrent == 0 || l.max_concurrent > MAX_LOOP_CONCURRENCY {
                    return Err(ServerError::BadRequest(format!(
                        "loop '{}' max_concurrent must be 1..={}",
                        l.id, MAX_LOOP_CONCURRENCY
                    )));
                }
                if l.max_iterations == 0 || l.max_iterations > MAX_LOOP_ITERATIONS {
                    return Err(ServerError::BadRequest(format!(
                        "loop '{}' max_iterations must be 1..={}",
                        l.id, MAX_LOOP_ITERATIONS
                    )));
                }
                if l.body.is_empty() {
                    return Err(ServerError::BadRequest(format!(
                        "loop '{}' has an empty body",
                        l.id
                    )));
                }
                // Body steps see outer steps plus earlier body steps.
                validate_scope(&l.body, seen)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn is_valid_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    id.len() <= 64
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn collect_integrations(steps: &[Step]) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for step in steps {
        match step {
            Step::ApiCall(s) => {
                if !keys.contains(&s.integration) {
                    keys.push(s.integration.clone());
                }
            }
            Step::Loop(l) => {
                for key in collect_integrations(&l.body) {
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }
            _ => {}
        }
    }
    keys
}

/// A stored workflow: the definition plus ownership metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub user_id: String,
    pub definition: WorkflowDefinition,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
name: "Invoice triage"
steps:
  - kind: api_call
    id: fetch
    integration: mail
    action: list_messages
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
      text: "${summary}"
"#
    }

    #[test]
    fn test_parse_and_validate_yaml() {
        let mut def = WorkflowDefinition::from_yaml(minimal_yaml()).unwrap();
        def.validate().unwrap();
        assert_eq!(def.steps.len(), 3);
        assert_eq!(def.steps[0].kind_str(), "api_call");
        assert_eq!(def.required_integrations, vec!["mail", "chat"]);
        assert_eq!(def.trigger.as_str(), "manual");
    }

    #[test]
    fn test_forward_reference_rejected() {
        let yaml = r#"
name: "bad"
steps:
  - kind: transform
    id: first
    op: merge
    inputs:
      later: { from: step, step: second }
  - kind: transform
    id: second
    op: merge
"#;
        let mut def = WorkflowDefinition::from_yaml(yaml).unwrap();
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("not an earlier step"), "{err}");
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let yaml = r#"
name: "bad"
steps:
  - kind: transform
    id: same
    op: merge
  - kind: transform
    id: same
    op: merge
"#;
        let mut def = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_self_reference_rejected() {
        let yaml = r#"
name: "bad"
steps:
  - kind: transform
    id: loopy
    op: merge
    inputs:
      me: { from: step, step: loopy }
"#;
        let mut def = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_loop_body_sees_outer_steps() {
        let yaml = r#"
name: "loops"
steps:
  - kind: api_call
    id: fetch
    integration: sheets
    action: read_rows
  - kind: loop
    id: each-row
    items: rows
    inputs:
      rows: { from: step, step: fetch }
    body:
      - kind: transform
        id: shape
        op: merge
        inputs:
          row: { from: runtime, key: item }
          all: { from: step, step: fetch }
"#;
        let mut def = WorkflowDefinition::from_yaml(yaml).unwrap();
        def.validate().unwrap();
    }

    #[test]
    fn test_invalid_id_shape_rejected() {
        let yaml = r#"
name: "bad"
steps:
  - kind: transform
    id: "Not Valid"
    op: merge
"#;
        let mut def = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_scheduled_trigger_parses() {
        let yaml = r#"
name: "nightly"
trigger:
  mode: scheduled
  expression: "0 2 * * *"
  timezone: "America/New_York"
steps:
  - kind: transform
    id: noop
    op: merge
"#;
        let def = WorkflowDefinition::from_yaml(yaml).unwrap();
        match &def.trigger {
            TriggerMode::Scheduled { expression, timezone } => {
                assert_eq!(expression, "0 2 * * *");
                assert_eq!(timezone, "America/New_York");
            }
            other => panic!("unexpected trigger: {:?}", other),
        }
    }
}
