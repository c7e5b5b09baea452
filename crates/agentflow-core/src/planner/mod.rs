//! Plan generation — goal in, validated step graph out.
//!
//! A cheap primary model drafts the step graph; the draft is structurally
//! validated with the same rules applied to hand-written definitions. An
//! invalid draft (or a primary-model error) escalates once to a stronger
//! fallback model when fallback is enabled. A failure at the fallback
//! stage is terminal.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ServerError, StepError};
use crate::models::workflow::{validate_steps, Step};

/// Upper bound on steps in a generated plan, tighter than the general
/// definition limit because generated graphs should stay reviewable.
pub const MAX_PLAN_STEPS: usize = 20;

/// Result of one model completion.
#[derive(Debug, Clone)]
pub struct ModelReply {
    pub content: String,
    pub model: String,
    pub tokens_used: u64,
}

/// Access to a reasoning model. Implemented by the HTTP client in
/// production and by in-memory fakes in tests.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        system: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<ModelReply, StepError>;
}

/// Anthropic-compatible Messages API client (also served by GLM/BigModel).
///
/// POST {base_url}/v1/messages
/// Headers:
///   x-api-key: {api_key}
///   anthropic-version: 2023-06-01
pub struct HttpModelClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpModelClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            base_url,
            api_key,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// Configure from `AGENTFLOW_MODEL_BASE_URL` / `AGENTFLOW_MODEL_API_KEY`.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var("AGENTFLOW_MODEL_BASE_URL")
                .unwrap_or_else(|_| "https://open.bigmodel.cn/api/anthropic".to_string()),
            std::env::var("AGENTFLOW_MODEL_API_KEY").unwrap_or_default(),
        )
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn complete(
        &self,
        model: &str,
        system: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<ModelReply, StepError> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));

        let mut body = serde_json::json!({
            "model": model,
            "max_tokens": max_tokens,
            "messages": [
                { "role": "user", "content": prompt }
            ]
        });
        if !system.is_empty() {
            body["system"] = Value::String(system.to_string());
        }

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StepError::Transient("model request timed out".to_string())
                } else {
                    StepError::Transient(format!("model request failed: {}", e))
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| StepError::Transient(format!("model response read failed: {}", e)))?;
        if !status.is_success() {
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(StepError::Transient(format!("model API returned {}", status)));
            }
            return Err(StepError::Terminal(format!(
                "model API returned {}: {}",
                status, text
            )));
        }

        let json: Value = serde_json::from_str(&text)
            .map_err(|e| StepError::Terminal(format!("model response parse failed: {}", e)))?;

        let content = json
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|block| {
                        if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                            block.get("text").and_then(|t| t.as_str()).map(String::from)
                        } else {
                            None
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();

        let tokens_used = json
            .get("usage")
            .map(|u| {
                u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0)
                    + u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0)
            })
            .unwrap_or(0);

        Ok(ModelReply {
            content,
            model: json
                .get("model")
                .and_then(|m| m.as_str())
                .unwrap_or(model)
                .to_string(),
            tokens_used,
        })
    }
}

/// Planner configuration: model pair and escalation policy.
#[derive(Debug, Clone)]
pub struct PlanConfig {
    pub primary_model: String,
    pub fallback_model: String,
    pub fallback_enabled: bool,
    pub max_tokens: u32,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            primary_model: "GLM-4.5-Air".to_string(),
            fallback_model: "GLM-4.7".to_string(),
            fallback_enabled: true,
            max_tokens: 4096,
        }
    }
}

impl PlanConfig {
    /// Override from `AGENTFLOW_PLAN_PRIMARY_MODEL`, `_FALLBACK_MODEL`
    /// and `_FALLBACK_ENABLED`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("AGENTFLOW_PLAN_PRIMARY_MODEL") {
            config.primary_model = v;
        }
        if let Ok(v) = std::env::var("AGENTFLOW_PLAN_FALLBACK_MODEL") {
            config.fallback_model = v;
        }
        if let Ok(v) = std::env::var("AGENTFLOW_PLAN_FALLBACK_ENABLED") {
            config.fallback_enabled = v != "0" && v.to_lowercase() != "false";
        }
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorUsed {
    Primary,
    Fallback,
}

/// A validated plan plus how it was obtained and what it cost.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOutcome {
    pub steps: Vec<Step>,
    pub generator_used: GeneratorUsed,
    pub validated: bool,
    /// Total tokens spent across all attempts, failed ones included.
    pub cost: u64,
}

#[derive(Clone)]
pub struct PlanGenerator {
    client: Arc<dyn ModelClient>,
    config: PlanConfig,
}

impl PlanGenerator {
    pub fn new(client: Arc<dyn ModelClient>, config: PlanConfig) -> Self {
        Self { client, config }
    }

    /// Produce a validated step graph for a goal, escalating to the
    /// fallback model at most once.
    pub async fn generate(
        &self,
        goal: &str,
        available_integrations: &[String],
    ) -> Result<PlanOutcome, ServerError> {
        if goal.trim().is_empty() {
            return Err(ServerError::BadRequest("plan goal is empty".into()));
        }

        let system = plan_system_prompt(available_integrations);
        let mut cost = 0u64;

        let primary_failure = match self
            .attempt(&self.config.primary_model, &system, goal, available_integrations)
            .await
        {
            Attempt::Valid { steps, tokens } => {
                return Ok(PlanOutcome {
                    steps,
                    generator_used: GeneratorUsed::Primary,
                    validated: true,
                    cost: cost + tokens,
                });
            }
            Attempt::Invalid { reason, tokens } => {
                cost += tokens;
                reason
            }
        };

        if !self.config.fallback_enabled {
            return Err(ServerError::BadRequest(format!(
                "plan generation failed: {}",
                primary_failure
            )));
        }

        tracing::warn!(
            model = %self.config.primary_model,
            reason = %primary_failure,
            "primary plan attempt failed, escalating to fallback model"
        );

        match self
            .attempt(&self.config.fallback_model, &system, goal, available_integrations)
            .await
        {
            Attempt::Valid { steps, tokens } => Ok(PlanOutcome {
                steps,
                generator_used: GeneratorUsed::Fallback,
                validated: true,
                cost: cost + tokens,
            }),
            Attempt::Invalid { reason, .. } => Err(ServerError::BadRequest(format!(
                "plan generation failed after fallback: {}",
                reason
            ))),
        }
    }

    async fn attempt(
        &self,
        model: &str,
        system: &str,
        goal: &str,
        available_integrations: &[String],
    ) -> Attempt {
        let started = Instant::now();
        let reply = self
            .client
            .complete(model, system, goal, self.config.max_tokens)
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match reply {
            Ok(reply) => {
                let outcome = parse_and_validate(&reply.content, available_integrations);
                match outcome {
                    Ok(steps) => {
                        tracing::info!(
                            model = %reply.model,
                            tokens = reply.tokens_used,
                            latency_ms,
                            steps = steps.len(),
                            "plan attempt succeeded"
                        );
                        Attempt::Valid {
                            steps,
                            tokens: reply.tokens_used,
                        }
                    }
                    Err(reason) => {
                        tracing::info!(
                            model = %reply.model,
                            tokens = reply.tokens_used,
                            latency_ms,
                            reason = %reason,
                            "plan attempt produced an invalid graph"
                        );
                        Attempt::Invalid {
                            reason,
                            tokens: reply.tokens_used,
                        }
                    }
                }
            }
            Err(e) => {
                tracing::info!(model, latency_ms, error = %e, "plan attempt errored");
                Attempt::Invalid {
                    reason: e.to_string(),
                    tokens: 0,
                }
            }
        }
    }
}

enum Attempt {
    Valid { steps: Vec<Step>, tokens: u64 },
    Invalid { reason: String, tokens: u64 },
}

fn plan_system_prompt(available_integrations: &[String]) -> String {
    format!(
        "You design automation workflows as JSON. Respond with a single JSON \
         object {{\"steps\": [...]}} and nothing else. Each step has a \"kind\" \
         of api_call, transform, conditional, llm_decision or loop, a unique \
         lowercase \"id\", and may declare \"inputs\" bindings referencing \
         earlier step outputs ({{\"from\": \"step\", \"step\": \"<id>\"}}), \
         runtime inputs ({{\"from\": \"runtime\", \"key\": \"<key>\"}}) or \
         literals. api_call steps name an \"integration\" and \"action\". \
         Available integrations: {}. Use at most {} steps.",
        if available_integrations.is_empty() {
            "none".to_string()
        } else {
            available_integrations.join(", ")
        },
        MAX_PLAN_STEPS
    )
}

/// Parse the model reply into steps and apply structural validation.
fn parse_and_validate(
    content: &str,
    available_integrations: &[String],
) -> Result<Vec<Step>, String> {
    let json = extract_json(content).ok_or("reply contains no JSON object")?;
    let steps_value = json
        .get("steps")
        .cloned()
        .ok_or("reply has no \"steps\" array")?;
    let steps: Vec<Step> = serde_json::from_value(steps_value)
        .map_err(|e| format!("steps do not match the schema: {}", e))?;

    if steps.len() > MAX_PLAN_STEPS {
        return Err(format!("plan exceeds the {} step limit", MAX_PLAN_STEPS));
    }
    validate_steps(&steps).map_err(|e| e.to_string())?;

    for step in &steps {
        if let Step::ApiCall(s) = step {
            if !available_integrations.iter().any(|i| i == &s.integration) {
                return Err(format!(
                    "step '{}' uses unavailable integration '{}'",
                    s.id, s.integration
                ));
            }
        }
    }
    Ok(steps)
}

/// Pull the JSON object out of a reply, tolerating markdown fences and
/// surrounding prose.
fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    serde_json::from_str(&trimmed[start..=end]).ok()
}
