//! Workflow engine — drives a run through its step graph.
//!
//! Steps execute in declared order. Before each step its input bindings
//! are resolved from runtime inputs or recorded outputs of earlier steps;
//! a resolution failure marks the step skipped without aborting the rest
//! of the graph, and the skip cascades naturally because dependents then
//! fail to resolve too. Loop steps fan their body out over a bounded set
//! of items with bounded concurrency; iteration failures are isolated.
//!
//! The engine holds no cross-run mutable state. Everything a run needs
//! lives in its `Execution` row (including the snapshot that lets a
//! suspended or budget-interrupted run pick up where it left off), so
//! concurrent runs are fully independent.

pub mod bindings;
pub mod events;
pub mod step_executor;

use std::collections::HashMap;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use tokio::time::{Duration, Instant};

use crate::decisions::DecisionGate;
use crate::error::ServerError;
use crate::models::decision::DecisionAction;
use crate::models::execution::{Execution, ExecutionResult, ExecutionStatus, TriggerType};
use crate::models::workflow::{LoopStep, Step, Workflow, WorkflowDefinition};
use crate::store::{ExecutionStore, WorkflowStore};

use bindings::resolve_bindings;
use events::{EventHub, ExecutionEmitter, ExecutionEventKind};
use step_executor::{StepExecutor, StepOutcome};

#[derive(Clone)]
pub struct WorkflowEngine {
    workflows: WorkflowStore,
    executions: ExecutionStore,
    executor: StepExecutor,
    gate: DecisionGate,
    hub: EventHub,
    /// Wall-clock budget for one engine invocation. When exceeded, the
    /// run snapshots and continues in a spawned task instead of being
    /// terminated mid-step.
    run_budget: Option<Duration>,
}

impl WorkflowEngine {
    pub fn new(
        workflows: WorkflowStore,
        executions: ExecutionStore,
        executor: StepExecutor,
        gate: DecisionGate,
        hub: EventHub,
    ) -> Self {
        Self {
            workflows,
            executions,
            executor,
            gate,
            hub,
            run_budget: None,
        }
    }

    pub fn with_run_budget(mut self, budget: Duration) -> Self {
        self.run_budget = Some(budget);
        self
    }

    /// Start a fresh run of a workflow and drive it to a terminal state,
    /// a suspension, or a budget handoff.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        trigger: TriggerType,
        runtime_inputs: Map<String, Value>,
        session_id: Option<String>,
    ) -> Result<ExecutionResult, ServerError> {
        let execution = self
            .executions
            .create(&workflow.id, &workflow.user_id, trigger, session_id, runtime_inputs)
            .await?;
        self.start(execution, &workflow.definition).await
    }

    /// Drive a pre-created execution record (scheduler claims create the
    /// record before handing the run to the engine).
    pub async fn execute_claimed(&self, execution_id: &str) -> Result<ExecutionResult, ServerError> {
        let (execution, workflow) = self.load(execution_id).await?;
        self.start(execution, &workflow.definition).await
    }

    async fn start(
        &self,
        mut execution: Execution,
        definition: &WorkflowDefinition,
    ) -> Result<ExecutionResult, ServerError> {
        let started_at = Utc::now();
        self.executions.mark_started(&execution.id, started_at).await?;
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(started_at);

        tracing::info!(
            execution_id = %execution.id,
            workflow_id = %execution.workflow_id,
            trigger = execution.trigger.as_str(),
            "execution started"
        );
        self.drive(execution, definition, 0, None).await
    }

    /// Resume a run suspended on a human decision. The pending request's
    /// resolution decides how the suspended step proceeds; an expired or
    /// missing request resolves to skip.
    pub async fn resume(&self, execution_id: &str) -> Result<ExecutionResult, ServerError> {
        let (mut execution, workflow) = self.load(execution_id).await?;
        let definition = &workflow.definition;

        if execution.status.is_terminal() {
            return Ok(ExecutionResult::from_execution(&execution));
        }
        let Some(idx) = execution.resume_from.filter(|_| execution.status == ExecutionStatus::Waiting)
        else {
            return Err(ServerError::BadRequest(format!(
                "execution {} is not suspended",
                execution_id
            )));
        };
        let step = definition.steps.get(idx).ok_or_else(|| {
            ServerError::Internal(format!("resume index {} is out of range", idx))
        })?;

        let Some(action) = self
            .gate
            .resolve_for_resume(&execution.id, step.id())
            .await?
        else {
            // Still pending and unexpired; nothing to do yet.
            return Ok(ExecutionResult::from_execution(&execution));
        };

        let emitter = self.hub.open(&execution.id).await;
        execution.status = ExecutionStatus::Running;

        match action {
            DecisionAction::Continue => {
                let decision = serde_json::json!({ "action": "continue" });
                self.drive(execution, definition, idx, Some(decision)).await
            }
            DecisionAction::Skip => {
                mark_skipped(&mut execution, step.id(), "decision resolved to skip", &emitter);
                self.drive(execution, definition, idx + 1, None).await
            }
            DecisionAction::Stop => {
                mark_skipped(&mut execution, step.id(), "run stopped by decision", &emitter);
                for remaining in &definition.steps[idx + 1..] {
                    mark_skipped(&mut execution, remaining.id(), "run stopped by decision", &emitter);
                }
                self.finish(execution, None, &emitter).await
            }
        }
    }

    /// Continue a run that handed off at the wall-clock budget.
    async fn continue_run(&self, execution_id: &str) -> Result<ExecutionResult, ServerError> {
        let (execution, workflow) = self.load(execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(ExecutionResult::from_execution(&execution));
        }
        let idx = execution.resume_from.unwrap_or(0);
        self.drive(execution, &workflow.definition, idx, None).await
    }

    async fn load(&self, execution_id: &str) -> Result<(Execution, Workflow), ServerError> {
        let execution = self
            .executions
            .get(execution_id)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("execution {} not found", execution_id)))?;
        let workflow = self
            .workflows
            .get(&execution.workflow_id)
            .await?
            .ok_or_else(|| {
                ServerError::NotFound(format!("workflow {} not found", execution.workflow_id))
            })?;
        Ok((execution, workflow))
    }

    /// Drive the graph from `start`, returning on a terminal state, a
    /// decision suspension, or a budget handoff. Boxed because the budget
    /// handoff re-enters `drive` through `continue_run`.
    fn drive<'a>(
        &'a self,
        mut execution: Execution,
        definition: &'a WorkflowDefinition,
        start: usize,
        mut decision_for_first: Option<Value>,
    ) -> BoxFuture<'a, Result<ExecutionResult, ServerError>> {
        Box::pin(async move {
            let emitter = self.hub.open(&execution.id).await;
            let deadline = self.run_budget.map(|budget| Instant::now() + budget);
            let mut last_output: Option<Value> = None;

            for idx in start..definition.steps.len() {
                if let Some(deadline) = deadline {
                    // Hand off between steps, never mid-step; require at least
                    // one step of progress so the continuation cannot spin.
                    if idx > start && Instant::now() >= deadline {
                        execution.resume_from = Some(idx);
                        self.executions.save_progress(&execution).await?;
                        tracing::info!(
                            execution_id = %execution.id,
                            next_step = idx,
                            "run budget exceeded, continuing asynchronously"
                        );
                        let engine = self.clone();
                        let id = execution.id.clone();
                        tokio::spawn(async move {
                            if let Err(e) = engine.continue_run(&id).await {
                                tracing::error!(execution_id = %id, error = %e, "continuation failed");
                            }
                        });
                        return Ok(ExecutionResult::from_execution(&execution));
                    }
                }

                let step = &definition.steps[idx];
                let step_id = step.id().to_string();
                emitter.emit(ExecutionEventKind::StepStarted {
                    step_id: step_id.clone(),
                });

                let mut inputs = match resolve_bindings(
                    step.inputs(),
                    &execution.runtime_inputs,
                    &execution.step_outputs,
                ) {
                    Ok(inputs) => inputs,
                    Err(failure) => {
                        mark_skipped(&mut execution, &step_id, &failure.to_string(), &emitter);
                        continue;
                    }
                };
                if idx == start {
                    if let Some(decision) = decision_for_first.take() {
                        inputs.insert("decision".to_string(), decision);
                    }
                }

                if let Step::Loop(loop_step) = step {
                    match self.run_loop(&execution.user_id, loop_step, &inputs, &execution).await {
                        Ok((output, tokens)) => {
                            execution.tokens_used += tokens;
                            execution.step_outputs.insert(step_id.clone(), output.clone());
                            execution.steps_completed.push(step_id.clone());
                            last_output = Some(output);
                            emitter.emit(ExecutionEventKind::StepCompleted { step_id });
                        }
                        Err(e) => {
                            execution.steps_failed.push(step_id.clone());
                            emitter.emit(ExecutionEventKind::StepFailed {
                                step_id,
                                error_kind: e.kind().to_string(),
                                error: e.to_string(),
                            });
                        }
                    }
                    continue;
                }

                match self
                    .executor
                    .run_with_retry(&execution.user_id, step, &inputs)
                    .await
                {
                    Ok(StepOutcome::Completed { output, tokens }) => {
                        execution.tokens_used += tokens;
                        execution.step_outputs.insert(step_id.clone(), output.clone());
                        execution.steps_completed.push(step_id.clone());
                        last_output = Some(output);
                        emitter.emit(ExecutionEventKind::StepCompleted { step_id });
                    }
                    Ok(StepOutcome::Skipped { reason }) => {
                        mark_skipped(&mut execution, &step_id, &reason, &emitter);
                    }
                    Ok(StepOutcome::NeedsDecision { context }) => {
                        let request = self.gate.request(&execution.id, &step_id, context).await?;
                        execution.status = ExecutionStatus::Waiting;
                        execution.resume_from = Some(idx);
                        self.executions.save_progress(&execution).await?;
                        emitter.emit(ExecutionEventKind::DecisionRequested {
                            step_id: step_id.clone(),
                            request_id: request.id.clone(),
                        });
                        tracing::info!(
                            execution_id = %execution.id,
                            step_id = %step_id,
                            request_id = %request.id,
                            "execution suspended on a decision"
                        );
                        return Ok(ExecutionResult::from_execution(&execution));
                    }
                    Err(e) => {
                        execution.steps_failed.push(step_id.clone());
                        emitter.emit(ExecutionEventKind::StepFailed {
                            step_id: step_id.clone(),
                            error_kind: e.kind().to_string(),
                            error: e.to_string(),
                        });
                        tracing::warn!(
                            execution_id = %execution.id,
                            step_id = %step_id,
                            error_kind = e.kind(),
                            error = %e,
                            "step failed"
                        );
                    }
                }
            }

            self.finish(execution, last_output, &emitter).await
        })
    }

    /// Finalize the run exactly once and tear down its event channel.
    async fn finish(
        &self,
        mut execution: Execution,
        output: Option<Value>,
        emitter: &ExecutionEmitter,
    ) -> Result<ExecutionResult, ServerError> {
        execution.status = if execution.steps_failed.is_empty() {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        execution.completed_at = Some(Utc::now());
        execution.resume_from = None;
        execution.output = output;
        if !execution.steps_failed.is_empty() {
            execution.error = Some(format!(
                "{} step(s) failed: {}",
                execution.steps_failed.len(),
                execution.steps_failed.join(", ")
            ));
        }
        self.executions.finalize(&execution).await?;

        emitter.emit(ExecutionEventKind::ExecutionComplete {
            status: execution.status,
            steps_completed: execution.steps_completed.len(),
            steps_failed: execution.steps_failed.len(),
            steps_skipped: execution.steps_skipped.len(),
            tokens_used: execution.tokens_used,
        });
        self.hub.close(&execution.id).await;

        tracing::info!(
            execution_id = %execution.id,
            status = execution.status.as_str(),
            completed = execution.steps_completed.len(),
            failed = execution.steps_failed.len(),
            skipped = execution.steps_skipped.len(),
            tokens = execution.tokens_used,
            "execution finished"
        );
        Ok(ExecutionResult::from_execution(&execution))
    }

    /// Fan the loop body out over its items with bounded concurrency.
    /// Iteration failures are isolated; the loop itself only fails when
    /// the items binding is not an array.
    fn run_loop<'a>(
        &'a self,
        user_id: &'a str,
        loop_step: &'a LoopStep,
        inputs: &'a Map<String, Value>,
        execution: &'a Execution,
    ) -> BoxFuture<'a, Result<(Value, u64), crate::error::StepError>> {
        Box::pin(async move {
            let items = inputs
                .get(&loop_step.items)
                .and_then(|v| v.as_array())
                .ok_or_else(|| {
                    crate::error::StepError::Validation(format!(
                        "loop '{}' input '{}' is not an array",
                        loop_step.id, loop_step.items
                    ))
                })?;

            if items.len() > loop_step.max_iterations {
                tracing::warn!(
                    step_id = %loop_step.id,
                    items = items.len(),
                    max = loop_step.max_iterations,
                    "loop items truncated to the iteration bound"
                );
            }

            // Each iteration owns its item so the futures carry no borrow
            // into the bounded stream.
            let items: Vec<Value> = items
                .iter()
                .take(loop_step.max_iterations)
                .cloned()
                .collect();
            let mut iterations: Vec<(usize, Value, u64, bool)> =
                stream::iter(items.into_iter().enumerate())
                    .map(move |(index, item)| {
                        self.run_iteration(user_id, loop_step, index, item, execution)
                    })
                    .buffer_unordered(loop_step.max_concurrent)
                    .collect()
                    .await;
            iterations.sort_by_key(|(index, ..)| *index);

            let tokens: u64 = iterations.iter().map(|(_, _, t, _)| t).sum();
            let succeeded = iterations.iter().filter(|(.., ok)| *ok).count();
            let failed = iterations.len() - succeeded;
            let output = serde_json::json!({
                "iterations": iterations
                    .into_iter()
                    .map(|(_, summary, ..)| summary)
                    .collect::<Vec<_>>(),
                "succeeded": succeeded,
                "failed": failed,
            });
            Ok((output, tokens))
        })
    }

    /// Run the loop body once for one item. Body steps see the outer
    /// scope plus the item bound under the declared variable; their state
    /// stays local to the iteration.
    async fn run_iteration(
        &self,
        user_id: &str,
        loop_step: &LoopStep,
        index: usize,
        item: Value,
        execution: &Execution,
    ) -> (usize, Value, u64, bool) {
        let mut runtime = execution.runtime_inputs.clone();
        runtime.insert(loop_step.item_var.clone(), item);
        let mut outputs: HashMap<String, Value> = execution.step_outputs.clone();

        let mut tokens = 0u64;
        let mut failed: Vec<String> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();
        let mut last_output: Option<Value> = None;

        for step in &loop_step.body {
            let step_id = step.id().to_string();
            let inputs = match resolve_bindings(step.inputs(), &runtime, &outputs) {
                Ok(inputs) => inputs,
                Err(_) => {
                    skipped.push(step_id);
                    continue;
                }
            };

            let outcome = if let Step::Loop(nested) = step {
                self.run_loop(user_id, nested, &inputs, execution)
                    .await
                    .map(|(output, t)| StepOutcome::Completed { output, tokens: t })
            } else {
                self.executor.run_with_retry(user_id, step, &inputs).await
            };

            match outcome {
                Ok(StepOutcome::Completed { output, tokens: t }) => {
                    tokens += t;
                    outputs.insert(step_id, output.clone());
                    last_output = Some(output);
                }
                Ok(StepOutcome::Skipped { .. }) => skipped.push(step_id),
                // Human decisions cannot suspend a single loop iteration;
                // the step is skipped for this item instead.
                Ok(StepOutcome::NeedsDecision { .. }) => skipped.push(step_id),
                Err(_) => failed.push(step_id),
            }
        }

        let success = failed.is_empty();
        let summary = serde_json::json!({
            "index": index,
            "success": success,
            "output": last_output,
            "failed": failed,
            "skipped": skipped,
        });
        (index, summary, tokens, success)
    }
}

fn mark_skipped(execution: &mut Execution, step_id: &str, reason: &str, emitter: &ExecutionEmitter) {
    execution.steps_skipped.push(step_id.to_string());
    emitter.emit(ExecutionEventKind::StepSkipped {
        step_id: step_id.to_string(),
        reason: reason.to_string(),
    });
}
