//! Scheduler — claims due scheduled workflows and starts their runs.
//!
//! There is no resident daemon: `tick` is invoked by an external timer
//! and must tolerate overlapping and duplicate invocations. Correctness
//! rests entirely on the compare-and-swap claim over `next_run`; losing
//! the race is expected and silently skipped.

pub mod cron;

use chrono::{Duration, Utc};
use serde::Serialize;

use crate::engine::WorkflowEngine;
use crate::error::ServerError;
use crate::models::execution::{ExecutionStatus, TriggerType};
use crate::models::workflow::{TriggerMode, Workflow};
use crate::store::{ExecutionStore, ScheduleStore, WorkflowStore};

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub claimed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub resumed: usize,
}

#[derive(Clone)]
pub struct Scheduler {
    schedules: ScheduleStore,
    executions: ExecutionStore,
    workflows: WorkflowStore,
    engine: WorkflowEngine,
}

impl Scheduler {
    pub fn new(
        schedules: ScheduleStore,
        executions: ExecutionStore,
        workflows: WorkflowStore,
        engine: WorkflowEngine,
    ) -> Self {
        Self {
            schedules,
            executions,
            workflows,
            engine,
        }
    }

    /// One scheduler pass: resume suspended runs whose decision window
    /// closed, then scan due schedules, claim each via the
    /// compare-and-swap, create the execution record, and hand the run to
    /// the engine in a spawned task.
    pub async fn tick(&self) -> Result<TickReport, ServerError> {
        let now = Utc::now();
        let mut report = TickReport::default();

        // Suspended runs whose request expired would otherwise wait
        // forever, and the active-run check would keep their workflow
        // unclaimable. `resume` leaves a still-pending request alone.
        for execution in self.executions.list_waiting().await? {
            match self.engine.resume(&execution.id).await {
                Ok(result) if result.status != ExecutionStatus::Waiting => {
                    tracing::info!(
                        execution_id = %execution.id,
                        status = result.status.as_str(),
                        "suspended run resumed by expiry sweep"
                    );
                    report.resumed += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(
                        execution_id = %execution.id,
                        error = %e,
                        "expiry sweep could not resume run"
                    );
                    report.failed += 1;
                }
            }
        }

        let due = self.schedules.list_due(now).await?;

        for schedule in due {
            let workflow_id = schedule.workflow_id.clone();

            // Defense in depth beyond the claim: never stack a second run
            // on a workflow that is still executing.
            if self.executions.has_active(&workflow_id).await? {
                tracing::debug!(workflow_id = %workflow_id, "skipping, a run is still active");
                report.skipped += 1;
                continue;
            }

            let Some(observed) = schedule.next_run else {
                report.skipped += 1;
                continue;
            };

            // A malformed expression reschedules one hour out rather than
            // blocking the workflow indefinitely.
            let next = match cron::next_occurrence(&schedule.expression, &schedule.timezone, now) {
                Ok(next) => next,
                Err(e) => {
                    tracing::warn!(
                        workflow_id = %workflow_id,
                        expression = %schedule.expression,
                        error = %e,
                        "cannot compute next occurrence, rescheduling one hour ahead"
                    );
                    now + Duration::hours(1)
                }
            };

            if !self.schedules.claim(&workflow_id, observed, next, now).await? {
                tracing::debug!(workflow_id = %workflow_id, "lost the claim race");
                report.skipped += 1;
                continue;
            }

            match self.start_claimed_run(&workflow_id).await {
                Ok(()) => report.claimed += 1,
                Err(e) => {
                    tracing::error!(
                        workflow_id = %workflow_id,
                        error = %e,
                        "run creation failed after claim, rolling back"
                    );
                    self.schedules
                        .restore_claim(&workflow_id, schedule.next_run, schedule.last_run)
                        .await?;
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            claimed = report.claimed,
            skipped = report.skipped,
            failed = report.failed,
            resumed = report.resumed,
            "scheduler tick finished"
        );
        Ok(report)
    }

    async fn start_claimed_run(&self, workflow_id: &str) -> Result<(), ServerError> {
        let workflow = self
            .workflows
            .get(workflow_id)
            .await?
            .ok_or_else(|| ServerError::NotFound(format!("workflow {} not found", workflow_id)))?;

        let execution = self
            .executions
            .create(
                workflow_id,
                &workflow.user_id,
                TriggerType::Schedule,
                None,
                serde_json::Map::new(),
            )
            .await?;

        let engine = self.engine.clone();
        let execution_id = execution.id;
        tokio::spawn(async move {
            if let Err(e) = engine.execute_claimed(&execution_id).await {
                tracing::error!(execution_id = %execution_id, error = %e, "scheduled run failed");
            }
        });
        Ok(())
    }

    /// Bring the schedule row in line with a workflow's trigger: upsert
    /// and arm it for scheduled workflows, disable it otherwise.
    pub async fn sync_schedule(&self, workflow: &Workflow) -> Result<(), ServerError> {
        match &workflow.definition.trigger {
            TriggerMode::Scheduled {
                expression,
                timezone,
            } => {
                let next = cron::next_occurrence(expression, timezone, Utc::now())?;
                self.schedules
                    .upsert(&workflow.id, expression, timezone, true, Some(next))
                    .await?;
                Ok(())
            }
            _ => {
                self.schedules.set_enabled(&workflow.id, false).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::decisions::DecisionGate;
    use crate::engine::events::EventHub;
    use crate::engine::step_executor::StepExecutor;
    use crate::error::StepError;
    use crate::integrations::{AdapterRegistry, IntegrationBroker};
    use crate::models::workflow::WorkflowDefinition;
    use crate::planner::{ModelClient, ModelReply};
    use crate::store::{ConnectionStore, DecisionStore};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NullModel;

    #[async_trait]
    impl ModelClient for NullModel {
        async fn complete(
            &self,
            model: &str,
            _system: &str,
            _prompt: &str,
            _max_tokens: u32,
        ) -> Result<ModelReply, StepError> {
            Ok(ModelReply {
                content: "{}".into(),
                model: model.to_string(),
                tokens_used: 0,
            })
        }
    }

    fn build(db: Database) -> (Scheduler, ScheduleStore, ExecutionStore, WorkflowStore) {
        let workflows = WorkflowStore::new(db.clone());
        let executions = ExecutionStore::new(db.clone());
        let schedules = ScheduleStore::new(db.clone());
        let broker = IntegrationBroker::new(
            ConnectionStore::new(db.clone()),
            Arc::new(AdapterRegistry::new()),
        );
        let executor = StepExecutor::new(broker, Arc::new(NullModel), "test-model".into());
        let gate = DecisionGate::new(DecisionStore::new(db.clone()), executions.clone());
        let engine = WorkflowEngine::new(
            workflows.clone(),
            executions.clone(),
            executor,
            gate,
            EventHub::new(),
        );
        (
            Scheduler::new(
                schedules.clone(),
                executions.clone(),
                workflows.clone(),
                engine,
            ),
            schedules,
            executions,
            workflows,
        )
    }

    async fn scheduled_workflow(workflows: &WorkflowStore) -> String {
        let def = WorkflowDefinition::from_yaml(
            "name: nightly\ntrigger:\n  mode: scheduled\n  expression: \"*/5 * * * *\"\nsteps:\n  - kind: transform\n    id: shape\n    op: merge\n",
        )
        .unwrap();
        workflows.create("u1", def).await.unwrap().id
    }

    #[tokio::test]
    async fn test_tick_claims_due_schedule_and_advances() {
        let (scheduler, schedules, _executions, workflows) = build(Database::open_in_memory().unwrap());
        let wf_id = scheduled_workflow(&workflows).await;
        let due = Utc::now() - Duration::minutes(1);
        schedules
            .upsert(&wf_id, "*/5 * * * *", "UTC", true, Some(due))
            .await
            .unwrap();

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.failed, 0);

        let state = schedules.get(&wf_id).await.unwrap().unwrap();
        assert!(state.next_run.unwrap() > due, "next_run must strictly advance");
        assert!(state.last_run.is_some());
    }

    #[tokio::test]
    async fn test_second_tick_finds_nothing_due() {
        let (scheduler, schedules, _executions, workflows) = build(Database::open_in_memory().unwrap());
        let wf_id = scheduled_workflow(&workflows).await;
        schedules
            .upsert(&wf_id, "*/5 * * * *", "UTC", true, Some(Utc::now() - Duration::minutes(1)))
            .await
            .unwrap();

        assert_eq!(scheduler.tick().await.unwrap().claimed, 1);
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.claimed, 0);
    }

    #[tokio::test]
    async fn test_active_run_skips_claim() {
        let (scheduler, schedules, executions, workflows) = build(Database::open_in_memory().unwrap());
        let wf_id = scheduled_workflow(&workflows).await;
        let due = Utc::now() - Duration::minutes(1);
        schedules
            .upsert(&wf_id, "*/5 * * * *", "UTC", true, Some(due))
            .await
            .unwrap();
        executions
            .create(&wf_id, "u1", TriggerType::Manual, None, Default::default())
            .await
            .unwrap();

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.claimed, 0);
        assert_eq!(report.skipped, 1);
        // The schedule was not consumed.
        let state = schedules.get(&wf_id).await.unwrap().unwrap();
        assert_eq!(
            state.next_run.unwrap().timestamp_millis(),
            due.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_malformed_expression_reschedules_an_hour_out() {
        let (scheduler, schedules, _executions, workflows) = build(Database::open_in_memory().unwrap());
        let wf_id = scheduled_workflow(&workflows).await;
        schedules
            .upsert(&wf_id, "not a cron", "UTC", true, Some(Utc::now() - Duration::minutes(1)))
            .await
            .unwrap();

        let before = Utc::now();
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.claimed, 1);

        let state = schedules.get(&wf_id).await.unwrap().unwrap();
        let next = state.next_run.unwrap();
        assert!(next >= before + Duration::minutes(59));
        assert!(next <= Utc::now() + Duration::minutes(61));
    }
}
