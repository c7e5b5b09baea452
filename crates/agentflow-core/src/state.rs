//! Shared application state for the HTTP server.

use std::sync::Arc;

use tokio::time::Duration;

use crate::db::Database;
use crate::decisions::DecisionGate;
use crate::engine::events::EventHub;
use crate::engine::step_executor::StepExecutor;
use crate::engine::WorkflowEngine;
use crate::integrations::{AdapterRegistry, IntegrationBroker};
use crate::planner::{ModelClient, PlanConfig, PlanGenerator};
use crate::scheduler::Scheduler;
use crate::store::{
    ConnectionStore, DecisionStore, ExecutionStore, ScheduleStore, WorkflowStore,
};

/// Process-level configuration not tied to a single component.
#[derive(Clone)]
pub struct AppConfig {
    /// Model used by `llm_decision` steps with no override.
    pub default_model: String,
    pub plan: PlanConfig,
    /// Bearer token required by the scheduler tick endpoint.
    pub scheduler_token: Option<String>,
    /// Wall-clock budget per engine invocation; exceeded runs continue
    /// in a spawned task.
    pub run_budget: Option<Duration>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_model: "GLM-4.7".to_string(),
            plan: PlanConfig::default(),
            scheduler_token: None,
            run_budget: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let mut config = Self {
            plan: PlanConfig::from_env(),
            ..Self::default()
        };
        if let Ok(v) = std::env::var("AGENTFLOW_DEFAULT_MODEL") {
            config.default_model = v;
        }
        if let Ok(v) = std::env::var("AGENTFLOW_SCHEDULER_TOKEN") {
            if !v.is_empty() {
                config.scheduler_token = Some(v);
            }
        }
        if let Ok(v) = std::env::var("AGENTFLOW_RUN_BUDGET_SECS") {
            if let Ok(secs) = v.parse::<u64>() {
                config.run_budget = Some(Duration::from_secs(secs));
            }
        }
        config
    }
}

/// Shared state accessible by all API handlers.
pub struct AppStateInner {
    pub db: Database,
    pub workflow_store: WorkflowStore,
    pub execution_store: ExecutionStore,
    pub schedule_store: ScheduleStore,
    pub connection_store: ConnectionStore,
    pub decision_store: DecisionStore,
    pub hub: EventHub,
    pub broker: IntegrationBroker,
    pub gate: DecisionGate,
    pub engine: WorkflowEngine,
    pub scheduler: Scheduler,
    pub planner: PlanGenerator,
    pub config: AppConfig,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    pub fn new(
        db: Database,
        registry: Arc<AdapterRegistry>,
        model: Arc<dyn ModelClient>,
        config: AppConfig,
    ) -> Self {
        let workflow_store = WorkflowStore::new(db.clone());
        let execution_store = ExecutionStore::new(db.clone());
        let schedule_store = ScheduleStore::new(db.clone());
        let connection_store = ConnectionStore::new(db.clone());
        let decision_store = DecisionStore::new(db.clone());

        let hub = EventHub::new();
        let broker = IntegrationBroker::new(connection_store.clone(), registry);
        let gate = DecisionGate::new(decision_store.clone(), execution_store.clone());
        let executor = StepExecutor::new(
            broker.clone(),
            model.clone(),
            config.default_model.clone(),
        );

        let mut engine = WorkflowEngine::new(
            workflow_store.clone(),
            execution_store.clone(),
            executor,
            gate.clone(),
            hub.clone(),
        );
        if let Some(budget) = config.run_budget {
            engine = engine.with_run_budget(budget);
        }

        let scheduler = Scheduler::new(
            schedule_store.clone(),
            execution_store.clone(),
            workflow_store.clone(),
            engine.clone(),
        );
        let planner = PlanGenerator::new(model, config.plan.clone());

        Self {
            workflow_store,
            execution_store,
            schedule_store,
            connection_store,
            decision_store,
            hub,
            broker,
            gate,
            engine,
            scheduler,
            planner,
            config,
            db,
        }
    }
}
