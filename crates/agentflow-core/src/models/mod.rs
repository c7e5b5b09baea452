pub mod connection;
pub mod decision;
pub mod execution;
pub mod schedule;
pub mod workflow;

pub use connection::{ConnectionStatus, IntegrationConnection};
pub use decision::{DecisionAction, DecisionRequest, DecisionStatus, DECISION_TTL_SECS};
pub use execution::{Execution, ExecutionResult, ExecutionStatus, TriggerType};
pub use schedule::ScheduleState;
pub use workflow::{
    BindingSource, Step, TriggerMode, Workflow, WorkflowDefinition,
};
