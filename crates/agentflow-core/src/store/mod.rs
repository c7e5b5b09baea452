pub mod connection_store;
pub mod decision_store;
pub mod execution_store;
pub mod schedule_store;
pub mod workflow_store;

pub use connection_store::ConnectionStore;
pub use decision_store::DecisionStore;
pub use execution_store::ExecutionStore;
pub use schedule_store::ScheduleStore;
pub use workflow_store::WorkflowStore;
