pub mod condition;
pub mod engine;
pub mod store;
pub mod types;

pub use condition::{evaluate_condition, ConditionError};
pub use engine::{AgentTaskOutput, TaskAgentCaller, WorkflowEngine};
pub use store::{load_definitions, ExecutionStore, StoreError};
pub use types::*;
