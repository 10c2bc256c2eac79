//! Plan validation, batching, and execution.

pub mod dag;
pub mod executor;
pub mod state;

pub use dag::{PlanError, build_batches, dependencies_of, dependents_of, validate_plan};
pub use executor::{
    ExecutionResult, ExecutorConfig, ExecutorError, PlanExecutor, RunOptions, step_aggregate_id,
};
