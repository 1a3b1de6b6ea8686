//! Convergence engine. Drives an instance pair through the step pipeline.
//!
//! The `orchestrator` module runs steps in order with halt, retry and resume
//! policy and produces the cluster status report. The `retry` module provides
//! the backoff policy for retryable steps.

pub mod orchestrator;
pub mod retry;

pub use orchestrator::{
    new_run_id, validate_pipeline, AbortHandle, ConvergeError, ConvergenceOrchestrator,
    OrchestratorConfig,
};
pub use retry::RetryPolicy;
