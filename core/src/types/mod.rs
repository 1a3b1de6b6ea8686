//! Core data model shared by the orchestrator, the verifier and the CLI.

pub mod config;
pub mod instance;
pub mod outcome;
pub mod report;
pub mod step;

pub use instance::{Credentials, InstanceError, InstanceHandle, InstanceNaming, Role, Secret};
pub use outcome::{StepOutcome, StepResult};
pub use report::{
    ApplyState, ClusterStatusReport, DestinationHealth, DestinationState, DestinationStatus,
    Finding, InstanceReplicationState, OverallStatus,
};
pub use step::{Capture, Expectation, Idempotency, Postcondition, StepDefinition, StepTarget};
