//! Remote execution backends.
//!
//! `RemoteExecutor` is the only way the orchestrator and verifier touch an
//! instance. The gcloud SSH executor is the production implementation and
//! `mock::ScriptedExecutor` is the test double. Executors never retry; retry
//! policy belongs to the orchestrator.

pub mod mock;
pub mod runner;
pub mod ssh;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::InstanceHandle;

/// Structured result of a command that ran to completion. A non-zero exit
/// code is a normal, inspectable result rather than an error.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        ExecOutput {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        ExecOutput {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty line of stderr, falling back to stdout.
    pub fn tail(&self) -> &str {
        fn last(s: &str) -> Option<&str> {
            s.lines().map(str::trim).filter(|l| !l.is_empty()).last()
        }
        last(&self.stderr).or_else(|| last(&self.stdout)).unwrap_or("")
    }
}

/// Failure to reach an instance at all. Distinct from a non-zero exit code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("{instance} unreachable: {reason}")]
    Unreachable { instance: String, reason: String },
    #[error("authentication to {instance} failed: {reason}")]
    Auth { instance: String, reason: String },
    #[error("command on {instance} timed out after {}s", .after.as_secs())]
    Timeout { instance: String, after: Duration },
    #[error("could not start transport to {instance}: {reason}")]
    Spawn { instance: String, reason: String },
}

impl ExecutionError {
    pub fn instance(&self) -> &str {
        match self {
            ExecutionError::Unreachable { instance, .. }
            | ExecutionError::Auth { instance, .. }
            | ExecutionError::Timeout { instance, .. }
            | ExecutionError::Spawn { instance, .. } => instance,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionError::Timeout { .. })
    }
}

/// Executes an administrative command against one instance.
///
/// Implementations block for the duration of the command and must give up
/// with `ExecutionError::Timeout` once `timeout` has elapsed.
pub trait RemoteExecutor: Send + Sync {
    fn execute(
        &self,
        instance: &InstanceHandle,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ExecutionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::mock::ScriptedExecutor;

    #[test]
    fn scripted_executor_is_a_remote_executor() {
        let exec = ScriptedExecutor::new();
        let _: &dyn RemoteExecutor = &exec;
    }

    #[test]
    fn tail_prefers_stderr() {
        let out = ExecOutput {
            exit_code: 1,
            stdout: "line one\n".into(),
            stderr: "warn\nORA-01031: insufficient privileges\n\n".into(),
        };
        assert_eq!(out.tail(), "ORA-01031: insufficient privileges");
        assert_eq!(ExecOutput::success("a\nb\n").tail(), "b");
        assert_eq!(ExecOutput::default().tail(), "");
    }

    #[test]
    fn timeout_error_message() {
        let e = ExecutionError::Timeout {
            instance: "ora-2".into(),
            after: Duration::from_secs(90),
        };
        assert_eq!(e.to_string(), "command on ora-2 timed out after 90s");
        assert!(e.is_timeout());
        assert_eq!(e.instance(), "ora-2");
    }
}
