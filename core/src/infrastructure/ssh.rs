//! `RemoteExecutor` over `gcloud compute ssh`.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::runner::{CommandRunner, RunnerError};
use super::{ExecOutput, ExecutionError, RemoteExecutor};
use crate::types::InstanceHandle;

/// Exit status ssh reserves for its own failures.
const SSH_TRANSPORT_EXIT: i32 = 255;

pub struct GcloudSshExecutor {
    runner: Arc<dyn CommandRunner>,
    project: String,
    zone: String,
}

impl GcloudSshExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, project: &str, zone: &str) -> Self {
        GcloudSshExecutor {
            runner,
            project: project.to_string(),
            zone: zone.to_string(),
        }
    }

    /// Argument vector for `gcloud`. The script travels as one argument and is
    /// run by the remote login shell.
    pub fn ssh_args(&self, instance: &InstanceHandle, command: &str) -> Vec<String> {
        let target = match instance.credentials().ssh_user {
            Some(ref user) => format!("{}@{}", user, instance.id()),
            None => instance.id().to_string(),
        };
        vec![
            "compute".into(),
            "ssh".into(),
            target,
            "--zone".into(),
            self.zone.clone(),
            "--project".into(),
            self.project.clone(),
            "--quiet".into(),
            "--command".into(),
            command.to_string(),
        ]
    }

    fn classify(&self, instance: &InstanceHandle, output: ExecOutput) -> Result<ExecOutput, ExecutionError> {
        if output.exit_code != SSH_TRANSPORT_EXIT {
            return Ok(output);
        }
        let reason = output.tail().to_string();
        if reason.contains("Permission denied") || reason.contains("publickey") {
            Err(ExecutionError::Auth {
                instance: instance.id().to_string(),
                reason,
            })
        } else {
            Err(ExecutionError::Unreachable {
                instance: instance.id().to_string(),
                reason,
            })
        }
    }
}

impl RemoteExecutor for GcloudSshExecutor {
    fn execute(
        &self,
        instance: &InstanceHandle,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ExecutionError> {
        debug!(instance = instance.id(), bytes = command.len(), "gcloud ssh");
        let args = self.ssh_args(instance, command);
        match self.runner.run("gcloud", &args, timeout) {
            Ok(output) => self.classify(instance, output),
            Err(RunnerError::TimedOut { after, .. }) => Err(ExecutionError::Timeout {
                instance: instance.id().to_string(),
                after,
            }),
            Err(RunnerError::Spawn { reason, .. }) => Err(ExecutionError::Spawn {
                instance: instance.id().to_string(),
                reason,
            }),
        }
    }
}
