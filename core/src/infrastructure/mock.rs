//! Scripted executor for testing.
//!
//! Records every command and answers from pre-configured rules, making it easy
//! to write deterministic tests for the orchestrator and verifier.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{ExecOutput, ExecutionError, RemoteExecutor};
use crate::types::InstanceHandle;

pub type Response = Result<ExecOutput, ExecutionError>;

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub instance: String,
    pub command: String,
    pub timeout: Duration,
}

struct Rule {
    instance: Option<String>,
    pattern: String,
    responses: Vec<Response>,
    served: usize,
}

impl Rule {
    fn matches(&self, instance: &str, command: &str) -> bool {
        self.instance.as_deref().map_or(true, |i| i == instance) && command.contains(&self.pattern)
    }

    /// Serves responses in order, then keeps repeating the last one.
    fn next(&mut self) -> Response {
        let idx = self.served.min(self.responses.len().saturating_sub(1));
        self.served += 1;
        self.responses
            .get(idx)
            .cloned()
            .unwrap_or_else(|| Ok(ExecOutput::default()))
    }
}

#[derive(Default)]
struct State {
    rules: Vec<Rule>,
    calls: Vec<Call>,
    /// Instance id -> calls still allowed before it drops off the network.
    disconnects: HashMap<String, usize>,
}

/// A test-double `RemoteExecutor`. Rules match on an optional instance id and
/// a command substring; the most recently added matching rule wins. Commands
/// that match nothing succeed with empty output.
#[derive(Default)]
pub struct ScriptedExecutor {
    state: Mutex<State>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer every matching command with `output`.
    pub fn on(&self, instance: Option<&str>, pattern: &str, output: ExecOutput) {
        self.on_sequence(instance, pattern, vec![Ok(output)]);
    }

    /// Answer matching commands from `responses` in order; the last response
    /// repeats once the list is exhausted.
    pub fn on_sequence(&self, instance: Option<&str>, pattern: &str, responses: Vec<Response>) {
        self.state().rules.push(Rule {
            instance: instance.map(String::from),
            pattern: pattern.to_string(),
            responses,
            served: 0,
        });
    }

    /// Every later command to `instance` fails as unreachable.
    pub fn disconnect(&self, instance: &str) {
        self.disconnect_after(instance, 0);
    }

    /// Allow `calls` more commands to `instance`, then fail as unreachable.
    pub fn disconnect_after(&self, instance: &str, calls: usize) {
        self.state().disconnects.insert(instance.to_string(), calls);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn calls_for(&self, instance: &str) -> Vec<Call> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.instance == instance)
            .cloned()
            .collect()
    }
}

impl RemoteExecutor for ScriptedExecutor {
    fn execute(
        &self,
        instance: &InstanceHandle,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ExecutionError> {
        let mut state = self.state();
        state.calls.push(Call {
            instance: instance.id().to_string(),
            command: command.to_string(),
            timeout,
        });

        if let Some(remaining) = state.disconnects.get_mut(instance.id()) {
            if *remaining == 0 {
                return Err(ExecutionError::Unreachable {
                    instance: instance.id().to_string(),
                    reason: "connection refused".into(),
                });
            }
            *remaining -= 1;
        }

        match state
            .rules
            .iter_mut()
            .rev()
            .find(|r| r.matches(instance.id(), command))
        {
            Some(rule) => rule.next(),
            None => Ok(ExecOutput::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Credentials, Role, Secret};

    fn handle(id: &str) -> InstanceHandle {
        InstanceHandle::new(
            id,
            Role::Primary,
            "10.0.0.1",
            Credentials {
                ssh_user: None,
                sys_password: Secret::new("pw"),
            },
        )
        .unwrap()
    }

    const T: Duration = Duration::from_secs(1);

    #[test]
    fn unmatched_commands_succeed_empty() {
        let exec = ScriptedExecutor::new();
        let out = exec.execute(&handle("ora-1"), "hostname", T).unwrap();
        assert_eq!(out, ExecOutput::default());
        assert_eq!(exec.calls().len(), 1);
    }

    #[test]
    fn latest_matching_rule_wins() {
        let exec = ScriptedExecutor::new();
        exec.on(None, "tnsping", ExecOutput::success("OK (10 msec)"));
        exec.on(Some("ora-2"), "tnsping", ExecOutput::failure(1, "TNS-03505"));
        assert_eq!(exec.execute(&handle("ora-1"), "tnsping ORA1", T).unwrap().exit_code, 0);
        assert_eq!(exec.execute(&handle("ora-2"), "tnsping ORA1", T).unwrap().exit_code, 1);
    }

    #[test]
    fn sequence_repeats_last_response() {
        let exec = ScriptedExecutor::new();
        exec.on_sequence(
            None,
            "mrp",
            vec![Ok(ExecOutput::failure(1, "ORA-01153")), Ok(ExecOutput::success("MRP_RUNNING"))],
        );
        let h = handle("ora-2");
        assert_eq!(exec.execute(&h, "mrp", T).unwrap().exit_code, 1);
        assert_eq!(exec.execute(&h, "mrp", T).unwrap().stdout, "MRP_RUNNING");
        assert_eq!(exec.execute(&h, "mrp", T).unwrap().stdout, "MRP_RUNNING");
    }

    #[test]
    fn disconnect_after_allows_some_calls() {
        let exec = ScriptedExecutor::new();
        exec.disconnect_after("ora-2", 1);
        let h = handle("ora-2");
        assert!(exec.execute(&h, "a", T).is_ok());
        assert!(matches!(
            exec.execute(&h, "b", T),
            Err(ExecutionError::Unreachable { .. })
        ));
        assert!(exec.execute(&handle("ora-1"), "c", T).is_ok());
        assert_eq!(exec.calls_for("ora-2").len(), 2);
    }
}
