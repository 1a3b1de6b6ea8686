//! Local process runner.
//!
//! `CommandRunner` is the trait the gcloud-backed executor and provisioner use
//! to run programs on the operator host. `ProcessRunner` is the production
//! implementation. `MockRunner` is the test double that records calls and
//! returns preset responses.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use super::ExecOutput;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunnerError {
    #[error("failed to execute {program}: {reason}")]
    Spawn { program: String, reason: String },
    #[error("{program} timed out after {}s", .after.as_secs())]
    TimedOut { program: String, after: Duration },
}

/// Runs a local program to completion or until the timeout elapses.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String], timeout: Duration)
        -> Result<ExecOutput, RunnerError>;
}

// ---------------------------------------------------------------------------
// ProcessRunner
// ---------------------------------------------------------------------------

/// Production runner. Pipes are drained on helper threads so a chatty child
/// cannot block on a full pipe while we wait for it.
pub struct ProcessRunner {
    poll_interval: Duration,
}

impl ProcessRunner {
    pub fn new() -> Self {
        ProcessRunner {
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for ProcessRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, RunnerError> {
        debug!(program, argc = args.len(), "spawning local process");
        let spawn_err = |reason: String| RunnerError::Spawn {
            program: program.to_string(),
            reason,
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_err(e.to_string()))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(RunnerError::TimedOut {
                        program: program.to_string(),
                        after: timeout,
                    });
                }
                Ok(None) => thread::sleep(self.poll_interval),
                Err(e) => return Err(spawn_err(e.to_string())),
            }
        };

        Ok(ExecOutput {
            // Killed by a signal: report like a shell would.
            exit_code: status.code().unwrap_or(128),
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
        })
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut p) = pipe {
            let _ = p.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

// ---------------------------------------------------------------------------
// MockRunner
// ---------------------------------------------------------------------------

/// Test-double runner that records invocations and returns pre-configured
/// responses in order. Once the responses run out it answers with empty
/// success.
pub struct MockRunner {
    responses: Mutex<Vec<Result<ExecOutput, RunnerError>>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl MockRunner {
    pub fn new() -> Self {
        MockRunner {
            responses: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_responses(responses: Vec<Result<ExecOutput, RunnerError>>) -> Self {
        let mut reversed = responses;
        reversed.reverse();
        MockRunner {
            responses: Mutex::new(reversed),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Each call as `[program, args...]`.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for MockRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        _timeout: Duration,
    ) -> Result<ExecOutput, RunnerError> {
        if let Ok(mut calls) = self.calls.lock() {
            let mut call = vec![program.to_string()];
            call.extend(args.iter().cloned());
            calls.push(call);
        }
        match self.responses.lock() {
            Ok(mut responses) => responses.pop().unwrap_or_else(|| Ok(ExecOutput::default())),
            Err(_) => Ok(ExecOutput::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn mock_runner_records_calls() {
        let runner = MockRunner::new();
        runner.run("gcloud", &args(&["config", "get-value", "project"]), Duration::from_secs(1)).unwrap();
        runner.run("gsutil", &args(&["ls"]), Duration::from_secs(1)).unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], args(&["gcloud", "config", "get-value", "project"]));
        assert_eq!(calls[1][0], "gsutil");
    }

    #[test]
    fn mock_runner_returns_responses_in_order() {
        let runner = MockRunner::with_responses(vec![
            Ok(ExecOutput::success("first")),
            Ok(ExecOutput::failure(1, "boom")),
        ]);
        let t = Duration::from_secs(1);
        assert_eq!(runner.run("a", &[], t).unwrap().stdout, "first");
        assert_eq!(runner.run("b", &[], t).unwrap().exit_code, 1);
        assert_eq!(runner.run("c", &[], t).unwrap(), ExecOutput::default());
    }

    #[test]
    fn process_runner_captures_output_and_status() {
        let runner = ProcessRunner::new();
        let out = runner
            .run("sh", &args(&["-c", "echo out; echo err >&2; exit 3"]), Duration::from_secs(10))
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[test]
    fn process_runner_enforces_timeout() {
        let runner = ProcessRunner::new();
        let started = Instant::now();
        let err = runner
            .run("sh", &args(&["-c", "sleep 5"]), Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, RunnerError::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn process_runner_reports_missing_program() {
        let runner = ProcessRunner::new();
        let err = runner
            .run("definitely-not-a-real-program-dgc", &[], Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }
}
