//! Declarative description of one convergence action.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::instance::Role;
use crate::infrastructure::ExecOutput;
use crate::template::{self, Bindings, TemplateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepTarget {
    Primary,
    Standby,
    /// Primary first, then standby.
    Both,
}

impl StepTarget {
    pub fn roles(&self) -> &'static [Role] {
        match self {
            StepTarget::Primary => &[Role::Primary],
            StepTarget::Standby => &[Role::Standby],
            StepTarget::Both => &[Role::Primary, Role::Standby],
        }
    }

    pub fn includes(&self, role: Role) -> bool {
        self.roles().contains(&role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Idempotency {
    /// Safe to re-run; re-application is a no-op.
    Idempotent,
    /// Once recorded OK for a pair, later runs only re-check the postcondition.
    RunOnce,
}

// ---------------------------------------------------------------------------
// Postconditions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum Expectation {
    ExitZero,
    StdoutContains(String),
    /// Compared against the trimmed stdout.
    StdoutEquals(String),
}

impl Expectation {
    pub fn render(&self, bindings: &Bindings) -> Result<Expectation, TemplateError> {
        Ok(match self {
            Expectation::ExitZero => Expectation::ExitZero,
            Expectation::StdoutContains(t) => {
                Expectation::StdoutContains(template::render(t, bindings)?)
            }
            Expectation::StdoutEquals(t) => {
                Expectation::StdoutEquals(template::render(t, bindings)?)
            }
        })
    }

    pub fn holds(&self, output: &ExecOutput) -> bool {
        if !output.succeeded() {
            return false;
        }
        match self {
            Expectation::ExitZero => true,
            Expectation::StdoutContains(t) => output.stdout.contains(t.as_str()),
            Expectation::StdoutEquals(t) => output.stdout.trim() == t.trim(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Expectation::ExitZero => "exit status 0".to_string(),
            Expectation::StdoutContains(t) => format!("output containing '{}'", t),
            Expectation::StdoutEquals(t) => format!("output equal to '{}'", t),
        }
    }
}

/// Read-only verification query run after a step's command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Postcondition {
    pub query: String,
    pub expect: Expectation,
}

impl Postcondition {
    pub fn new(query: impl Into<String>, expect: Expectation) -> Self {
        Postcondition {
            query: query.into(),
            expect,
        }
    }

    pub fn contains(query: impl Into<String>, marker: impl Into<String>) -> Self {
        Self::new(query, Expectation::StdoutContains(marker.into()))
    }

    pub fn equals(query: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(query, Expectation::StdoutEquals(value.into()))
    }

    pub fn exit_zero(query: impl Into<String>) -> Self {
        Self::new(query, Expectation::ExitZero)
    }
}

// ---------------------------------------------------------------------------
// Captures
// ---------------------------------------------------------------------------

/// A value produced by a step on one instance and handed forward to later
/// commands as a template binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capture {
    pub variable: String,
    pub from: Role,
    /// The value is the rest of the last stdout line starting with this prefix.
    pub prefix: String,
    /// Sensitive values are kept in memory only and never written to the run log.
    #[serde(default)]
    pub sensitive: bool,
}

impl Capture {
    pub fn extract(&self, stdout: &str) -> Option<String> {
        stdout
            .lines()
            .rev()
            .map(str::trim)
            .find_map(|line| line.strip_prefix(self.prefix.as_str()))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

// ---------------------------------------------------------------------------
// StepDefinition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub target: StepTarget,
    /// Shell script template rendered with `{{name}}` bindings.
    pub command: String,
    pub postcondition: Postcondition,
    pub retryable: bool,
    pub idempotency: Idempotency,
    #[serde(default)]
    pub captures: Vec<Capture>,
    /// Overrides the orchestrator's default per-command timeout.
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl StepDefinition {
    pub fn new(
        name: impl Into<String>,
        target: StepTarget,
        command: impl Into<String>,
        postcondition: Postcondition,
    ) -> Self {
        StepDefinition {
            name: name.into(),
            target,
            command: command.into(),
            postcondition,
            retryable: false,
            idempotency: Idempotency::Idempotent,
            captures: Vec::new(),
            timeout: None,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn run_once(mut self) -> Self {
        self.idempotency = Idempotency::RunOnce;
        self
    }

    pub fn capture(mut self, variable: &str, from: Role, prefix: &str) -> Self {
        self.captures.push(Capture {
            variable: variable.to_string(),
            from,
            prefix: prefix.to_string(),
            sensitive: false,
        });
        self
    }

    pub fn capture_sensitive(mut self, variable: &str, from: Role, prefix: &str) -> Self {
        self.captures.push(Capture {
            variable: variable.to_string(),
            from,
            prefix: prefix.to_string(),
            sensitive: true,
        });
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Every `{{variable}}` referenced by the command, postcondition query and
    /// expectation text.
    pub fn referenced_variables(&self) -> Vec<String> {
        let mut vars = template::variables(&self.command);
        vars.extend(template::variables(&self.postcondition.query));
        match &self.postcondition.expect {
            Expectation::StdoutContains(t) | Expectation::StdoutEquals(t) => {
                vars.extend(template::variables(t));
            }
            Expectation::ExitZero => {}
        }
        vars.sort();
        vars.dedup();
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn out(code: i32, stdout: &str) -> ExecOutput {
        ExecOutput {
            exit_code: code,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    #[test]
    fn both_targets_primary_first() {
        assert_eq!(StepTarget::Both.roles(), &[Role::Primary, Role::Standby]);
        assert!(!StepTarget::Primary.includes(Role::Standby));
    }

    #[test]
    fn expectation_requires_zero_exit() {
        let e = Expectation::StdoutContains("READY".into());
        assert!(e.holds(&out(0, "x READY y")));
        assert!(!e.holds(&out(1, "READY")));
        assert!(!e.holds(&out(0, "NOT YET")));
    }

    #[test]
    fn expectation_equals_trims() {
        let e = Expectation::StdoutEquals("abc123".into());
        assert!(e.holds(&out(0, "abc123\n")));
        assert!(!e.holds(&out(0, "abc1234")));
    }

    #[test]
    fn expectation_renders_bindings() {
        let mut b = Bindings::new();
        b.insert("orapw_md5".into(), "feed".into());
        let e = Expectation::StdoutEquals("{{orapw_md5}}".into()).render(&b).unwrap();
        assert_eq!(e, Expectation::StdoutEquals("feed".into()));
        assert!(Expectation::StdoutEquals("{{missing}}".into()).render(&b).is_err());
    }

    #[test]
    fn capture_takes_last_matching_line() {
        let c = Capture {
            variable: "md5".into(),
            from: Role::Primary,
            prefix: "MD5=".into(),
            sensitive: false,
        };
        assert_eq!(c.extract("MD5=old\nnoise\nMD5=new\n").as_deref(), Some("new"));
        assert_eq!(c.extract("nothing here"), None);
        assert_eq!(c.extract("MD5=   \n"), None);
    }

    #[test]
    fn builder_flags() {
        let s = StepDefinition::new(
            "dup",
            StepTarget::Standby,
            "run {{db_name}}",
            Postcondition::equals("check {{target_id}}", "{{expected}}"),
        )
        .retryable()
        .run_once()
        .timeout(Duration::from_secs(5));
        assert!(s.retryable);
        assert_eq!(s.idempotency, Idempotency::RunOnce);
        assert_eq!(s.timeout, Some(Duration::from_secs(5)));
        assert_eq!(s.referenced_variables(), vec!["db_name", "expected", "target_id"]);
    }
}
