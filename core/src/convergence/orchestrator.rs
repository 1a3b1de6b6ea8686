//! Convergence orchestrator: drives an instance pair through an ordered step
//! pipeline, records every outcome, and hands the result to the verifier.
//!
//! Policy:
//! - steps run strictly in order, each on the instance(s) its target names
//!   (primary before standby for `Both`)
//! - a step is OK only when its command exits zero and its postcondition
//!   holds on every targeted instance
//! - a retryable step is re-attempted per the retry policy; anything else
//!   fails on the first error
//! - the first FAILED step halts the run and every later step is SKIPPED
//! - an abort between steps marks the remainder SKIPPED
//! - the verifier runs after every run, failed or not
//! - a run-once step that succeeded in a previous run for the same pair is
//!   not re-run; only its postcondition is checked

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::retry::RetryPolicy;
use crate::infrastructure::{ExecutionError, RemoteExecutor};
use crate::runlog::{pair_key, RunLog, RunLogError, RunLogWriter};
use crate::template::{self, Bindings, TemplateError};
use crate::types::config::Settings;
use crate::types::{
    ClusterStatusReport, Finding, Idempotency, InstanceHandle, OverallStatus, Role,
    StepDefinition, StepOutcome, StepResult,
};
use crate::verify::{StatusVerifier, VerifierConfig};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicy,
    pub default_step_timeout: Duration,
    pub verifier: VerifierConfig,
    /// Stop cleanly after this step succeeds, as if aborted.
    pub stop_after: Option<String>,
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        OrchestratorConfig {
            retry: RetryPolicy::from(&settings.retry),
            default_step_timeout: Duration::from_secs(settings.step_timeout_secs),
            verifier: VerifierConfig {
                destinations: settings.destinations.clone(),
                max_apply_lag: Duration::from_secs(settings.max_apply_lag_secs),
                query_timeout: Duration::from_secs(settings.query_timeout_secs),
            },
            stop_after: None,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig::from_settings(&Settings::default())
    }
}

/// Cloneable flag the caller sets to stop a run at the next step boundary.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures that prevent a report from being produced at all.
#[derive(Debug, Error)]
pub enum ConvergeError {
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),
    #[error(transparent)]
    RunLog(#[from] RunLogError),
    #[error("no report: neither {primary} nor {standby} could be reached for assessment")]
    NoReport { primary: String, standby: String },
}

/// Why one attempt of a step failed. Recorded as the outcome detail.
#[derive(Debug, Clone, Error)]
enum StepError {
    #[error("template: {0}")]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("command exited {code} on {instance}: {tail}")]
    NonZeroExit {
        instance: String,
        code: i32,
        tail: String,
    },
    #[error("postcondition not met on {instance}: expected {expected}, observed '{observed}'")]
    Postcondition {
        instance: String,
        expected: String,
        observed: String,
    },
    #[error("{instance} printed no value for '{variable}'")]
    EmptyCapture { instance: String, variable: String },
}

impl StepError {
    /// Rendering is deterministic, so a template error never clears on retry.
    fn is_retryable(&self) -> bool {
        !matches!(self, StepError::Template(_))
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// The instances a run touches.
#[derive(Clone, Copy)]
enum Scope<'h> {
    Pair {
        primary: &'h InstanceHandle,
        standby: &'h InstanceHandle,
    },
    Single(&'h InstanceHandle),
}

impl<'h> Scope<'h> {
    fn key(&self) -> String {
        match self {
            Scope::Pair { primary, standby } => pair_key(primary.id(), standby.id()),
            Scope::Single(h) => h.id().to_string(),
        }
    }

    fn hosts(&self, step: &StepDefinition) -> Vec<&'h InstanceHandle> {
        match *self {
            Scope::Pair { primary, standby } => step
                .target
                .roles()
                .iter()
                .map(|r| match r {
                    Role::Primary => primary,
                    Role::Standby => standby,
                })
                .collect(),
            Scope::Single(h) => vec![h],
        }
    }

    /// Single-instance runs capture from whichever host ran the step.
    fn captures_from(&self, host: &InstanceHandle, from: Role) -> bool {
        match self {
            Scope::Pair { .. } => host.role() == from,
            Scope::Single(_) => true,
        }
    }
}

// ---------------------------------------------------------------------------
// ConvergenceOrchestrator
// ---------------------------------------------------------------------------

pub struct ConvergenceOrchestrator<'a> {
    executor: &'a dyn RemoteExecutor,
    config: OrchestratorConfig,
    bindings: Bindings,
    prior: RunLog,
    log: RunLogWriter,
    abort: AbortHandle,
}

impl<'a> ConvergenceOrchestrator<'a> {
    pub fn new(executor: &'a dyn RemoteExecutor, config: OrchestratorConfig, log: RunLogWriter) -> Self {
        ConvergenceOrchestrator {
            executor,
            config,
            bindings: Bindings::new(),
            prior: RunLog::default(),
            log,
            abort: AbortHandle::new(),
        }
    }

    /// Extra template bindings, typically the derived database names.
    pub fn with_bindings(mut self, bindings: Bindings) -> Self {
        self.bindings.extend(bindings);
        self
    }

    /// A previous run log used to resume run-once steps.
    pub fn with_prior(mut self, prior: RunLog) -> Self {
        self.prior = prior;
        self
    }

    pub fn with_abort(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn run_id(&self) -> &str {
        self.log.run_id()
    }

    /// Run `steps` against the pair and produce the cluster status report.
    pub fn converge(
        &mut self,
        primary: &InstanceHandle,
        standby: &InstanceHandle,
        steps: &[StepDefinition],
    ) -> Result<ClusterStatusReport, ConvergeError> {
        validate_pipeline(primary, standby, steps, &self.bindings)?;

        let mut bindings = self.bindings.clone();
        bindings.extend(seed_bindings(primary, standby));

        let scope = Scope::Pair { primary, standby };
        info!(
            run_id = self.log.run_id(),
            primary = primary.id(),
            standby = standby.id(),
            steps = steps.len(),
            "convergence run started"
        );
        let run = self.run_steps(scope, steps, &mut bindings)?;

        let assessment = StatusVerifier::new(self.executor, self.config.verifier.clone())
            .assess(primary, standby);
        if assessment.both_unreachable() {
            return Err(ConvergeError::NoReport {
                primary: primary.id().to_string(),
                standby: standby.id().to_string(),
            });
        }

        let first_failed = run.outcomes.iter().find(|o| o.is_failed());
        let mut findings = Vec::new();
        if let Some(failed) = first_failed {
            findings.push(Finding::StepFailed {
                step: failed.step.clone(),
                detail: failed.detail.clone(),
            });
        }
        if let Some(ref next_step) = run.stopped_before {
            findings.push(Finding::Aborted {
                next_step: next_step.clone(),
            });
        }
        findings.extend(assessment.findings);

        let overall = findings
            .iter()
            .map(Finding::severity)
            .fold(OverallStatus::Converged, OverallStatus::worst);

        let report = ClusterStatusReport {
            run_id: self.log.run_id().to_string(),
            generated_at: Utc::now(),
            overall,
            findings,
            primary: assessment.primary,
            standby: assessment.standby,
            first_failed_step: first_failed.map(|o| o.step.clone()),
            outcomes: run.outcomes,
        };
        info!(run_id = %report.run_id, overall = %report.overall, "convergence run finished");
        Ok(report)
    }

    /// Run `steps` against one instance with the same halt/retry/log policy.
    /// Used for single-instance setup pipelines; no assessment follows.
    pub fn apply(
        &mut self,
        instance: &InstanceHandle,
        steps: &[StepDefinition],
    ) -> Result<Vec<StepOutcome>, ConvergeError> {
        check_unique_names(steps)?;
        let mut bindings = self.bindings.clone();
        bindings.insert("instance_id".into(), instance.id().to_string());
        bindings.insert(
            "sys_password".into(),
            instance.credentials().sys_password.expose().to_string(),
        );
        check_variables(steps, &bindings)?;

        info!(run_id = self.log.run_id(), instance = instance.id(), "setup run started");
        let run = self.run_steps(Scope::Single(instance), steps, &mut bindings)?;
        Ok(run.outcomes)
    }

    // -------------------------------------------------------------------
    // Step loop
    // -------------------------------------------------------------------

    fn run_steps(
        &mut self,
        scope: Scope<'_>,
        steps: &[StepDefinition],
        bindings: &mut Bindings,
    ) -> Result<PipelineRun, ConvergeError> {
        let key = scope.key();
        let mut outcomes = Vec::with_capacity(steps.len());
        let mut stopped_before = None;
        let mut halt: Option<String> = None;

        for (idx, step) in steps.iter().enumerate() {
            let skip_reason = if let Some(ref reason) = halt {
                Some(reason.clone())
            } else if self.abort.is_aborted() {
                stopped_before = Some(step.name.clone());
                halt = Some("run aborted".to_string());
                halt.clone()
            } else {
                None
            };

            let outcome = match skip_reason {
                Some(reason) => StepOutcome::skipped(&step.name, &reason, Utc::now()),
                None => self.run_step(scope, &key, step, bindings),
            };
            debug!(step = %step.name, result = %outcome.result, "outcome recorded");
            self.log.append(&key, &outcome)?;

            if halt.is_none() {
                if outcome.is_failed() {
                    halt = Some(format!("halted: step '{}' failed", step.name));
                } else if self.config.stop_after.as_deref() == Some(step.name.as_str()) {
                    if let Some(next) = steps.get(idx + 1) {
                        info!(step = %step.name, "stopping after requested step");
                        stopped_before = Some(next.name.clone());
                        halt = Some(format!("stopped after '{}'", step.name));
                    }
                }
            }
            outcomes.push(outcome);
        }

        Ok(PipelineRun {
            outcomes,
            stopped_before,
        })
    }

    fn run_step(
        &self,
        scope: Scope<'_>,
        key: &str,
        step: &StepDefinition,
        bindings: &mut Bindings,
    ) -> StepOutcome {
        let started_at = Utc::now();
        let hosts = scope.hosts(step);
        let instances = hosts.iter().map(|h| h.id().to_string()).collect();
        info!(step = %step.name, target = ?step.target, "step started");

        if step.idempotency == Idempotency::RunOnce {
            if let Some(prior) = self.prior.last_success(key, &step.name) {
                bindings.extend(prior.captured.clone());
                let captured = prior.captured.clone();
                let checked = hosts
                    .iter()
                    .try_for_each(|h| self.check_postcondition(step, h, bindings));
                let (result, detail) = match checked {
                    Ok(()) => (
                        StepResult::Ok,
                        "applied in an earlier run; postcondition holds".to_string(),
                    ),
                    Err(e) => (
                        StepResult::Failed,
                        format!("applied in an earlier run but {}; not re-running", e),
                    ),
                };
                info!(step = %step.name, %result, "run-once step resumed");
                return finish(step, started_at, result, detail, 0, instances, captured);
            }
        }

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let mut captured = BTreeMap::new();
            match self.attempt(scope, step, &hosts, bindings, &mut captured) {
                Ok(()) => {
                    info!(step = %step.name, attempts, "step ok");
                    let detail = if attempts > 1 {
                        format!("postcondition holds after {} attempts", attempts)
                    } else {
                        "postcondition holds".to_string()
                    };
                    return finish(step, started_at, StepResult::Ok, detail, attempts, instances, captured);
                }
                Err(e) => {
                    let retry = attempts - 1;
                    if step.retryable && e.is_retryable() && self.config.retry.should_retry(retry) {
                        let delay = self.config.retry.delay(retry);
                        warn!(step = %step.name, attempt = attempts, max_attempts = self.config.retry.max_attempts(), error = %e, delay_ms = delay.as_millis() as u64, "step failed, retrying");
                        thread::sleep(delay);
                        continue;
                    }
                    warn!(step = %step.name, attempts, error = %e, "step failed");
                    return finish(
                        step,
                        started_at,
                        StepResult::Failed,
                        e.to_string(),
                        attempts,
                        instances,
                        BTreeMap::new(),
                    );
                }
            }
        }
    }

    fn attempt(
        &self,
        scope: Scope<'_>,
        step: &StepDefinition,
        hosts: &[&InstanceHandle],
        bindings: &mut Bindings,
        captured: &mut BTreeMap<String, String>,
    ) -> Result<(), StepError> {
        let timeout = self.timeout_for(step);
        for host in hosts {
            let local = with_target(bindings, host);
            let command = template::render(&step.command, &local)?;
            debug!(step = %step.name, instance = host.id(), bytes = command.len(), "executing");
            let script = format!("# dgc step={}\n{}", step.name, command);
            let out = self.executor.execute(host, &script, timeout)?;
            if !out.succeeded() {
                return Err(StepError::NonZeroExit {
                    instance: host.id().to_string(),
                    code: out.exit_code,
                    tail: out.tail().to_string(),
                });
            }

            for cap in step.captures.iter().filter(|c| scope.captures_from(host, c.from)) {
                let value = cap.extract(&out.stdout).ok_or_else(|| StepError::EmptyCapture {
                    instance: host.id().to_string(),
                    variable: cap.variable.clone(),
                })?;
                if !cap.sensitive {
                    captured.insert(cap.variable.clone(), value.clone());
                }
                bindings.insert(cap.variable.clone(), value);
            }

            self.check_postcondition(step, host, bindings)?;
        }
        Ok(())
    }

    fn check_postcondition(
        &self,
        step: &StepDefinition,
        host: &InstanceHandle,
        bindings: &Bindings,
    ) -> Result<(), StepError> {
        let local = with_target(bindings, host);
        let query = template::render(&step.postcondition.query, &local)?;
        let expect = step.postcondition.expect.render(&local)?;
        let script = format!("# dgc check={}\n{}", step.name, query);
        let out = self.executor.execute(host, &script, self.timeout_for(step))?;
        if expect.holds(&out) {
            Ok(())
        } else {
            Err(StepError::Postcondition {
                instance: host.id().to_string(),
                expected: expect.describe(),
                observed: out.tail().to_string(),
            })
        }
    }

    fn timeout_for(&self, step: &StepDefinition) -> Duration {
        step.timeout.unwrap_or(self.config.default_step_timeout)
    }
}

struct PipelineRun {
    outcomes: Vec<StepOutcome>,
    /// First step not run because of an abort or a requested stop.
    stopped_before: Option<String>,
}

fn finish(
    step: &StepDefinition,
    started_at: DateTime<Utc>,
    result: StepResult,
    detail: String,
    attempts: u32,
    instances: Vec<String>,
    captured: BTreeMap<String, String>,
) -> StepOutcome {
    StepOutcome {
        step: step.name.clone(),
        started_at,
        finished_at: Utc::now(),
        result,
        detail,
        attempts,
        instances,
        captured,
    }
}

/// `<primary>-<standby>-<UTC timestamp>`.
pub fn new_run_id(primary: &str, standby: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}-{}", primary, standby, at.format("%Y%m%dT%H%M%S%.3fZ"))
}

// ---------------------------------------------------------------------------
// Bindings and validation
// ---------------------------------------------------------------------------

fn seed_bindings(primary: &InstanceHandle, standby: &InstanceHandle) -> Bindings {
    let mut b = Bindings::new();
    b.insert("primary_id".into(), primary.id().to_string());
    b.insert("standby_id".into(), standby.id().to_string());
    b.insert("primary_address".into(), primary.address().to_string());
    b.insert("standby_address".into(), standby.address().to_string());
    b.insert(
        "sys_password".into(),
        primary.credentials().sys_password.expose().to_string(),
    );
    b
}

fn with_target(bindings: &Bindings, host: &InstanceHandle) -> Bindings {
    let mut local = bindings.clone();
    local.insert("target_id".into(), host.id().to_string());
    local.insert("target_address".into(), host.address().to_string());
    local
}

fn check_unique_names(steps: &[StepDefinition]) -> Result<(), ConvergeError> {
    let mut seen = HashSet::new();
    for step in steps {
        if step.name.trim().is_empty() {
            return Err(ConvergeError::InvalidPipeline("step with empty name".into()));
        }
        if !seen.insert(step.name.as_str()) {
            return Err(ConvergeError::InvalidPipeline(format!(
                "duplicate step name '{}'",
                step.name
            )));
        }
    }
    Ok(())
}

/// Every variable a step references must be bound before the step runs: by
/// the caller, by the seeded instance values, or by an earlier capture. A
/// step's own captures are visible to its postcondition only.
fn check_variables(steps: &[StepDefinition], initial: &Bindings) -> Result<(), ConvergeError> {
    let mut known: HashSet<String> = initial.keys().cloned().collect();
    known.insert("target_id".into());
    known.insert("target_address".into());

    for step in steps {
        if let Some(var) = template::variables(&step.command)
            .into_iter()
            .find(|v| !known.contains(v))
        {
            return Err(ConvergeError::InvalidPipeline(format!(
                "step '{}' command uses '{}' before it is bound",
                step.name, var
            )));
        }
        known.extend(step.captures.iter().map(|c| c.variable.clone()));
        if let Some(var) = step
            .referenced_variables()
            .into_iter()
            .find(|v| !known.contains(v))
        {
            return Err(ConvergeError::InvalidPipeline(format!(
                "step '{}' postcondition uses '{}' before it is bound",
                step.name, var
            )));
        }
    }
    Ok(())
}

/// Structural checks run before any step touches an instance.
pub fn validate_pipeline(
    primary: &InstanceHandle,
    standby: &InstanceHandle,
    steps: &[StepDefinition],
    extra: &Bindings,
) -> Result<(), ConvergeError> {
    if primary.role() != Role::Primary {
        return Err(ConvergeError::InvalidPipeline(format!(
            "{} is passed as primary but has role {}",
            primary.id(),
            primary.role()
        )));
    }
    if standby.role() != Role::Standby {
        return Err(ConvergeError::InvalidPipeline(format!(
            "{} is passed as standby but has role {}",
            standby.id(),
            standby.role()
        )));
    }
    if primary.id() == standby.id() {
        return Err(ConvergeError::InvalidPipeline(format!(
            "primary and standby are the same instance '{}'",
            primary.id()
        )));
    }
    check_unique_names(steps)?;
    for step in steps {
        if let Some(cap) = step.captures.iter().find(|c| !step.target.includes(c.from)) {
            return Err(ConvergeError::InvalidPipeline(format!(
                "step '{}' captures '{}' from {} which it does not target",
                step.name, cap.variable, cap.from
            )));
        }
    }
    let mut initial = extra.clone();
    initial.extend(seed_bindings(primary, standby));
    check_variables(steps, &initial)
}
