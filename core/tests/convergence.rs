//! End-to-end convergence runs against a simulated primary/standby pair.
//!
//! `SimulatedDataGuard` stands in for two hosts. It remembers which steps
//! have taken effect on which instance, answers postcondition checks from
//! that memory, and answers the verifier's queries from the resulting
//! replication state. Failures and disconnects are injected per test.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use dgc_core::convergence::{
    ConvergeError, ConvergenceOrchestrator, OrchestratorConfig, RetryPolicy,
};
use dgc_core::infrastructure::{ExecOutput, ExecutionError, RemoteExecutor};
use dgc_core::pipeline::{dataguard_pipeline, DataGuardNames, DataGuardOptions};
use dgc_core::runlog::{pair_key, RunLog, RunLogWriter};
use dgc_core::types::config::BackoffStrategy;
use dgc_core::types::{
    ClusterStatusReport, Credentials, DestinationStatus, Expectation, Finding, InstanceHandle,
    OverallStatus, Role, Secret, StepDefinition, StepResult,
};
use dgc_core::verify::VerifierConfig;

const ORAPW_MD5: &str = "5f4dcc3b5aa765d61d8327deb882cf99";
const ALWAYS: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// Simulated pair
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SimState {
    applied: HashSet<(String, String)>,
    runs: Vec<(String, String)>,
    failures: HashMap<(String, String), u32>,
    dest_error: Option<String>,
    down: HashSet<String>,
    /// Instances that drop off the network at their first status query.
    drop_on_assess: HashSet<String>,
}

struct SimulatedDataGuard {
    expectations: HashMap<String, Expectation>,
    state: Mutex<SimState>,
}

impl SimulatedDataGuard {
    fn new(steps: &[StepDefinition]) -> Self {
        SimulatedDataGuard {
            expectations: steps
                .iter()
                .map(|s| (s.name.clone(), s.postcondition.expect.clone()))
                .collect(),
            state: Mutex::new(SimState::default()),
        }
    }

    fn fail(&self, instance: &str, step: &str, times: u32) {
        let mut st = self.state.lock().unwrap();
        st.failures.insert((instance.into(), step.into()), times);
    }

    fn break_destination(&self, error: &str) {
        self.state.lock().unwrap().dest_error = Some(error.into());
    }

    fn take_down(&self, instance: &str) {
        self.state.lock().unwrap().down.insert(instance.into());
    }

    fn disconnect_at_assessment(&self, instance: &str) {
        self.state.lock().unwrap().drop_on_assess.insert(instance.into());
    }

    fn runs_of(&self, instance: &str, step: &str) -> usize {
        let st = self.state.lock().unwrap();
        st.runs.iter().filter(|(i, s)| i == instance && s == step).count()
    }

    fn ran(&self, step: &str) -> bool {
        self.state.lock().unwrap().runs.iter().any(|(_, s)| s == step)
    }

    fn check_output(&self, step: &str) -> ExecOutput {
        match self.expectations.get(step) {
            Some(Expectation::StdoutContains(t)) => ExecOutput::success(format!("{}\n", t)),
            Some(Expectation::StdoutEquals(t)) => {
                ExecOutput::success(format!("{}\n", t.replace("{{orapw_md5}}", ORAPW_MD5)))
            }
            Some(Expectation::ExitZero) => ExecOutput::success(""),
            None => ExecOutput::failure(127, format!("unknown check {}", step)),
        }
    }
}

impl RemoteExecutor for SimulatedDataGuard {
    fn execute(
        &self,
        instance: &InstanceHandle,
        command: &str,
        _timeout: Duration,
    ) -> Result<ExecOutput, ExecutionError> {
        let id = instance.id().to_string();
        let header = command.lines().next().unwrap_or("");
        let mut st = self.state.lock().unwrap();
        if st.down.contains(&id) {
            return Err(ExecutionError::Unreachable {
                instance: id,
                reason: "ssh: connect to host port 22: Connection timed out".into(),
            });
        }
        if header.starts_with("# dgc assess=") && st.drop_on_assess.remove(&id) {
            st.down.insert(id.clone());
            return Err(ExecutionError::Unreachable {
                instance: id,
                reason: "Connection to 10.150.0.2 closed by remote host".into(),
            });
        }

        if let Some(step) = header.strip_prefix("# dgc step=") {
            st.runs.push((id.clone(), step.to_string()));
            if let Some(left) = st.failures.get_mut(&(id.clone(), step.to_string())) {
                if *left > 0 {
                    if *left != ALWAYS {
                        *left -= 1;
                    }
                    return Ok(ExecOutput::failure(1, "ORA-12541: TNS:no listener"));
                }
            }
            st.applied.insert((id, step.to_string()));
            if step == "export_password_file" {
                return Ok(ExecOutput::success(format!(
                    "ORAPW_MD5={}\nORAPW_B64=b3JhcHcgYnl0ZXM=\n",
                    ORAPW_MD5
                )));
            }
            return Ok(ExecOutput::success(""));
        }

        if let Some(step) = header.strip_prefix("# dgc check=") {
            if st.applied.contains(&(id, step.to_string())) {
                return Ok(self.check_output(step));
            }
            return Ok(ExecOutput::failure(1, "not configured"));
        }

        if header == "# dgc assess=destinations" {
            let shipping = st.applied.contains(&(id, "enable_log_shipping".to_string()));
            let dest2 = match (&st.dest_error, shipping) {
                (Some(err), _) => format!("DEST|2|ERROR|{}|ORA1_STBY", err),
                (None, true) => "DEST|2|VALID||ORA1_STBY".to_string(),
                (None, false) => "DEST|2|DEFERRED||ORA1_STBY".to_string(),
            };
            return Ok(ExecOutput::success(format!(
                "DEST|1|VALID||USE_DB_RECOVERY_FILE_DEST\n{}\n",
                dest2
            )));
        }

        if header == "# dgc assess=apply" {
            if !st.applied.contains(&(id.clone(), "duplicate_database".to_string())) {
                return Ok(ExecOutput::success("ROLE|PRIMARY|READ WRITE\n"));
            }
            let mut out = String::from("ROLE|PHYSICAL STANDBY|MOUNTED\n");
            if st.applied.contains(&(id, "start_managed_recovery".to_string())) {
                out.push_str("MRP|MRP0|APPLYING_LOG\nLAG|+00 00:00:00\n");
            }
            return Ok(ExecOutput::success(out));
        }

        Ok(ExecOutput::failure(2, "unrecognised script"))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn handle(id: &str, role: Role) -> InstanceHandle {
    let n = id.trim_start_matches("ora-");
    InstanceHandle::new(
        id,
        role,
        format!("10.150.0.{}", n),
        Credentials {
            ssh_user: None,
            sys_password: Secret::new("DataGu4rd#2025"),
        },
    )
    .unwrap()
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry: RetryPolicy::new(2, BackoffStrategy::Fixed, 0),
        default_step_timeout: Duration::from_secs(5),
        verifier: VerifierConfig::default(),
        stop_after: None,
    }
}

fn converge(
    sim: &SimulatedDataGuard,
    primary: &str,
    standby: &str,
    steps: &[StepDefinition],
    log: RunLogWriter,
    prior: RunLog,
) -> Result<ClusterStatusReport, ConvergeError> {
    let names = DataGuardNames::derive(primary, standby).unwrap();
    ConvergenceOrchestrator::new(sim, config(), log)
        .with_bindings(names.bindings())
        .with_prior(prior)
        .converge(
            &handle(primary, Role::Primary),
            &handle(standby, Role::Standby),
            steps,
        )
}

fn fresh_run(sim: &SimulatedDataGuard, steps: &[StepDefinition]) -> ClusterStatusReport {
    converge(sim, "ora-1", "ora-2", steps, RunLogWriter::in_memory("test-run"), RunLog::default())
        .unwrap()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn fresh_pair_converges() {
    let steps = dataguard_pipeline(&DataGuardOptions::default());
    let sim = SimulatedDataGuard::new(&steps);
    let report = fresh_run(&sim, &steps);

    assert_eq!(report.overall, OverallStatus::Converged, "{}", report.render_text());
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.outcomes.len(), steps.len());
    assert!(report.outcomes.iter().all(|o| o.result == StepResult::Ok));
    assert!(report.findings.is_empty());
    assert_eq!(report.first_failed_step, None);

    // Both-target steps touch the primary first.
    let tns = report.outcomes.iter().find(|o| o.step == "configure_tns_entries").unwrap();
    assert_eq!(tns.instances, vec!["ora-1", "ora-2"]);
    assert_eq!(report.standby.apply.as_ref().and_then(|a| a.apply_lag_secs), Some(0));
    assert!(!report.primary.destinations.is_empty());
    assert!(report
        .primary
        .destinations
        .iter()
        .all(|d| d.status == DestinationStatus::Valid));
}

#[test]
fn password_content_never_reaches_the_log() {
    let steps = dataguard_pipeline(&DataGuardOptions::default());
    let sim = SimulatedDataGuard::new(&steps);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.jsonl");

    let report = converge(
        &sim,
        "ora-1",
        "ora-2",
        &steps,
        RunLogWriter::open(&path, "run-1", 0).unwrap(),
        RunLog::default(),
    )
    .unwrap();
    assert!(report.is_converged());

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.contains(ORAPW_MD5));
    assert!(!raw.contains("b3JhcHcgYnl0ZXM="));
    assert!(!raw.contains("DataGu4rd#2025"));
}

#[test]
fn second_run_changes_nothing_and_skips_duplication() {
    let steps = dataguard_pipeline(&DataGuardOptions::default());
    let sim = SimulatedDataGuard::new(&steps);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.jsonl");

    let first = converge(
        &sim,
        "ora-1",
        "ora-2",
        &steps,
        RunLogWriter::open(&path, "run-1", 0).unwrap(),
        RunLog::default(),
    )
    .unwrap();
    assert!(first.is_converged());

    let prior = RunLog::load(&path).unwrap();
    let writer = RunLogWriter::open(&path, "run-2", prior.next_sequence()).unwrap();
    let second = converge(&sim, "ora-1", "ora-2", &steps, writer, prior).unwrap();

    assert!(second.is_converged(), "{}", second.render_text());
    assert!(second.outcomes.iter().all(|o| o.is_ok()));
    assert_eq!(sim.runs_of("ora-2", "duplicate_database"), 1);
    assert_eq!(sim.runs_of("ora-2", "remove_standby_database"), 1);
    assert_eq!(sim.runs_of("ora-1", "configure_tns_entries"), 2);

    let dup = second.outcomes.iter().find(|o| o.step == "duplicate_database").unwrap();
    assert_eq!(dup.attempts, 0);

    let log = RunLog::load(&path).unwrap();
    assert_eq!(log.runs(), vec!["run-1", "run-2"]);
    assert_eq!(log.entries().len(), steps.len() * 2);
}

#[test]
fn failed_step_halts_the_pipeline() {
    let steps = dataguard_pipeline(&DataGuardOptions::default());
    let sim = SimulatedDataGuard::new(&steps);
    sim.fail("ora-2", "configure_static_listener", ALWAYS);

    let report = fresh_run(&sim, &steps);

    assert_eq!(report.overall, OverallStatus::Diverged);
    assert_eq!(report.first_failed_step.as_deref(), Some("configure_static_listener"));
    let failed_at = report
        .outcomes
        .iter()
        .position(|o| o.result == StepResult::Failed)
        .unwrap();
    assert!(report.outcomes[..failed_at].iter().all(|o| o.is_ok()));
    assert!(report.outcomes[failed_at + 1..]
        .iter()
        .all(|o| o.result == StepResult::Skipped));
    assert!(report.outcomes[failed_at].detail.contains("ORA-12541"));
    assert!(!sim.ran("enable_log_shipping"));
    assert!(matches!(
        report.findings.first(),
        Some(Finding::StepFailed { step, .. }) if step == "configure_static_listener"
    ));
}

#[test]
fn retryable_step_recovers() {
    let steps = dataguard_pipeline(&DataGuardOptions::default());
    let sim = SimulatedDataGuard::new(&steps);
    sim.fail("ora-2", "start_managed_recovery", 1);

    let report = fresh_run(&sim, &steps);

    assert!(report.is_converged(), "{}", report.render_text());
    let mrp = report.outcomes.iter().find(|o| o.step == "start_managed_recovery").unwrap();
    assert_eq!(mrp.attempts, 2);
}

#[test]
fn destination_error_is_diverged_with_the_oracle_error() {
    let steps = dataguard_pipeline(&DataGuardOptions::default());
    let sim = SimulatedDataGuard::new(&steps);
    sim.break_destination("ORA-16191: Primary log shipping client not logged on standby");

    let report = fresh_run(&sim, &steps);

    // Every step succeeded; only the verifier sees the broken transport.
    assert!(report.outcomes.iter().all(|o| o.is_ok()));
    assert_eq!(report.overall, OverallStatus::Diverged);
    assert_eq!(report.exit_code(), 1);
    assert!(report.findings.iter().any(|f| matches!(
        f,
        Finding::DestinationError { dest_id: 2, error, .. } if error.starts_with("ORA-16191")
    )));
    assert!(report.render_text().contains("ORA-16191"));
}

#[test]
fn unreachable_standby_is_reported() {
    let steps = dataguard_pipeline(&DataGuardOptions::default());
    let sim = SimulatedDataGuard::new(&steps);
    sim.take_down("ora-2");

    let report = fresh_run(&sim, &steps);

    assert_eq!(report.overall, OverallStatus::Diverged);
    assert_eq!(report.first_failed_step.as_deref(), Some("configure_bash_profiles"));
    assert!(report.primary.reachable);
    assert!(!report.standby.reachable);
    assert!(report
        .findings
        .iter()
        .any(|f| matches!(f, Finding::Unreachable { instance, .. } if instance == "ora-2")));
}

#[test]
fn standby_lost_during_assessment_is_diverged() {
    let steps = dataguard_pipeline(&DataGuardOptions::default());
    let sim = SimulatedDataGuard::new(&steps);
    sim.disconnect_at_assessment("ora-2");

    let report = fresh_run(&sim, &steps);

    assert!(report.outcomes.iter().all(|o| o.is_ok()));
    assert_eq!(report.first_failed_step, None);
    assert_eq!(report.overall, OverallStatus::Diverged);
    assert_eq!(report.exit_code(), 1);
    assert!(report.primary.reachable);
    assert!(!report.standby.reachable);
    assert!(report
        .findings
        .iter()
        .any(|f| matches!(f, Finding::Unreachable { instance, .. } if instance == "ora-2")));
    assert!(!report.findings.iter().any(|f| matches!(f, Finding::StepFailed { .. })));
}

#[test]
fn no_report_when_both_instances_are_unreachable() {
    let steps = dataguard_pipeline(&DataGuardOptions::default());
    let sim = SimulatedDataGuard::new(&steps);
    sim.take_down("ora-1");
    sim.take_down("ora-2");

    let err = converge(
        &sim,
        "ora-1",
        "ora-2",
        &steps,
        RunLogWriter::in_memory("test-run"),
        RunLog::default(),
    )
    .unwrap_err();
    assert!(matches!(err, ConvergeError::NoReport { .. }));
}

#[test]
fn skipping_duplication_leaves_standby_unconverted() {
    let steps = dataguard_pipeline(&DataGuardOptions {
        skip_primary_config: false,
        skip_duplication: true,
    });
    let sim = SimulatedDataGuard::new(&dataguard_pipeline(&DataGuardOptions::default()));

    let report = fresh_run(&sim, &steps);

    // The simulation lets recovery start anyway; the verifier still sees the
    // old database role.
    assert!(report.findings.iter().any(|f| matches!(f, Finding::RoleMismatch { .. })));
    assert_ne!(report.overall, OverallStatus::Converged);
}

#[test]
fn concurrent_pairs_keep_separate_logs() {
    let steps = dataguard_pipeline(&DataGuardOptions::default());
    let dir = tempfile::tempdir().unwrap();
    let pairs = [("ora-1", "ora-2"), ("ora-3", "ora-4")];

    let reports: Vec<ClusterStatusReport> = std::thread::scope(|s| {
        let handles: Vec<_> = pairs
            .iter()
            .map(|(p, sb)| {
                let steps = &steps;
                let path = dir.path().join(format!("{}-{}.jsonl", p, sb));
                s.spawn(move || {
                    let sim = SimulatedDataGuard::new(steps);
                    let log = RunLogWriter::open(&path, &format!("run-{}", p), 0).unwrap();
                    converge(&sim, p, sb, steps, log, RunLog::default()).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for ((p, sb), report) in pairs.iter().zip(&reports) {
        assert!(report.is_converged(), "{}", report.render_text());
        let log = RunLog::load(&dir.path().join(format!("{}-{}.jsonl", p, sb))).unwrap();
        assert_eq!(log.entries().len(), steps.len());
        assert!(log.entries().iter().all(|e| e.pair == pair_key(p, sb)));
    }
}
