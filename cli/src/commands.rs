//! Subcommand bodies. Each returns the process exit code.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use dgc_core::convergence::{new_run_id, ConvergeError, ConvergenceOrchestrator, OrchestratorConfig};
use dgc_core::infrastructure::runner::{CommandRunner, ProcessRunner};
use dgc_core::infrastructure::ssh::GcloudSshExecutor;
use dgc_core::pipeline::{
    dataguard_pipeline, instance_setup_pipeline, kernel_pipeline, DataGuardNames, DataGuardOptions,
    SetupLayout, SetupOptions,
};
use dgc_core::provision::{
    gcloud_config_value, GcloudProvisioner, GcsMediaSource, InstanceSpec, MediaSource, Provisioner,
};
use dgc_core::runlog::{RunLog, RunLogWriter};
use dgc_core::settings;
use dgc_core::types::config::Settings;
use dgc_core::types::{
    ClusterStatusReport, Idempotency, InstanceHandle, Role, Secret, StepDefinition, StepOutcome,
};
use dgc_core::verify::StatusVerifier;

use crate::{Cli, Command, ConvergeArgs, PairArgs, ProvisionArgs};

/// No report could be produced.
const EXIT_NO_REPORT: i32 = 2;

pub fn run(cli: &Cli) -> Result<i32> {
    let settings = settings::load_or_default(cli.config.as_deref()).context("loading settings")?;
    match cli.command {
        Command::Steps { setup } => {
            print!("{}", list_steps(setup));
            Ok(0)
        }
        Command::Provision(ref args) => provision(cli, &settings, args),
        Command::Converge(ref args) => converge(cli, &settings, args),
        Command::Status(ref args) => status(cli, &settings, args),
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// The gcloud-backed collaborators every remote subcommand needs.
struct Cloud {
    runner: Arc<dyn CommandRunner>,
    project: String,
    zone: String,
    provisioner: GcloudProvisioner,
}

impl Cloud {
    fn connect(cli: &Cli, settings: &Settings) -> Result<Self> {
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());
        let project = pick(cli.project.as_ref(), settings.project.as_ref(), || {
            gcloud_config_value(runner.as_ref(), "project")
        })?
        .context("no cloud project: pass --project, set `project` in dgc.yaml, or run `gcloud config set project`")?;
        let zone = pick(cli.zone.as_ref(), settings.zone.as_ref(), || {
            gcloud_config_value(runner.as_ref(), "compute/zone")
        })?
        .context("no cloud zone: pass --zone, set `zone` in dgc.yaml, or run `gcloud config set compute/zone`")?;
        info!(project = %project, zone = %zone, "using cloud location");

        let provisioner = GcloudProvisioner::new(
            runner.clone(),
            &project,
            &zone,
            settings.ssh_user.clone(),
            Secret::new(cli.sys_password.clone()),
        )
        .with_ready_timeout(std::time::Duration::from_secs(settings.ready_timeout_secs));
        Ok(Cloud {
            runner,
            project,
            zone,
            provisioner,
        })
    }

    fn executor(&self) -> GcloudSshExecutor {
        GcloudSshExecutor::new(self.runner.clone(), &self.project, &self.zone)
    }
}

/// Flag, then settings file, then the gcloud fallback.
fn pick<E>(
    flag: Option<&String>,
    file: Option<&String>,
    fallback: impl FnOnce() -> std::result::Result<Option<String>, E>,
) -> Result<Option<String>>
where
    E: std::error::Error + Send + Sync + 'static,
{
    if let Some(v) = flag.or(file) {
        return Ok(Some(v.clone()));
    }
    Ok(fallback()?)
}

fn open_log(path: &Path, run_id: &str) -> Result<(RunLog, RunLogWriter)> {
    let prior = RunLog::load(path).with_context(|| format!("reading run log {}", path.display()))?;
    if !prior.is_empty() {
        info!(path = %path.display(), previous_runs = prior.runs().len(), "resuming from run log");
    }
    let writer = RunLogWriter::open(path, run_id, prior.next_sequence())
        .with_context(|| format!("opening run log {}", path.display()))?;
    Ok((prior, writer))
}

/// Runs against different instances or pairs may happen at once, and a log
/// has exactly one writer, so each scope gets its own file beside the
/// configured one.
fn scoped_log_path(base: &Path, scope: &str) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dgc-run".to_string());
    let ext = base
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "jsonl".to_string());
    base.with_file_name(format!("{}-{}.{}", stem, scope, ext))
}

fn pair_log_path(base: &Path, primary: &str, standby: &str) -> PathBuf {
    scoped_log_path(base, &format!("{}-{}", primary, standby))
}

fn report_path(run_log: &Path, run_id: &str) -> PathBuf {
    run_log.with_file_name(format!("{}.report.json", run_id))
}

// ---------------------------------------------------------------------------
// provision
// ---------------------------------------------------------------------------

fn provision(cli: &Cli, settings: &Settings, args: &ProvisionArgs) -> Result<i32> {
    let cloud = Cloud::connect(cli, settings)?;
    if args.delete {
        let deleted = cloud.provisioner.delete(&args.instance)?;
        info!(instance = %args.instance, deleted, "delete finished");
        return Ok(0);
    }

    let bucket = args.swlib_bucket.clone().unwrap_or_else(|| settings.swlib_bucket.clone());
    let version = args.media_version.clone().unwrap_or_else(|| settings.media_version.clone());
    let mut settings = settings.clone();
    if let Some(ref extra) = args.extra_diskgroups {
        settings.extra_diskgroups = extra.clone();
    }
    let layout = SetupLayout::new(&args.instance, &settings.extra_diskgroups, &bucket, &version)?;

    if !args.skip_install {
        let media = GcsMediaSource::new(cloud.runner.clone(), &settings.media_cache_dir);
        let manifest = media.fetch(&bucket, &version).context("staging installation media")?;
        info!(manifest = %manifest.display(), "installation media available");
    }

    let spec = InstanceSpec::new(&args.instance, Role::Primary, &settings)?;
    let instance = if args.skip_create {
        cloud.provisioner.resolve(&args.instance, Role::Primary)?
    } else {
        cloud.provisioner.provision(&spec)?
    };

    let log_path = scoped_log_path(args.run_log.as_deref().unwrap_or(&settings.run_log), &args.instance);
    let run_id = new_run_id(&args.instance, "setup", Utc::now());
    let (prior, writer) = open_log(&log_path, &run_id)?;
    let executor = cloud.executor();
    let mut orchestrator =
        ConvergenceOrchestrator::new(&executor, OrchestratorConfig::from_settings(&settings), writer)
            .with_bindings(layout.bindings())
            .with_prior(prior);

    let mut outcomes = Vec::new();
    if !args.skip_kernel {
        let kernel = orchestrator.apply(&instance, &kernel_pipeline())?;
        let reboot = kernel
            .iter()
            .any(|o| o.captured.get("reboot_required").map(String::as_str) == Some("yes"));
        let ok = kernel.iter().all(StepOutcome::is_ok);
        outcomes.extend(kernel);
        if !ok {
            print!("{}", render_outcomes(&instance_title(&args.instance, &run_id), &outcomes));
            return Ok(1);
        }
        if reboot {
            cloud.provisioner.reset(&args.instance)?;
        }
    }

    let opts = SetupOptions {
        skip_install: args.skip_install,
        skip_asmfd: args.skip_asmfd,
    };
    outcomes.extend(orchestrator.apply(&instance, &instance_setup_pipeline(&opts))?);

    print!("{}", render_outcomes(&instance_title(&args.instance, &run_id), &outcomes));
    Ok(if outcomes.iter().all(StepOutcome::is_ok) { 0 } else { 1 })
}

fn instance_title(instance: &str, run_id: &str) -> String {
    format!("Instance {} setup (run {})", instance, run_id)
}

fn render_outcomes(title: &str, outcomes: &[StepOutcome]) -> String {
    let mut out = format!("{}\n", title);
    for o in outcomes {
        out.push_str(&format!("  {:<8} {:<32} {}\n", o.result, o.step, o.detail));
    }
    out
}

// ---------------------------------------------------------------------------
// converge / status
// ---------------------------------------------------------------------------

fn resolve_pair(cloud: &Cloud, pair: &PairArgs) -> Result<(InstanceHandle, InstanceHandle)> {
    if pair.primary == pair.standby {
        bail!("primary and standby must be different instances");
    }
    let primary = cloud
        .provisioner
        .resolve(&pair.primary, Role::Primary)
        .with_context(|| format!("resolving primary {}", pair.primary))?;
    let standby = cloud
        .provisioner
        .resolve(&pair.standby, Role::Standby)
        .with_context(|| format!("resolving standby {}", pair.standby))?;
    Ok((primary, standby))
}

fn converge(cli: &Cli, settings: &Settings, args: &ConvergeArgs) -> Result<i32> {
    let cloud = Cloud::connect(cli, settings)?;
    let (primary, standby) = resolve_pair(&cloud, &args.pair)?;
    let names = DataGuardNames::derive(primary.id(), standby.id())?;
    let steps = dataguard_pipeline(&DataGuardOptions {
        skip_primary_config: args.skip_primary_config,
        skip_duplication: args.skip_duplication,
    });

    let log_path = pair_log_path(
        args.run_log.as_deref().unwrap_or(&settings.run_log),
        primary.id(),
        standby.id(),
    );
    let run_id = new_run_id(primary.id(), standby.id(), Utc::now());
    let (prior, writer) = open_log(&log_path, &run_id)?;

    let mut config = OrchestratorConfig::from_settings(settings);
    config.stop_after = args.stop_after.clone();
    if let Some(ref stop) = config.stop_after {
        if !steps.iter().any(|s| &s.name == stop) {
            bail!("--stop-after names unknown step '{}'", stop);
        }
    }

    let executor = cloud.executor();
    let mut orchestrator = ConvergenceOrchestrator::new(&executor, config, writer)
        .with_bindings(names.bindings())
        .with_prior(prior);

    match orchestrator.converge(&primary, &standby, &steps) {
        Ok(report) => {
            publish(&report, &report_path(&log_path, &run_id))?;
            Ok(report.exit_code())
        }
        Err(e @ ConvergeError::NoReport { .. }) => {
            warn!(error = %e, "no status report");
            eprintln!("dgc: {}", e);
            Ok(EXIT_NO_REPORT)
        }
        Err(e) => Err(e).context("convergence run"),
    }
}

fn status(cli: &Cli, settings: &Settings, args: &PairArgs) -> Result<i32> {
    let cloud = Cloud::connect(cli, settings)?;
    let (primary, standby) = resolve_pair(&cloud, args)?;
    let executor = cloud.executor();
    let config = OrchestratorConfig::from_settings(settings);
    let assessment = StatusVerifier::new(&executor, config.verifier).assess(&primary, &standby);
    if assessment.both_unreachable() {
        eprintln!("dgc: neither {} nor {} is reachable", primary.id(), standby.id());
        return Ok(EXIT_NO_REPORT);
    }
    let report = ClusterStatusReport {
        run_id: new_run_id(primary.id(), standby.id(), Utc::now()),
        generated_at: Utc::now(),
        overall: assessment.overall,
        findings: assessment.findings,
        primary: assessment.primary,
        standby: assessment.standby,
        outcomes: Vec::new(),
        first_failed_step: None,
    };
    print!("{}", report.render_text());
    Ok(report.exit_code())
}

/// Print the report and write its JSON form beside the run log.
fn publish(report: &ClusterStatusReport, path: &Path) -> Result<()> {
    print!("{}", report.render_text());
    let json = report.to_json().context("encoding report")?;
    fs::write(path, json).with_context(|| format!("writing report {}", path.display()))?;
    info!(path = %path.display(), overall = %report.overall, "report written");
    Ok(())
}

// ---------------------------------------------------------------------------
// steps
// ---------------------------------------------------------------------------

fn list_steps(setup: bool) -> String {
    let steps: Vec<StepDefinition> = if setup {
        let mut s = kernel_pipeline();
        s.extend(instance_setup_pipeline(&SetupOptions::default()));
        s
    } else {
        dataguard_pipeline(&DataGuardOptions::default())
    };
    let mut out = String::new();
    for (i, step) in steps.iter().enumerate() {
        let mut flags = Vec::new();
        if step.retryable {
            flags.push("retryable");
        }
        if step.idempotency == Idempotency::RunOnce {
            flags.push("run-once");
        }
        out.push_str(&format!(
            "{:>2}. {:<32} {:<8} {}\n",
            i + 1,
            step.name,
            format!("{:?}", step.target).to_lowercase(),
            flags.join(",")
        ));
    }
    out
}
