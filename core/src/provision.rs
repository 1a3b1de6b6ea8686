//! Provisioning collaborators: compute instances and installation media.
//!
//! Both sit outside convergence. They are driven by `dgc provision` before any
//! step runs, and only hand back an `InstanceHandle` or a local path.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::infrastructure::runner::{CommandRunner, RunnerError};
use crate::infrastructure::ExecOutput;
use crate::types::config::Settings;
use crate::types::{Credentials, InstanceError, InstanceHandle, InstanceNaming, Role, Secret};

const GCLOUD_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);
const READY_POLL: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error(transparent)]
    Naming(#[from] InstanceError),
    #[error("{action} {instance} failed (exit {code}): {detail}")]
    Command {
        action: &'static str,
        instance: String,
        code: i32,
        detail: String,
    },
    #[error("instance {0} does not exist")]
    NotFound(String),
    #[error("instance {instance} not reachable over ssh after {}s", .after.as_secs())]
    NotReady { instance: String, after: Duration },
    #[error("no installation media for version {version} in {bucket}")]
    MediaMissing { bucket: String, version: String },
    #[error("cannot write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

/// What to create for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    pub id: String,
    pub role: Role,
    pub machine_type: String,
    pub cdb_diskgroup: String,
    pub extra_diskgroups: Vec<String>,
}

impl InstanceSpec {
    pub fn new(id: &str, role: Role, settings: &Settings) -> Result<Self, InstanceError> {
        let naming = InstanceNaming::parse(id)?;
        Ok(InstanceSpec {
            id: id.to_string(),
            role,
            machine_type: settings.machine_type.clone(),
            cdb_diskgroup: naming.cdb_diskgroup(),
            extra_diskgroups: settings.extra_diskgroups.clone(),
        })
    }
}

pub trait Provisioner {
    /// Create the instance unless it exists, wait until it accepts ssh, and
    /// return its handle.
    fn provision(&self, spec: &InstanceSpec) -> Result<InstanceHandle, ProvisionError>;
    /// Handle for an existing instance.
    fn resolve(&self, id: &str, role: Role) -> Result<InstanceHandle, ProvisionError>;
    /// Hard reset and wait for ssh to come back.
    fn reset(&self, id: &str) -> Result<(), ProvisionError>;
    /// Returns false when there was nothing to delete.
    fn delete(&self, id: &str) -> Result<bool, ProvisionError>;
}

pub struct GcloudProvisioner {
    runner: Arc<dyn CommandRunner>,
    project: String,
    zone: String,
    credentials: Credentials,
    ready_timeout: Duration,
    poll_interval: Duration,
}

impl GcloudProvisioner {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        project: &str,
        zone: &str,
        ssh_user: Option<String>,
        sys_password: Secret,
    ) -> Self {
        GcloudProvisioner {
            runner,
            project: project.to_string(),
            zone: zone.to_string(),
            credentials: Credentials {
                ssh_user,
                sys_password,
            },
            ready_timeout: Duration::from_secs(300),
            poll_interval: READY_POLL,
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn location(&self) -> Vec<String> {
        vec![
            "--zone".into(),
            self.zone.clone(),
            "--project".into(),
            self.project.clone(),
        ]
    }

    fn gcloud(&self, args: Vec<String>, timeout: Duration) -> Result<ExecOutput, ProvisionError> {
        debug!(args = ?args, "gcloud");
        Ok(self.runner.run("gcloud", &args, timeout)?)
    }

    fn instances(&self, verb: &str, id: &str, extra: &[&str]) -> Vec<String> {
        let mut args: Vec<String> = vec!["compute".into(), "instances".into(), verb.into(), id.into()];
        args.extend(self.location());
        args.extend(extra.iter().map(|s| s.to_string()));
        args
    }

    pub fn exists(&self, id: &str) -> Result<bool, ProvisionError> {
        let out = self.gcloud(self.instances("describe", id, &["--format=value(name)"]), GCLOUD_TIMEOUT)?;
        if out.succeeded() {
            return Ok(true);
        }
        if out.stderr.contains("was not found") || out.stderr.contains("notFound") {
            return Ok(false);
        }
        Err(command_error("describe", id, &out))
    }

    pub fn create_args(&self, spec: &InstanceSpec) -> Vec<String> {
        let mut args = self.instances("create", &spec.id, &[]);
        args.push(format!("--machine-type={}", spec.machine_type));
        args.push("--image-project=oracle-linux-cloud".into());
        args.push("--image-family=oracle-linux-8".into());
        args.push(format!("--create-disk=name={}-u01,device-name=u01,size=30GB", spec.id));
        args.push(format!("--create-disk=name={}-swap,device-name=swap,size=16GB", spec.id));
        for dg in std::iter::once(&spec.cdb_diskgroup).chain(spec.extra_diskgroups.iter()) {
            let disk = dg.to_lowercase();
            args.push(format!(
                "--create-disk=name={}-{},device-name={},size=20GB,type=pd-balanced",
                spec.id, disk, disk
            ));
        }
        args
    }

    /// Poll `ssh true` until it succeeds or the ready timeout passes.
    pub fn wait_ready(&self, id: &str) -> Result<(), ProvisionError> {
        let target = match self.credentials.ssh_user {
            Some(ref user) => format!("{}@{}", user, id),
            None => id.to_string(),
        };
        let mut args: Vec<String> = vec!["compute".into(), "ssh".into(), target];
        args.extend(self.location());
        args.extend(["--quiet".into(), "--command".into(), "true".into()]);

        let deadline = Instant::now() + self.ready_timeout;
        loop {
            match self.gcloud(args.clone(), PROBE_TIMEOUT) {
                Ok(out) if out.succeeded() => {
                    info!(instance = id, "instance accepts ssh");
                    return Ok(());
                }
                Ok(out) => debug!(instance = id, detail = out.tail(), "not ready yet"),
                Err(e) => debug!(instance = id, error = %e, "not ready yet"),
            }
            if Instant::now() >= deadline {
                return Err(ProvisionError::NotReady {
                    instance: id.to_string(),
                    after: self.ready_timeout,
                });
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn internal_ip(&self, id: &str) -> Result<String, ProvisionError> {
        let out = self.gcloud(
            self.instances("describe", id, &["--format", "get(networkInterfaces[0].networkIP)"]),
            GCLOUD_TIMEOUT,
        )?;
        if !out.succeeded() {
            if out.stderr.contains("was not found") {
                return Err(ProvisionError::NotFound(id.to_string()));
            }
            return Err(command_error("describe", id, &out));
        }
        Ok(out.stdout.trim().to_string())
    }
}

impl Provisioner for GcloudProvisioner {
    fn provision(&self, spec: &InstanceSpec) -> Result<InstanceHandle, ProvisionError> {
        if self.exists(&spec.id)? {
            info!(instance = %spec.id, "instance exists, not creating");
        } else {
            info!(instance = %spec.id, machine_type = %spec.machine_type, "creating instance");
            let out = self.gcloud(self.create_args(spec), GCLOUD_TIMEOUT)?;
            if !out.succeeded() {
                return Err(command_error("create", &spec.id, &out));
            }
        }
        self.wait_ready(&spec.id)?;
        self.resolve(&spec.id, spec.role)
    }

    fn resolve(&self, id: &str, role: Role) -> Result<InstanceHandle, ProvisionError> {
        let address = self.internal_ip(id)?;
        Ok(InstanceHandle::new(id, role, address, self.credentials.clone())?)
    }

    fn reset(&self, id: &str) -> Result<(), ProvisionError> {
        info!(instance = id, "resetting instance");
        let out = self.gcloud(self.instances("reset", id, &[]), GCLOUD_TIMEOUT)?;
        if !out.succeeded() {
            return Err(command_error("reset", id, &out));
        }
        self.wait_ready(id)
    }

    fn delete(&self, id: &str) -> Result<bool, ProvisionError> {
        if !self.exists(id)? {
            warn!(instance = id, "nothing to delete");
            return Ok(false);
        }
        info!(instance = id, "deleting instance");
        let out = self.gcloud(self.instances("delete", id, &["--quiet"]), GCLOUD_TIMEOUT)?;
        if !out.succeeded() {
            return Err(command_error("delete", id, &out));
        }
        Ok(true)
    }
}

fn command_error(action: &'static str, instance: &str, out: &ExecOutput) -> ProvisionError {
    ProvisionError::Command {
        action,
        instance: instance.to_string(),
        code: out.exit_code,
        detail: out.tail().to_string(),
    }
}

/// `gcloud config get-value <key>`; `None` when the key is unset.
pub fn gcloud_config_value(runner: &dyn CommandRunner, key: &str) -> Result<Option<String>, ProvisionError> {
    let args = vec!["config".to_string(), "get-value".to_string(), key.to_string()];
    let out = runner.run("gcloud", &args, PROBE_TIMEOUT)?;
    let value = out.stdout.trim();
    if !out.succeeded() || value.is_empty() || value == "(unset)" {
        return Ok(None);
    }
    Ok(Some(value.to_string()))
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

pub trait MediaSource {
    /// Make the media for `version` available and return a local path
    /// describing it.
    fn fetch(&self, bucket: &str, version: &str) -> Result<PathBuf, ProvisionError>;
}

/// Checks the software library bucket for the release's media and records
/// the object list in `<cache_dir>/<version>/MANIFEST`. The install step
/// pulls the archives from the bucket itself, so nothing large is copied to
/// the operator host. A cached manifest is reused.
pub struct GcsMediaSource {
    runner: Arc<dyn CommandRunner>,
    cache_dir: PathBuf,
}

impl GcsMediaSource {
    pub fn new(runner: Arc<dyn CommandRunner>, cache_dir: &Path) -> Self {
        GcsMediaSource {
            runner,
            cache_dir: cache_dir.to_path_buf(),
        }
    }

    pub fn manifest_path(&self, version: &str) -> PathBuf {
        self.cache_dir.join(version).join("MANIFEST")
    }
}

/// Oracle media archive names carry the release as e.g. `_213000_`.
fn matches_version(object: &str, version: &str) -> bool {
    let digits: String = version.chars().filter(|c| c.is_ascii_digit()).collect();
    !digits.is_empty()
        && object.rsplit('/').next().map_or(false, |name| {
            name.ends_with(".zip") && name.contains(&format!("_{}", digits))
        })
}

impl MediaSource for GcsMediaSource {
    fn fetch(&self, bucket: &str, version: &str) -> Result<PathBuf, ProvisionError> {
        let manifest = self.manifest_path(version);
        if manifest.exists() {
            debug!(path = %manifest.display(), "media manifest cached");
            return Ok(manifest);
        }
        let args = vec!["ls".to_string(), bucket.to_string()];
        let out = self.runner.run("gsutil", &args, GCLOUD_TIMEOUT)?;
        if !out.succeeded() {
            return Err(command_error("list", bucket, &out));
        }
        let objects: Vec<&str> = out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| matches_version(l, version))
            .collect();
        if objects.is_empty() {
            return Err(ProvisionError::MediaMissing {
                bucket: bucket.to_string(),
                version: version.to_string(),
            });
        }
        let io_err = |source| ProvisionError::Io {
            path: manifest.clone(),
            source,
        };
        if let Some(dir) = manifest.parent() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        fs::write(&manifest, objects.join("\n") + "\n").map_err(io_err)?;
        info!(bucket, version, objects = objects.len(), "media staged");
        Ok(manifest)
    }
}
