//! Cluster status report and the replication observations it is built from.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::instance::Role;
use super::outcome::{StepOutcome, StepResult};

// ---------------------------------------------------------------------------
// OverallStatus
// ---------------------------------------------------------------------------

/// Ordered by severity: `Converged < Degraded < Diverged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    Converged,
    Degraded,
    Diverged,
}

impl OverallStatus {
    pub fn worst(self, other: OverallStatus) -> OverallStatus {
        self.max(other)
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverallStatus::Converged => write!(f, "CONVERGED"),
            OverallStatus::Degraded => write!(f, "DEGRADED"),
            OverallStatus::Diverged => write!(f, "DIVERGED"),
        }
    }
}

// ---------------------------------------------------------------------------
// Log-shipping destinations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationHealth {
    Healthy,
    /// Retrying or otherwise expected to clear on its own.
    Transient,
    /// Rejected, misconfigured or disabled.
    Terminal,
}

/// `V$ARCHIVE_DEST.STATUS` values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DestinationStatus {
    Valid,
    Inactive,
    Deferred,
    Error,
    Disabled,
    BadParam,
    Full,
    Alternate,
    Other(String),
}

impl DestinationStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "VALID" => DestinationStatus::Valid,
            "INACTIVE" => DestinationStatus::Inactive,
            "DEFERRED" => DestinationStatus::Deferred,
            "ERROR" => DestinationStatus::Error,
            "DISABLED" => DestinationStatus::Disabled,
            "BAD PARAM" => DestinationStatus::BadParam,
            "FULL" => DestinationStatus::Full,
            "ALTERNATE" => DestinationStatus::Alternate,
            other => DestinationStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DestinationStatus::Valid => "VALID",
            DestinationStatus::Inactive => "INACTIVE",
            DestinationStatus::Deferred => "DEFERRED",
            DestinationStatus::Error => "ERROR",
            DestinationStatus::Disabled => "DISABLED",
            DestinationStatus::BadParam => "BAD PARAM",
            DestinationStatus::Full => "FULL",
            DestinationStatus::Alternate => "ALTERNATE",
            DestinationStatus::Other(s) => s,
        }
    }

    /// A configured destination that is inactive or deferred after the
    /// pipeline enabled it never took effect, so both count as terminal.
    pub fn health(&self) -> DestinationHealth {
        match self {
            DestinationStatus::Valid => DestinationHealth::Healthy,
            DestinationStatus::Full | DestinationStatus::Alternate | DestinationStatus::Other(_) => {
                DestinationHealth::Transient
            }
            DestinationStatus::Inactive
            | DestinationStatus::Deferred
            | DestinationStatus::Error
            | DestinationStatus::Disabled
            | DestinationStatus::BadParam => DestinationHealth::Terminal,
        }
    }
}

impl From<String> for DestinationStatus {
    fn from(s: String) -> Self {
        DestinationStatus::parse(&s)
    }
}

impl From<DestinationStatus> for String {
    fn from(s: DestinationStatus) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for DestinationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationState {
    pub dest_id: u32,
    pub destination: String,
    pub status: DestinationStatus,
    /// `V$ARCHIVE_DEST.ERROR`, empty when none.
    pub error: String,
}

// ---------------------------------------------------------------------------
// Standby apply state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ApplyState {
    pub database_role: String,
    pub open_mode: String,
    /// Status of the managed recovery process, `None` when it is not running.
    pub mrp_status: Option<String>,
    pub apply_lag_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceReplicationState {
    pub instance: String,
    pub role: Role,
    pub reachable: bool,
    #[serde(default)]
    pub destinations: Vec<DestinationState>,
    #[serde(default)]
    pub apply: Option<ApplyState>,
}

impl InstanceReplicationState {
    pub fn unobserved(instance: &str, role: Role) -> Self {
        InstanceReplicationState {
            instance: instance.to_string(),
            role,
            reachable: false,
            destinations: Vec::new(),
            apply: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Findings
// ---------------------------------------------------------------------------

/// One diagnosable reason the cluster is not converged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    StepFailed {
        step: String,
        detail: String,
    },
    DestinationError {
        instance: String,
        dest_id: u32,
        destination: String,
        status: String,
        error: String,
    },
    Unreachable {
        instance: String,
        reason: String,
    },
    DestinationTransient {
        instance: String,
        dest_id: u32,
        status: String,
    },
    ApplyLag {
        instance: String,
        lag_secs: u64,
        bound_secs: u64,
    },
    ApplyStalled {
        instance: String,
        detail: String,
    },
    RoleMismatch {
        instance: String,
        observed: String,
    },
    Aborted {
        next_step: String,
    },
}

impl Finding {
    pub fn severity(&self) -> OverallStatus {
        match self {
            Finding::StepFailed { .. }
            | Finding::DestinationError { .. }
            | Finding::Unreachable { .. } => OverallStatus::Diverged,
            Finding::DestinationTransient { .. }
            | Finding::ApplyLag { .. }
            | Finding::ApplyStalled { .. }
            | Finding::RoleMismatch { .. }
            | Finding::Aborted { .. } => OverallStatus::Degraded,
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Finding::StepFailed { step, detail } => {
                write!(f, "step '{}' failed: {}", step, detail)
            }
            Finding::DestinationError {
                instance,
                dest_id,
                destination,
                status,
                error,
            } => {
                write!(
                    f,
                    "{}: LOG_ARCHIVE_DEST_{} ({}) is {}",
                    instance, dest_id, destination, status
                )?;
                if !error.is_empty() {
                    write!(f, ": {}", error)?;
                }
                Ok(())
            }
            Finding::Unreachable { instance, reason } => {
                write!(f, "{} unreachable during assessment: {}", instance, reason)
            }
            Finding::DestinationTransient {
                instance,
                dest_id,
                status,
            } => write!(f, "{}: LOG_ARCHIVE_DEST_{} is {}", instance, dest_id, status),
            Finding::ApplyLag {
                instance,
                lag_secs,
                bound_secs,
            } => write!(
                f,
                "{}: apply lag {}s exceeds bound {}s",
                instance, lag_secs, bound_secs
            ),
            Finding::ApplyStalled { instance, detail } => write!(f, "{}: {}", instance, detail),
            Finding::RoleMismatch { instance, observed } => {
                write!(f, "{}: database role is {}, expected PHYSICAL STANDBY", instance, observed)
            }
            Finding::Aborted { next_step } => {
                write!(f, "run aborted before step '{}'", next_step)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ClusterStatusReport
// ---------------------------------------------------------------------------

/// Final result of a convergence run. Produced once, never changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatusReport {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub overall: OverallStatus,
    pub findings: Vec<Finding>,
    pub primary: InstanceReplicationState,
    pub standby: InstanceReplicationState,
    pub outcomes: Vec<StepOutcome>,
    pub first_failed_step: Option<String>,
}

impl ClusterStatusReport {
    pub fn is_converged(&self) -> bool {
        self.overall == OverallStatus::Converged
    }

    /// Process exit code for automation: 0 only when converged.
    pub fn exit_code(&self) -> i32 {
        if self.is_converged() {
            0
        } else {
            1
        }
    }

    pub fn count(&self, result: StepResult) -> usize {
        self.outcomes.iter().filter(|o| o.result == result).count()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Plain-text rendering for terminals and log files.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Cluster status: {}\n", self.overall));
        out.push_str(&format!("Run: {} at {}\n", self.run_id, self.generated_at.to_rfc3339()));
        if let Some(ref step) = self.first_failed_step {
            out.push_str(&format!("First failing step: {}\n", step));
        }

        out.push_str(&format!(
            "\nSteps ({} ok, {} failed, {} skipped):\n",
            self.count(StepResult::Ok),
            self.count(StepResult::Failed),
            self.count(StepResult::Skipped),
        ));
        for o in &self.outcomes {
            out.push_str(&format!("  {:<8} {:<32} {}\n", o.result, o.step, o.detail));
        }

        out.push_str("\nReplication:\n");
        for state in [&self.primary, &self.standby] {
            out.push_str(&format!(
                "  {} ({}): {}\n",
                state.instance,
                state.role,
                if state.reachable { "reachable" } else { "unreachable" }
            ));
            for d in &state.destinations {
                out.push_str(&format!(
                    "    LOG_ARCHIVE_DEST_{:<2} {:<10} {}{}\n",
                    d.dest_id,
                    d.status,
                    d.destination,
                    if d.error.is_empty() {
                        String::new()
                    } else {
                        format!(" [{}]", d.error)
                    }
                ));
            }
            if let Some(ref apply) = state.apply {
                out.push_str(&format!(
                    "    role={} open_mode={} mrp={} apply_lag={}\n",
                    apply.database_role,
                    apply.open_mode,
                    apply.mrp_status.as_deref().unwrap_or("not running"),
                    apply
                        .apply_lag_secs
                        .map(|s| format!("{}s", s))
                        .unwrap_or_else(|| "unknown".to_string()),
                ));
            }
        }

        if !self.findings.is_empty() {
            out.push_str("\nFindings:\n");
            for f in &self.findings {
                out.push_str(&format!("  [{}] {}\n", f.severity(), f));
            }
        }
        out
    }
}
