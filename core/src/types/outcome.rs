use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepResult {
    Ok,
    Failed,
    Skipped,
}

impl fmt::Display for StepResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepResult::Ok => write!(f, "OK"),
            StepResult::Failed => write!(f, "FAILED"),
            StepResult::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// Record of one step execution. Appended to the run log and never changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: StepResult,
    pub detail: String,
    #[serde(default)]
    pub attempts: u32,
    /// Instance ids the step touched, in execution order.
    #[serde(default)]
    pub instances: Vec<String>,
    /// Non-sensitive values this step handed forward.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub captured: BTreeMap<String, String>,
}

impl StepOutcome {
    pub fn skipped(step: &str, reason: &str, at: DateTime<Utc>) -> Self {
        StepOutcome {
            step: step.to_string(),
            started_at: at,
            finished_at: at,
            result: StepResult::Skipped,
            detail: reason.to_string(),
            attempts: 0,
            instances: Vec::new(),
            captured: BTreeMap::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result == StepResult::Ok
    }

    pub fn is_failed(&self) -> bool {
        self.result == StepResult::Failed
    }
}
