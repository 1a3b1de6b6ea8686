use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    #[default]
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub backoff_strategy: BackoffStrategy,
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            max_retries: 3,
            backoff_strategy: BackoffStrategy::Fixed,
            base_delay_ms: 10_000,
        }
    }
}

/// Operator settings, read from `dgc.yaml` and overridden by CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Cloud project; falls back to `gcloud config get-value project`.
    pub project: Option<String>,
    /// Cloud zone; falls back to `gcloud config get-value compute/zone`.
    pub zone: Option<String>,
    pub swlib_bucket: String,
    pub media_version: String,
    pub media_cache_dir: PathBuf,
    pub machine_type: String,
    pub extra_diskgroups: Vec<String>,
    pub ssh_user: Option<String>,
    pub run_log: PathBuf,
    pub retry: RetrySettings,
    pub step_timeout_secs: u64,
    pub query_timeout_secs: u64,
    pub max_apply_lag_secs: u64,
    /// `LOG_ARCHIVE_DEST_n` ids the verifier inspects on the primary.
    pub destinations: Vec<u32>,
    pub ready_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            project: None,
            zone: None,
            swlib_bucket: "gs://ocie-oracle-us-east4".into(),
            media_version: "21".into(),
            media_cache_dir: PathBuf::from(".dgc/media"),
            machine_type: "n2-standard-4".into(),
            extra_diskgroups: vec!["DG1".into()],
            ssh_user: None,
            run_log: PathBuf::from("dgc-run.jsonl"),
            retry: RetrySettings::default(),
            step_timeout_secs: 1800,
            query_timeout_secs: 120,
            max_apply_lag_secs: 30,
            destinations: vec![1, 2],
            ready_timeout_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip() {
        let mut settings = Settings::default();
        settings.project = Some("my-project".into());
        settings.retry.backoff_strategy = BackoffStrategy::Linear;
        let json = serde_json::to_string(&settings).unwrap();
        let back: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn backoff_strategy_serde() {
        let json = serde_json::to_string(&BackoffStrategy::Exponential).unwrap();
        assert_eq!(json, "\"exponential\"");
        assert_eq!(BackoffStrategy::default(), BackoffStrategy::Fixed);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let back: Settings = serde_json::from_str(r#"{"zone":"us-east4-b"}"#).unwrap();
        assert_eq!(back.zone.as_deref(), Some("us-east4-b"));
        assert_eq!(back.destinations, vec![1, 2]);
        assert_eq!(back.retry.max_retries, 3);
    }
}
