//! Loading operator settings from `dgc.yaml`.
//!
//! Every field has a default, so a partial file (or none at all) is valid.
//! Unknown keys are ignored for forward compatibility.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::config::Settings;

pub const DEFAULT_SETTINGS_FILE: &str = "dgc.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid settings: {0}")]
    Invalid(String),
}

pub fn load(path: &Path) -> Result<Settings, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&content).map_err(|e| match e {
        ConfigError::Parse { source, .. } => ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })
}

/// Parse settings from YAML. An empty document yields the defaults.
pub fn parse(content: &str) -> Result<Settings, ConfigError> {
    if content.trim().is_empty() {
        return Ok(Settings::default());
    }
    let settings: Settings = serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
        path: PathBuf::new(),
        source,
    })?;
    validate(&settings)?;
    Ok(settings)
}

/// An explicitly named file must exist. Without one, `dgc.yaml` in the
/// working directory is used when present and the defaults otherwise.
pub fn load_or_default(path: Option<&Path>) -> Result<Settings, ConfigError> {
    match path {
        Some(p) => load(p),
        None => {
            let default = Path::new(DEFAULT_SETTINGS_FILE);
            if default.exists() {
                load(default)
            } else {
                Ok(Settings::default())
            }
        }
    }
}

fn validate(s: &Settings) -> Result<(), ConfigError> {
    if s.destinations.is_empty() {
        return Err(ConfigError::Invalid("destinations must not be empty".into()));
    }
    if s.query_timeout_secs == 0 || s.step_timeout_secs == 0 {
        return Err(ConfigError::Invalid("timeouts must be positive".into()));
    }
    if s.media_version.trim().is_empty() {
        return Err(ConfigError::Invalid("media_version must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::config::BackoffStrategy;
    use std::io::Write;

    #[test]
    fn parse_partial_file() {
        let s = parse(
            "zone: us-east4-b\nretry:\n  max_retries: 5\n  backoff_strategy: exponential\ndestinations: [2]\n",
        )
        .unwrap();
        assert_eq!(s.zone.as_deref(), Some("us-east4-b"));
        assert_eq!(s.retry.max_retries, 5);
        assert_eq!(s.retry.backoff_strategy, BackoffStrategy::Exponential);
        assert_eq!(s.retry.base_delay_ms, 10_000);
        assert_eq!(s.destinations, vec![2]);
        assert_eq!(s.machine_type, "n2-standard-4");
    }

    #[test]
    fn empty_and_unknown_keys() {
        assert_eq!(parse("").unwrap(), Settings::default());
        assert_eq!(parse("future_key: 1\n").unwrap(), Settings::default());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(parse("step_timeout_secs: soon\n"), Err(ConfigError::Parse { .. })));
        assert!(matches!(parse("destinations: []\n"), Err(ConfigError::Invalid(_))));
        assert!(matches!(parse("query_timeout_secs: 0\n"), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_reports_path() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "retry: [not, a, map]").unwrap();
        let err = load(f.path()).unwrap_err();
        assert!(err.to_string().contains(&f.path().display().to_string()));
    }

    #[test]
    fn explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(matches!(
            load_or_default(Some(&missing)),
            Err(ConfigError::Read { .. })
        ));
    }
}
