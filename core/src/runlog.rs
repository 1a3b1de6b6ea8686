//! Persisted run log.
//!
//! Every step outcome is appended as one JSON line and flushed before the next
//! step starts, so a crashed or aborted run leaves an accurate record behind.
//! A later invocation loads the log to find steps that already succeeded for
//! the same instance pair.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{StepOutcome, StepResult};

#[derive(Debug, Error)]
pub enum RunLogError {
    #[error("run log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("run log line {line} parse error: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not encode run log entry: {0}")]
    Encode(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// RunLogEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub sequence: u64,
    pub run_id: String,
    /// `<primary>/<standby>`, or a single instance id for setup runs.
    pub pair: String,
    pub outcome: StepOutcome,
}

pub fn pair_key(primary: &str, standby: &str) -> String {
    format!("{}/{}", primary, standby)
}

// ---------------------------------------------------------------------------
// RunLog (read side)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RunLog {
    entries: Vec<RunLogEntry>,
}

impl RunLog {
    /// Load a log from disk. A missing file is an empty log.
    pub fn load(path: &Path) -> Result<Self, RunLogError> {
        match std::fs::read_to_string(path) {
            Ok(data) => Self::from_json_lines(&data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(RunLog::default()),
            Err(e) => Err(RunLogError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Blank lines are skipped. Invalid lines produce an error naming the
    /// 1-based line number.
    pub fn from_json_lines(data: &str) -> Result<Self, RunLogError> {
        let mut entries = Vec::new();
        for (i, line) in data.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let entry: RunLogEntry = serde_json::from_str(trimmed)
                .map_err(|e| RunLogError::Parse { line: i + 1, source: e })?;
            entries.push(entry);
        }
        Ok(RunLog { entries })
    }

    pub fn entries(&self) -> &[RunLogEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_sequence(&self) -> u64 {
        self.entries.iter().map(|e| e.sequence + 1).max().unwrap_or(0)
    }

    /// Most recent OK outcome of `step` for `pair`.
    pub fn last_success(&self, pair: &str, step: &str) -> Option<&StepOutcome> {
        self.entries
            .iter()
            .rev()
            .filter(|e| e.pair == pair && e.outcome.step == step)
            .map(|e| &e.outcome)
            .find(|o| o.result == StepResult::Ok)
    }

    /// Run ids in order of first appearance.
    pub fn runs(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for e in &self.entries {
            if !ids.contains(&e.run_id.as_str()) {
                ids.push(&e.run_id);
            }
        }
        ids
    }

}

// ---------------------------------------------------------------------------
// RunLogWriter (append side)
// ---------------------------------------------------------------------------

/// Single-writer, append-only sink for one run.
pub struct RunLogWriter {
    run_id: String,
    file: Option<File>,
    path: Option<PathBuf>,
    next_sequence: u64,
    written: Vec<RunLogEntry>,
}

impl RunLogWriter {
    /// Open `path` for appending, creating it if needed. Sequence numbers
    /// continue from `next_sequence`.
    pub fn open(path: &Path, run_id: &str, next_sequence: u64) -> Result<Self, RunLogError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| RunLogError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| RunLogError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        Ok(RunLogWriter {
            run_id: run_id.to_string(),
            file: Some(file),
            path: Some(path.to_path_buf()),
            next_sequence,
            written: Vec::new(),
        })
    }

    /// A writer that keeps entries in memory only.
    pub fn in_memory(run_id: &str) -> Self {
        RunLogWriter {
            run_id: run_id.to_string(),
            file: None,
            path: None,
            next_sequence: 0,
            written: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn append(&mut self, pair: &str, outcome: &StepOutcome) -> Result<u64, RunLogError> {
        let entry = RunLogEntry {
            sequence: self.next_sequence,
            run_id: self.run_id.clone(),
            pair: pair.to_string(),
            outcome: outcome.clone(),
        };
        if let Some(ref mut file) = self.file {
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            let path = self.path.clone().unwrap_or_default();
            file.write_all(line.as_bytes())
                .and_then(|_| file.flush())
                .map_err(|e| RunLogError::Io { path, source: e })?;
        }
        self.next_sequence += 1;
        self.written.push(entry);
        Ok(self.next_sequence - 1)
    }

    /// Entries appended through this writer.
    pub fn written(&self) -> &[RunLogEntry] {
        &self.written
    }
}
