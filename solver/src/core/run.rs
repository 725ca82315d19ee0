//! Per-run status record and its monotonic lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::core::types::RunStatus;

/// Opaque identifier for a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a new random run id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A timestamped, human-readable step event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// One submit call made during the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub at: DateTime<Utc>,
    /// Task page the answer belongs to.
    pub task_url: String,
    /// Where the answer was posted.
    pub submit_url: String,
    pub answer: Value,
    pub correct: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// The record already reached an absorbing status.
    #[error("run is already {from}; refusing change to {to}")]
    AlreadyTerminal { from: RunStatus, to: String },

    /// Runs can never go back to `queued`.
    #[error("invalid transition {from} -> {to}")]
    Invalid { from: RunStatus, to: RunStatus },
}

/// Status record of one run, as seen by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: RunId,
    pub email: String,
    pub initial_url: String,
    pub current_url: String,
    pub status: RunStatus,
    pub logs: Vec<LogEntry>,
    pub history: Vec<SubmissionRecord>,
    pub error: Option<String>,
    pub result: Option<String>,
    /// Number of chain steps entered so far.
    pub steps: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRun {
    /// Create a queued run.
    pub fn new(id: RunId, email: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        let now = Utc::now();
        Self {
            id,
            email: email.into(),
            initial_url: url.clone(),
            current_url: url,
            status: RunStatus::Queued,
            logs: Vec::new(),
            history: Vec::new(),
            error: None,
            result: None,
            steps: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to a non-terminal or terminal status.
    ///
    /// Re-entering the current non-terminal status is a no-op.
    pub fn transition(&mut self, to: RunStatus) -> Result<(), TransitionError> {
        self.ensure_mutable(to.as_str())?;
        if to == RunStatus::Queued && self.status != RunStatus::Queued {
            return Err(TransitionError::Invalid {
                from: self.status,
                to,
            });
        }
        if self.status != to {
            self.status = to;
            self.touch();
        }
        Ok(())
    }

    /// Enter a terminal status, recording the error and result markers.
    pub fn finish(
        &mut self,
        status: RunStatus,
        error: Option<String>,
        result: Option<String>,
    ) -> Result<(), TransitionError> {
        if !status.is_terminal() {
            return Err(TransitionError::Invalid {
                from: self.status,
                to: status,
            });
        }
        self.transition(status)?;
        self.error = error;
        self.result = result;
        Ok(())
    }

    pub fn log(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.ensure_mutable("log")?;
        self.logs.push(LogEntry {
            at: Utc::now(),
            message: message.into(),
        });
        self.touch();
        Ok(())
    }

    /// Enter a new chain step at `url`.
    pub fn begin_step(&mut self, url: &str) -> Result<(), TransitionError> {
        self.ensure_mutable("step")?;
        self.steps += 1;
        self.current_url = url.to_string();
        self.touch();
        Ok(())
    }

    pub fn record_submission(&mut self, record: SubmissionRecord) -> Result<(), TransitionError> {
        self.ensure_mutable("history")?;
        self.history.push(record);
        self.touch();
        Ok(())
    }

    fn ensure_mutable(&self, to: &str) -> Result<(), TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::AlreadyTerminal {
                from: self.status,
                to: to.to_string(),
            });
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
