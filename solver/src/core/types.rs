//! Shared deterministic types for solver core logic.
//!
//! These types define the contracts between the task loop, the solve step and
//! the external collaborators. They hold no I/O handles.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a run.
///
/// `Completed`, `Failed`, `Error` and `Timeout` are absorbing: once a run
/// reaches one of them its record never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Error,
    Timeout,
}

impl RunStatus {
    /// Returns true if the run can no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Error | Self::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability/cost level of the reasoning service.
///
/// Ordering is by capability: `Fast < Strong`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Fast,
    Strong,
}

impl ModelTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Strong => "strong",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Product of fetching one task page.
#[derive(Clone, PartialEq, Eq)]
pub struct TaskContent {
    /// URL the content was fetched from.
    pub url: String,
    /// Visible text (or raw markup when the visible text was near-empty).
    pub text: String,
    /// Rendered image of the page, forwarded to the reasoner only.
    pub screenshot: Option<Vec<u8>>,
}

impl fmt::Debug for TaskContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContent")
            .field("url", &self.url)
            .field("text_len", &self.text.len())
            .field("screenshot_len", &self.screenshot.as_ref().map(Vec::len))
            .finish()
    }
}

/// What kind of work a fetched page asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TaskKind {
    /// The page references an audio clip that must be transcribed.
    Audio { audio_url: String },
    /// The page points at data files or structured formats.
    Data,
    /// Plain question text.
    Text,
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Audio { .. } => "audio",
            Self::Data => "data",
            Self::Text => "text",
        }
    }
}

/// Structured answer recovered from model or program output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub answer: Value,
    pub submit_url: Option<String>,
}

impl Answer {
    /// Build an answer from a parsed JSON value.
    ///
    /// Requires an object with a non-null `answer`. `submit_url` is kept only
    /// when it is a non-empty string.
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let answer = object.get("answer").filter(|v| !v.is_null())?.clone();
        let submit_url = non_empty_str(object.get("submit_url"));
        Some(Self { answer, submit_url })
    }
}

/// Payload posted to a submission target.
#[derive(Clone, Serialize)]
pub struct Submission {
    pub email: String,
    pub secret: String,
    pub url: String,
    pub answer: Value,
}

impl fmt::Debug for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("email", &self.email)
            .field("secret", &"<redacted>")
            .field("url", &self.url)
            .field("answer", &self.answer)
            .finish()
    }
}

/// Judge response to a submission.
///
/// Built leniently from untrusted input: see [`SubmissionResult::from_value`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SubmissionResult {
    pub correct: bool,
    pub next_url: Option<String>,
    pub reason: Option<String>,
}

impl SubmissionResult {
    /// Interpret a judge response body.
    ///
    /// `correct` counts only when it is literally `true`. The next task URL is
    /// read from `next_url`, then `url`; the reason from `reason`, then
    /// `message`. Empty strings are treated as absent.
    pub fn from_value(value: &Value) -> Self {
        let correct = value
            .get("correct")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let next_url =
            non_empty_str(value.get("next_url")).or_else(|| non_empty_str(value.get("url")));
        let reason =
            non_empty_str(value.get("reason")).or_else(|| non_empty_str(value.get("message")));
        Self {
            correct,
            next_url,
            reason,
        }
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
