//! One solve attempt for one task page.
//!
//! Audio tasks go transcript → answer. Everything else goes analyze →
//! (optional) screenshot extraction → program → sandbox → extract. The step
//! never retries on its own; a failure is returned with feedback text that
//! the task loop hands to the next attempt.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::extract::{extract_answer, extract_json, strip_code_fences};
use crate::core::types::{Answer, ModelTier, TaskContent, TaskKind};
use crate::io::config::{Credentials, SolverConfig};
use crate::io::prompt::{PromptBuilder, PromptPack};
use crate::io::reasoner::{
    OpenAiClient, Reasoner, ReasonerRequest, Transcriber, excerpt, tail_excerpt,
};
use crate::io::renderer::{HttpRenderer, Renderer};
use crate::io::sandbox::{CodeRunner, ProcessSandbox};
use crate::io::submit::{HttpSubmitter, Submitter};

/// Longest output or stderr excerpt quoted back in feedback.
const FEEDBACK_EXCERPT_CHARS: usize = 1_500;

/// Port implementations handed to the solver.
#[derive(Clone)]
pub struct Collaborators {
    pub renderer: Arc<dyn Renderer>,
    pub reasoner: Arc<dyn Reasoner>,
    pub transcriber: Arc<dyn Transcriber>,
    pub sandbox: Arc<dyn CodeRunner>,
    pub submitter: Arc<dyn Submitter>,
}

impl Collaborators {
    /// Network-backed collaborators built from config and environment credentials.
    pub fn from_config(config: &SolverConfig, credentials: &Credentials) -> Result<Self> {
        let client = Arc::new(OpenAiClient::new(&config.reasoner, credentials)?);
        Ok(Self {
            renderer: Arc::new(HttpRenderer::new(&config.renderer)?),
            reasoner: client.clone(),
            transcriber: client,
            sandbox: Arc::new(ProcessSandbox::new(&config.sandbox)),
            submitter: Arc::new(HttpSubmitter::new(&config.submit)?),
        })
    }
}

/// Why one attempt produced no usable answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptFailure {
    #[error("reasoner failed: {0}")]
    Reasoner(String),
    #[error("transcription failed: {0}")]
    Transcription(String),
    #[error("output has no answer object")]
    MalformedOutput { output: String },
    #[error("program output has no answer object{}", describe_truncation(.truncation))]
    ProgramOutputMalformed {
        stdout: String,
        truncation: Option<String>,
    },
    #[error("program exited with {}{}", describe_exit(.exit_code), describe_truncation(.truncation))]
    ExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
        truncation: Option<String>,
    },
    #[error("program timed out after {timeout_secs}s")]
    ExecutionTimedOut { timeout_secs: u64 },
    #[error("program could not be run: {0}")]
    Sandbox(String),
    #[error("submission failed: {0}")]
    Submission(String),
    #[error("answer rejected: {reason}")]
    Incorrect { reason: String },
}

impl AttemptFailure {
    /// Instruction for the next attempt, with long excerpts cut down.
    ///
    /// Program output and stderr are quoted from the end, where the answer
    /// line and the raised exception are.
    pub fn feedback(&self) -> String {
        match self {
            Self::Reasoner(msg) => format!(
                "The previous attempt could not get a response from the model ({}). Please try again.",
                excerpt(msg, FEEDBACK_EXCERPT_CHARS)
            ),
            Self::Transcription(msg) => format!(
                "The audio could not be transcribed ({}). Work from the page text if possible.",
                excerpt(msg, FEEDBACK_EXCERPT_CHARS)
            ),
            Self::MalformedOutput { output } => format!(
                "Your previous output was not valid JSON with 'answer' and 'submit_url'. Please fix the format. Previous output: {}",
                excerpt(output, FEEDBACK_EXCERPT_CHARS)
            ),
            Self::ProgramOutputMalformed { stdout, truncation } => format!(
                "Your program ran but its output had no JSON object with 'answer'. Print the final answer as JSON on the last line.{} Output tail: {}",
                describe_truncation(truncation),
                tail_excerpt(stdout, FEEDBACK_EXCERPT_CHARS)
            ),
            Self::ExecutionFailed {
                exit_code,
                stderr,
                truncation,
            } => format!(
                "The program failed ({}).{} stderr: {}",
                describe_exit(exit_code),
                describe_truncation(truncation),
                tail_excerpt(stderr, FEEDBACK_EXCERPT_CHARS)
            ),
            Self::ExecutionTimedOut { timeout_secs } => format!(
                "The program did not finish within {timeout_secs} seconds. Write a faster program."
            ),
            Self::Sandbox(msg) => format!(
                "The program could not be started ({}).",
                excerpt(msg, FEEDBACK_EXCERPT_CHARS)
            ),
            Self::Submission(msg) => {
                format!("submission failed: {}", excerpt(msg, FEEDBACK_EXCERPT_CHARS))
            }
            Self::Incorrect { reason } => format!(
                "The answer was incorrect. Server response: {}. Please try a different approach.",
                excerpt(reason, FEEDBACK_EXCERPT_CHARS)
            ),
        }
    }
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (killed by signal)".to_string(),
    }
}

fn describe_truncation(truncation: &Option<String>) -> String {
    match truncation {
        Some(notice) => format!(" {notice}"),
        None => String::new(),
    }
}

/// Inputs for one attempt.
#[derive(Debug, Clone, Copy)]
pub struct SolveRequest<'a> {
    pub content: &'a TaskContent,
    pub kind: &'a TaskKind,
    pub feedback: Option<&'a str>,
    pub tier: ModelTier,
    pub sandbox_timeout: Duration,
}

/// Reasoner plan for a non-audio task.
#[derive(Debug, Clone, PartialEq)]
struct Analysis {
    raw: Value,
    question: String,
    submit_url: Option<String>,
    visual_extraction_needed: bool,
}

impl Analysis {
    fn from_value(raw: Value) -> Self {
        let question = raw
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let submit_url = raw
            .get("submit_url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let visual_extraction_needed = match raw.get("visual_extraction_needed") {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(flag)) => flag.eq_ignore_ascii_case("true"),
            _ => false,
        };
        Self {
            raw,
            question,
            submit_url,
            visual_extraction_needed,
        }
    }
}

/// Produces answers for task pages.
#[derive(Clone)]
pub struct Solver {
    collaborators: Collaborators,
    prompts: PromptBuilder,
}

impl Solver {
    pub fn new(collaborators: Collaborators, prompts: PromptBuilder) -> Self {
        Self {
            collaborators,
            prompts,
        }
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Run one attempt.
    #[instrument(skip_all, fields(url = %request.content.url, kind = request.kind.label(), tier = %request.tier))]
    pub async fn solve(&self, request: SolveRequest<'_>) -> Result<Answer, AttemptFailure> {
        match request.kind {
            TaskKind::Audio { audio_url } => self.solve_audio(&request, audio_url).await,
            TaskKind::Data | TaskKind::Text => self.solve_with_program(&request).await,
        }
    }

    async fn solve_audio(
        &self,
        request: &SolveRequest<'_>,
        audio_url: &str,
    ) -> Result<Answer, AttemptFailure> {
        let transcript = self
            .collaborators
            .transcriber
            .transcribe(audio_url)
            .await
            .map_err(|e| AttemptFailure::Transcription(format!("{e:#}")))?;
        debug!(chars = transcript.len(), "transcript ready");

        let pack = self
            .prompts
            .transcript(request.content, &transcript, request.feedback)
            .map_err(|e| AttemptFailure::Reasoner(format!("{e:#}")))?;
        let reply = self.ask(pack, request.tier, None, true).await?;
        extract_answer(&reply).ok_or(AttemptFailure::MalformedOutput { output: reply })
    }

    async fn solve_with_program(&self, request: &SolveRequest<'_>) -> Result<Answer, AttemptFailure> {
        let screenshot = request.content.screenshot.clone();
        let pack = self
            .prompts
            .analyze(request.content, request.feedback)
            .map_err(|e| AttemptFailure::Reasoner(format!("{e:#}")))?;
        let reply = self.ask(pack, request.tier, screenshot.clone(), true).await?;
        let raw = match extract_json(&reply) {
            Some(value @ Value::Object(_)) => value,
            _ => return Err(AttemptFailure::MalformedOutput { output: reply }),
        };

        if let Some(answer) = Answer::from_value(&raw) {
            info!("analysis answered directly");
            return Ok(answer);
        }
        let analysis = Analysis::from_value(raw);

        let visual = match (&screenshot, analysis.visual_extraction_needed) {
            (Some(image), true) => {
                let pack = self
                    .prompts
                    .vision(&analysis.question)
                    .map_err(|e| AttemptFailure::Reasoner(format!("{e:#}")))?;
                Some(self.ask(pack, request.tier, Some(image.clone()), false).await?)
            }
            (None, true) => {
                warn!("visual extraction requested but no screenshot is available");
                None
            }
            _ => None,
        };

        let plan = serde_json::to_string_pretty(&analysis.raw)
            .map_err(|e| AttemptFailure::Reasoner(format!("serialize plan: {e}")))?;
        let pack = self
            .prompts
            .code(
                request.content,
                &plan,
                visual.as_deref(),
                request.feedback,
                request.sandbox_timeout.as_secs(),
            )
            .map_err(|e| AttemptFailure::Reasoner(format!("{e:#}")))?;
        let reply = self.ask(pack, request.tier, None, false).await?;
        let program = strip_code_fences(&reply);
        if program.is_empty() {
            return Err(AttemptFailure::MalformedOutput { output: reply });
        }

        let output = self
            .collaborators
            .sandbox
            .run(&program, request.sandbox_timeout)
            .await
            .map_err(|e| AttemptFailure::Sandbox(format!("{e:#}")))?;
        if output.timed_out {
            return Err(AttemptFailure::ExecutionTimedOut {
                timeout_secs: request.sandbox_timeout.as_secs(),
            });
        }
        if let Some(notice) = &output.truncation {
            warn!(notice = %notice, "program output was truncated");
        }
        if output.exit_code != Some(0) {
            return Err(AttemptFailure::ExecutionFailed {
                exit_code: output.exit_code,
                stderr: output.stderr,
                truncation: output.truncation,
            });
        }

        let mut answer =
            extract_answer(&output.stdout).ok_or(AttemptFailure::ProgramOutputMalformed {
                stdout: output.stdout,
                truncation: output.truncation,
            })?;
        if answer.submit_url.is_none() {
            answer.submit_url = analysis.submit_url;
        }
        Ok(answer)
    }

    async fn ask(
        &self,
        pack: PromptPack,
        tier: ModelTier,
        image: Option<Vec<u8>>,
        json_mode: bool,
    ) -> Result<String, AttemptFailure> {
        self.collaborators
            .reasoner
            .complete(ReasonerRequest {
                system: pack.system,
                prompt: pack.user,
                tier,
                image,
                json_mode,
            })
            .await
            .map_err(|e| AttemptFailure::Reasoner(format!("{e:#}")))
    }
}
