//! The task loop: walk a chain of task pages until the judge stops it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::core::budget::{BudgetExhausted, RunBudget};
use crate::core::classifier::classify_task;
use crate::core::escalation::EscalationPolicy;
use crate::core::links::resolve_link;
use crate::core::run::{RunId, SubmissionRecord, TaskRun};
use crate::core::types::{RunStatus, Submission, TaskContent, TaskKind};
use crate::io::config::SolverConfig;
use crate::io::run_store::RunStore;
use crate::solve::{AttemptFailure, SolveRequest, Solver};

/// Limits for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    pub max_steps: u32,
    pub max_attempts: u32,
    pub run_timeout: Duration,
    pub sandbox_timeout: Duration,
    pub escalation: EscalationPolicy,
}

impl LoopConfig {
    pub fn from_config(config: &SolverConfig) -> Result<Self> {
        Ok(Self {
            max_steps: config.budget.max_steps,
            max_attempts: config.budget.max_attempts,
            run_timeout: config.run_timeout(),
            sandbox_timeout: config.sandbox.timeout(),
            escalation: config
                .reasoner
                .escalation_policy()
                .context("build escalation policy")?,
        })
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            max_attempts: 3,
            run_timeout: Duration::from_secs(160),
            sandbox_timeout: Duration::from_secs(60),
            escalation: EscalationPolicy::default(),
        }
    }
}

/// What the caller asked for. Owns the secret for the lifetime of the run.
#[derive(Clone)]
pub struct RunRequest {
    pub email: String,
    pub secret: String,
    pub url: String,
}

impl fmt::Debug for RunRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunRequest")
            .field("email", &self.email)
            .field("secret", &"<redacted>")
            .field("url", &self.url)
            .finish()
    }
}

/// Reason why `TaskLoop::run` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The judge accepted an answer and named no further task.
    Completed,
    /// A task could not be fetched or every attempt on it failed.
    Failed { reason: String },
    /// The wall-clock budget ran out.
    Timeout,
    /// The run was cancelled from outside.
    Cancelled,
    /// The chain was longer than the step cap.
    MaxStepsReached,
}

impl LoopStop {
    pub fn status(&self) -> RunStatus {
        match self {
            Self::Completed => RunStatus::Completed,
            Self::Timeout => RunStatus::Timeout,
            Self::Failed { .. } | Self::Cancelled | Self::MaxStepsReached => RunStatus::Failed,
        }
    }
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub run_id: RunId,
    pub steps_executed: u32,
    pub stop: LoopStop,
}

/// Result of working one task page.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AttemptsOutcome {
    /// Correct answer; continue at this URL.
    Advance(String),
    /// Correct answer and the chain ends here.
    Completed,
    /// Every attempt failed; carries the last feedback.
    Exhausted(String),
    OutOfBudget(BudgetExhausted),
}

/// Writes run progress to the store and to tracing.
struct Recorder<'a> {
    store: &'a dyn RunStore,
    run_id: &'a RunId,
}

impl Recorder<'_> {
    fn log(&self, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        info!(run_id = %self.run_id, "{message}");
        self.store
            .update(self.run_id, &mut |run| run.log(message.clone()))
    }

    fn begin_step(&self, step: u32, url: &str) -> Result<()> {
        self.store
            .update(self.run_id, &mut |run| run.begin_step(url))?;
        self.log(format!("step {step}: fetching {url}"))
    }

    fn record_submission(&self, record: SubmissionRecord) -> Result<()> {
        self.store
            .update(self.run_id, &mut |run| run.record_submission(record.clone()))
    }

    fn finish(&self, stop: &LoopStop) -> Result<()> {
        let (error, result) = match stop {
            LoopStop::Completed => (None, Some("chain completed".to_string())),
            LoopStop::Failed { reason } => (Some(reason.clone()), None),
            LoopStop::Timeout => (Some("run time budget exhausted".to_string()), None),
            LoopStop::Cancelled => (Some("cancelled".to_string()), None),
            LoopStop::MaxStepsReached => (Some("max steps reached".to_string()), None),
        };
        let status = stop.status();
        match &error {
            Some(err) => warn!(run_id = %self.run_id, %status, err = %err, "run stopped"),
            None => info!(run_id = %self.run_id, %status, "run finished"),
        }
        self.store.update(self.run_id, &mut |run| {
            let note = match &error {
                Some(err) => format!("run {status}: {err}"),
                None => format!("run {status}"),
            };
            run.log(note)?;
            run.finish(status, error.clone(), result.clone())
        })
    }
}

/// Drives one run from its entry URL to a terminal status.
#[derive(Clone)]
pub struct TaskLoop {
    config: LoopConfig,
    solver: Solver,
    store: Arc<dyn RunStore>,
}

impl TaskLoop {
    pub fn new(config: LoopConfig, solver: Solver, store: Arc<dyn RunStore>) -> Self {
        Self {
            config,
            solver,
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Walk the chain for `request`, recording progress under `run_id`.
    ///
    /// A record is created when the store has none. On return the record is
    /// terminal unless the store itself failed, which is the only `Err` case.
    #[instrument(skip_all, fields(run_id = %run_id, url = %request.url))]
    pub async fn run(
        &self,
        run_id: &RunId,
        request: &RunRequest,
        cancel: CancellationToken,
    ) -> Result<LoopOutcome> {
        if self.store.get(run_id)?.is_none() {
            self.store
                .put(TaskRun::new(run_id.clone(), &request.email, &request.url))?;
        }
        let recorder = Recorder {
            store: self.store.as_ref(),
            run_id,
        };
        self.store
            .update(run_id, &mut |run| run.transition(RunStatus::Processing))?;
        recorder.log(format!("run started at {}", request.url))?;

        let budget = RunBudget::start(self.config.run_timeout, cancel);
        let mut url = request.url.clone();
        let mut steps_executed = 0u32;

        let stop = loop {
            if steps_executed >= self.config.max_steps {
                break LoopStop::MaxStepsReached;
            }
            if let Err(exhausted) = budget.check() {
                break budget_stop(exhausted);
            }
            steps_executed += 1;
            recorder.begin_step(steps_executed, &url)?;

            let content = match budget.bound(self.solver.collaborators().renderer.fetch(&url)).await
            {
                Ok(Ok(content)) => content,
                Ok(Err(err)) => {
                    error!(url = %url, "fetch failed: {err:#}");
                    break LoopStop::Failed {
                        reason: format!("fetch failed for {url}: {err:#}"),
                    };
                }
                Err(exhausted) => break budget_stop(exhausted),
            };
            let kind = classify_task(&url, &content.text);
            recorder.log(format!("classified task as {}", kind.label()))?;

            let outcome = self
                .attempts(&recorder, &budget, request, &url, &content, &kind)
                .await?;
            match outcome {
                AttemptsOutcome::Advance(next) => {
                    recorder.log(format!("correct, next task {next}"))?;
                    url = next;
                }
                AttemptsOutcome::Completed => break LoopStop::Completed,
                AttemptsOutcome::Exhausted(feedback) => {
                    break LoopStop::Failed {
                        reason: format!(
                            "all {} attempts failed at {url}; last feedback: {feedback}",
                            self.config.max_attempts
                        ),
                    };
                }
                AttemptsOutcome::OutOfBudget(exhausted) => break budget_stop(exhausted),
            }
        };

        info!(
            steps = steps_executed,
            elapsed_ms = budget.elapsed().as_millis() as u64,
            "loop stopped"
        );
        recorder.finish(&stop)?;
        Ok(LoopOutcome {
            run_id: run_id.clone(),
            steps_executed,
            stop,
        })
    }

    /// Solve and submit one task, retrying with feedback.
    async fn attempts(
        &self,
        recorder: &Recorder<'_>,
        budget: &RunBudget,
        request: &RunRequest,
        url: &str,
        content: &TaskContent,
        kind: &TaskKind,
    ) -> Result<AttemptsOutcome> {
        let max_attempts = self.config.max_attempts;
        let mut feedback: Option<String> = None;

        for attempt in 0..max_attempts {
            let remaining = match budget.check() {
                Ok(remaining) => remaining,
                Err(exhausted) => return Ok(AttemptsOutcome::OutOfBudget(exhausted)),
            };
            let tier = self.config.escalation.tier_for(attempt, max_attempts);
            recorder.log(format!(
                "attempt {}/{max_attempts} on {tier} tier",
                attempt + 1
            ))?;

            let solve = self.solver.solve(SolveRequest {
                content,
                kind,
                feedback: feedback.as_deref(),
                tier,
                sandbox_timeout: self.config.sandbox_timeout.min(remaining),
            });
            let answer = match budget.bound(solve).await {
                Ok(Ok(answer)) => answer,
                Ok(Err(failure)) => {
                    recorder.log(format!("attempt {} failed: {failure}", attempt + 1))?;
                    feedback = Some(failure.feedback());
                    continue;
                }
                Err(exhausted) => return Ok(AttemptsOutcome::OutOfBudget(exhausted)),
            };

            let submit_url = match answer.submit_url.as_deref() {
                Some(target) => resolve_link(url, target).unwrap_or_else(|| {
                    warn!(target, "unusable submit url, posting to the task url");
                    url.to_string()
                }),
                None => url.to_string(),
            };
            let submission = Submission {
                email: request.email.clone(),
                secret: request.secret.clone(),
                url: url.to_string(),
                answer: answer.answer.clone(),
            };
            recorder.log(format!("submitting {} to {submit_url}", answer.answer))?;

            let verdict = match budget
                .bound(
                    self.solver
                        .collaborators()
                        .submitter
                        .submit(&submit_url, &submission),
                )
                .await
            {
                Ok(Ok(verdict)) => verdict,
                Ok(Err(err)) => {
                    let failure = AttemptFailure::Submission(format!("{err:#}"));
                    recorder.log(format!("attempt {} failed: {failure}", attempt + 1))?;
                    feedback = Some(failure.feedback());
                    continue;
                }
                Err(exhausted) => return Ok(AttemptsOutcome::OutOfBudget(exhausted)),
            };

            recorder.record_submission(SubmissionRecord {
                at: Utc::now(),
                task_url: url.to_string(),
                submit_url: submit_url.clone(),
                answer: answer.answer,
                correct: verdict.correct,
                reason: verdict.reason.clone(),
            })?;

            if verdict.correct {
                let Some(next) = verdict.next_url else {
                    return Ok(AttemptsOutcome::Completed);
                };
                return Ok(match resolve_link(url, &next) {
                    Some(next) => AttemptsOutcome::Advance(next),
                    None => {
                        recorder.log(format!("ignoring unusable next url {next:?}"))?;
                        AttemptsOutcome::Completed
                    }
                });
            }

            let failure = AttemptFailure::Incorrect {
                reason: verdict
                    .reason
                    .unwrap_or_else(|| "no reason given".to_string()),
            };
            recorder.log(format!("attempt {} failed: {failure}", attempt + 1))?;
            feedback = Some(failure.feedback());
        }

        Ok(AttemptsOutcome::Exhausted(feedback.unwrap_or_default()))
    }
}

fn budget_stop(exhausted: BudgetExhausted) -> LoopStop {
    match exhausted {
        BudgetExhausted::TimedOut { .. } => LoopStop::Timeout,
        BudgetExhausted::Cancelled => LoopStop::Cancelled,
    }
}
