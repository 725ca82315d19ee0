//! Scripted collaborators for tests.
//!
//! Every fake replays a queue of canned results in order and records the
//! calls it received. An exhausted queue is an error, so a test notices when
//! the code under test makes more calls than scripted.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::core::types::{Submission, SubmissionResult, TaskContent};
use crate::io::prompt::PromptBuilder;
use crate::io::reasoner::{Reasoner, ReasonerRequest, Transcriber};
use crate::io::renderer::Renderer;
use crate::io::sandbox::{CodeRunner, SandboxOutput};
use crate::io::submit::Submitter;
use crate::solve::{Collaborators, Solver};

fn pop<T>(queue: &Mutex<VecDeque<T>>, what: &str) -> Result<T> {
    queue
        .lock()
        .map_err(|_| anyhow!("{what} queue poisoned"))?
        .pop_front()
        .ok_or_else(|| anyhow!("no scripted {what} left"))
}

fn record<T>(calls: &Mutex<Vec<T>>, call: T) {
    if let Ok(mut calls) = calls.lock() {
        calls.push(call);
    }
}

fn snapshot<T: Clone>(calls: &Mutex<Vec<T>>) -> Vec<T> {
    calls.lock().map(|calls| calls.clone()).unwrap_or_default()
}

/// Serves fixed page text per URL.
#[derive(Debug, Default)]
pub struct ScriptedRenderer {
    pages: HashMap<String, String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, text: &str) -> Self {
        self.pages.insert(url.to_string(), text.to_string());
        self
    }

    /// Sleep before answering each fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        snapshot(&self.calls)
    }
}

#[async_trait]
impl Renderer for ScriptedRenderer {
    async fn fetch(&self, url: &str) -> Result<TaskContent> {
        record(&self.calls, url.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let text = self
            .pages
            .get(url)
            .ok_or_else(|| anyhow!("404 for {url}"))?;
        Ok(TaskContent {
            url: url.to_string(),
            text: text.clone(),
            screenshot: None,
        })
    }
}

/// Replays model replies; `Err(msg)` entries become service errors.
#[derive(Debug, Default)]
pub struct ScriptedReasoner {
    replies: Mutex<VecDeque<Result<String, String>>>,
    calls: Mutex<Vec<ReasonerRequest>>,
}

impl ScriptedReasoner {
    pub fn new(replies: Vec<Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Replies that all succeed.
    pub fn replying(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|r| Ok((*r).to_string())).collect())
    }

    pub fn calls(&self) -> Vec<ReasonerRequest> {
        snapshot(&self.calls)
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn complete(&self, request: ReasonerRequest) -> Result<String> {
        record(&self.calls, request);
        pop(&self.replies, "reasoner reply")?.map_err(|msg| anyhow!(msg))
    }
}

#[derive(Debug, Default)]
pub struct ScriptedTranscriber {
    transcripts: Mutex<VecDeque<Result<String, String>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTranscriber {
    pub fn new(transcripts: Vec<Result<String, String>>) -> Self {
        Self {
            transcripts: Mutex::new(transcripts.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        snapshot(&self.calls)
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, audio_url: &str) -> Result<String> {
        record(&self.calls, audio_url.to_string());
        pop(&self.transcripts, "transcript")?.map_err(|msg| anyhow!(msg))
    }
}

/// Replays sandbox outputs and records the programs it was given.
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
    outputs: Mutex<VecDeque<SandboxOutput>>,
    calls: Mutex<Vec<(String, Duration)>>,
}

impl ScriptedSandbox {
    pub fn new(outputs: Vec<SandboxOutput>) -> Self {
        Self {
            outputs: Mutex::new(outputs.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Duration)> {
        snapshot(&self.calls)
    }
}

#[async_trait]
impl CodeRunner for ScriptedSandbox {
    async fn run(&self, program: &str, timeout: Duration) -> Result<SandboxOutput> {
        record(&self.calls, (program.to_string(), timeout));
        pop(&self.outputs, "sandbox output")
    }
}

/// Replays judge verdicts; `Err(msg)` entries become transport failures.
#[derive(Debug, Default)]
pub struct ScriptedSubmitter {
    verdicts: Mutex<VecDeque<Result<SubmissionResult, String>>>,
    calls: Mutex<Vec<(String, Submission)>>,
}

impl ScriptedSubmitter {
    pub fn new(verdicts: Vec<Result<SubmissionResult, String>>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<(String, Submission)> {
        snapshot(&self.calls)
    }
}

#[async_trait]
impl Submitter for ScriptedSubmitter {
    async fn submit(&self, url: &str, submission: &Submission) -> Result<SubmissionResult> {
        record(&self.calls, (url.to_string(), submission.clone()));
        pop(&self.verdicts, "verdict")?.map_err(|msg| anyhow!(msg))
    }
}

/// Fakes for every port, kept for later inspection.
#[derive(Debug, Clone)]
pub struct Fakes {
    pub renderer: Arc<ScriptedRenderer>,
    pub reasoner: Arc<ScriptedReasoner>,
    pub transcriber: Arc<ScriptedTranscriber>,
    pub sandbox: Arc<ScriptedSandbox>,
    pub submitter: Arc<ScriptedSubmitter>,
}

impl Fakes {
    pub fn new(
        renderer: ScriptedRenderer,
        reasoner: ScriptedReasoner,
        sandbox: ScriptedSandbox,
        submitter: ScriptedSubmitter,
    ) -> Self {
        Self {
            renderer: Arc::new(renderer),
            reasoner: Arc::new(reasoner),
            transcriber: Arc::new(ScriptedTranscriber::default()),
            sandbox: Arc::new(sandbox),
            submitter: Arc::new(submitter),
        }
    }

    pub fn with_transcriber(mut self, transcriber: ScriptedTranscriber) -> Self {
        self.transcriber = Arc::new(transcriber);
        self
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            renderer: self.renderer.clone(),
            reasoner: self.reasoner.clone(),
            transcriber: self.transcriber.clone(),
            sandbox: self.sandbox.clone(),
            submitter: self.submitter.clone(),
        }
    }

    pub fn solver(&self) -> Solver {
        Solver::new(self.collaborators(), PromptBuilder::new(60_000))
    }
}

/// Analysis reply that answers directly.
pub fn direct_answer(answer: Value, submit_url: &str) -> String {
    json!({ "answer": answer, "submit_url": submit_url }).to_string()
}

/// Analysis reply that asks for a program.
pub fn plan_reply(question: &str, submit_url: &str) -> String {
    json!({
        "question": question,
        "submit_url": submit_url,
        "task_type": "data",
        "plan": "1. compute the value 2. print it as json",
        "visual_extraction_needed": false,
    })
    .to_string()
}

pub fn sandbox_ok(stdout: &str) -> SandboxOutput {
    SandboxOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: Some(0),
        timed_out: false,
        duration: Duration::from_millis(5),
        truncation: None,
    }
}

pub fn sandbox_failed(exit_code: i32, stderr: &str) -> SandboxOutput {
    SandboxOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: Some(exit_code),
        timed_out: false,
        duration: Duration::from_millis(5),
        truncation: None,
    }
}

pub fn correct(next_url: Option<&str>) -> Result<SubmissionResult, String> {
    Ok(SubmissionResult {
        correct: true,
        next_url: next_url.map(str::to_string),
        reason: None,
    })
}

pub fn incorrect(reason: &str) -> Result<SubmissionResult, String> {
    Ok(SubmissionResult {
        correct: false,
        next_url: None,
        reason: Some(reason.to_string()),
    })
}
