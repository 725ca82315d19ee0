//! Executing generated programs in an isolated child process.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::io::config::SandboxConfig;
use crate::io::process::run_command_with_timeout;

const PROGRAM_FILE: &str = "solution.py";

/// Result of one sandboxed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal (including timeout).
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
    pub truncation: Option<String>,
}

impl SandboxOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Executes a program and reports its output.
///
/// `Err` is reserved for failures to start or observe the process; a program
/// that exits non-zero or times out is a normal `Ok` outcome.
#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run(&self, program: &str, timeout: Duration) -> Result<SandboxOutput>;
}

/// Runs programs with the configured interpreter in a fresh scratch directory.
///
/// Dropping the future returned by `run` kills the program and its children.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    interpreter: Vec<String>,
    output_limit_bytes: usize,
    scrub_env: Vec<String>,
    work_dir: Option<PathBuf>,
}

impl ProcessSandbox {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            interpreter: config.interpreter.clone(),
            output_limit_bytes: config.output_limit_bytes,
            scrub_env: config.scrub_env.clone(),
            work_dir: config.work_dir.clone(),
        }
    }

    fn run_blocking(
        &self,
        program: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SandboxOutput> {
        let scratch = match &self.work_dir {
            Some(parent) => {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create sandbox parent {}", parent.display()))?;
                tempfile::Builder::new()
                    .prefix("solve-")
                    .tempdir_in(parent)
            }
            None => tempfile::Builder::new().prefix("solve-").tempdir(),
        }
        .context("create sandbox scratch dir")?;

        let program_path = scratch.path().join(PROGRAM_FILE);
        fs::write(&program_path, program)
            .with_context(|| format!("write {}", program_path.display()))?;

        let (exe, args) = self
            .interpreter
            .split_first()
            .context("sandbox interpreter is empty")?;
        let mut cmd = Command::new(exe);
        cmd.args(args).arg(&program_path).current_dir(scratch.path());
        for key in &self.scrub_env {
            cmd.env_remove(key);
        }

        debug!(dir = %scratch.path().display(), "running program");
        let output = run_command_with_timeout(cmd, timeout, self.output_limit_bytes, cancel)?;
        let truncation = output.truncation_notice();
        // `scratch` drops here, removing the directory and anything the program wrote.
        Ok(SandboxOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: if output.timed_out || output.cancelled {
                None
            } else {
                output.status.code()
            },
            timed_out: output.timed_out,
            duration: output.duration,
            truncation,
        })
    }
}

#[async_trait]
impl CodeRunner for ProcessSandbox {
    #[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), program_bytes = program.len()))]
    async fn run(&self, program: &str, timeout: Duration) -> Result<SandboxOutput> {
        let sandbox = self.clone();
        let program = program.to_string();
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let kill_on_drop = cancel.drop_guard();
        let output = tokio::task::spawn_blocking(move || {
            sandbox.run_blocking(&program, timeout, &worker_cancel)
        })
        .await
        .context("sandbox worker panicked")??;
        kill_on_drop.disarm();
        info!(
            exit_code = ?output.exit_code,
            timed_out = output.timed_out,
            duration_ms = output.duration.as_millis() as u64,
            "program finished"
        );
        Ok(output)
    }
}
