//! Running child processes with a timeout and bounded output capture.

use std::collections::VecDeque;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How often a waiting child is checked for cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Captured child process output.
///
/// Each stream keeps its last bytes; `*_truncated` counts the leading bytes
/// that were dropped.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    /// Killed because the cancel token fired.
    pub cancelled: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn truncation_notice(&self) -> Option<String> {
        if self.stdout_truncated == 0 && self.stderr_truncated == 0 {
            return None;
        }
        Some(format!(
            "[output truncated: first {} bytes of stdout and {} bytes of stderr dropped]",
            self.stdout_truncated, self.stderr_truncated
        ))
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// stdin is closed. Output is read concurrently while the child runs and the
/// last `output_limit_bytes` of each stream are kept; earlier bytes are
/// drained and counted. The child is killed when `timeout` passes or `cancel`
/// fires. On Unix it leads its own process group so the kill reaches anything
/// it spawned too.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancellationToken,
) -> Result<CommandOutput> {
    if cancel.is_cancelled() {
        bail!("cancelled before the command started");
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_tail(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_tail(stderr, output_limit_bytes));

    let mut timed_out = false;
    let mut cancelled = false;
    let status = match wait_or_stop(&mut child, started + timeout, cancel)? {
        Wait::Exited(status) => status,
        stop => {
            match stop {
                Wait::Cancelled => {
                    warn!("command cancelled, killing");
                    cancelled = true;
                }
                _ => {
                    warn!(
                        timeout_secs = timeout.as_secs(),
                        "command timed out, killing"
                    );
                    timed_out = true;
                }
            }
            kill_process_group(child.id());
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    let duration = started.elapsed();
    debug!(exit_code = ?status.code(), timed_out, duration_ms = duration.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
        duration,
    })
}

enum Wait {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// Wait for `child` in short slices so a cancel is noticed promptly.
fn wait_or_stop(child: &mut Child, deadline: Instant, cancel: &CancellationToken) -> Result<Wait> {
    loop {
        if cancel.is_cancelled() {
            return Ok(Wait::Cancelled);
        }
        let Some(left) = deadline.checked_duration_since(Instant::now()) else {
            return Ok(Wait::TimedOut);
        };
        if let Some(status) = child
            .wait_timeout(left.min(CANCEL_POLL))
            .context("wait for command")?
        {
            return Ok(Wait::Exited(status));
        }
    }
}

/// Best-effort SIGKILL for the whole group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let result = Command::new("kill")
        .arg("-KILL")
        .arg(format!("-{pid}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(e) = result {
        warn!(err = %e, pid, "failed to signal process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Drain `reader`, keeping its last `limit` bytes and counting the dropped ones.
fn read_stream_tail<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut tail: VecDeque<u8> = VecDeque::with_capacity(limit.min(64 * 1024));
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        tail.extend(&chunk[..n]);
        if tail.len() > limit {
            let excess = tail.len() - limit;
            tail.drain(..excess);
            dropped += excess;
        }
    }

    Ok((Vec::from(tail), dropped))
}
