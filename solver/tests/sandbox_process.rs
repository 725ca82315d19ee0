//! Process sandbox behaviour, using `sh` as the interpreter.
#![cfg(unix)]

use std::fs;
use std::time::{Duration, Instant};

use solver::core::extract::extract_answer;
use solver::io::config::SandboxConfig;
use solver::io::sandbox::{CodeRunner, ProcessSandbox};

fn sh_sandbox(work_dir: &std::path::Path) -> ProcessSandbox {
    ProcessSandbox::new(&SandboxConfig {
        interpreter: vec!["sh".to_string()],
        timeout_secs: 5,
        output_limit_bytes: 4_096,
        scrub_env: vec!["SOLVER_TEST_SECRET".to_string()],
        work_dir: Some(work_dir.to_path_buf()),
    })
}

fn scratch_entries(dir: &std::path::Path) -> usize {
    fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

#[tokio::test]
async fn prints_json_answer() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sandbox = sh_sandbox(temp.path());

    let output = sandbox
        .run(
            "echo 'loading'\necho '{\"answer\": 300, \"submit_url\": \"https://quiz.example/submit\"}'\n",
            Duration::from_secs(5),
        )
        .await
        .expect("run");

    assert!(output.succeeded());
    let answer = extract_answer(&output.stdout).expect("answer");
    assert_eq!(answer.answer, serde_json::json!(300));
    assert_eq!(scratch_entries(temp.path()), 0, "scratch dir removed");
}

#[tokio::test]
async fn nonzero_exit_is_reported_with_stderr() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sandbox = sh_sandbox(temp.path());

    let output = sandbox
        .run("echo 'boom' >&2\nexit 4\n", Duration::from_secs(5))
        .await
        .expect("run");

    assert!(!output.succeeded());
    assert!(!output.timed_out);
    assert_eq!(output.exit_code, Some(4));
    assert_eq!(output.stderr.trim(), "boom");
}

#[tokio::test]
async fn timeout_is_distinct_from_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sandbox = sh_sandbox(temp.path());

    let started = Instant::now();
    let output = sandbox
        .run("sleep 30\n", Duration::from_millis(300))
        .await
        .expect("run");

    assert!(output.timed_out);
    assert_eq!(output.exit_code, None);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(scratch_entries(temp.path()), 0, "scratch dir removed after timeout");
}

#[tokio::test]
async fn runs_inside_scratch_dir_and_cleans_up() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sandbox = sh_sandbox(temp.path());
    let output = sandbox
        .run(
            "ls\necho \"secret=${SOLVER_TEST_SECRET:-unset}\"\ntouch leftover.txt\n",
            Duration::from_secs(5),
        )
        .await
        .expect("run");

    assert!(output.succeeded());
    assert!(output.stdout.contains("solution.py"), "{}", output.stdout);
    assert!(output.stdout.contains("secret=unset"), "{}", output.stdout);
    assert_eq!(scratch_entries(temp.path()), 0, "files written by the program are removed");
}

#[tokio::test]
async fn large_output_is_truncated() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sandbox = sh_sandbox(temp.path());

    let output = sandbox
        .run(
            "i=0\nwhile [ $i -lt 2000 ]; do echo 0123456789; i=$((i+1)); done\n",
            Duration::from_secs(5),
        )
        .await
        .expect("run");

    assert_eq!(output.stdout.len(), 4_096);
    assert!(output.stdout.ends_with("0123456789\n"));
    let notice = output.truncation.expect("truncation notice");
    assert!(notice.contains("stdout"), "{notice}");
}

#[tokio::test]
async fn answer_after_noisy_progress_survives_truncation() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sandbox = sh_sandbox(temp.path());

    let output = sandbox
        .run(
            "i=0\nwhile [ $i -lt 1000 ]; do echo \"progress $i\"; i=$((i+1)); done\necho '{\"answer\": 300}'\n",
            Duration::from_secs(5),
        )
        .await
        .expect("run");

    assert!(output.succeeded());
    assert!(output.truncation.is_some());
    assert!(!output.stdout.contains("progress 0\n"));
    let answer = extract_answer(&output.stdout).expect("answer kept at the end");
    assert_eq!(answer.answer, serde_json::json!(300));
}

#[tokio::test]
async fn dropping_the_run_kills_the_program() {
    let temp = tempfile::tempdir().expect("tempdir");
    let outside = tempfile::tempdir().expect("tempdir");
    let marker = outside.path().join("ran");
    let sandbox = sh_sandbox(temp.path());
    let program = format!("sleep 2\necho ran > '{}'\n", marker.display());

    let abandoned = tokio::time::timeout(
        Duration::from_millis(300),
        sandbox.run(&program, Duration::from_secs(30)),
    )
    .await;
    assert!(abandoned.is_err(), "run should still be going when dropped");

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!marker.exists(), "program kept running after its future was dropped");
    for _ in 0..50 {
        if scratch_entries(temp.path()) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(scratch_entries(temp.path()), 0, "scratch dir removed after kill");
}
