//! End-to-end runs of the task loop over scripted collaborators.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use solver::core::run::{RunId, TaskRun};
use solver::core::types::{ModelTier, RunStatus};
use solver::io::run_store::{InMemoryRunStore, RunStore};
use solver::looping::{LoopConfig, LoopStop, RunRequest, TaskLoop};
use solver::test_support::{
    Fakes, ScriptedReasoner, ScriptedRenderer, ScriptedSandbox, ScriptedSubmitter,
    ScriptedTranscriber, correct, direct_answer, incorrect, plan_reply, sandbox_failed, sandbox_ok,
};
use tokio_util::sync::CancellationToken;

const TASK_1: &str = "https://quiz.example/tasks/1";
const TASK_2: &str = "https://quiz.example/tasks/2";
const TASK_3: &str = "https://quiz.example/tasks/3";
const SUBMIT: &str = "https://quiz.example/submit";

fn request(url: &str) -> RunRequest {
    RunRequest {
        email: "student@example.com".to_string(),
        secret: "s3cret".to_string(),
        url: url.to_string(),
    }
}

fn task_loop(fakes: &Fakes, config: LoopConfig) -> (TaskLoop, Arc<InMemoryRunStore>) {
    let store = Arc::new(InMemoryRunStore::new());
    let task_loop = TaskLoop::new(config, fakes.solver(), store.clone());
    (task_loop, store)
}

fn record(store: &InMemoryRunStore, id: &RunId) -> TaskRun {
    store.get(id).expect("get").expect("record exists")
}

#[tokio::test]
async fn single_task_completes_without_further_fetch() {
    let fakes = Fakes::new(
        ScriptedRenderer::new().page(TASK_1, "What is 100 + 200? Post your answer to /submit."),
        ScriptedReasoner::replying(&[&direct_answer(json!(300), SUBMIT)]),
        ScriptedSandbox::default(),
        ScriptedSubmitter::new(vec![correct(None)]),
    );
    let (task_loop, store) = task_loop(&fakes, LoopConfig::default());
    let run_id = RunId::from("run-1");

    let outcome = task_loop
        .run(&run_id, &request(TASK_1), CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(outcome.stop, LoopStop::Completed);
    assert_eq!(outcome.steps_executed, 1);
    assert_eq!(fakes.renderer.calls(), vec![TASK_1.to_string()]);

    let submissions = fakes.submitter.calls();
    assert_eq!(submissions.len(), 1);
    let (url, payload) = &submissions[0];
    assert_eq!(url, SUBMIT);
    assert_eq!(payload.email, "student@example.com");
    assert_eq!(payload.secret, "s3cret");
    assert_eq!(payload.url, TASK_1);
    assert_eq!(payload.answer, json!(300));

    let run = record(&store, &run_id);
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.result.is_some());
    assert!(run.error.is_none());
    assert_eq!(run.history.len(), 1);
    assert!(run.history[0].correct);
    assert_eq!(run.steps, 1);
}

#[tokio::test]
async fn chain_advances_and_resets_attempts() {
    let fakes = Fakes::new(
        ScriptedRenderer::new()
            .page(TASK_1, "Add the numbers 1 and 1.")
            .page(TASK_2, "Add the numbers 1 and 2."),
        ScriptedReasoner::replying(&[
            &direct_answer(json!(1), SUBMIT),
            &direct_answer(json!(2), SUBMIT),
            &direct_answer(json!(3), SUBMIT),
        ]),
        ScriptedSandbox::default(),
        ScriptedSubmitter::new(vec![
            incorrect("Wrong sum"),
            correct(Some("/tasks/2")),
            correct(None),
        ]),
    );
    let (task_loop, store) = task_loop(&fakes, LoopConfig::default());
    let run_id = RunId::from("run-2");

    let outcome = task_loop
        .run(&run_id, &request(TASK_1), CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(outcome.stop, LoopStop::Completed);
    assert_eq!(outcome.steps_executed, 2);
    assert_eq!(
        fakes.renderer.calls(),
        vec![TASK_1.to_string(), TASK_2.to_string()]
    );

    let calls = fakes.reasoner.calls();
    let tiers: Vec<ModelTier> = calls.iter().map(|c| c.tier).collect();
    assert_eq!(tiers, vec![ModelTier::Fast, ModelTier::Strong, ModelTier::Fast]);

    let second_prompt = &calls[1].prompt;
    assert!(
        second_prompt.contains(
            "The answer was incorrect. Server response: Wrong sum. Please try a different approach."
        ),
        "{second_prompt}"
    );
    let third_prompt = &calls[2].prompt;
    assert!(!third_prompt.contains("### Previous Attempt"));

    let payload_urls: Vec<String> = fakes
        .submitter
        .calls()
        .into_iter()
        .map(|(_, payload)| payload.url)
        .collect();
    assert_eq!(payload_urls, vec![TASK_1, TASK_1, TASK_2]);

    let run = record(&store, &run_id);
    assert_eq!(run.current_url, TASK_2);
    assert_eq!(run.history.len(), 3);
    assert!(!run.history[0].correct);
    assert_eq!(run.history[0].reason.as_deref(), Some("Wrong sum"));
}

#[tokio::test]
async fn three_malformed_attempts_fail_the_run() {
    let fakes = Fakes::new(
        ScriptedRenderer::new().page(TASK_1, "Say something."),
        ScriptedReasoner::replying(&["not json", "still not json", "nope"]),
        ScriptedSandbox::default(),
        ScriptedSubmitter::default(),
    );
    let (task_loop, store) = task_loop(&fakes, LoopConfig::default());
    let run_id = RunId::from("run-3");

    let outcome = task_loop
        .run(&run_id, &request(TASK_1), CancellationToken::new())
        .await
        .expect("run");

    let LoopStop::Failed { reason } = &outcome.stop else {
        panic!("expected failure, got {:?}", outcome.stop);
    };
    assert!(reason.contains("all 3 attempts failed"), "{reason}");
    assert!(reason.contains("not valid JSON"), "{reason}");
    assert!(fakes.submitter.calls().is_empty());
    assert_eq!(fakes.renderer.calls().len(), 1);

    let tiers: Vec<ModelTier> = fakes.reasoner.calls().iter().map(|c| c.tier).collect();
    assert_eq!(
        tiers,
        vec![ModelTier::Fast, ModelTier::Strong, ModelTier::Strong]
    );

    let run = record(&store, &run_id);
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some(reason.as_str()));
}

#[tokio::test]
async fn three_rejected_answers_fail_the_run() {
    let fakes = Fakes::new(
        ScriptedRenderer::new().page(TASK_1, "Add the numbers 2 and 2."),
        ScriptedReasoner::replying(&[
            &direct_answer(json!(3), SUBMIT),
            &direct_answer(json!(5), SUBMIT),
            &direct_answer(json!(22), SUBMIT),
        ]),
        ScriptedSandbox::default(),
        ScriptedSubmitter::new(vec![
            incorrect("Wrong sum"),
            incorrect("Still wrong"),
            incorrect("Not even close"),
        ]),
    );
    let (task_loop, store) = task_loop(&fakes, LoopConfig::default());
    let run_id = RunId::from("run-rejected");

    let outcome = task_loop
        .run(&run_id, &request(TASK_1), CancellationToken::new())
        .await
        .expect("run");

    let LoopStop::Failed { reason } = &outcome.stop else {
        panic!("expected failure, got {:?}", outcome.stop);
    };
    assert!(reason.contains("all 3 attempts failed"), "{reason}");
    assert!(reason.contains("Not even close"), "{reason}");

    let submissions = fakes.submitter.calls();
    assert_eq!(submissions.len(), 3);
    let answers: Vec<_> = submissions.iter().map(|(_, payload)| payload.answer.clone()).collect();
    assert_eq!(answers, vec![json!(3), json!(5), json!(22)]);
    assert_eq!(fakes.renderer.calls().len(), 1);

    let run = record(&store, &run_id);
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.history.len(), 3);
    assert!(run.history.iter().all(|entry| !entry.correct));
    assert_eq!(run.current_url, TASK_1);
}

#[tokio::test]
async fn program_path_runs_code_and_defaults_submit_url() {
    let fakes = Fakes::new(
        ScriptedRenderer::new().page(TASK_1, "Download data.csv and sum the value column."),
        ScriptedReasoner::replying(&[
            &plan_reply("Sum the value column", SUBMIT),
            "```python\nprint('{\"answer\": 42}')\n```",
        ]),
        ScriptedSandbox::new(vec![sandbox_ok("loading rows\n{\"answer\": 42}\n")]),
        ScriptedSubmitter::new(vec![correct(None)]),
    );
    let (task_loop, _store) = task_loop(&fakes, LoopConfig::default());

    let outcome = task_loop
        .run(&RunId::from("run-4"), &request(TASK_1), CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(outcome.stop, LoopStop::Completed);
    let calls = fakes.reasoner.calls();
    assert!(calls[0].json_mode);
    assert!(!calls[1].json_mode);
    assert!(calls[1].prompt.contains("Sum the value column"));

    let programs = fakes.sandbox.calls();
    assert_eq!(programs.len(), 1);
    assert_eq!(programs[0].0, "print('{\"answer\": 42}')");
    assert!(programs[0].1 <= Duration::from_secs(60));

    let submissions = fakes.submitter.calls();
    let (url, payload) = &submissions[0];
    assert_eq!(url, SUBMIT);
    assert_eq!(payload.answer, json!(42));
}

#[tokio::test]
async fn failing_program_feeds_stderr_into_next_attempt() {
    let fakes = Fakes::new(
        ScriptedRenderer::new().page(TASK_1, "Compute the checksum of the dataset."),
        ScriptedReasoner::replying(&[
            &plan_reply("checksum", SUBMIT),
            "print(x)",
            &plan_reply("checksum", SUBMIT),
            "print('{\"answer\": 7}')",
        ]),
        ScriptedSandbox::new(vec![
            sandbox_failed(1, "NameError: name 'x' is not defined"),
            sandbox_ok("{\"answer\": 7}"),
        ]),
        ScriptedSubmitter::new(vec![correct(None)]),
    );
    let (task_loop, store) = task_loop(&fakes, LoopConfig::default());
    let run_id = RunId::from("run-5");

    let outcome = task_loop
        .run(&run_id, &request(TASK_1), CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(outcome.stop, LoopStop::Completed);
    let calls = fakes.reasoner.calls();
    assert_eq!(calls.len(), 4);
    assert!(calls[2].prompt.contains("NameError: name 'x' is not defined"));
    assert!(calls[3].prompt.contains("exit code 1"));

    let run = record(&store, &run_id);
    assert!(
        run.logs
            .iter()
            .any(|entry| entry.message.contains("attempt 1 failed: program exited with exit code 1"))
    );
}

#[tokio::test]
async fn submission_transport_error_consumes_an_attempt() {
    let fakes = Fakes::new(
        ScriptedRenderer::new().page(TASK_1, "What is 2 + 2?"),
        ScriptedReasoner::replying(&[
            &direct_answer(json!(4), SUBMIT),
            &direct_answer(json!(4), SUBMIT),
        ]),
        ScriptedSandbox::default(),
        ScriptedSubmitter::new(vec![Err("connection refused".to_string()), correct(None)]),
    );
    let (task_loop, store) = task_loop(&fakes, LoopConfig::default());
    let run_id = RunId::from("run-6");

    let outcome = task_loop
        .run(&run_id, &request(TASK_1), CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(outcome.stop, LoopStop::Completed);
    let calls = fakes.reasoner.calls();
    let second_prompt = &calls[1].prompt;
    assert!(
        second_prompt.contains("submission failed: connection refused"),
        "{second_prompt}"
    );
    assert_eq!(record(&store, &run_id).history.len(), 1);
}

#[tokio::test]
async fn zero_budget_times_out_before_any_call() {
    let fakes = Fakes::new(
        ScriptedRenderer::new().page(TASK_1, "unused"),
        ScriptedReasoner::default(),
        ScriptedSandbox::default(),
        ScriptedSubmitter::default(),
    );
    let config = LoopConfig {
        run_timeout: Duration::ZERO,
        ..LoopConfig::default()
    };
    let (task_loop, store) = task_loop(&fakes, config);
    let run_id = RunId::from("run-7");

    let outcome = task_loop
        .run(&run_id, &request(TASK_1), CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(outcome.stop, LoopStop::Timeout);
    assert_eq!(outcome.steps_executed, 0);
    assert!(fakes.renderer.calls().is_empty());
    assert!(fakes.reasoner.calls().is_empty());
    assert!(fakes.submitter.calls().is_empty());
    assert_eq!(record(&store, &run_id).status, RunStatus::Timeout);
}

#[tokio::test]
async fn slow_fetch_is_cut_off_by_the_budget() {
    let fakes = Fakes::new(
        ScriptedRenderer::new()
            .page(TASK_1, "unused")
            .with_delay(Duration::from_secs(30)),
        ScriptedReasoner::default(),
        ScriptedSandbox::default(),
        ScriptedSubmitter::default(),
    );
    let config = LoopConfig {
        run_timeout: Duration::from_millis(200),
        ..LoopConfig::default()
    };
    let (task_loop, store) = task_loop(&fakes, config);
    let run_id = RunId::from("run-8");

    let started = std::time::Instant::now();
    let outcome = task_loop
        .run(&run_id, &request(TASK_1), CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(outcome.stop, LoopStop::Timeout);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(fakes.reasoner.calls().is_empty());
    assert_eq!(record(&store, &run_id).status, RunStatus::Timeout);
}

#[tokio::test]
async fn cancelled_run_fails_with_reason() {
    let fakes = Fakes::new(
        ScriptedRenderer::new().page(TASK_1, "unused"),
        ScriptedReasoner::default(),
        ScriptedSandbox::default(),
        ScriptedSubmitter::default(),
    );
    let (task_loop, store) = task_loop(&fakes, LoopConfig::default());
    let run_id = RunId::from("run-9");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = task_loop
        .run(&run_id, &request(TASK_1), cancel)
        .await
        .expect("run");

    assert_eq!(outcome.stop, LoopStop::Cancelled);
    assert!(fakes.renderer.calls().is_empty());
    let run = record(&store, &run_id);
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn step_cap_ends_long_chains() {
    let fakes = Fakes::new(
        ScriptedRenderer::new()
            .page(TASK_1, "Task one text.")
            .page(TASK_2, "Task two text.")
            .page(TASK_3, "Task three text."),
        ScriptedReasoner::replying(&[
            &direct_answer(json!("a"), SUBMIT),
            &direct_answer(json!("b"), SUBMIT),
        ]),
        ScriptedSandbox::default(),
        ScriptedSubmitter::new(vec![correct(Some(TASK_2)), correct(Some(TASK_3))]),
    );
    let config = LoopConfig {
        max_steps: 2,
        ..LoopConfig::default()
    };
    let (task_loop, store) = task_loop(&fakes, config);
    let run_id = RunId::from("run-10");

    let outcome = task_loop
        .run(&run_id, &request(TASK_1), CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(outcome.stop, LoopStop::MaxStepsReached);
    assert_eq!(outcome.steps_executed, 2);
    assert_eq!(fakes.renderer.calls().len(), 2);
    let run = record(&store, &run_id);
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("max steps reached"));
}

#[tokio::test]
async fn fetch_failure_fails_without_retry() {
    let fakes = Fakes::new(
        ScriptedRenderer::new(),
        ScriptedReasoner::default(),
        ScriptedSandbox::default(),
        ScriptedSubmitter::default(),
    );
    let (task_loop, store) = task_loop(&fakes, LoopConfig::default());
    let run_id = RunId::from("run-11");

    let outcome = task_loop
        .run(&run_id, &request(TASK_1), CancellationToken::new())
        .await
        .expect("run");

    assert!(matches!(outcome.stop, LoopStop::Failed { .. }));
    assert_eq!(fakes.renderer.calls().len(), 1);
    let run = record(&store, &run_id);
    assert_eq!(run.status, RunStatus::Failed);
    assert!(
        run.error
            .as_deref()
            .is_some_and(|err| err.contains("fetch failed"))
    );
}

#[tokio::test]
async fn audio_task_answers_from_transcript() {
    let fakes = Fakes::new(
        ScriptedRenderer::new().page(
            TASK_1,
            "Listen to https://cdn.example/q1.mp3 and submit the spoken number.",
        ),
        ScriptedReasoner::replying(&[&direct_answer(json!(7), SUBMIT)]),
        ScriptedSandbox::default(),
        ScriptedSubmitter::new(vec![correct(None)]),
    )
    .with_transcriber(ScriptedTranscriber::new(vec![Ok(
        "the number is seven".to_string()
    )]));
    let (task_loop, _store) = task_loop(&fakes, LoopConfig::default());

    let outcome = task_loop
        .run(&RunId::from("run-12"), &request(TASK_1), CancellationToken::new())
        .await
        .expect("run");

    assert_eq!(outcome.stop, LoopStop::Completed);
    assert_eq!(
        fakes.transcriber.calls(),
        vec!["https://cdn.example/q1.mp3".to_string()]
    );
    let calls = fakes.reasoner.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].prompt.contains("the number is seven"));
    assert!(fakes.sandbox.calls().is_empty());
}

#[tokio::test]
async fn finished_record_rejects_further_mutation() {
    let fakes = Fakes::new(
        ScriptedRenderer::new().page(TASK_1, "What is 1 + 1?"),
        ScriptedReasoner::replying(&[&direct_answer(json!(2), SUBMIT)]),
        ScriptedSandbox::default(),
        ScriptedSubmitter::new(vec![correct(None)]),
    );
    let (task_loop, store) = task_loop(&fakes, LoopConfig::default());
    let run_id = RunId::from("run-13");
    task_loop
        .run(&run_id, &request(TASK_1), CancellationToken::new())
        .await
        .expect("run");

    let before = record(&store, &run_id);
    assert!(store.update(&run_id, &mut |run| run.log("late")).is_err());
    assert!(
        store
            .update(&run_id, &mut |run| run.transition(RunStatus::Processing))
            .is_err()
    );
    assert_eq!(record(&store, &run_id), before);
}
