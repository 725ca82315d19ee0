//! Background execution of runs.
//!
//! Each run is driven on its own task. A supervising task waits for it so
//! that a panic or a store failure still leaves the record terminal.

use std::any::Any;

use solver::core::run::RunId;
use solver::core::types::RunStatus;
use solver::looping::RunRequest;
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, error, info, info_span, warn};

use crate::state::AppState;

/// Start driving `run_id`, whose record must already be stored.
///
/// The cancellation token is registered before this returns, so a cancel
/// request that follows immediately always reaches the run.
pub fn dispatch(state: AppState, run_id: RunId, request: RunRequest) -> JoinHandle<()> {
    let cancel = state.register_cancel(&run_id);
    info!(run_id = %run_id, live_runs = state.live_runs(), "run dispatched");
    let span = info_span!("run", run_id = %run_id);

    tokio::spawn(
        async move {
            let task_loop = state.task_loop.clone();
            let loop_id = run_id.clone();
            let driver =
                tokio::spawn(async move { task_loop.run(&loop_id, &request, cancel).await });

            match driver.await {
                Ok(Ok(outcome)) => {
                    info!(
                        steps = outcome.steps_executed,
                        status = %outcome.stop.status(),
                        "run finished"
                    );
                }
                Ok(Err(err)) => {
                    error!("run aborted: {err:#}");
                    mark_error(&state, &run_id, format!("internal error: {err:#}"));
                }
                Err(join_err) => {
                    let message = describe_join_error(join_err);
                    error!("{message}");
                    mark_error(&state, &run_id, message);
                }
            }
            state.forget(&run_id);
        }
        .instrument(span),
    )
}

fn mark_error(state: &AppState, run_id: &RunId, message: String) {
    let result = state.store().update(run_id, &mut |run| {
        run.finish(RunStatus::Error, Some(message.clone()), None)
    });
    if let Err(err) = result {
        warn!("could not record run error: {err:#}");
    }
}

fn describe_join_error(err: JoinError) -> String {
    if err.is_panic() {
        format!("run task panicked: {}", panic_message(err.into_panic()))
    } else {
        "run task was aborted".to_string()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
