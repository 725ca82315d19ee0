//! HTTP route handlers.

use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use solver::core::links::is_http_url;
use solver::core::run::{RunId, TaskRun};
use solver::io::run_store::RunSummary;
use solver::looping::RunRequest;
use tracing::{error, info, warn};

use crate::dispatch::dispatch;
use crate::state::AppState;

type ApiError = (StatusCode, Json<Value>);
type ApiResult<T> = Result<T, ApiError>;

/// Build the router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/run", post(start_run))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn store_error(err: anyhow::Error) -> ApiError {
    error!("run store failed: {err:#}");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "run store unavailable")
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct RunBody {
    email: String,
    secret: String,
    url: String,
}

/// POST /run - accept a chain and start solving it in the background.
async fn start_run(
    State(state): State<AppState>,
    payload: Result<Json<RunBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(body) = payload.map_err(|rejection| {
        warn!(reason = %rejection.body_text(), "rejected unreadable run body");
        api_error(rejection.status(), rejection.body_text())
    })?;
    if body.secret != *state.secret {
        warn!(email = %body.email, "rejected run with invalid secret");
        return Err(api_error(StatusCode::FORBIDDEN, "invalid secret"));
    }
    if !is_http_url(&body.url) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("url must be an absolute http(s) url: {}", body.url),
        ));
    }

    let run_id = RunId::generate();
    state
        .store()
        .put(TaskRun::new(run_id.clone(), &body.email, &body.url))
        .map_err(store_error)?;
    info!(run_id = %run_id, url = %body.url, "run queued");

    dispatch(
        state,
        run_id.clone(),
        RunRequest {
            email: body.email,
            secret: body.secret,
            url: body.url,
        },
    );
    Ok(Json(json!({ "task_id": run_id, "status": "queued" })))
}

/// GET /tasks - summaries, newest first.
async fn list_tasks(State(state): State<AppState>) -> ApiResult<Json<Vec<RunSummary>>> {
    state.store().list().map(Json).map_err(store_error)
}

/// GET /tasks/{id} - the full run record.
async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskRun>> {
    match state.store().get(&RunId::new(id)).map_err(store_error)? {
        Some(run) => Ok(Json(run)),
        None => Err(api_error(StatusCode::NOT_FOUND, "unknown task")),
    }
}

/// POST /tasks/{id}/cancel - signal a live run to stop.
async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let id = RunId::new(id);
    let run = state
        .store()
        .get(&id)
        .map_err(store_error)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "unknown task"))?;
    if run.is_terminal() {
        return Err(api_error(
            StatusCode::CONFLICT,
            format!("task already {}", run.status),
        ));
    }
    if !state.cancel(&id) {
        return Err(api_error(StatusCode::CONFLICT, "task is not running"));
    }
    info!(run_id = %id, "cancel requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "task_id": id, "status": "cancelling" })),
    ))
}
