//! Shared application state for the solver server.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use solver::core::run::RunId;
use solver::io::run_store::RunStore;
use solver::looping::TaskLoop;
use tokio_util::sync::CancellationToken;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub task_loop: TaskLoop,
    /// Expected value of the `secret` field on `POST /run`.
    pub secret: Arc<str>,
    /// Cancellation handles of runs that are still being driven.
    cancels: Arc<Mutex<HashMap<RunId, CancellationToken>>>,
}

impl AppState {
    pub fn new(task_loop: TaskLoop, secret: impl Into<Arc<str>>) -> Self {
        Self {
            task_loop,
            secret: secret.into(),
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        self.task_loop.store()
    }

    /// Create and remember the cancellation token for a new live run.
    pub fn register_cancel(&self, id: &RunId) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut cancels) = self.cancels.lock() {
            cancels.insert(id.clone(), token.clone());
        }
        token
    }

    /// Signal a live run. Returns false when no live run has this id.
    pub fn cancel(&self, id: &RunId) -> bool {
        match self.cancels.lock() {
            Ok(cancels) => cancels.get(id).map(CancellationToken::cancel).is_some(),
            Err(_) => false,
        }
    }

    pub fn forget(&self, id: &RunId) {
        if let Ok(mut cancels) = self.cancels.lock() {
            cancels.remove(id);
        }
    }

    pub fn live_runs(&self) -> usize {
        self.cancels.lock().map(|cancels| cancels.len()).unwrap_or(0)
    }
}
