//! Storage for run status records.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::core::run::{RunId, TaskRun, TransitionError};
use crate::core::types::RunStatus;

/// Row returned by run listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub id: RunId,
    pub email: String,
    pub status: RunStatus,
    pub current_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&TaskRun> for RunSummary {
    fn from(run: &TaskRun) -> Self {
        Self {
            id: run.id.clone(),
            email: run.email.clone(),
            status: run.status,
            current_url: run.current_url.clone(),
            created_at: run.created_at,
            updated_at: run.updated_at,
        }
    }
}

/// Keyed store of run records.
///
/// Reads hand out snapshots; callers never hold a reference into the store.
pub trait RunStore: Send + Sync {
    fn get(&self, id: &RunId) -> Result<Option<TaskRun>>;

    /// Insert or replace a record.
    fn put(&self, run: TaskRun) -> Result<()>;

    /// All runs, newest first.
    fn list(&self) -> Result<Vec<RunSummary>>;

    /// Apply `change` to the stored record atomically.
    ///
    /// The change is applied to a copy and committed only if it succeeds, so a
    /// rejected mutation leaves the stored record untouched.
    fn update(
        &self,
        id: &RunId,
        change: &mut dyn FnMut(&mut TaskRun) -> Result<(), TransitionError>,
    ) -> Result<()>;
}

/// Process-local store.
///
/// With a retention cap, each `put` that leaves more records than the cap
/// drops the oldest finished runs. Live runs are never dropped, so the store
/// can exceed the cap while that many runs are in flight.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, TaskRun>>,
    max_retained: Option<usize>,
}

impl InMemoryRunStore {
    /// Unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(max_retained: usize) -> Self {
        Self {
            runs: RwLock::default(),
            max_retained: Some(max_retained),
        }
    }
}

fn evict_finished(runs: &mut HashMap<RunId, TaskRun>, max_retained: usize) {
    let excess = runs.len().saturating_sub(max_retained);
    if excess == 0 {
        return;
    }
    let mut finished: Vec<(DateTime<Utc>, RunId)> = runs
        .values()
        .filter(|run| run.is_terminal())
        .map(|run| (run.created_at, run.id.clone()))
        .collect();
    finished.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.as_str().cmp(b.1.as_str())));
    let evicted = finished.len().min(excess);
    for (_, id) in finished.into_iter().take(evicted) {
        runs.remove(&id);
    }
    if evicted > 0 {
        info!(evicted, retained = runs.len(), "dropped oldest finished runs");
    }
}

impl RunStore for InMemoryRunStore {
    fn get(&self, id: &RunId) -> Result<Option<TaskRun>> {
        let runs = self
            .runs
            .read()
            .map_err(|_| anyhow!("run store lock poisoned"))?;
        Ok(runs.get(id).cloned())
    }

    fn put(&self, run: TaskRun) -> Result<()> {
        debug!(run_id = %run.id, status = %run.status, "storing run");
        let mut runs = self
            .runs
            .write()
            .map_err(|_| anyhow!("run store lock poisoned"))?;
        runs.insert(run.id.clone(), run);
        if let Some(max_retained) = self.max_retained {
            evict_finished(&mut runs, max_retained);
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<RunSummary>> {
        let runs = self
            .runs
            .read()
            .map_err(|_| anyhow!("run store lock poisoned"))?;
        let mut summaries: Vec<RunSummary> = runs.values().map(RunSummary::from).collect();
        summaries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        Ok(summaries)
    }

    fn update(
        &self,
        id: &RunId,
        change: &mut dyn FnMut(&mut TaskRun) -> Result<(), TransitionError>,
    ) -> Result<()> {
        let mut runs = self
            .runs
            .write()
            .map_err(|_| anyhow!("run store lock poisoned"))?;
        let current = runs
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown run {id}"))?;
        let mut next = current.clone();
        change(&mut next)?;
        *current = next;
        Ok(())
    }
}
