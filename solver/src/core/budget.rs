//! Wall-clock budget and cancellation checks for a run.

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why a run may not start more work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BudgetExhausted {
    #[error("run exceeded its {limit_secs}s time budget")]
    TimedOut { limit_secs: u64 },
    #[error("run was cancelled")]
    Cancelled,
}

/// Return the remaining time budget until the provided deadline.
pub fn remaining_budget(deadline: Instant) -> Option<Duration> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return None;
    }
    Some(remaining)
}

/// Deadline plus an external cancel flag, consulted before every unit of work.
#[derive(Debug, Clone)]
pub struct RunBudget {
    started: Instant,
    limit: Duration,
    cancel: CancellationToken,
}

impl RunBudget {
    pub fn start(limit: Duration, cancel: CancellationToken) -> Self {
        Self {
            started: Instant::now(),
            limit,
            cancel,
        }
    }

    /// Remaining time, or the reason no more work may be started.
    ///
    /// Cancellation wins over the deadline.
    pub fn check(&self) -> Result<Duration, BudgetExhausted> {
        if self.cancel.is_cancelled() {
            return Err(BudgetExhausted::Cancelled);
        }
        remaining_budget(self.started + self.limit).ok_or(BudgetExhausted::TimedOut {
            limit_secs: self.limit.as_secs(),
        })
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Drive `work` to completion unless the deadline passes or the run is
    /// cancelled first; the unfinished future is dropped in that case.
    pub async fn bound<F: Future>(&self, work: F) -> Result<F::Output, BudgetExhausted> {
        let remaining = self.check()?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BudgetExhausted::Cancelled),
            out = tokio::time::timeout(remaining, work) => out.map_err(|_| BudgetExhausted::TimedOut {
                limit_secs: self.limit.as_secs(),
            }),
        }
    }
}
