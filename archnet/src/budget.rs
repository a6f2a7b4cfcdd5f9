//! Cancellation, progress, and resource limits for a pipeline run.
//!
//! A run gets a [`RunBudget`] and the caller keeps the shared [`BudgetState`]. The state can
//! cancel the run from another thread and report how many levels have been solved. The run
//! checks the budget between stages and before each level.

use crate::error::{ArchnetError, Result};
use log::warn;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State shared between a running pipeline and its caller
#[derive(Debug, Default)]
pub struct BudgetState {
    cancelled: AtomicBool,
    levels_done: AtomicUsize,
    levels_total: AtomicUsize,
}

impl BudgetState {
    /// Ask the run to stop at its next check
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// `true` once [`BudgetState::cancel`] has been called
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Number of archetype levels solved so far
    pub fn levels_done(&self) -> usize {
        self.levels_done.load(Ordering::Relaxed)
    }

    /// Fraction of the levels solved, in `[0, 1]`
    pub fn progress(&self) -> f64 {
        let total = self.levels_total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        (self.levels_done() as f64 / total as f64).min(1.0)
    }
}

/// The run's side of a budget
#[derive(Debug)]
pub struct RunBudget {
    state: Arc<BudgetState>,
    started: Instant,
    time_budget: Option<Duration>,
}

/// Create a budget limited to `time_budget` of wall-clock time. Returns the handle for the
/// caller and the budget to hand to the run.
pub fn budget(time_budget: Option<Duration>) -> (Arc<BudgetState>, RunBudget) {
    let state: Arc<BudgetState> = Default::default();
    (state.clone(), RunBudget::new(state, time_budget))
}

impl RunBudget {
    fn new(state: Arc<BudgetState>, time_budget: Option<Duration>) -> Self {
        RunBudget {
            state,
            started: Instant::now(),
            time_budget,
        }
    }

    /// A budget with no time limit that nothing outside the run can cancel
    pub fn unlimited() -> Self {
        RunBudget::new(Default::default(), None)
    }

    /// Time since the budget was created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Fail if the run was cancelled or has used up its time.
    pub fn check(&self, stage: &str) -> Result<()> {
        if self.state.is_cancelled() {
            warn!("cancelled before {}", stage);
            return Err(ArchnetError::Cancelled);
        }
        if let Some(limit) = self.time_budget {
            let elapsed = self.elapsed();
            if elapsed > limit {
                warn!("time budget exhausted before {}", stage);
                return Err(ArchnetError::ResourceExhausted {
                    resource: "time",
                    required: format!("{:.3}s", elapsed.as_secs_f64()),
                    limit: format!("{:.3}s", limit.as_secs_f64()),
                });
            }
        }
        Ok(())
    }

    pub(crate) fn start_levels(&self, n: usize) {
        self.state.levels_done.store(0, Ordering::Relaxed);
        self.state.levels_total.store(n, Ordering::Relaxed);
    }

    pub(crate) fn level_done(&self) {
        self.state.levels_done.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fail if `required` bytes exceed `limit`.
pub fn check_memory(required: usize, limit: Option<usize>) -> Result<()> {
    match limit {
        Some(limit) if required > limit => Err(ArchnetError::ResourceExhausted {
            resource: "memory",
            required: format!("{required} bytes"),
            limit: format!("{limit} bytes"),
        }),
        _ => Ok(()),
    }
}
