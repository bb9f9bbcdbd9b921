//! Step scheduler
//!
//! Repeatedly calls [`BatchRunner::step`] with a fixed delay between steps
//! until the batch finishes, the budget runs out, or the caller cancels.
//! When it stops early the batch is left `Suspended`; a later run (or a
//! manual `step`) resumes from the persisted queue.

use crate::batch::{BatchRunner, StepOutcome};
use crate::config::BatchSettings;
use crate::error::BatchError;
use crate::state::BatchState;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info};

/// Cooperative cancellation flag shared with a running scheduler
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create an uncancelled token
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the scheduler to stop after the current step
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Limits on one scheduler run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepBudget {
    /// Maximum steps, unbounded when `None`
    pub max_steps: Option<u32>,
    /// Maximum wall time, unbounded when `None`
    pub max_wall: Option<Duration>,
}

impl StepBudget {
    /// Budget taken from batch settings
    #[must_use]
    pub fn from_settings(settings: &BatchSettings) -> Self {
        Self {
            max_steps: settings.max_steps,
            max_wall: (settings.max_wall_secs > 0)
                .then(|| Duration::from_secs(settings.max_wall_secs)),
        }
    }

    fn exhausted(&self, steps: u32, started: Instant) -> bool {
        self.max_steps.is_some_and(|max| steps >= max)
            || self.max_wall.is_some_and(|max| started.elapsed() >= max)
    }
}

/// Result of one scheduler run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Steps taken
    pub steps: u32,
    /// Batch state when the run ended
    pub state: BatchState,
    /// Last step outcome
    pub last: Option<StepOutcome>,
}

/// Drives a [`BatchRunner`] step by step
#[derive(Debug, Clone)]
pub struct StepScheduler {
    delay: Duration,
    budget: StepBudget,
    cancel: CancelToken,
}

impl StepScheduler {
    /// Create a scheduler with the given inter-step delay
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            budget: StepBudget::default(),
            cancel: CancelToken::new(),
        }
    }

    /// Scheduler configured from batch settings
    #[must_use]
    pub fn from_settings(settings: &BatchSettings) -> Self {
        Self::new(settings.step_delay()).with_budget(StepBudget::from_settings(settings))
    }

    /// Limit the run
    #[inline]
    #[must_use]
    pub fn with_budget(mut self, budget: StepBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Share a cancellation token
    #[inline]
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels this scheduler
    #[inline]
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Step until done, cancelled, or out of budget
    ///
    /// Fatal step errors are returned as-is; the queue is untouched, so the
    /// batch can be resumed once the cause is fixed.
    pub async fn run(&self, runner: &BatchRunner) -> Result<RunSummary, BatchError> {
        let started = Instant::now();
        let mut steps = 0;
        let mut last: Option<StepOutcome> = None;

        loop {
            if self.cancel.is_cancelled() || self.budget.exhausted(steps, started) {
                runner.suspend()?;
                info!("scheduler paused after {} step(s)", steps);
                return Ok(RunSummary {
                    steps,
                    state: runner.status()?.map_or(BatchState::Idle, |s| s.meta.state),
                    last,
                });
            }

            let outcome = runner.step().await?;
            steps += 1;
            debug!("step {}: {}", steps, outcome.message);

            if outcome.done {
                let state = outcome
                    .report
                    .as_ref()
                    .map_or(BatchState::Idle, |r| r.state);
                return Ok(RunSummary {
                    steps,
                    state,
                    last: Some(outcome),
                });
            }
            last = Some(outcome);

            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared() {
        let scheduler = StepScheduler::new(Duration::ZERO);
        let token = scheduler.cancel_token();
        assert!(!scheduler.cancel.is_cancelled());
        token.cancel();
        assert!(scheduler.cancel.is_cancelled());
    }

    #[test]
    fn budget_limits() {
        let started = Instant::now();
        assert!(!StepBudget::default().exhausted(1_000, started));

        let steps = StepBudget {
            max_steps: Some(3),
            max_wall: None,
        };
        assert!(!steps.exhausted(2, started));
        assert!(steps.exhausted(3, started));

        let wall = StepBudget {
            max_steps: None,
            max_wall: Some(Duration::ZERO),
        };
        assert!(wall.exhausted(0, started));
    }

    #[test]
    fn settings_budget() {
        let settings = BatchSettings::default();
        let budget = StepBudget::from_settings(&settings);
        assert_eq!(budget.max_wall, Some(Duration::from_secs(330)));
        assert_eq!(budget.max_steps, None);
    }
}
