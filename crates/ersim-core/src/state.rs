//! Batch lifecycle states
//!
//! ```text
//! Idle -> Running -> Completed -> Idle
//!            |  ^
//!            v  |
//!         Suspended -> Stopped -> Idle
//! ```
//!
//! `Running -> Stopped` is also allowed when the stop flag is observed
//! mid-batch.

use crate::error::StateError;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// No batch queued
    Idle,
    /// Queue present and steps are being taken
    Running,
    /// Queue present, driver paused (budget exhausted or cancelled)
    Suspended,
    /// Queue drained
    Completed,
    /// Stop flag honoured before the queue drained
    Stopped,
}

impl BatchState {
    /// Whether no further steps will run for this batch
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped)
    }

    /// Whether a queue exists that can still make progress
    #[inline]
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Suspended)
    }
}

/// Validate a state transition
pub fn validate_transition(from: BatchState, to: BatchState) -> Result<(), StateError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StateError::IllegalTransition { from, to })
    }
}

/// States reachable from `from` in one transition
#[must_use]
pub fn allowed_transitions(from: BatchState) -> Vec<BatchState> {
    use BatchState::{Completed, Idle, Running, Stopped, Suspended};
    match from {
        Idle => vec![Running],
        Running => vec![Suspended, Completed, Stopped],
        Suspended => vec![Running, Stopped],
        Completed | Stopped => vec![Idle],
    }
}
