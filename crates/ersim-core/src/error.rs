//! Error types for the ERSIM pipeline
//!
//! Errors fall into two classes:
//! - **Fatal**: schema, persistence and queue corruption. These abort the
//!   current batch step.
//! - **Per-item**: generation, envelope and merge lookup failures. These are
//!   recorded against the row or item and processing continues.

use crate::state::BatchState;
use ersim_llm::{EnvelopeError, LlmError};
use ersim_sheets::{KvError, TabularError};
use std::path::PathBuf;

/// Schema resolution errors
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// Header row is absent or entirely blank
    #[error("header row {row} of '{sheet}' is missing or empty")]
    MissingHeaderRow {
        /// Sheet read
        sheet: String,
        /// 1-based header row
        row: usize,
    },

    /// No persisted header snapshot; an explicit refresh is required
    #[error("no header snapshot for '{0}', refresh the schema first")]
    NotRefreshed(String),

    /// Field has no header match and no fallback index
    #[error("field '{0}' could not be resolved")]
    Unresolved(String),

    /// Underlying sheet access failed
    #[error("tabular error: {0}")]
    Tabular(#[from] TabularError),

    /// Snapshot persistence failed
    #[error("persistence error: {0}")]
    Kv(#[from] KvError),
}

/// Batch queue persistence errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Value read back after a write differs from what was written
    #[error("read-back mismatch on '{key}'")]
    ReadBack {
        /// Key written
        key: String,
    },

    /// Persisted queue state cannot be decoded or is inconsistent
    #[error("corrupt queue state in '{key}': {reason}")]
    Corrupt {
        /// Key holding the bad value
        key: String,
        /// What is wrong with it
        reason: String,
    },

    /// Pending row is ahead of the sink, rows would be skipped
    #[error("queue expects row {row} but the sink correlates to row {expected}")]
    CursorMismatch {
        /// Front of the queue
        row: usize,
        /// Row the sink size implies
        expected: usize,
    },

    /// Store access failed
    #[error("persistence error: {0}")]
    Kv(#[from] KvError),
}

impl QueueError {
    /// Create corrupt state error
    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Errors producing a record from one row
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// Outbound call failed
    #[error("model call failed: {0}")]
    Llm(#[from] LlmError),

    /// Response envelope could not be unwrapped
    #[error("envelope: {0}")]
    Envelope(#[from] EnvelopeError),

    /// Payload is well-formed JSON but not a usable record
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl GenerationError {
    /// Whether the caller's retry policy should try again
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Llm(e) => e.is_retryable(),
            Self::Envelope(_) | Self::InvalidPayload(_) => false,
        }
    }
}

/// Per-item categorization merge errors
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// Neither key matched a record
    #[error("no record for primary '{primary}' or secondary '{secondary}'")]
    NotFound {
        /// Primary key looked up
        primary: String,
        /// Secondary key looked up
        secondary: String,
    },

    /// Key matched several records and cannot be disambiguated
    #[error("{key_kind} key '{key}' matches rows {rows:?}")]
    LookupAmbiguity {
        /// `primary` or `secondary`
        key_kind: &'static str,
        /// Key value
        key: String,
        /// Every matching sink row
        rows: Vec<usize>,
    },

    /// Result carries a field the sink has no column for
    #[error("sink has no column for field '{0}'")]
    UnknownField(String),

    /// Result has no keys at all
    #[error("result has neither primary nor secondary key")]
    MissingKey,

    /// Sheet access failed
    #[error("tabular error: {0}")]
    Tabular(#[from] TabularError),

    /// Sink schema unusable
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),
}

impl MergeError {
    /// Whether the whole merge pass must stop
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Tabular(_) | Self::Schema(_))
    }
}

/// Batch state machine errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    /// Transition not in the allowed table
    #[error("illegal batch transition {from:?} -> {to:?}")]
    IllegalTransition {
        /// Current state
        from: BatchState,
        /// Requested state
        to: BatchState,
    },
}

/// Batch lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// A batch is already queued for this store
    #[error("batch {batch_id} is still {state:?}")]
    AlreadyActive {
        /// Active batch
        batch_id: String,
        /// Its state
        state: BatchState,
    },

    /// Row spec could not be parsed
    #[error("invalid row spec: {0}")]
    InvalidRowSpec(String),

    /// Batch state transition rejected
    #[error(transparent)]
    State(#[from] StateError),

    /// Schema resolution failed
    #[error("schema: {0}")]
    Schema(#[from] SchemaError),

    /// Queue persistence failed
    #[error("queue: {0}")]
    Queue(#[from] QueueError),

    /// Sheet access failed
    #[error("tabular: {0}")]
    Tabular(#[from] TabularError),

    /// Property access failed
    #[error("persistence: {0}")]
    Kv(#[from] KvError),
}

/// Categorization pass errors
#[derive(Debug, thiserror::Error)]
pub enum CategorizeError {
    /// Sink lacks a column the pass depends on
    #[error("sink has no '{0}' column")]
    MissingColumn(String),

    /// Schema resolution failed
    #[error("schema: {0}")]
    Schema(#[from] SchemaError),

    /// Sheet access failed
    #[error("tabular: {0}")]
    Tabular(#[from] TabularError),
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("io error reading {path}: {source}")]
    Io {
        /// File attempted
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },

    /// File is not valid TOML for the config schema
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values parse but are unusable
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Convenience result alias
pub type Result<T, E = BatchError> = std::result::Result<T, E>;
