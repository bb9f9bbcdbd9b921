//! ERSIM pipeline
//!
//! Converts loosely structured case descriptions into structured simulation
//! records, one row per step, and merges categorization metadata back into
//! them.
//!
//! - [`schema`]: header-name field resolution with fallback columns
//! - [`cursor`]: next source row derived from the sink's size
//! - [`queue`] / [`batch`]: persisted, resumable batch execution
//! - [`worker`] / [`scorer`]: record generation and quality checks
//! - [`categorize`] / [`merger`]: categorization pass and merge
//! - [`fields`]: field selection and recommendations
//!
//! # Example
//!
//! ```rust,ignore
//! use ersim_core::prelude::*;
//!
//! # async fn example(
//! #     store: Arc<dyn TabularStore>,
//! #     kv: Arc<dyn KeyValueStore>,
//! #     model: Arc<dyn ChatModel>,
//! # ) -> Result<(), BatchError> {
//! let runner = BatchRunner::new(PipelineConfig::default(), store, kv, model);
//! runner.start(BatchMode::Next(25))?;
//! let summary = StepScheduler::new(Duration::from_secs(1)).run(&runner).await?;
//! println!("{} steps, {:?}", summary.steps, summary.state);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod batch;
pub mod categorize;
pub mod config;
pub mod cursor;
pub mod error;
pub mod fields;
pub mod merger;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod retry;
pub mod rowspec;
pub mod scheduler;
pub mod schema;
pub mod scorer;
pub mod state;
pub mod worker;

pub use batch::{BatchReport, BatchRunner, BatchStatus, StartReport, StepOutcome};
pub use categorize::{Categorizer, CategorizeReport, SuggestionStatus};
pub use config::{CallSettings, PipelineConfig};
pub use cursor::{RowCursor, SheetRef};
pub use error::{
    BatchError, CategorizeError, ConfigError, GenerationError, MergeError, QueueError, SchemaError,
    StateError,
};
pub use fields::{FieldRecommendationCache, FieldSelection, Recommendation, SelectionSource};
pub use merger::{read_results, CategorizationMerger, CategorizationResult, MergeReport};
pub use pipeline::{RowContext, RowOutcome, RowPipeline};
pub use queue::{BatchCounters, BatchMode, BatchQueue};
pub use record::{Record, ResolvedRow, RowStatus};
pub use retry::{Backoff, RetryPolicy};
pub use rowspec::parse_row_spec;
pub use scheduler::{CancelToken, RunSummary, StepBudget, StepScheduler};
pub use schema::{FieldSpec, HeaderSnapshot, SchemaMap, SchemaResolver, SchemaWarning};
pub use scorer::{QualityReport, QualityScorer};
pub use state::BatchState;
pub use worker::{GenerationWorker, PromptSpec};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving the pipeline
    pub use crate::{
        BatchError, BatchMode, BatchRunner, BatchState, CategorizationMerger, Categorizer,
        FieldRecommendationCache, PipelineConfig, RetryPolicy, SchemaResolver, StepScheduler,
    };
    pub use ersim_llm::ChatModel;
    pub use ersim_sheets::{KeyValueStore, TabularStore};
    pub use std::sync::Arc;
    pub use std::time::Duration;
}
