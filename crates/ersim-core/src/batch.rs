//! Resumable batch execution
//!
//! A batch is a persisted queue of source rows. [`BatchRunner::step`] takes
//! exactly one row per call, so each call stays well inside a host's
//! per-invocation time limit; all progress lives in the key-value store and
//! the sink, never in memory.
//!
//! # Example
//!
//! ```rust,ignore
//! let runner = BatchRunner::new(config, store, kv, model);
//! runner.start(BatchMode::Next(25))?;
//! loop {
//!     let outcome = runner.step().await?;
//!     if outcome.done {
//!         break;
//!     }
//! }
//! ```

use crate::config::PipelineConfig;
use crate::cursor::{RowCursor, SheetRef};
use crate::error::{BatchError, QueueError, SchemaError};
use crate::pipeline::{RowContext, RowOutcome, RowPipeline};
use crate::queue::{BatchCounters, BatchMeta, BatchMode, BatchQueue, QueueSnapshot};
use crate::record::RowStatus;
use crate::rowspec::parse_row_spec;
use crate::schema::{resolve, SchemaResolver, SchemaWarning};
use crate::scorer::QualityScorer;
use crate::state::{validate_transition, BatchState};
use crate::worker::{GenerationWorker, PromptSpec};
use chrono::Utc;
use ersim_llm::ChatModel;
use ersim_sheets::{get_json, set_json, KeyValueStore, Rect, TabularStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Key holding the report of the last finished batch
pub const LAST_REPORT_KEY: &str = "batch.last_report";

/// Result of starting a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartReport {
    /// Batch id, `None` when nothing was queued
    pub batch_id: Option<String>,
    /// Rows queued
    pub queued: usize,
    /// First queued row
    pub first_row: Option<usize>,
    /// Last queued row
    pub last_row: Option<usize>,
    /// Rows given in a spec but not eligible for retry
    pub rejected_rows: Vec<usize>,
    /// Schema fallbacks used for source fields
    pub schema_warnings: Vec<SchemaWarning>,
}

/// Final counts of a finished batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    /// Batch id
    pub batch_id: String,
    /// `Completed` or `Stopped`
    pub state: BatchState,
    /// Rows queued at start
    pub total: usize,
    /// Rows left unprocessed
    pub remaining: usize,
    /// Outcome counts
    pub counters: BatchCounters,
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch {} {:?}: {} ({} of {} rows left)",
            self.batch_id, self.state, self.counters, self.remaining, self.total
        )
    }
}

/// Result of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// No further steps will do anything
    pub done: bool,
    /// Rows still queued
    pub remaining: usize,
    /// Human-readable summary
    pub message: String,
    /// Source row handled by this step
    pub row: Option<usize>,
    /// Status written for that row
    pub status: Option<RowStatus>,
    /// Final report, when this step finished the batch
    pub report: Option<BatchReport>,
}

impl StepOutcome {
    fn idle() -> Self {
        Self {
            done: true,
            remaining: 0,
            message: "No active batch".to_string(),
            row: None,
            status: None,
            report: None,
        }
    }

    fn finished(report: BatchReport) -> Self {
        Self {
            done: true,
            remaining: report.remaining,
            message: report.to_string(),
            row: None,
            status: None,
            report: Some(report),
        }
    }
}

/// Current batch as seen by `status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatus {
    /// Active batch metadata
    pub meta: BatchMeta,
    /// Rows still queued
    pub remaining: usize,
    /// Outcome counts so far
    pub counters: BatchCounters,
    /// Stop flag
    pub stop_requested: bool,
}

/// Drives batches over one source/sink pair
///
/// The row context of the active batch is kept between steps and rebuilt
/// from the store when the runner is new or the batch changes.
#[derive(Clone)]
pub struct BatchRunner {
    config: PipelineConfig,
    store: Arc<dyn TabularStore>,
    kv: Arc<dyn KeyValueStore>,
    queue: BatchQueue,
    schema: SchemaResolver,
    pipeline: RowPipeline,
    context: Arc<Mutex<Option<(String, RowContext)>>>,
}

impl fmt::Debug for BatchRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRunner")
            .field("source", &self.config.sheets.source)
            .field("sink", &self.config.sheets.sink)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl BatchRunner {
    /// Create a runner from configuration and collaborators
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn TabularStore>,
        kv: Arc<dyn KeyValueStore>,
        model: Arc<dyn ChatModel>,
    ) -> Self {
        let worker = GenerationWorker::new(model, config.llm.conversion.clone());
        let pipeline = RowPipeline::new(
            store.clone(),
            worker,
            QualityScorer::new(config.scoring.clone()),
            config.batch.retry,
        )
        .with_signature_chars(config.batch.signature_chars);
        Self {
            queue: BatchQueue::new(kv.clone()),
            schema: SchemaResolver::new(kv.clone()),
            config,
            store,
            kv,
            pipeline,
            context: Arc::new(Mutex::new(None)),
        }
    }

    /// Use a custom conversion prompt
    #[must_use]
    pub fn with_prompt(mut self, prompt: PromptSpec) -> Self {
        self.pipeline = self.pipeline.with_prompt(prompt);
        self
    }

    /// Configuration in use
    #[inline]
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn cursor(&self) -> RowCursor<'_> {
        RowCursor::new(
            SheetRef::new(&self.config.sheets.source, self.config.sheets.source_layout()),
            SheetRef::new(&self.config.sheets.sink, self.config.sheets.sink_layout()),
        )
    }

    /// Queue rows for a new batch
    ///
    /// Refreshes both header snapshots, creates the sink status column when
    /// missing, then persists the queue. Fails if a batch is still active.
    pub fn start(&self, mode: BatchMode) -> Result<StartReport, BatchError> {
        if let Some(existing) = self.queue.load()? {
            if existing.meta.state.is_active() {
                return Err(BatchError::AlreadyActive {
                    batch_id: existing.meta.batch_id,
                    state: existing.meta.state,
                });
            }
            self.queue.destroy()?;
        }

        let sheets = &self.config.sheets;
        let source_header = self
            .schema
            .refresh(self.store.as_ref(), &sheets.source, sheets.source_layout())?;
        self.ensure_status_column()?;

        let source_map = resolve(&source_header, &self.config.schema.source_fields);
        let schema_warnings = source_map.warnings().to_vec();

        let (rows, rejected_rows) = self.select_rows(&mode)?;
        let mut report = StartReport {
            batch_id: None,
            queued: rows.len(),
            first_row: rows.first().copied(),
            last_row: rows.last().copied(),
            rejected_rows,
            schema_warnings,
        };
        if rows.is_empty() {
            info!("nothing to process for {}", mode);
            return Ok(report);
        }

        validate_transition(BatchState::Idle, BatchState::Running)?;
        self.queue.save_source_map(&source_map)?;
        let now = Utc::now();
        let meta = BatchMeta {
            batch_id: ulid::Ulid::new().to_string(),
            source: sheets.source.clone(),
            sink: sheets.sink.clone(),
            mode: mode.clone(),
            state: BatchState::Running,
            total: rows.len(),
            started_at: now,
            updated_at: now,
        };
        let snapshot = self.queue.create(meta, rows)?;
        info!(
            "batch {} started ({}): {} rows queued",
            snapshot.meta.batch_id,
            mode,
            snapshot.remaining()
        );
        report.batch_id = Some(snapshot.meta.batch_id);
        Ok(report)
    }

    fn select_rows(&self, mode: &BatchMode) -> Result<(Vec<usize>, Vec<usize>), BatchError> {
        let cursor = self.cursor();
        let store = self.store.as_ref();
        match mode {
            BatchMode::Next(n) => Ok((cursor.next_batch(store, *n)?, Vec::new())),
            BatchMode::All => Ok((cursor.next_batch(store, usize::MAX)?, Vec::new())),
            BatchMode::Specific(spec) => {
                let requested = parse_row_spec(spec)?;
                let first = self.config.sheets.source_layout().first_data_row();
                let next = cursor.expected_next_row(store)?;
                let status_col = self.status_col()?;

                let mut accepted = Vec::new();
                let mut rejected = Vec::new();
                for row in requested {
                    let retryable = row >= first
                        && row < next
                        && self
                            .sink_status(cursor.sink_row_for(row), status_col)?
                            .is_some_and(|(s, _)| s.is_error());
                    if retryable {
                        accepted.push(row);
                    } else {
                        warn!("row {} has no error placeholder to retry, skipping", row);
                        rejected.push(row);
                    }
                }
                Ok((accepted, rejected))
            }
        }
    }

    fn status_col(&self) -> Result<usize, BatchError> {
        let status = &self.config.schema.status;
        let sink_header = self.schema.cached(&self.config.sheets.sink)?;
        let col = sink_header
            .position(&status.header)
            .ok_or_else(|| SchemaError::Unresolved(status.name.clone()))?;
        Ok(col)
    }

    /// Status and signature recorded in a sink row's status cell
    fn sink_status(
        &self,
        sink_row: usize,
        status_col: usize,
    ) -> Result<Option<(RowStatus, Option<String>)>, BatchError> {
        let cell = self
            .store
            .read_range(&self.config.sheets.sink, Rect::cell(sink_row, status_col))?;
        let text = cell
            .first()
            .and_then(|r| r.first())
            .cloned()
            .unwrap_or_default();
        Ok(RowStatus::parse_cell(&text))
    }

    /// Refresh the sink header, appending the status column when absent
    fn ensure_status_column(&self) -> Result<(), BatchError> {
        let sheets = &self.config.sheets;
        let layout = sheets.sink_layout();
        let header = self.schema.refresh(self.store.as_ref(), &sheets.sink, layout)?;
        if header.position(&self.config.schema.status.header).is_some() {
            return Ok(());
        }

        let Some(label_row) = layout.header_rows.checked_sub(1) else {
            return Err(SchemaError::MissingHeaderRow {
                sheet: sheets.sink.clone(),
                row: 1,
            }
            .into());
        };
        let col = header.width();
        self.store.append_columns(&sheets.sink, col, 1)?;
        let mut cells = vec![vec![String::new()]; layout.header_rows];
        if layout.header_rows >= 2 {
            cells[0][0] = self.config.schema.status_group.clone();
        }
        cells[label_row][0] = self.config.schema.status.header.clone();
        self.store
            .write_range(&sheets.sink, Rect::new(1, col, layout.header_rows, 1), &cells)?;
        info!(
            "added status column '{}' to '{}'",
            self.config.schema.status.header, sheets.sink
        );
        self.schema.refresh(self.store.as_ref(), &sheets.sink, layout)?;
        Ok(())
    }

    /// Process exactly one queued row
    pub async fn step(&self) -> Result<StepOutcome, BatchError> {
        let Some(mut snapshot) = self.queue.load()? else {
            self.context.lock().take();
            return Ok(StepOutcome::idle());
        };

        if snapshot.meta.state == BatchState::Suspended {
            self.transition(&mut snapshot, BatchState::Running)?;
        }
        if snapshot.stop_requested {
            info!("batch {} stop requested", snapshot.meta.batch_id);
            return self.finish(snapshot, BatchState::Stopped);
        }
        let Some(row) = snapshot.front() else {
            return self.finish(snapshot, BatchState::Completed);
        };
        if snapshot.front_counted() {
            debug!("row {} counted before an interrupted commit, dequeuing", row);
            self.queue.drop_front(&mut snapshot)?;
            let message = format!("Row {row} already committed");
            return self.after_commit(snapshot, row, None, message);
        }

        let cursor = self.cursor();
        let sink_row = cursor.sink_row_for(row);
        let mut ctx = self.row_context(&snapshot.meta.batch_id)?;
        if snapshot.meta.mode.follows_cursor() {
            let expected = cursor.expected_next_row(self.store.as_ref())?;
            if row < expected {
                // written before an interrupted commit
                return self.recover(snapshot, ctx, row, sink_row);
            }
            if row > expected {
                error!(
                    "batch {} queue at row {} but sink correlates to row {}",
                    snapshot.meta.batch_id, row, expected
                );
                return Err(QueueError::CursorMismatch { row, expected }.into());
            }
        } else if !self
            .sink_status(sink_row, ctx.status_col)?
            .is_some_and(|(s, _)| s.is_error())
        {
            // retried before an interrupted commit
            return self.recover(snapshot, ctx, row, sink_row);
        }

        let outcome: RowOutcome = self.pipeline.process(&mut ctx, row, sink_row).await?;
        self.queue.commit_front(&mut snapshot, &outcome.status)?;
        self.keep_context(&snapshot.meta.batch_id, ctx);
        info!(
            "batch {} row {} -> sink row {}: {}",
            snapshot.meta.batch_id, row, sink_row, outcome.status
        );
        let message = format!("Row {row}: {}", outcome.status);
        self.after_commit(snapshot, row, Some(outcome.status), message)
    }

    /// Count a row whose sink write survived but whose commit did not
    fn recover(
        &self,
        mut snapshot: QueueSnapshot,
        mut ctx: RowContext,
        row: usize,
        sink_row: usize,
    ) -> Result<StepOutcome, BatchError> {
        let status = match self.sink_status(sink_row, ctx.status_col)? {
            Some((status, signature)) => {
                if let (RowStatus::Created, Some(signature)) = (&status, signature) {
                    ctx.remember(signature);
                }
                status
            }
            None => {
                warn!("sink row {} has no readable status", sink_row);
                RowStatus::Error("status cell unreadable".to_string())
            }
        };
        debug!("row {} already in sink as {}, counting", row, status);
        self.queue.commit_front(&mut snapshot, &status)?;
        self.keep_context(&snapshot.meta.batch_id, ctx);
        let message = format!("Row {row} already written: {status}");
        self.after_commit(snapshot, row, Some(status), message)
    }

    /// Row context of `batch_id`, built from the store on first use
    fn row_context(&self, batch_id: &str) -> Result<RowContext, BatchError> {
        let cached = self.context.lock().take();
        if let Some((id, ctx)) = cached {
            if id == batch_id {
                return Ok(ctx);
            }
        }
        let sink_header = self.schema.cached(&self.config.sheets.sink)?;
        let source_map = self.queue.source_map()?;
        RowContext::build(self.store.as_ref(), &self.config, source_map, sink_header)
    }

    fn keep_context(&self, batch_id: &str, ctx: RowContext) {
        *self.context.lock() = Some((batch_id.to_string(), ctx));
    }

    fn after_commit(
        &self,
        snapshot: QueueSnapshot,
        row: usize,
        status: Option<RowStatus>,
        message: String,
    ) -> Result<StepOutcome, BatchError> {
        if snapshot.pending.is_empty() {
            let mut outcome = self.finish(snapshot, BatchState::Completed)?;
            outcome.row = Some(row);
            outcome.status = status;
            return Ok(outcome);
        }
        Ok(StepOutcome {
            done: false,
            remaining: snapshot.remaining(),
            message,
            row: Some(row),
            status,
            report: None,
        })
    }

    fn transition(&self, snapshot: &mut QueueSnapshot, to: BatchState) -> Result<(), BatchError> {
        validate_transition(snapshot.meta.state, to)?;
        snapshot.meta.state = to;
        self.queue.save_meta(&snapshot.meta)?;
        Ok(())
    }

    fn finish(
        &self,
        mut snapshot: QueueSnapshot,
        state: BatchState,
    ) -> Result<StepOutcome, BatchError> {
        validate_transition(snapshot.meta.state, state)?;
        self.context.lock().take();
        snapshot.meta.state = state;
        let report = BatchReport {
            batch_id: snapshot.meta.batch_id.clone(),
            state,
            total: snapshot.meta.total,
            remaining: snapshot.remaining(),
            counters: snapshot.counters,
        };
        set_json(self.kv.as_ref(), LAST_REPORT_KEY, &report)?;
        self.queue.destroy()?;
        info!("{}", report);
        Ok(StepOutcome::finished(report))
    }

    /// Request a cooperative stop; returns whether a batch was active
    pub fn stop(&self) -> Result<bool, BatchError> {
        let requested = self.queue.request_stop()?;
        if requested {
            info!("stop requested, honoured on next step");
        }
        Ok(requested)
    }

    /// Mark a running batch as suspended (driver paused)
    pub fn suspend(&self) -> Result<(), BatchError> {
        if let Some(mut snapshot) = self.queue.load()? {
            if snapshot.meta.state == BatchState::Running {
                self.transition(&mut snapshot, BatchState::Suspended)?;
                debug!("batch {} suspended", snapshot.meta.batch_id);
            }
        }
        Ok(())
    }

    /// Active batch, if any
    pub fn status(&self) -> Result<Option<BatchStatus>, BatchError> {
        Ok(self.queue.load()?.map(|s| BatchStatus {
            remaining: s.remaining(),
            counters: s.counters,
            stop_requested: s.stop_requested,
            meta: s.meta,
        }))
    }

    /// Report of the most recently finished batch
    pub fn last_report(&self) -> Result<Option<BatchReport>, BatchError> {
        Ok(get_json(self.kv.as_ref(), LAST_REPORT_KEY)?)
    }
}
