//! Single-row pipeline
//!
//! `read -> resolve -> (skip | duplicate | generate -> score) -> write`
//!
//! Every call writes exactly one sink row, success or placeholder, so the
//! row cursor's position correlation holds no matter how the row ends.

use crate::config::PipelineConfig;
use crate::error::{BatchError, SchemaError};
use crate::record::{cell_text, Record, ResolvedRow, RowStatus};
use crate::retry::RetryPolicy;
use crate::schema::{FieldSpec, HeaderSnapshot, SchemaMap};
use crate::scorer::{QualityReport, QualityScorer};
use crate::worker::{GenerationWorker, PromptSpec};
use ersim_sheets::TabularStore;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything a step needs to know about both sheets
#[derive(Debug, Clone)]
pub struct RowContext {
    /// Source sheet name
    pub source: String,
    /// Sink sheet name
    pub sink: String,
    /// Source fields fed to the model
    pub source_fields: Vec<FieldSpec>,
    /// Source field columns
    pub source_map: SchemaMap,
    /// Sink header snapshot
    pub sink_header: HeaderSnapshot,
    /// Sink status column
    pub status_col: usize,
    /// Signatures of content already converted
    pub signatures: HashSet<String>,
}

impl RowContext {
    /// Assemble a context from the batch's source map, the sink snapshot and
    /// the sink's status column
    pub fn build(
        store: &dyn TabularStore,
        config: &PipelineConfig,
        source_map: SchemaMap,
        sink_header: HeaderSnapshot,
    ) -> Result<Self, BatchError> {
        let source_fields = config.schema.source_fields.clone();
        let status_col = sink_header
            .position(&config.schema.status.header)
            .ok_or_else(|| SchemaError::Unresolved(config.schema.status.name.clone()))?;

        let first = config.sheets.sink_layout().first_data_row();
        let signatures = store
            .read_column(&config.sheets.sink, status_col, first)?
            .iter()
            .filter_map(|cell| match RowStatus::parse_cell(cell)? {
                (RowStatus::Created, Some(sig)) => Some(sig),
                _ => None,
            })
            .collect();

        Ok(Self {
            source: config.sheets.source.clone(),
            sink: config.sheets.sink.clone(),
            source_fields,
            source_map,
            sink_header,
            status_col,
            signatures,
        })
    }

    /// Note content recorded as created outside [`RowPipeline::process`]
    pub fn remember(&mut self, signature: String) {
        self.signatures.insert(signature);
    }
}

/// Result of processing one row
#[derive(Debug, Clone, PartialEq)]
pub struct RowOutcome {
    /// Source row processed
    pub source_row: usize,
    /// Sink row written
    pub sink_row: usize,
    /// Recorded status
    pub status: RowStatus,
    /// Content signature
    pub signature: String,
    /// Quality verdict, when a record was generated
    pub quality: Option<QualityReport>,
    /// Record keys with no sink column
    pub dropped_fields: Vec<String>,
}

/// Processes one source row into one sink row
#[derive(Clone)]
pub struct RowPipeline {
    store: Arc<dyn TabularStore>,
    worker: GenerationWorker,
    scorer: QualityScorer,
    retry: RetryPolicy,
    prompt: PromptSpec,
    signature_chars: usize,
}

impl fmt::Debug for RowPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowPipeline")
            .field("worker", &self.worker)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RowPipeline {
    /// Create a pipeline
    #[must_use]
    pub fn new(
        store: Arc<dyn TabularStore>,
        worker: GenerationWorker,
        scorer: QualityScorer,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            worker,
            scorer,
            retry,
            prompt: PromptSpec::default(),
            signature_chars: 1000,
        }
    }

    /// Use a custom prompt
    #[inline]
    #[must_use]
    pub fn with_prompt(mut self, prompt: PromptSpec) -> Self {
        self.prompt = prompt;
        self
    }

    /// Characters considered for the duplicate signature
    #[inline]
    #[must_use]
    pub fn with_signature_chars(mut self, chars: usize) -> Self {
        self.signature_chars = chars;
        self
    }

    /// Process `source_row` and write the result to `sink_row`
    pub async fn process(
        &self,
        ctx: &mut RowContext,
        source_row: usize,
        sink_row: usize,
    ) -> Result<RowOutcome, BatchError> {
        let cells = self.store.read_row(&ctx.source, source_row)?;
        let resolved =
            ResolvedRow::from_cells(source_row, &cells, &ctx.source_fields, &ctx.source_map);
        let signature = resolved.signature(self.signature_chars);

        let (status, record, quality) = if resolved.is_blank() {
            debug!("source row {} is empty", source_row);
            (RowStatus::Skipped, None, None)
        } else if ctx.signatures.contains(&signature) {
            debug!("source row {} duplicates signature {}", source_row, signature);
            (RowStatus::Duplicate, None, None)
        } else {
            self.generate(&resolved, &ctx.sink_header).await
        };

        let dropped_fields = self.write(ctx, sink_row, &status, &signature, record.as_ref())?;
        if status == RowStatus::Created {
            ctx.signatures.insert(signature.clone());
        }

        Ok(RowOutcome {
            source_row,
            sink_row,
            status,
            signature,
            quality,
            dropped_fields,
        })
    }

    async fn generate(
        &self,
        row: &ResolvedRow,
        sink_header: &HeaderSnapshot,
    ) -> (RowStatus, Option<Record>, Option<QualityReport>) {
        let prompt = if self.prompt.output_fields.is_empty() {
            let fields = sink_header
                .fields
                .iter()
                .filter(|f| !f.is_empty())
                .cloned()
                .collect();
            self.prompt.clone().with_output_fields(fields)
        } else {
            self.prompt.clone()
        };

        let result = self
            .retry
            .run(|| self.worker.generate(row, &prompt), |e| e.is_retryable())
            .await;

        match result {
            Ok(record) => {
                let report = self.scorer.score(&record);
                let status = match report.summary() {
                    None => RowStatus::Created,
                    Some(reason) => {
                        warn!("source row {} failed quality checks: {}", row.row, reason);
                        RowStatus::Error(format!("quality: {reason}"))
                    }
                };
                (status, Some(record), Some(report))
            }
            Err(e) => {
                warn!("source row {} failed: {}", row.row, e);
                (RowStatus::Error(e.to_string()), None, None)
            }
        }
    }

    fn write(
        &self,
        ctx: &RowContext,
        sink_row: usize,
        status: &RowStatus,
        signature: &str,
        record: Option<&Record>,
    ) -> Result<Vec<String>, BatchError> {
        let width = ctx.sink_header.width().max(ctx.status_col + 1);
        let mut cells = vec![String::new(); width];
        let mut dropped = Vec::new();

        if let Some(record) = record {
            for (key, value) in record.iter() {
                match ctx.sink_header.position(key) {
                    Some(col) if col != ctx.status_col => cells[col] = cell_text(value),
                    _ => dropped.push(key.to_string()),
                }
            }
        }
        if !dropped.is_empty() {
            debug!("sink has no column for {:?}", dropped);
        }

        cells[ctx.status_col] = status.cell(signature);
        self.store.write_row(&ctx.sink, sink_row, &cells)?;
        Ok(dropped)
    }
}
