//! Persisted batch queue
//!
//! Queue state is split across several keys so no single value grows past
//! the store's per-value ceiling:
//!
//! | key              | content                                  |
//! |------------------|------------------------------------------|
//! | `batch.meta`     | id, sheets, mode, state, timestamps      |
//! | `batch.pending`  | remaining rows, compact spec (`15-30`)   |
//! | `batch.counters` | outcome counts and the last counted row  |
//! | `batch.schema`   | source columns resolved at start         |
//! | `batch.stop`     | cooperative stop flag                    |
//!
//! Every write is read back and compared; a mismatch is fatal.
//!
//! A row commits in two writes: counters (carrying the row just counted),
//! then pending. The counters write is the commit point. A row still pending
//! but already named by the counters was counted before an interrupted
//! commit and is dequeued without being counted again.

use crate::error::QueueError;
use crate::record::RowStatus;
use crate::rowspec::{decode_rows, encode_rows};
use crate::schema::SchemaMap;
use crate::state::BatchState;
use chrono::{DateTime, Utc};
use ersim_sheets::{get_json, KeyValueStore};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Key holding batch metadata
pub const META_KEY: &str = "batch.meta";
/// Key holding pending rows
pub const PENDING_KEY: &str = "batch.pending";
/// Key holding running counters
pub const COUNTERS_KEY: &str = "batch.counters";
/// Key holding the source columns resolved at start
pub const SCHEMA_KEY: &str = "batch.schema";
/// Key holding the stop flag
pub const STOP_KEY: &str = "batch.stop";

/// How a batch chose its rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum BatchMode {
    /// Next `n` unprocessed rows
    Next(usize),
    /// Every remaining unprocessed row
    All,
    /// Explicit rows retried in place (e.g. `"5, 7, 10-12"`)
    Specific(String),
}

impl BatchMode {
    /// Whether rows are appended at the cursor position
    #[inline]
    #[must_use]
    pub fn follows_cursor(&self) -> bool {
        !matches!(self, Self::Specific(_))
    }
}

impl fmt::Display for BatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Next(n) => write!(f, "next {n}"),
            Self::All => write!(f, "all"),
            Self::Specific(spec) => write!(f, "rows {spec}"),
        }
    }
}

/// Batch identity and lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMeta {
    /// Unique batch id (ULID)
    pub batch_id: String,
    /// Source sheet
    pub source: String,
    /// Sink sheet
    pub sink: String,
    /// Row selection mode
    pub mode: BatchMode,
    /// Lifecycle state
    pub state: BatchState,
    /// Rows queued at start
    pub total: usize,
    /// Creation time
    pub started_at: DateTime<Utc>,
    /// Last persisted change
    pub updated_at: DateTime<Utc>,
}

/// Running per-outcome counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounters {
    /// Records written
    pub created: usize,
    /// Empty source rows
    pub skipped: usize,
    /// Already-converted content
    pub duplicates: usize,
    /// Failed rows
    pub errors: usize,
}

impl BatchCounters {
    /// Count one row outcome
    pub fn record(&mut self, status: &RowStatus) {
        match status {
            RowStatus::Created => self.created += 1,
            RowStatus::Skipped => self.skipped += 1,
            RowStatus::Duplicate => self.duplicates += 1,
            RowStatus::Error(_) => self.errors += 1,
        }
    }

    /// Rows accounted for
    #[inline]
    #[must_use]
    pub fn processed(&self) -> usize {
        self.created + self.skipped + self.duplicates + self.errors
    }
}

impl fmt::Display for BatchCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created {}, skipped {}, duplicates {}, errors {}",
            self.created, self.skipped, self.duplicates, self.errors
        )
    }
}

#[derive(Serialize, Deserialize)]
struct CounterRecord {
    #[serde(flatten)]
    counters: BatchCounters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_counted: Option<usize>,
}

/// Full queue state as loaded from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    /// Identity and lifecycle
    pub meta: BatchMeta,
    /// Remaining rows, ascending
    pub pending: VecDeque<usize>,
    /// Outcome counts so far
    pub counters: BatchCounters,
    /// Row whose outcome was counted last
    pub last_counted: Option<usize>,
    /// Stop flag
    pub stop_requested: bool,
}

impl QueueSnapshot {
    /// Next row to process
    #[inline]
    #[must_use]
    pub fn front(&self) -> Option<usize> {
        self.pending.front().copied()
    }

    /// Rows left
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Whether the front row was counted but never dequeued
    #[must_use]
    pub fn front_counted(&self) -> bool {
        self.front().is_some() && self.front() == self.last_counted
    }
}

/// Key-value backed queue store
#[derive(Clone)]
pub struct BatchQueue {
    kv: Arc<dyn KeyValueStore>,
}

impl fmt::Debug for BatchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchQueue").finish_non_exhaustive()
    }
}

impl BatchQueue {
    /// Create a queue over `kv`
    #[inline]
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Persist a fresh queue
    pub fn create(&self, meta: BatchMeta, rows: Vec<usize>) -> Result<QueueSnapshot, QueueError> {
        let snapshot = QueueSnapshot {
            meta,
            pending: rows.into(),
            counters: BatchCounters::default(),
            last_counted: None,
            stop_requested: false,
        };
        self.write_verified(STOP_KEY, "false")?;
        self.save_counters(&snapshot.counters, None)?;
        self.save_pending(&snapshot.pending)?;
        self.save_meta(&snapshot.meta)?;
        debug!(
            "queue {} created with {} rows",
            snapshot.meta.batch_id,
            snapshot.remaining()
        );
        Ok(snapshot)
    }

    /// Load the queue, `None` when no batch exists
    pub fn load(&self) -> Result<Option<QueueSnapshot>, QueueError> {
        let Some(meta) = self.read_json::<BatchMeta>(META_KEY)? else {
            return Ok(None);
        };
        let pending_text = self
            .kv
            .get(PENDING_KEY)?
            .ok_or_else(|| QueueError::corrupt(PENDING_KEY, "missing while batch meta exists"))?;
        let pending = decode_rows(&pending_text)
            .map_err(|e| QueueError::corrupt(PENDING_KEY, e.to_string()))?;
        let record = self.read_json::<CounterRecord>(COUNTERS_KEY)?;
        let stop_requested = self.stop_requested()?;
        Ok(Some(QueueSnapshot {
            meta,
            pending: pending.into(),
            counters: record.as_ref().map(|r| r.counters).unwrap_or_default(),
            last_counted: record.and_then(|r| r.last_counted),
            stop_requested,
        }))
    }

    /// Count the front row's outcome, then dequeue it
    pub fn commit_front(
        &self,
        snapshot: &mut QueueSnapshot,
        status: &RowStatus,
    ) -> Result<(), QueueError> {
        let Some(row) = snapshot.front() else {
            return Ok(());
        };
        if !snapshot.front_counted() {
            snapshot.counters.record(status);
            snapshot.last_counted = Some(row);
            self.save_counters(&snapshot.counters, Some(row))?;
        }
        self.drop_front(snapshot)
    }

    /// Dequeue the front row without counting it
    ///
    /// Only for a row the counters already name.
    pub fn drop_front(&self, snapshot: &mut QueueSnapshot) -> Result<(), QueueError> {
        snapshot.pending.pop_front();
        self.save_pending(&snapshot.pending)
    }

    /// Persist the source columns resolved for this batch
    pub fn save_source_map(&self, map: &SchemaMap) -> Result<(), QueueError> {
        let text = serde_json::to_string(map)
            .map_err(|e| QueueError::corrupt(SCHEMA_KEY, e.to_string()))?;
        self.write_verified(SCHEMA_KEY, &text)
    }

    /// Source columns resolved at start
    pub fn source_map(&self) -> Result<SchemaMap, QueueError> {
        self.read_json::<SchemaMap>(SCHEMA_KEY)?
            .ok_or_else(|| QueueError::corrupt(SCHEMA_KEY, "missing while batch meta exists"))
    }

    /// Persist batch metadata with a fresh `updated_at`
    pub fn save_meta(&self, meta: &BatchMeta) -> Result<(), QueueError> {
        let mut meta = meta.clone();
        meta.updated_at = Utc::now();
        let text = serde_json::to_string(&meta)
            .map_err(|e| QueueError::corrupt(META_KEY, e.to_string()))?;
        self.write_verified(META_KEY, &text)
    }

    /// Set the stop flag; returns whether a batch exists to stop
    pub fn request_stop(&self) -> Result<bool, QueueError> {
        if self.kv.get(META_KEY)?.is_none() {
            return Ok(false);
        }
        self.write_verified(STOP_KEY, "true")?;
        Ok(true)
    }

    /// Current stop flag
    pub fn stop_requested(&self) -> Result<bool, QueueError> {
        Ok(self.kv.get(STOP_KEY)?.as_deref() == Some("true"))
    }

    /// Delete all queue keys
    pub fn destroy(&self) -> Result<(), QueueError> {
        for key in [PENDING_KEY, COUNTERS_KEY, SCHEMA_KEY, STOP_KEY, META_KEY] {
            self.kv.delete(key)?;
        }
        Ok(())
    }

    fn save_pending(&self, pending: &VecDeque<usize>) -> Result<(), QueueError> {
        let rows: Vec<usize> = pending.iter().copied().collect();
        self.write_verified(PENDING_KEY, &encode_rows(&rows))
    }

    fn save_counters(
        &self,
        counters: &BatchCounters,
        last_counted: Option<usize>,
    ) -> Result<(), QueueError> {
        let record = CounterRecord {
            counters: *counters,
            last_counted,
        };
        let text = serde_json::to_string(&record)
            .map_err(|e| QueueError::corrupt(COUNTERS_KEY, e.to_string()))?;
        self.write_verified(COUNTERS_KEY, &text)
    }

    fn read_json<T>(&self, key: &str) -> Result<Option<T>, QueueError>
    where
        T: serde::de::DeserializeOwned,
    {
        get_json(self.kv.as_ref(), key).map_err(|e| QueueError::corrupt(key, e.to_string()))
    }

    fn write_verified(&self, key: &str, value: &str) -> Result<(), QueueError> {
        self.kv.set(key, value)?;
        match self.kv.get(key)? {
            Some(stored) if stored == value => Ok(()),
            _ => Err(QueueError::ReadBack {
                key: key.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ersim_sheets::{KvError, MemoryKv};

    fn meta() -> BatchMeta {
        BatchMeta {
            batch_id: "01HZX".into(),
            source: "Input".into(),
            sink: "Master".into(),
            mode: BatchMode::Next(25),
            state: BatchState::Running,
            total: 4,
            started_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn create_load_round_trip() {
        let queue = BatchQueue::new(Arc::new(MemoryKv::new()));
        let created = queue.create(meta(), vec![15, 16, 17, 20]).unwrap();
        let loaded = queue.load().unwrap().unwrap();
        assert_eq!(loaded.pending, created.pending);
        assert_eq!(loaded.meta.batch_id, "01HZX");
        assert!(!loaded.stop_requested);
    }

    #[test]
    fn commit_front_shrinks_and_counts() {
        let queue = BatchQueue::new(Arc::new(MemoryKv::new()));
        let mut snap = queue.create(meta(), vec![15, 16]).unwrap();
        queue.commit_front(&mut snap, &RowStatus::Duplicate).unwrap();
        queue.commit_front(&mut snap, &RowStatus::Created).unwrap();

        let loaded = queue.load().unwrap().unwrap();
        assert!(loaded.pending.is_empty());
        assert_eq!(loaded.counters.duplicates, 1);
        assert_eq!(loaded.counters.created, 1);
        assert_eq!(loaded.last_counted, Some(16));
    }

    #[test]
    fn row_counted_before_a_lost_dequeue_is_not_counted_again() {
        let kv = Arc::new(MemoryKv::new());
        let queue = BatchQueue::new(kv.clone());
        let mut snap = queue.create(meta(), vec![15, 16]).unwrap();
        let pending = kv.get(PENDING_KEY).unwrap().unwrap();
        queue.commit_front(&mut snap, &RowStatus::Created).unwrap();
        kv.set(PENDING_KEY, &pending).unwrap();

        let mut reloaded = queue.load().unwrap().unwrap();
        assert!(reloaded.front_counted());
        queue.commit_front(&mut reloaded, &RowStatus::Created).unwrap();
        assert_eq!(reloaded.counters.created, 1);
        assert_eq!(reloaded.front(), Some(16));
        assert!(!reloaded.front_counted());
    }

    #[test]
    fn counters_without_marker_still_load() {
        let kv = Arc::new(MemoryKv::new());
        let queue = BatchQueue::new(kv.clone());
        queue.create(meta(), vec![15]).unwrap();
        kv.set(COUNTERS_KEY, r#"{"created":2,"skipped":0,"duplicates":1,"errors":0}"#)
            .unwrap();

        let loaded = queue.load().unwrap().unwrap();
        assert_eq!(loaded.counters.processed(), 3);
        assert_eq!(loaded.last_counted, None);
    }

    #[test]
    fn stop_flag_requires_batch() {
        let queue = BatchQueue::new(Arc::new(MemoryKv::new()));
        assert!(!queue.request_stop().unwrap());
        queue.create(meta(), vec![3]).unwrap();
        assert!(queue.request_stop().unwrap());
        assert!(queue.load().unwrap().unwrap().stop_requested);
        queue.destroy().unwrap();
        assert!(queue.load().unwrap().is_none());
    }

    #[test]
    fn large_contiguous_queue_fits_small_values() {
        let kv = Arc::new(MemoryKv::new().with_value_limit(512));
        let queue = BatchQueue::new(kv);
        let snap = queue.create(meta(), (3..=5000).collect()).unwrap();
        assert_eq!(snap.remaining(), 4998);
    }

    #[test]
    fn overflow_surfaces_as_kv_error() {
        let kv = Arc::new(MemoryKv::new().with_value_limit(64));
        let queue = BatchQueue::new(kv);
        let err = queue
            .create(meta(), (3..=200).step_by(2).collect())
            .unwrap_err();
        assert!(matches!(err, QueueError::Kv(KvError::ValueTooLarge { .. })));
    }

    #[test]
    fn source_map_lives_with_the_batch() {
        let queue = BatchQueue::new(Arc::new(MemoryKv::new()));
        queue.create(meta(), vec![3]).unwrap();
        assert!(matches!(queue.source_map(), Err(QueueError::Corrupt { .. })));

        queue.save_source_map(&SchemaMap::default()).unwrap();
        assert_eq!(queue.source_map().unwrap(), SchemaMap::default());
        queue.destroy().unwrap();
        assert!(queue.source_map().is_err());
    }

    #[test]
    fn missing_pending_is_corruption() {
        let kv = Arc::new(MemoryKv::new());
        let queue = BatchQueue::new(kv.clone());
        queue.create(meta(), vec![3]).unwrap();
        kv.delete(PENDING_KEY).unwrap();
        assert!(matches!(queue.load(), Err(QueueError::Corrupt { .. })));
    }
}
