//! Error types for tabular and key-value storage
//!
//! - [`TabularError`]: grid reads and writes against a named sheet
//! - [`KvError`]: small persisted properties

use std::path::PathBuf;

/// Errors raised by a [`crate::TabularStore`]
#[derive(Debug, thiserror::Error)]
pub enum TabularError {
    /// Named sheet does not exist
    #[error("sheet not found: '{0}'")]
    SheetNotFound(String),

    /// Sheet already exists
    #[error("sheet already exists: '{0}'")]
    SheetExists(String),

    /// Range is malformed (zero row, empty extent)
    #[error("invalid range on '{sheet}': {reason}")]
    InvalidRange {
        /// Sheet addressed
        sheet: String,
        /// What is wrong with the range
        reason: String,
    },

    /// Values do not match the target range dimensions
    #[error(
        "shape mismatch: range is {expected_rows}x{expected_cols}, \
         values are {actual_rows}x{actual_cols}"
    )]
    ShapeMismatch {
        /// Rows in the range
        expected_rows: usize,
        /// Columns in the range
        expected_cols: usize,
        /// Rows supplied
        actual_rows: usize,
        /// Widest row supplied
        actual_cols: usize,
    },

    /// IO error on a file-backed workbook
    #[error("io error on {path}: {source}")]
    Io {
        /// Workbook file
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },

    /// Workbook file could not be decoded
    #[error("corrupt workbook {path}: {source}")]
    Corrupt {
        /// Workbook file
        path: PathBuf,
        /// Decode failure
        #[source]
        source: serde_json::Error,
    },
}

impl TabularError {
    /// Create invalid range error
    pub fn invalid_range(sheet: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRange {
            sheet: sheet.into(),
            reason: reason.into(),
        }
    }

    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised by a [`crate::KeyValueStore`]
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// Value exceeds the per-key size ceiling
    #[error("value for '{key}' is {size} bytes, limit is {limit}")]
    ValueTooLarge {
        /// Key written
        key: String,
        /// Value size in bytes
        size: usize,
        /// Store ceiling in bytes
        limit: usize,
    },

    /// Stored value could not be (de)serialized
    #[error("serialization failed for '{key}': {source}")]
    Serialization {
        /// Key read or written
        key: String,
        /// Encode or decode failure
        #[source]
        source: serde_json::Error,
    },

    /// IO error on a file-backed store
    #[error("io error on {path}: {source}")]
    Io {
        /// Property file
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: std::io::Error,
    },

    /// Store file could not be decoded
    #[error("corrupt property file {path}: {source}")]
    Corrupt {
        /// Property file
        path: PathBuf,
        /// Decode failure
        #[source]
        source: serde_json::Error,
    },
}

impl KvError {
    /// Create serialization error for key
    pub fn serialization(key: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            key: key.into(),
            source,
        }
    }

    /// Size overflow is a design fault, not a transient condition
    #[inline]
    #[must_use]
    pub fn is_overflow(&self) -> bool {
        matches!(self, Self::ValueTooLarge { .. })
    }
}
