//! ERSIM storage interfaces
//!
//! The pipeline reads and writes two kinds of external state:
//!
//! - **Tabular stores**: named sheets of string cells with a header layout
//!   ([`TabularStore`], [`SheetLayout`])
//! - **Key-value stores**: small persisted properties such as the batch queue
//!   and field selections ([`KeyValueStore`])
//!
//! Both come with an in-memory implementation for tests and a JSON file
//! implementation for the command-line driver.

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod error;
pub mod file;
pub mod grid;
pub mod kv;
pub mod memory;
pub mod tabular;

pub use error::{KvError, TabularError};
pub use file::JsonWorkbook;
pub use grid::{column_label, is_blank_row, Grid, Rect};
pub use kv::{get_json, set_json, FileKv, KeyValueStore, MemoryKv, DEFAULT_VALUE_LIMIT};
pub use memory::MemoryWorkbook;
pub use tabular::{SheetLayout, TabularStore};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for storage access
    pub use crate::grid::{Grid, Rect};
    pub use crate::kv::{KeyValueStore, MemoryKv};
    pub use crate::memory::MemoryWorkbook;
    pub use crate::tabular::{SheetLayout, TabularStore};
}
