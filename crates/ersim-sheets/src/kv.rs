//! Key-value persistence for small pipeline state
//!
//! Backends hold string values under string keys. Hosts that persist such
//! properties cap each value's size, so [`MemoryKv`] can enforce a ceiling and
//! callers are expected to split state across several keys.

use crate::error::KvError;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Result alias for key-value operations
pub type Result<T> = std::result::Result<T, KvError>;

/// Typical per-value ceiling of script property stores (9 KiB)
pub const DEFAULT_VALUE_LIMIT: usize = 9 * 1024;

/// String key-value store
pub trait KeyValueStore: Send + Sync {
    /// Fetch a value
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, replacing any previous one
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key; removing a missing key is not an error
    fn delete(&self, key: &str) -> Result<()>;
}

/// Fetch and decode a JSON value
pub fn get_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| KvError::serialization(key, e)),
        None => Ok(None),
    }
}

/// Encode and store a JSON value, returning the encoded text
pub fn set_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<String> {
    let text = serde_json::to_string(value).map_err(|e| KvError::serialization(key, e))?;
    store.set(key, &text)?;
    Ok(text)
}

/// In-memory store with an optional per-value size ceiling
#[derive(Debug, Default)]
pub struct MemoryKv {
    values: Mutex<BTreeMap<String, String>>,
    value_limit: Option<usize>,
}

impl MemoryKv {
    /// Create an unbounded store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enforce a per-value size ceiling in bytes
    #[inline]
    #[must_use]
    pub fn with_value_limit(mut self, limit: usize) -> Self {
        self.value_limit = Some(limit);
        self
    }

    /// Keys currently stored, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.values.lock().keys().cloned().collect()
    }

    fn from_map(values: BTreeMap<String, String>, value_limit: Option<usize>) -> Self {
        Self {
            values: Mutex::new(values),
            value_limit,
        }
    }

    fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.lock().clone()
    }
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        if let Some(limit) = self.value_limit {
            if value.len() > limit {
                return Err(KvError::ValueTooLarge {
                    key: key.to_string(),
                    size: value.len(),
                    limit,
                });
            }
        }
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// Store persisted as one JSON object on disk
///
/// A change whose file write fails is undone in memory as well.
#[derive(Debug)]
pub struct FileKv {
    path: PathBuf,
    inner: MemoryKv,
    writer: Mutex<()>,
}

impl FileKv {
    /// Open the store at `path`, starting empty if the file does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|source| KvError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(KvError::Io { path, source }),
        };
        Ok(Self {
            path,
            inner: MemoryKv::from_map(values, Some(DEFAULT_VALUE_LIMIT)),
            writer: Mutex::new(()),
        })
    }

    /// Backing file path
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` in memory and persist it, or neither
    fn commit(&self, change: impl FnOnce(&MemoryKv) -> Result<()>) -> Result<()> {
        let _writer = self.writer.lock();
        let before = self.inner.snapshot();
        let result = change(&self.inner).and_then(|()| self.flush());
        if result.is_err() {
            *self.inner.values.lock() = before;
        }
        result
    }

    fn flush(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.inner.snapshot())
            .map_err(|e| KvError::serialization("<store>", e))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text).map_err(|source| KvError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| KvError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl KeyValueStore for FileKv {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.commit(|kv| kv.set(key, value))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.commit(|kv| kv.delete(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_roundtrip_and_delete() {
        let kv = MemoryKv::new();
        kv.set("a", "1").unwrap();
        assert_eq!(kv.get("a").unwrap().as_deref(), Some("1"));
        kv.delete("a").unwrap();
        kv.delete("a").unwrap();
        assert_eq!(kv.get("a").unwrap(), None);
    }

    #[test]
    fn value_limit_is_enforced() {
        let kv = MemoryKv::new().with_value_limit(4);
        kv.set("k", "1234").unwrap();
        let err = kv.set("k", "12345").unwrap_err();
        assert!(err.is_overflow());
        assert_eq!(kv.get("k").unwrap().as_deref(), Some("1234"));
    }

    #[test]
    fn json_helpers() {
        let kv = MemoryKv::new();
        set_json(&kv, "rows", &vec![3_usize, 4, 5]).unwrap();
        let rows: Option<Vec<usize>> = get_json(&kv, "rows").unwrap();
        assert_eq!(rows, Some(vec![3, 4, 5]));

        kv.set("bad", "not json").unwrap();
        assert!(get_json::<Vec<usize>>(&kv, "bad").is_err());
    }

    #[test]
    fn file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("props.json");
        {
            let kv = FileKv::open(&path).unwrap();
            kv.set("batch.stop", "true").unwrap();
        }
        let kv = FileKv::open(&path).unwrap();
        assert_eq!(kv.get("batch.stop").unwrap().as_deref(), Some("true"));
    }

    #[test]
    fn failed_flush_leaves_file_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("props.json");
        let kv = FileKv::open(&path).unwrap();
        kv.set("batch.stop", "false").unwrap();

        std::fs::create_dir(path.with_extension("json.tmp")).unwrap();
        assert!(matches!(kv.set("batch.stop", "true"), Err(KvError::Io { .. })));
        assert!(kv.delete("batch.stop").is_err());
        assert_eq!(kv.get("batch.stop").unwrap().as_deref(), Some("false"));
    }
}
