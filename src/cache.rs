//! # Request-Scoped Row Cache
//!
//! [`RowCache`] memoizes point lookups keyed by `(table, column, id)` for
//! the duration of one logical request. Callers create one, thread it
//! through the reads that should share results, and drop it when done;
//! there is no ambient/global cache state.
//!
//! Negative results (row absent) are cached too; a write invalidates
//! nothing, so a cache must not outlive the reads it was created for.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use serde_json::Value as JsonValue;

use crate::table::json_key;

/// Default capacity of a [`RowCache`].
const DEFAULT_CAPACITY: usize = 1024;

/// A bounded memo of point-lookup results, keyed by table, column, and id.
pub struct RowCache {
    entries: Mutex<LruCache<String, Option<JsonValue>>>,
}

impl Default for RowCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RowCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self { entries: Mutex::new(LruCache::new(capacity)) }
    }

    fn key(table: &str, column: &str, id: &JsonValue) -> String {
        format!("{table}\u{1}{column}\u{1}{}", json_key(id))
    }

    /// A cached result: `Some(None)` means "known absent".
    pub fn get(&self, table: &str, column: &str, id: &JsonValue) -> Option<Option<JsonValue>> {
        self.entries
            .lock()
            .expect("cache mutex poisoned")
            .get(&Self::key(table, column, id))
            .cloned()
    }

    pub fn put(&self, table: &str, column: &str, id: &JsonValue, value: Option<JsonValue>) {
        self.entries
            .lock()
            .expect("cache mutex poisoned")
            .put(Self::key(table, column, id), value);
    }

    /// Drops every entry, e.g. after a write that could invalidate results.
    pub fn clear(&self) {
        self.entries.lock().expect("cache mutex poisoned").clear();
    }
}
