pub mod env_state;
pub mod json_file;
pub mod memory;
pub mod rocks;

pub use env_state::EnvStateStore;
pub use json_file::JsonFileStore;
pub use memory::MemoryStore;
pub use rocks::RocksStore;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Key/value backend for every cache layer
///
/// Keys are digest strings. Entries are written once per key; a second writer
/// racing on the same key overwrites with a value-equal result, so
/// last-write-wins is sufficient.
pub trait KvStore: Send + Sync {
    /// Look up a key. A missing key is `Ok(None)`, not an error.
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store a value under a key
    fn set(&self, key: &str, value: Value) -> Result<()>;

    /// All stored keys, sorted
    fn keys(&self) -> Result<Vec<String>>;

    /// Short description for logs and the CLI
    fn describe(&self) -> String;
}

/// Typed read through a store
pub fn get_typed<T: DeserializeOwned>(store: &dyn KvStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Typed write through a store
pub fn set_typed<T: Serialize>(store: &dyn KvStore, key: &str, value: &T) -> Result<()> {
    store.set(key, serde_json::to_value(value)?)
}

/// Stored result of one operation or memoized function call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub value: Value,
    /// The producer handed back a deferred value
    #[serde(default)]
    pub awaitable: bool,
    /// The producer was itself asynchronous
    #[serde(default)]
    pub coroutine: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            awaitable: false,
            coroutine: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Store statistics
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub total_entries: usize,
    pub total_bytes: u64,
    pub location: Option<PathBuf>,
}

/// Summarize a store by walking its keys
pub fn stats(store: &dyn KvStore, location: Option<PathBuf>) -> Result<StoreStats> {
    let mut total_bytes = 0u64;
    let keys = store.keys()?;

    for key in &keys {
        if let Some(value) = store.get(key)? {
            total_bytes += serde_json::to_vec(&value)?.len() as u64;
        }
    }

    Ok(StoreStats {
        total_entries: keys.len(),
        total_bytes,
        location,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_round_trip_through_memory_store() {
        let store = MemoryStore::new();
        let entry = CacheEntry::new(json!({"out": "ok"}));

        set_typed(&store, "k1", &entry).unwrap();
        let loaded: CacheEntry = get_typed(&store, "k1").unwrap().unwrap();
        assert_eq!(loaded.value, json!({"out": "ok"}));
        assert!(!loaded.awaitable);

        assert!(get_typed::<CacheEntry>(&store, "missing").unwrap().is_none());
    }

    #[test]
    fn test_entry_defaults_for_older_documents() {
        let entry: CacheEntry = serde_json::from_value(json!({
            "value": 1,
            "created_at": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(!entry.awaitable);
        assert!(!entry.coroutine);
        assert!(entry.started_at.is_none());
    }

    #[test]
    fn test_stats() {
        let store = MemoryStore::new();
        store.set("a", json!("x")).unwrap();
        store.set("b", json!([1, 2, 3])).unwrap();

        let stats = stats(&store, None).unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.total_bytes, 3 + 7);
    }
}
