use anyhow::{Context, Result};
use rocksdb::{Options, DB};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::KvStore;

/// RocksDB-backed store
///
/// Layout:
/// - `<cache_dir>/entries/` - RocksDB database, one row per cache key with the
///   JSON-encoded entry as the value
///
/// Suited to long-lived caches shared by many pipelines where rewriting a
/// single JSON document per `set` would be too slow.
pub struct RocksStore {
    db_path: PathBuf,
    db: DB,
}

impl RocksStore {
    pub fn open<P: AsRef<Path>>(cache_dir: P) -> Result<Self> {
        let db_path = cache_dir.as_ref().join("entries");
        fs::create_dir_all(&db_path).context("Failed to create store directory")?;

        let mut opts = Options::default();
        opts.create_if_missing(true);

        // Entries are small JSON documents
        opts.set_compression_type(rocksdb::DBCompressionType::Snappy);
        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_max_background_jobs(2);
        opts.set_statistics_level(rocksdb::statistics::StatsLevel::DisableAll);

        let db = DB::open(&opts, &db_path).context("Failed to open RocksDB database")?;
        debug!(path = %db_path.display(), "opened rocksdb store");

        Ok(Self { db_path, db })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }
}

impl Drop for RocksStore {
    fn drop(&mut self) {
        if let Err(e) = self.db.flush() {
            debug!("Failed to flush RocksDB on shutdown: {}", e);
        }
    }
}

impl KvStore for RocksStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.db.get(key.as_bytes()).context("Failed to read entry")? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).context("Failed to decode entry")?,
            )),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let bytes = serde_json::to_vec(&value).context("Failed to encode entry")?;
        self.db
            .put(key.as_bytes(), bytes)
            .context("Failed to write entry")?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let iter = self.db.iterator(rocksdb::IteratorMode::Start);

        for item in iter {
            let (key, _) = item?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }

        Ok(keys)
    }

    fn describe(&self) -> String {
        format!("rocksdb:{}", self.db_path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_rocks_store_persists() {
        let temp = TempDir::new().unwrap();

        {
            let store = RocksStore::open(temp.path()).unwrap();
            store.set("b", json!({"ret": [1, 2]})).unwrap();
            store.set("a", json!(null)).unwrap();
        }

        let store = RocksStore::open(temp.path()).unwrap();
        assert_eq!(store.get("b").unwrap(), Some(json!({"ret": [1, 2]})));
        assert_eq!(store.get("a").unwrap(), Some(json!(null)));
        assert!(store.get("c").unwrap().is_none());
        assert_eq!(store.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
