/// Single-document JSON store
///
/// The whole store is one JSON object on disk. It is loaded on open, and every
/// `set` merges the current document before rewriting it atomically (temp
/// file + rename), so writers sharing a file keep each other's keys. That is linear in
/// the store size per write, which is fine for the handful of entries a
/// pipeline produces.
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use super::KvStore;

pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<Map<String, Value>>,
}

impl JsonFileStore {
    /// Open (or lazily create) the document at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let entries = read_document(&path)?;

        debug!(
            path = %path.display(),
            entry_count = entries.len(),
            "opened json store"
        );

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &Map<String, Value>) -> Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .with_context(|| format!("Failed to create store directory: {}", parent.display()))?;

        // Write to a temp file in the same directory, then rename over the
        // document so readers never see a partial write
        let mut file = tempfile::NamedTempFile::new_in(&parent)
            .context("Failed to create temp file")?;
        let encoded = serde_json::to_vec(entries).context("Failed to serialize store")?;
        file.write_all(&encoded).context("Failed to write store")?;
        file.as_file().sync_all().context("Failed to sync store")?;
        file.persist(&self.path)
            .with_context(|| format!("Failed to replace store: {}", self.path.display()))?;

        Ok(())
    }
}

/// Current on-disk document; a missing or empty file is an empty store
fn read_document(path: &Path) -> Result<Map<String, Value>> {
    if !path.exists() {
        return Ok(Map::new());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read store: {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(Map::new());
    }

    match serde_json::from_str::<Value>(&content)
        .with_context(|| format!("Failed to parse store: {}", path.display()))?
    {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("Store is not a JSON object: {}", path.display()),
    }
}

impl KvStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("json store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    /// Merge with whatever other writers persisted since open, then replace
    /// the document. The in-process view only changes once the write landed.
    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("json store lock poisoned"))?;

        let mut merged = entries.clone();
        merged.extend(read_document(&self.path)?);
        merged.insert(key.to_string(), value);

        self.persist(&merged)?;
        *entries = merged;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("json store lock poisoned"))?;
        Ok(entries.keys().cloned().collect())
    }

    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }
}
