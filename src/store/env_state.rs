use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::io::Write;
use std::sync::{Arc, Mutex};

use super::KvStore;
use crate::environment::{join_path, shell_quote, EnvIdentity};
use crate::transport::{Location, Transport};

/// Name of the state document inside an environment's working directory
pub const STATE_FILE: &str = ".statechain_state.json";

/// Key/value state that lives inside an environment
///
/// The document sits next to the environment's files, so it moves with the
/// environment and disappears when the environment is wiped. Reads and writes
/// go through the environment's transport and never touch the hash chain.
/// Nothing is cached between calls: several handles may share one
/// environment, and each of them must see the others' entries.
pub struct EnvStateStore {
    identity: EnvIdentity,
    transport: Arc<dyn Transport>,
    write_lock: Mutex<()>,
}

impl EnvStateStore {
    pub fn new(identity: EnvIdentity, transport: Arc<dyn Transport>) -> Self {
        Self {
            identity,
            transport,
            write_lock: Mutex::new(()),
        }
    }

    fn location(&self) -> Location {
        let base = self.identity.location();
        Location {
            host: base.host,
            path: join_path(&base.path, STATE_FILE),
        }
    }

    fn read_remote(&self) -> Result<Map<String, Value>> {
        let quoted = shell_quote(STATE_FILE);
        let content = self
            .transport
            .execute(
                &self.identity,
                &format!("if [ -f {quoted} ]; then cat {quoted}; fi"),
            )
            .context("Failed to read environment state")?;

        if content.trim().is_empty() {
            return Ok(Map::new());
        }

        match serde_json::from_str::<Value>(&content).context("Failed to parse environment state")? {
            Value::Object(map) => Ok(map),
            _ => anyhow::bail!("Environment state is not a JSON object: {}", self.location()),
        }
    }

    fn write_remote(&self, entries: &Map<String, Value>) -> Result<()> {
        let mut file = tempfile::NamedTempFile::new().context("Failed to create temp file")?;
        file.write_all(&serde_json::to_vec(entries)?)
            .context("Failed to write temp file")?;
        file.flush()?;

        let from = Location::local(file.path().to_string_lossy());
        self.transport
            .transfer(&from, &self.location())
            .context("Failed to upload environment state")?;
        Ok(())
    }
}

impl KvStore for EnvStateStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.read_remote()?.get(key).cloned())
    }

    /// Read-modify-write against the current document, so entries written by
    /// other handles on the same environment survive
    fn set(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("environment state lock poisoned"))?;
        let mut entries = self.read_remote()?;
        entries.insert(key.to_string(), value);
        self.write_remote(&entries)
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.read_remote()?.keys().cloned().collect())
    }

    fn describe(&self) -> String {
        format!("env:{}", self.location())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalTransport;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_state_lives_in_environment_directory() {
        let temp = TempDir::new().unwrap();
        let identity = EnvIdentity::new(None, temp.path().to_string_lossy());
        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::default());

        let store = EnvStateStore::new(identity.clone(), Arc::clone(&transport));
        assert!(store.get("step").unwrap().is_none());
        store.set("step", json!(3)).unwrap();

        let on_disk = std::fs::read_to_string(temp.path().join(STATE_FILE)).unwrap();
        assert_eq!(on_disk, r#"{"step":3}"#);

        let reopened = EnvStateStore::new(identity, transport);
        assert_eq!(reopened.get("step").unwrap(), Some(json!(3)));
    }

    #[test]
    fn test_interleaved_handles_keep_each_others_entries() {
        let temp = TempDir::new().unwrap();
        let identity = EnvIdentity::new(None, temp.path().to_string_lossy());
        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::default());

        let a = EnvStateStore::new(identity.clone(), Arc::clone(&transport));
        let b = EnvStateStore::new(identity.clone(), Arc::clone(&transport));
        assert!(a.get("first").unwrap().is_none());
        assert!(b.get("first").unwrap().is_none());

        b.set("first", json!(1)).unwrap();
        a.set("second", json!(2)).unwrap();
        b.set("third", json!(3)).unwrap();

        assert_eq!(a.get("third").unwrap(), Some(json!(3)));
        let fresh = EnvStateStore::new(identity, transport);
        assert_eq!(fresh.keys().unwrap(), vec!["first", "second", "third"]);
    }
}
