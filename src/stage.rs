//! Stage-level memoization across environments
//!
//! A [`Stage`] wraps an arbitrary call that may drive several environments.
//! The registry is snapshotted before and after the call and the hash
//! transitions in between are stored with the return value. On a later call
//! with the same inputs the transitions are replayed onto whichever
//! environments are registered under those identities, and the call body is
//! skipped.
//!
//! Inputs are keyed by the stage name plus the normalized call arguments, so
//! an environment argument contributes its current chain hash and a content
//! path contributes its fingerprint.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::deferred::Deferred;
use crate::digest::{digest_json, short};
use crate::error::{Error, Result};
use crate::logging::status;
use crate::normalize::{CallArgs, Normalizer};
use crate::registry::{HashDelta, Registry, Snapshot};
use crate::store::{self, KvStore};

/// What a stage call left behind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEntry {
    pub deltas: Vec<HashDelta>,
    pub value: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Stage {
    name: String,
    store: Arc<dyn KvStore>,
    registry: Arc<Registry>,
    normalizer: Arc<Normalizer>,
}

impl Stage {
    pub fn new(name: impl Into<String>, store: Arc<dyn KvStore>, registry: Arc<Registry>) -> Self {
        Self {
            name: name.into(),
            store,
            registry,
            normalizer: Arc::new(Normalizer::new()),
        }
    }

    pub fn with_normalizer(mut self, normalizer: Arc<Normalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cache key for a call with these arguments
    pub fn key(&self, args: &CallArgs) -> Result<String> {
        let normalized = self.normalizer.normalize_call(args)?;
        digest_json(&json!([self.name, normalized]))
    }

    /// Run a synchronous stage body
    pub fn call<T, E, F>(&self, args: &CallArgs, f: F) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<Error>,
        F: FnOnce() -> std::result::Result<T, E>,
    {
        let before = self.registry.snapshot();
        let key = self.key(args)?;

        if let Some(value) = self.replay(&key)? {
            return Ok(value);
        }

        debug!(
            stage = %self.name,
            status = status::MISS,
            key = short(&key, 12),
            envs = args.environments().len(),
            "running stage"
        );
        let value = f()?;
        self.record(&key, &before, &value)?;
        Ok(value)
    }

    /// Run a stage body that produces a deferred result
    ///
    /// The lookup happens now. On a miss the entry is written only once the
    /// deferred result resolves successfully, and the transitions recorded
    /// are those observed at that point.
    pub fn call_deferred<T, E, F>(&self, args: &CallArgs, f: F) -> Deferred<std::result::Result<T, E>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: From<Error> + Send + 'static,
        F: FnOnce() -> Deferred<std::result::Result<T, E>>,
    {
        let before = self.registry.snapshot();
        let key = match self.key(args) {
            Ok(key) => key,
            Err(e) => return Deferred::ready(Err(e.into())),
        };

        match self.replay::<T>(&key) {
            Ok(Some(value)) => return Deferred::ready(Ok(value)),
            Ok(None) => {}
            Err(e) => return Deferred::ready(Err(e.into())),
        }

        debug!(
            stage = %self.name,
            status = status::MISS,
            key = short(&key, 12),
            "running deferred stage"
        );
        let pending = f();
        let stage = self.clone();

        Deferred::new(async move {
            let value = pending.await?;
            stage.record(&key, &before, &value)?;
            Ok(value)
        })
    }

    /// Run an async stage body
    pub async fn call_async<T, E, F, Fut>(&self, args: &CallArgs, f: F) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: From<Error> + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        self.call_deferred(args, || Deferred::new(f())).await
    }

    fn replay<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        if self.registry.rerun().is_active() {
            return Ok(None);
        }

        let entry: StageEntry = match store::get_typed(self.store.as_ref(), key)? {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let value = match serde_json::from_value::<T>(entry.value) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    stage = %self.name,
                    key = short(key, 12),
                    "Cached stage result has an unexpected shape, rerunning: {}",
                    e
                );
                return Ok(None);
            }
        };

        let warnings = self.registry.apply_deltas(&entry.deltas);
        info!(
            stage = %self.name,
            status = status::HIT,
            key = short(key, 12),
            envs = entry.deltas.len(),
            drifted = warnings.len(),
            "Skipping stage {}",
            self.name
        );
        Ok(Some(value))
    }

    fn record<T: Serialize>(&self, key: &str, before: &Snapshot, value: &T) -> Result<()> {
        let after = self.registry.snapshot();
        let entry = StageEntry {
            deltas: self.registry.diff(before, &after),
            value: serde_json::to_value(value)?,
            created_at: Utc::now(),
        };

        match store::set_typed(self.store.as_ref(), key, &entry) {
            Ok(()) => debug!(
                stage = %self.name,
                status = status::STORED,
                key = short(key, 12),
                envs = entry.deltas.len(),
                "cached stage result"
            ),
            Err(e) => warn!(
                stage = %self.name,
                "Failed to cache stage result: {:#}",
                e
            ),
        }
        Ok(())
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("store", &self.store.describe())
            .finish()
    }
}
