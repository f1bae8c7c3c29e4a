//! General-purpose function memoization
//!
//! [`FunctionCache`] memoizes a producer under `<function key>_<args digest>`
//! with no reference to environments or chains. Entries remember whether the
//! producer was asynchronous and whether it handed back a deferred value, and
//! a hit is converted to fit the shape of the current call:
//!
//! | stored producer | current call | result |
//! |---|---|---|
//! | async | async | value (awaited by the caller) |
//! | async | sync | ready value |
//! | sync, ready value | async | value |
//! | sync, ready value | sync | ready value |
//! | sync, deferred value | async | value |
//! | sync, deferred value | sync | deferred value |
//!
//! The last row is ambiguous (the caller may or may not expect to await), and
//! resolves to a deferred value.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::deferred::{Deferred, MaybeDeferred};
use crate::digest::{digest_json, short};
use crate::error::{Error, Result};
use crate::logging::status;
use crate::normalize::{CallArgs, Normalizer};
use crate::store::{self, CacheEntry, KvStore};

/// Stable name a function's entries are stored under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionKey(String);

impl FunctionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derive a key from where a function is defined and its source text
    ///
    /// Editing the source yields a new key. Callers should copy the derived
    /// key into their code once they are happy with it, so that cosmetic
    /// edits do not throw the cache away.
    pub fn derive(module: &str, name: &str, source: &str) -> Result<Self> {
        let digest = digest_json(&json!([module, name, source]))?;
        let key = format!("{}_v0", short(&digest, 8));
        info!(
            function = %format!("{}::{}", module, name),
            key = %key,
            "Derived cache key {} for {}::{}; pin it with FunctionKey::new(\"{}\")",
            key,
            module,
            name,
            key
        );
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FunctionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone)]
pub struct FunctionCache {
    key: FunctionKey,
    store: Arc<dyn KvStore>,
    normalizer: Arc<Normalizer>,
}

impl FunctionCache {
    pub fn new(key: FunctionKey, store: Arc<dyn KvStore>) -> Self {
        Self {
            key,
            store,
            normalizer: Arc::new(Normalizer::new()),
        }
    }

    pub fn with_normalizer(mut self, normalizer: Arc<Normalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn key(&self) -> &FunctionKey {
        &self.key
    }

    /// Store key for a call with these arguments
    pub fn entry_key(&self, args: &CallArgs) -> Result<String> {
        let normalized = self.normalizer.normalize_call(args)?;
        Ok(format!("{}_{}", self.key, digest_json(&normalized)?))
    }

    fn lookup(&self, entry_key: &str) -> Result<Option<CacheEntry>> {
        Ok(store::get_typed(self.store.as_ref(), entry_key)?)
    }

    /// Memoize a synchronous producer
    ///
    /// The producer may return a ready value or a deferred one; deferred
    /// values are stored once they resolve successfully.
    pub fn call<T, E, F>(&self, args: &CallArgs, f: F) -> MaybeDeferred<std::result::Result<T, E>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: From<Error> + Send + 'static,
        F: FnOnce() -> MaybeDeferred<std::result::Result<T, E>>,
    {
        let entry_key = match self.entry_key(args) {
            Ok(key) => key,
            Err(e) => return MaybeDeferred::Ready(Err(e.into())),
        };

        match self.lookup(&entry_key) {
            Ok(Some(entry)) => match serde_json::from_value::<T>(entry.value.clone()) {
                Ok(value) => {
                    self.log_hit(&entry_key);
                    // Only a sync producer that deferred is replayed deferred
                    return if entry.awaitable && !entry.coroutine {
                        MaybeDeferred::Deferred(Deferred::ready(Ok(value)))
                    } else {
                        MaybeDeferred::Ready(Ok(value))
                    };
                }
                Err(e) => self.log_bad_shape(&entry_key, &e),
            },
            Ok(None) => {}
            Err(e) => return MaybeDeferred::Ready(Err(e.into())),
        }

        debug!(function = %self.key, status = status::MISS, key = %entry_key, "calling function");
        let started_at = Utc::now();

        match f() {
            MaybeDeferred::Ready(Ok(value)) => {
                if let Err(e) = self.persist(&entry_key, &value, false, false, started_at) {
                    return MaybeDeferred::Ready(Err(e.into()));
                }
                MaybeDeferred::Ready(Ok(value))
            }
            MaybeDeferred::Ready(Err(e)) => MaybeDeferred::Ready(Err(e)),
            MaybeDeferred::Deferred(pending) => {
                let writer = self.clone();
                MaybeDeferred::Deferred(Deferred::new(async move {
                    let value = pending.await?;
                    writer.persist(&entry_key, &value, true, false, started_at)?;
                    Ok(value)
                }))
            }
        }
    }

    /// Memoize an asynchronous producer
    pub async fn call_async<T, E, F, Fut>(&self, args: &CallArgs, f: F) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: From<Error> + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let entry_key = self.entry_key(args)?;

        if let Some(entry) = self.lookup(&entry_key)? {
            match serde_json::from_value::<T>(entry.value) {
                Ok(value) => {
                    self.log_hit(&entry_key);
                    return Ok(value);
                }
                Err(e) => self.log_bad_shape(&entry_key, &e),
            }
        }

        debug!(function = %self.key, status = status::MISS, key = %entry_key, "calling async function");
        let started_at = Utc::now();
        let value = f().await?;
        self.persist(&entry_key, &value, false, true, started_at)?;
        Ok(value)
    }

    fn persist<T: Serialize>(
        &self,
        entry_key: &str,
        value: &T,
        awaitable: bool,
        coroutine: bool,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let mut entry = CacheEntry::new(serde_json::to_value(value)?);
        entry.awaitable = awaitable;
        entry.coroutine = coroutine;
        entry.started_at = Some(started_at);
        entry.finished_at = Some(Utc::now());

        match store::set_typed(self.store.as_ref(), entry_key, &entry) {
            Ok(()) => debug!(
                function = %self.key,
                status = status::STORED,
                key = %entry_key,
                "cached function result"
            ),
            Err(e) => warn!(
                function = %self.key,
                "Failed to cache function result: {:#}",
                e
            ),
        }
        Ok(())
    }

    fn log_hit(&self, entry_key: &str) {
        info!(
            function = %self.key,
            status = status::HIT,
            key = %entry_key,
            "Using cached result for {}",
            self.key
        );
    }

    fn log_bad_shape(&self, entry_key: &str, e: &serde_json::Error) {
        warn!(
            function = %self.key,
            key = %entry_key,
            "Cached result has an unexpected shape, calling again: {}",
            e
        );
    }
}

impl std::fmt::Debug for FunctionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionCache")
            .field("key", &self.key)
            .field("store", &self.store.describe())
            .finish()
    }
}
