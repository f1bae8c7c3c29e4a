//! Wiring from configuration to live caches
//!
//! An [`Engine`] owns one registry, one transport and the shared stage and
//! function stores for a process. It hands out environments, stages and
//! function caches that all agree on those.
//!
//! Layout under the cache directory:
//! - `stages.json` / `stages/` - shared stage cache
//! - `functions.json` / `functions/` - shared function cache
//! - `operations/<identity digest>.json` / `operations/<identity digest>/` -
//!   one operation cache per environment identity

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::config::{CacheBackend, StatechainConfig};
use crate::digest::{digest_json, short};
use crate::environment::{EnvIdentity, Environment, Provisioning};
use crate::memo::{FunctionCache, FunctionKey};
use crate::normalize::Normalizer;
use crate::registry::Registry;
use crate::rerun::RerunScope;
use crate::stage::Stage;
use crate::store::{JsonFileStore, KvStore, MemoryStore, RocksStore};
use crate::transport::{LocalTransport, Transport};

pub struct Engine {
    backend: CacheBackend,
    cache_dir: PathBuf,
    operations_in_environment: bool,
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    normalizer: Arc<Normalizer>,
    stages: Arc<dyn KvStore>,
    functions: Arc<dyn KvStore>,
    operation_stores: Mutex<HashMap<EnvIdentity, Arc<dyn KvStore>>>,
}

impl Engine {
    /// Open the configured stores and a local transport
    pub fn new(config: &StatechainConfig) -> Result<Self> {
        config.validate()?;

        let backend = config.cache.backend;
        let cache_dir = config.cache.resolved_dir();
        if backend != CacheBackend::Memory {
            fs::create_dir_all(&cache_dir).with_context(|| {
                format!("Failed to create cache directory: {}", cache_dir.display())
            })?;
        }

        let stages = open_store(backend, &cache_dir, "stages")?;
        let functions = open_store(backend, &cache_dir, "functions")?;
        let transport: Arc<dyn Transport> =
            Arc::new(LocalTransport::new(config.fingerprint.sample_config()));

        debug!(
            backend = %backend,
            cache_dir = %cache_dir.display(),
            "engine ready"
        );

        Ok(Self {
            backend,
            cache_dir,
            operations_in_environment: config.cache.operations_in_environment,
            registry: Arc::new(Registry::new()),
            transport,
            normalizer: Arc::new(Normalizer::new()),
            stages,
            functions,
            operation_stores: Mutex::new(HashMap::new()),
        })
    }

    /// Use a different transport for environments created from now on
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    /// Use a normalizer with custom tags for everything created from now on
    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = Arc::new(normalizer);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Create and register an environment
    pub fn environment(
        &self,
        host: Option<&str>,
        path: &str,
        provisioning: Provisioning,
    ) -> Result<Environment> {
        let builder = Environment::builder(host, path)
            .provisioning(provisioning)
            .transport(Arc::clone(&self.transport))
            .registry(Arc::clone(&self.registry))
            .normalizer(Arc::clone(&self.normalizer));

        let builder = if self.operations_in_environment {
            builder.cache_in_environment()
        } else {
            let identity = EnvIdentity::new(host, path);
            builder.cache(self.operation_store(&identity)?)
        };

        Ok(builder.build()?)
    }

    pub fn stage(&self, name: &str) -> Stage {
        Stage::new(name, Arc::clone(&self.stages), Arc::clone(&self.registry))
            .with_normalizer(Arc::clone(&self.normalizer))
    }

    pub fn function(&self, key: FunctionKey) -> FunctionCache {
        FunctionCache::new(key, Arc::clone(&self.functions))
            .with_normalizer(Arc::clone(&self.normalizer))
    }

    /// Force every operation and stage lookup to miss until the scope drops
    pub fn force_rerun(&self) -> RerunScope<'_> {
        self.registry.force_rerun()
    }

    /// Operation store for an identity, opened once per process
    fn operation_store(&self, identity: &EnvIdentity) -> Result<Arc<dyn KvStore>> {
        let mut stores = self
            .operation_stores
            .lock()
            .map_err(|_| anyhow::anyhow!("operation store table lock poisoned"))?;

        if let Some(store) = stores.get(identity) {
            return Ok(Arc::clone(store));
        }

        let name = format!("operations/{}", short(&digest_json(identity)?, 16));
        let store = open_store(self.backend, &self.cache_dir, &name)?;
        stores.insert(identity.clone(), Arc::clone(&store));
        Ok(store)
    }
}

/// Open one named store under the cache directory
pub fn open_store(backend: CacheBackend, cache_dir: &Path, name: &str) -> Result<Arc<dyn KvStore>> {
    let store: Arc<dyn KvStore> = match backend {
        CacheBackend::Json => Arc::new(JsonFileStore::open(cache_dir.join(format!("{}.json", name)))?),
        CacheBackend::Rocksdb => Arc::new(RocksStore::open(cache_dir.join(name))?),
        CacheBackend::Memory => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("backend", &self.backend)
            .field("cache_dir", &self.cache_dir)
            .field("environments", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::CallArgs;
    use serial_test::serial;
    use tempfile::TempDir;

    fn config(cache_dir: &Path, backend: CacheBackend) -> StatechainConfig {
        let mut config = StatechainConfig::default();
        config.cache.dir = cache_dir.to_string_lossy().into_owned();
        config.cache.backend = backend;
        config
    }

    fn runs(dir: &Path) -> usize {
        fs::read_to_string(dir.join("runs.txt"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[test]
    #[serial]
    fn test_operation_cache_survives_restart() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("work").to_string_lossy().into_owned();
        let config = config(&temp.path().join("cache"), CacheBackend::Json);

        let first = Engine::new(&config).unwrap();
        let env = first.environment(None, &work, Provisioning::new()).unwrap();
        env.sh("echo x >> runs.txt").unwrap();
        let hash = env.hash();
        drop(env);
        drop(first);

        let second = Engine::new(&config).unwrap();
        let env = second.environment(None, &work, Provisioning::new()).unwrap();
        env.sh("echo x >> runs.txt").unwrap();

        assert_eq!(env.hash(), hash);
        assert_eq!(runs(&temp.path().join("work")), 1);
    }

    #[test]
    #[serial]
    fn test_same_identity_shares_one_store() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("work").to_string_lossy().into_owned();
        let engine = Engine::new(&config(&temp.path().join("cache"), CacheBackend::Rocksdb)).unwrap();

        let a = engine.environment(None, &work, Provisioning::new()).unwrap();
        let b = engine.environment(None, &work, Provisioning::new()).unwrap();
        a.sh("echo x >> runs.txt").unwrap();
        b.sh("echo x >> runs.txt").unwrap();

        assert_eq!(a.hash(), b.hash());
        assert_eq!(runs(&temp.path().join("work")), 1);
    }

    #[test]
    #[serial]
    fn test_environment_resident_cache_survives_interleaved_handles() {
        let temp = TempDir::new().unwrap();
        let work_dir = temp.path().join("work");
        fs::create_dir_all(&work_dir).unwrap();
        let work = work_dir.to_string_lossy().into_owned();
        let mut config = config(&temp.path().join("cache"), CacheBackend::Memory);
        config.cache.operations_in_environment = true;
        let engine = Engine::new(&config).unwrap();

        let a = engine.environment(None, &work, Provisioning::new()).unwrap();
        let b = engine.environment(None, &work, Provisioning::new()).unwrap();
        b.sh("echo other").unwrap();
        a.sh("echo run >> runs.txt").unwrap();
        b.sh("echo more").unwrap();

        let c = engine.environment(None, &work, Provisioning::new()).unwrap();
        c.sh("echo run >> runs.txt").unwrap();

        assert_eq!(c.hash(), a.hash());
        assert_eq!(runs(&work_dir), 1);
    }

    #[test]
    #[serial]
    fn test_stage_and_function_share_engine_state() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("work").to_string_lossy().into_owned();
        let engine = Engine::new(&config(&temp.path().join("cache"), CacheBackend::Memory)).unwrap();

        let env = engine.environment(None, &work, Provisioning::new()).unwrap();
        let stage = engine.stage("setup");
        let out: crate::Result<String> = stage.call(&CallArgs::new(vec![env.arg()]), || {
            env.sh("echo ready")
        });
        assert_eq!(out.unwrap(), "ready");

        let cache = engine.function(FunctionKey::new("double_v1"));
        let value = cache
            .call(&CallArgs::new(vec![21i64.into()]), || {
                crate::deferred::MaybeDeferred::Ready(Ok::<_, crate::Error>(42i64))
            })
            .into_ready()
            .unwrap()
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(engine.registry().len(), 1);
    }
}
