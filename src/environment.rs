//! Environments and the per-operation cache
//!
//! An [`Environment`] is a handle to a place where commands run and files
//! live: a working directory on some host. Every mutating call on it goes
//! through [`run_operation`], which advances the environment's hash chain and
//! memoizes the result in the environment's operation cache under the new
//! hash.
//!
//! An environment must be driven by one call stack at a time. Nothing locks
//! the chain across an operation; interleaving two operations on the same
//! environment from different threads gives an unspecified chain.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain;
use crate::digest::{digest_bytes, short};
use crate::error::{Error, Result};
use crate::logging::{operations, status};
use crate::normalize::{Arg, ContentPath, Normalizer};
use crate::registry::{EnvState, Registry};
use crate::rerun::RerunOverride;
use crate::store::{self, CacheEntry, EnvStateStore, KvStore, MemoryStore};
use crate::transport::{normalize_host, LocalTransport, Location, Transport};

/// Where an environment lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvIdentity {
    pub host: Option<String>,
    pub path: String,
}

impl EnvIdentity {
    pub fn new(host: Option<&str>, path: impl Into<String>) -> Self {
        Self {
            host: normalize_host(host),
            path: path.into(),
        }
    }

    pub fn location(&self) -> Location {
        Location {
            host: self.host.clone(),
            path: self.path.clone(),
        }
    }
}

impl std::fmt::Display for EnvIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{}:{}", host, self.path),
            None => write!(f, "{}", self.path),
        }
    }
}

/// Immutable parameters an environment was provisioned with
///
/// They feed the seed hash, so two environments at the same place but with a
/// different runtime or source revision never share cache entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Provisioning {
    params: BTreeMap<String, String>,
}

impl Provisioning {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn runtime(self, version: impl Into<String>) -> Self {
        self.param("runtime", version)
    }

    pub fn revision(self, revision: impl Into<String>) -> Self {
        self.param("revision", revision)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// What [`run_operation`] needs from the thing it mutates
pub trait CacheableOperation {
    /// Chain state advanced by every operation
    fn chain_state(&self) -> &EnvState;

    /// Store holding results keyed by chain hash
    fn operation_cache(&self) -> &dyn KvStore;

    fn rerun(&self) -> &RerunOverride;

    fn normalizer(&self) -> &Normalizer;
}

/// Run `body` as a memoized operation named `op`
///
/// The next chain hash is computed from the current hash, `op` and the
/// normalized `args`, and the environment moves to it before anything else
/// happens. A cached result under that hash is returned without calling
/// `body` (unless a rerun scope is open). Otherwise `body` runs and its
/// result is stored. A failing body leaves the hash advanced and stores
/// nothing, so retrying from the same prior state looks up the same key.
pub fn run_operation<C, T, E, F>(target: &C, op: &str, args: &[Arg], body: F) -> std::result::Result<T, E>
where
    C: CacheableOperation + ?Sized,
    T: Serialize + DeserializeOwned,
    E: From<Error>,
    F: FnOnce() -> std::result::Result<T, E>,
{
    let state = target.chain_state();
    let normalized = target.normalizer().normalize_all(args)?;
    let hash = chain::advance(&state.hash(), op, &normalized)?;
    state.set_hash(hash.clone());

    if !target.rerun().is_active() {
        match store::get_typed::<CacheEntry>(target.operation_cache(), &hash) {
            Ok(Some(entry)) => match serde_json::from_value::<T>(entry.value) {
                Ok(value) => {
                    info!(
                        env = %state.identity(),
                        operation = op,
                        status = status::HIT,
                        hash = short(&hash, 12),
                        "Skipping {} {}",
                        op,
                        normalized
                    );
                    return Ok(value);
                }
                Err(e) => {
                    warn!(
                        env = %state.identity(),
                        operation = op,
                        hash = short(&hash, 12),
                        "Cached result has an unexpected shape, rerunning: {}",
                        e
                    );
                }
            },
            Ok(None) => {}
            Err(e) => return Err(Error::Store(e).into()),
        }
    }

    debug!(
        env = %state.identity(),
        operation = op,
        status = status::MISS,
        hash = short(&hash, 12),
        "running operation"
    );

    let value = match body() {
        Ok(value) => value,
        Err(e) => {
            debug!(
                env = %state.identity(),
                operation = op,
                status = status::ERROR,
                "operation failed, nothing cached"
            );
            return Err(e);
        }
    };

    let entry = CacheEntry::new(serde_json::to_value(&value).map_err(Error::from)?);
    match store::set_typed(target.operation_cache(), &hash, &entry) {
        Ok(()) => debug!(
            env = %state.identity(),
            operation = op,
            status = status::STORED,
            hash = short(&hash, 12),
            "cached operation result"
        ),
        Err(e) => warn!(
            env = %state.identity(),
            operation = op,
            "Failed to cache operation result: {:#}",
            e
        ),
    }

    Ok(value)
}

/// A working directory on some host with a hash chain over its mutations
pub struct Environment {
    state: Arc<EnvState>,
    provisioning: Provisioning,
    transport: Arc<dyn Transport>,
    cache: Arc<dyn KvStore>,
    registry: Arc<Registry>,
    normalizer: Arc<Normalizer>,
}

impl Environment {
    pub fn builder(host: Option<&str>, path: impl Into<String>) -> EnvironmentBuilder {
        EnvironmentBuilder::new(EnvIdentity::new(host, path))
    }

    pub fn identity(&self) -> &EnvIdentity {
        self.state.identity()
    }

    /// Current chain hash
    pub fn hash(&self) -> String {
        self.state.hash()
    }

    pub fn state(&self) -> &Arc<EnvState> {
        &self.state
    }

    pub fn provisioning(&self) -> &Provisioning {
        &self.provisioning
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// This environment as a call argument (normalizes to its chain hash)
    pub fn arg(&self) -> Arg {
        Arg::Env(Arc::clone(&self.state))
    }

    /// Run a shell command as a cached operation
    pub fn sh(&self, command: &str) -> Result<String> {
        run_operation(self, operations::SH, &[Arg::from(command)], || {
            self.transport.execute(self.identity(), command)
        })
    }

    /// Run a command without touching the chain or the cache
    pub fn untracked(&self, command: &str) -> Result<String> {
        self.transport.execute(self.identity(), command)
    }

    /// Read a file relative to the environment without touching the chain
    pub fn read_file(&self, rel: &str) -> Result<String> {
        self.untracked(&format!("cat {}", shell_quote(rel)))
    }

    /// Write (or append) `content` to a path relative to the environment
    pub fn write_file(&self, rel: &str, content: &str, append: bool) -> Result<()> {
        let args = [Arg::from(rel), Arg::from(content), Arg::from(append)];
        run_operation(self, operations::WRITE_FILE, &args, || {
            let mut file = tempfile::NamedTempFile::new()?;
            file.write_all(content.as_bytes())?;
            file.flush()?;
            let from = Location::local(file.path().to_string_lossy());

            if append {
                let staging = format!(".statechain_upload_{}", short(&digest_bytes(content.as_bytes()), 16));
                self.transport.transfer(&from, &self.location_of(&staging))?;
                self.transport.execute(
                    self.identity(),
                    &format!(
                        "cat {staging} >> {dest} && rm {staging}",
                        staging = shell_quote(&staging),
                        dest = shell_quote(rel)
                    ),
                )?;
            } else {
                self.transport.transfer(&from, &self.location_of(rel))?;
            }
            Ok(())
        })
    }

    /// Copy content into the environment
    ///
    /// The source is part of the operation's arguments by fingerprint, so
    /// changed source content is a new operation.
    pub fn copy_from(&self, source: &ContentPath, dest: &str) -> Result<()> {
        let args = [Arg::from(source), Arg::from(dest)];
        run_operation(self, operations::COPY_FROM, &args, || {
            self.transport.transfer(source.location(), &self.location_of(dest))
        })
    }

    /// Run a caller-defined operation against this environment
    pub fn operation<T, E, F>(&self, op: &str, args: &[Arg], body: F) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<Error>,
        F: FnOnce(&Self) -> std::result::Result<T, E>,
    {
        run_operation(self, op, args, || body(self))
    }

    /// Content-addressed reference to a path inside the environment
    pub fn path(&self, rel: &str) -> ContentPath {
        ContentPath::new(self.location_of(rel), Arc::clone(&self.transport))
    }

    /// Key/value state stored inside the environment itself
    pub fn state_store(&self) -> EnvStateStore {
        EnvStateStore::new(self.identity().clone(), Arc::clone(&self.transport))
    }

    fn location_of(&self, rel: &str) -> Location {
        let base = self.identity().location();
        Location {
            host: base.host,
            path: join_path(&base.path, rel),
        }
    }
}

impl CacheableOperation for Environment {
    fn chain_state(&self) -> &EnvState {
        &self.state
    }

    fn operation_cache(&self) -> &dyn KvStore {
        self.cache.as_ref()
    }

    fn rerun(&self) -> &RerunOverride {
        self.registry.rerun()
    }

    fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("identity", self.identity())
            .field("hash", &self.hash())
            .field("cache", &self.cache.describe())
            .finish()
    }
}

enum CacheChoice {
    Store(Arc<dyn KvStore>),
    InEnvironment,
}

pub struct EnvironmentBuilder {
    identity: EnvIdentity,
    provisioning: Provisioning,
    transport: Option<Arc<dyn Transport>>,
    cache: Option<CacheChoice>,
    registry: Option<Arc<Registry>>,
    normalizer: Option<Arc<Normalizer>>,
}

impl EnvironmentBuilder {
    fn new(identity: EnvIdentity) -> Self {
        Self {
            identity,
            provisioning: Provisioning::default(),
            transport: None,
            cache: None,
            registry: None,
            normalizer: None,
        }
    }

    pub fn provisioning(mut self, provisioning: Provisioning) -> Self {
        self.provisioning = provisioning;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Operation cache backend (defaults to an in-memory store)
    pub fn cache(mut self, cache: Arc<dyn KvStore>) -> Self {
        self.cache = Some(CacheChoice::Store(cache));
        self
    }

    /// Keep the operation cache in a state file inside the environment
    pub fn cache_in_environment(mut self) -> Self {
        self.cache = Some(CacheChoice::InEnvironment);
        self
    }

    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn normalizer(mut self, normalizer: Arc<Normalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    /// Compute the seed and register the environment
    pub fn build(self) -> Result<Environment> {
        let seed = chain::seed(&self.identity, &self.provisioning)?;
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(LocalTransport::default()));
        let cache: Arc<dyn KvStore> = match self.cache {
            Some(CacheChoice::Store(cache)) => cache,
            Some(CacheChoice::InEnvironment) => Arc::new(EnvStateStore::new(
                self.identity.clone(),
                Arc::clone(&transport),
            )),
            None => Arc::new(MemoryStore::new()),
        };
        let registry = self.registry.unwrap_or_default();

        let state = Arc::new(EnvState::new(self.identity, seed));
        registry.register(Arc::clone(&state));

        debug!(
            env = %state.identity(),
            hash = short(&state.hash(), 12),
            cache = %cache.describe(),
            "registered environment"
        );

        Ok(Environment {
            state,
            provisioning: self.provisioning,
            transport,
            cache,
            registry,
            normalizer: self.normalizer.unwrap_or_default(),
        })
    }
}

/// Resolve `rel` against an environment path; absolute and home-relative
/// paths are kept as given
pub fn join_path(base: &str, rel: &str) -> String {
    if rel.starts_with('/') || rel.starts_with('~') {
        return rel.to_string();
    }
    let rel = rel.trim_start_matches("./");
    if rel.is_empty() || rel == "." {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), rel)
}

/// Single-quote a word for a POSIX shell
pub fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        dir: std::path::PathBuf,
        registry: Arc<Registry>,
        cache: Arc<dyn KvStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let dir = temp.path().join("env");
            Self {
                _temp: temp,
                dir,
                registry: Arc::new(Registry::new()),
                cache: Arc::new(MemoryStore::new()),
            }
        }

        fn env(&self) -> Environment {
            Environment::builder(None, self.dir.to_string_lossy())
                .registry(Arc::clone(&self.registry))
                .cache(Arc::clone(&self.cache))
                .build()
                .unwrap()
        }

        fn lines(&self, file: &str) -> usize {
            fs::read_to_string(self.dir.join(file))
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }
    }

    #[test]
    fn test_identical_operation_runs_once() {
        let fx = Fixture::new();

        let first = fx.env();
        let seed = first.hash();
        assert_eq!(first.sh("echo run >> log.txt; echo ok").unwrap(), "ok");
        let after = first.hash();
        assert_ne!(seed, after);

        let second = fx.env();
        assert_eq!(second.hash(), seed);
        assert_eq!(second.sh("echo run >> log.txt; echo ok").unwrap(), "ok");
        assert_eq!(second.hash(), after);

        assert_eq!(fx.lines("log.txt"), 1);
    }

    #[test]
    fn test_changed_argument_invalidates_downstream_only() {
        let fx = Fixture::new();

        let env = fx.env();
        env.sh("echo a >> a.txt").unwrap();
        let h1 = env.hash();
        env.sh("echo b >> b.txt").unwrap();

        let env = fx.env();
        env.sh("echo a >> a.txt").unwrap();
        assert_eq!(env.hash(), h1);
        env.sh("echo c >> b.txt").unwrap();

        assert_eq!(fx.lines("a.txt"), 1);
        assert_eq!(fx.lines("b.txt"), 2);
    }

    #[test]
    fn test_failure_advances_hash_without_caching() {
        let fx = Fixture::new();

        let env = fx.env();
        let seed = env.hash();
        let err = env.sh("test -f ready").unwrap_err();
        assert_eq!(err.exit_status(), Some(1));
        let failed_hash = env.hash();
        assert_ne!(failed_hash, seed);
        assert!(fx.cache.keys().unwrap().is_empty());

        fs::write(fx.dir.join("ready"), "").unwrap();
        let retry = fx.env();
        retry.sh("test -f ready").unwrap();
        assert_eq!(retry.hash(), failed_hash);
        assert_eq!(fx.cache.keys().unwrap(), vec![failed_hash]);
    }

    #[test]
    fn test_rerun_scope_forces_body_and_keeps_entry() {
        let fx = Fixture::new();

        fx.env().sh("echo run >> log.txt").unwrap();
        {
            let _rerun = fx.registry.force_rerun();
            fx.env().sh("echo run >> log.txt").unwrap();
        }
        fx.env().sh("echo run >> log.txt").unwrap();

        assert_eq!(fx.lines("log.txt"), 2);
        assert_eq!(fx.cache.keys().unwrap().len(), 1);
    }

    #[test]
    fn test_write_file_and_append() {
        let fx = Fixture::new();
        let env = fx.env();

        env.write_file("notes/a.txt", "one\n", false).unwrap();
        env.write_file("notes/a.txt", "two\n", true).unwrap();
        assert_eq!(
            fs::read_to_string(fx.dir.join("notes/a.txt")).unwrap(),
            "one\ntwo\n"
        );
        assert_eq!(env.read_file("notes/a.txt").unwrap(), "one\ntwo");

        // Replaying the same writes on a fresh handle is a pure cache walk
        fs::remove_file(fx.dir.join("notes/a.txt")).unwrap();
        let replay = fx.env();
        replay.write_file("notes/a.txt", "one\n", false).unwrap();
        replay.write_file("notes/a.txt", "two\n", true).unwrap();
        assert_eq!(replay.hash(), env.hash());
        assert!(!fx.dir.join("notes/a.txt").exists());
    }

    #[test]
    fn test_copy_from_tracks_source_content() {
        let fx = Fixture::new();
        let src_dir = fx._temp.path().join("src");
        fs::create_dir_all(&src_dir).unwrap();
        let src_file = src_dir.join("data.txt");
        fs::write(&src_file, "v1").unwrap();

        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::default());
        let source = ContentPath::new(
            Location::local(src_file.to_string_lossy()),
            Arc::clone(&transport),
        );

        let env = fx.env();
        env.copy_from(&source, "data.txt").unwrap();
        let h_v1 = env.hash();
        assert_eq!(fs::read_to_string(fx.dir.join("data.txt")).unwrap(), "v1");

        fs::write(&src_file, "version two").unwrap();
        let env = fx.env();
        env.copy_from(&source, "data.txt").unwrap();
        assert_ne!(env.hash(), h_v1);
        assert_eq!(
            fs::read_to_string(fx.dir.join("data.txt")).unwrap(),
            "version two"
        );
    }

    #[test]
    fn test_untracked_leaves_chain_alone() {
        let fx = Fixture::new();
        let env = fx.env();
        let seed = env.hash();

        env.untracked("echo hi > hi.txt").unwrap();
        assert_eq!(env.hash(), seed);
        assert!(fx.cache.keys().unwrap().is_empty());
    }

    #[test]
    fn test_unhashable_argument_leaves_chain_and_cache_alone() {
        let fx = Fixture::new();
        let env = fx.env();
        env.sh("echo setup").unwrap();
        let before = env.hash();
        let stored = fx.cache.keys().unwrap();
        let mut calls = 0;

        let out: Result<u32> = env.operation(
            "plan",
            &[Arg::tagged("gpu", serde_json::json!({"count": 2}))],
            |_| {
                calls += 1;
                Ok(1)
            },
        );
        assert!(matches!(out, Err(Error::Serialization(_))));

        let missing = env.path("does/not/exist.txt");
        let copied = fx.env().copy_from(&missing, "copy.txt");
        assert!(matches!(copied, Err(Error::NotFound(_))));

        assert_eq!(calls, 0);
        assert_eq!(env.hash(), before);
        assert_eq!(fx.cache.keys().unwrap(), stored);
        assert!(!fx.dir.join("copy.txt").exists());
    }

    #[test]
    fn test_custom_operation_with_anyhow() {
        let fx = Fixture::new();
        let env = fx.env();
        let mut calls = 0;

        let out: anyhow::Result<Vec<u32>> = env.operation("plan", &[Arg::from(3i64)], |_| {
            calls += 1;
            Ok(vec![1, 2, 3])
        });
        assert_eq!(out.unwrap(), vec![1, 2, 3]);

        let again: anyhow::Result<Vec<u32>> = fx.env().operation("plan", &[Arg::from(3i64)], |_| {
            calls += 1;
            Ok(vec![])
        });
        assert_eq!(again.unwrap(), vec![1, 2, 3]);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_provisioning_changes_seed() {
        let fx = Fixture::new();
        let plain = fx.env();
        let pinned = Environment::builder(None, fx.dir.to_string_lossy())
            .provisioning(Provisioning::new().runtime("3.11").revision("abc"))
            .registry(Arc::clone(&fx.registry))
            .build()
            .unwrap();

        assert_ne!(plain.hash(), pinned.hash());
        assert_eq!(pinned.provisioning().get("revision"), Some("abc"));
    }

    #[test]
    fn test_cache_in_environment() {
        let fx = Fixture::new();
        let build = || {
            Environment::builder(None, fx.dir.to_string_lossy())
                .registry(Arc::clone(&fx.registry))
                .cache_in_environment()
                .build()
                .unwrap()
        };

        build().sh("echo run >> log.txt").unwrap();
        build().sh("echo run >> log.txt").unwrap();
        assert_eq!(fx.lines("log.txt"), 1);
        assert!(fx.dir.join(crate::store::env_state::STATE_FILE).exists());
    }

    #[test]
    fn test_join_path_and_quote() {
        assert_eq!(join_path("/w", "a/b"), "/w/a/b");
        assert_eq!(join_path("/w/", "./a"), "/w/a");
        assert_eq!(join_path("/w", "/abs"), "/abs");
        assert_eq!(join_path("/w", "."), "/w");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
