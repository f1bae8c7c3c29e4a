//! Type-directed normalization of call arguments into hashable JSON
//!
//! Arguments are described by the [`Arg`] tagged union, so every kind of value
//! the cache knows how to hash is enumerable:
//!
//! | variant | normalized form |
//! |---|---|
//! | `Value` | itself (must already be JSON) |
//! | `Env` | the environment's current chain hash |
//! | `Path` | the content fingerprint of the path |
//! | `Named` | the stable name of a callable or type |
//! | `List` / `Map` | element-wise recursive normalization |
//! | `Tagged` | the function registered for the tag on the [`Normalizer`] |
//!
//! `Tagged` is the extension point for value kinds this crate has no built-in
//! knowledge of. A tag without a registered function fails with
//! [`Error::Serialization`].

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::fingerprint::FingerprintMode;
use crate::registry::EnvState;
use crate::transport::{Location, Transport};

/// A path whose content, not location, identifies it
#[derive(Clone)]
pub struct ContentPath {
    location: Location,
    mode: FingerprintMode,
    transport: Arc<dyn Transport>,
}

impl ContentPath {
    pub fn new(location: Location, transport: Arc<dyn Transport>) -> Self {
        Self {
            location,
            mode: FingerprintMode::Sampled,
            transport,
        }
    }

    /// Hash this path by its full content instead of samples
    pub fn exact(mut self) -> Self {
        self.mode = FingerprintMode::Exact;
        self
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn mode(&self) -> FingerprintMode {
        self.mode
    }

    /// Sampled fingerprint, regardless of the configured mode
    pub fn quick_hash(&self) -> Result<String> {
        self.transport
            .fingerprint(&self.location, FingerprintMode::Sampled)
    }

    /// Exact fingerprint, regardless of the configured mode
    pub fn exact_hash(&self) -> Result<String> {
        self.transport.fingerprint(&self.location, FingerprintMode::Exact)
    }

    pub fn fingerprint(&self) -> Result<String> {
        self.transport.fingerprint(&self.location, self.mode)
    }
}

impl fmt::Debug for ContentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentPath")
            .field("location", &self.location)
            .field("mode", &self.mode)
            .finish()
    }
}

/// A call argument as seen by the hashing layer
#[derive(Debug, Clone)]
pub enum Arg {
    Value(Value),
    Env(Arc<EnvState>),
    Path(ContentPath),
    Named(String),
    List(Vec<Arg>),
    Map(BTreeMap<String, Arg>),
    Tagged { tag: String, value: Value },
}

impl Arg {
    /// Serialize any value into a plain JSON argument
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(Arg::Value)
            .map_err(Error::serialization)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Arg::Named(name.into())
    }

    /// Stable name of a type
    pub fn type_ref<T: ?Sized>() -> Self {
        Arg::Named(std::any::type_name::<T>().to_string())
    }

    /// Stable name of a function or closure
    pub fn callable<F>(_f: &F) -> Self {
        Arg::Named(std::any::type_name::<F>().to_string())
    }

    pub fn tagged(tag: impl Into<String>, value: Value) -> Self {
        Arg::Tagged {
            tag: tag.into(),
            value,
        }
    }

    /// Environment references reachable from this argument
    pub fn environments(&self) -> Vec<Arc<EnvState>> {
        let mut found = Vec::new();
        self.collect_environments(&mut found);
        found
    }

    fn collect_environments(&self, found: &mut Vec<Arc<EnvState>>) {
        match self {
            Arg::Env(state) => found.push(Arc::clone(state)),
            Arg::List(items) => items.iter().for_each(|i| i.collect_environments(found)),
            Arg::Map(items) => items.values().for_each(|i| i.collect_environments(found)),
            _ => {}
        }
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Value(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Value(Value::String(value.to_string()))
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Value(Value::String(value))
    }
}

impl From<&String> for Arg {
    fn from(value: &String) -> Self {
        Arg::Value(Value::String(value.clone()))
    }
}

impl From<bool> for Arg {
    fn from(value: bool) -> Self {
        Arg::Value(Value::Bool(value))
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Arg::Value(Value::from(value))
    }
}

impl From<i32> for Arg {
    fn from(value: i32) -> Self {
        Arg::Value(Value::from(value))
    }
}

impl From<u64> for Arg {
    fn from(value: u64) -> Self {
        Arg::Value(Value::from(value))
    }
}

impl From<f64> for Arg {
    fn from(value: f64) -> Self {
        Arg::Value(Value::from(value))
    }
}

impl<T: Into<Arg>> From<Option<T>> for Arg {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Arg::Value(Value::Null))
    }
}

impl From<Vec<Arg>> for Arg {
    fn from(value: Vec<Arg>) -> Self {
        Arg::List(value)
    }
}

impl From<BTreeMap<String, Arg>> for Arg {
    fn from(value: BTreeMap<String, Arg>) -> Self {
        Arg::Map(value)
    }
}

impl From<ContentPath> for Arg {
    fn from(value: ContentPath) -> Self {
        Arg::Path(value)
    }
}

impl From<&ContentPath> for Arg {
    fn from(value: &ContentPath) -> Self {
        Arg::Path(value.clone())
    }
}

impl From<Arc<EnvState>> for Arg {
    fn from(value: Arc<EnvState>) -> Self {
        Arg::Env(value)
    }
}

/// Build a `Vec<Arg>` from heterogeneous values
#[macro_export]
macro_rules! args {
    () => { ::std::vec::Vec::<$crate::normalize::Arg>::new() };
    ($($arg:expr),+ $(,)?) => {
        vec![$($crate::normalize::Arg::from($arg)),+]
    };
}

/// Positional and keyword arguments of a wrapped call
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub positional: Vec<Arg>,
    pub keyword: BTreeMap<String, Arg>,
}

impl CallArgs {
    pub fn new(positional: Vec<Arg>) -> Self {
        Self {
            positional,
            keyword: BTreeMap::new(),
        }
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Arg>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    /// Every environment passed positionally or by keyword
    pub fn environments(&self) -> Vec<Arc<EnvState>> {
        self.positional
            .iter()
            .chain(self.keyword.values())
            .flat_map(Arg::environments)
            .collect()
    }
}

impl From<Vec<Arg>> for CallArgs {
    fn from(positional: Vec<Arg>) -> Self {
        Self::new(positional)
    }
}

type NormalizeFn = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;

/// Registry of normalization functions for tagged arguments
#[derive(Clone, Default)]
pub struct Normalizer {
    custom: BTreeMap<String, NormalizeFn>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a normalization function for a tag, replacing any previous one
    pub fn register<F>(&mut self, tag: impl Into<String>, f: F)
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.custom.insert(tag.into(), Arc::new(f));
    }

    pub fn with<F>(mut self, tag: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.register(tag, f);
        self
    }

    /// Registered tags in sorted order
    pub fn tags(&self) -> Vec<&str> {
        self.custom.keys().map(String::as_str).collect()
    }

    pub fn normalize(&self, arg: &Arg) -> Result<Value> {
        match arg {
            Arg::Value(value) => Ok(value.clone()),
            Arg::Env(state) => Ok(Value::String(state.hash())),
            Arg::Path(path) => path.fingerprint().map(Value::String),
            Arg::Named(name) => Ok(Value::String(name.clone())),
            Arg::List(items) => self.normalize_all(items),
            Arg::Map(items) => {
                let mut map = serde_json::Map::new();
                for (key, value) in items {
                    map.insert(key.clone(), self.normalize(value)?);
                }
                Ok(Value::Object(map))
            }
            Arg::Tagged { tag, value } => match self.custom.get(tag) {
                Some(f) => f(value),
                None => Err(Error::Serialization(format!(
                    "no normalizer registered for tag '{}'",
                    tag
                ))),
            },
        }
    }

    pub fn normalize_all(&self, args: &[Arg]) -> Result<Value> {
        args.iter()
            .map(|arg| self.normalize(arg))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array)
    }

    /// `[positional, [[name, value], ...]]` with keywords sorted by name
    pub fn normalize_call(&self, call: &CallArgs) -> Result<Value> {
        let positional = self.normalize_all(&call.positional)?;
        let keyword = call
            .keyword
            .iter()
            .map(|(name, value)| {
                Ok(Value::Array(vec![
                    Value::String(name.clone()),
                    self.normalize(value)?,
                ]))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::Array(vec![positional, Value::Array(keyword)]))
    }
}

impl fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Normalizer")
            .field("tags", &self.tags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvIdentity;
    use crate::transport::LocalTransport;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_plain_values_pass_through() {
        let normalizer = Normalizer::new();
        let value = normalizer
            .normalize_all(&args!["x", 3i64, true, json!({"k": [1, 2]})])
            .unwrap();
        assert_eq!(value, json!(["x", 3, true, {"k": [1, 2]}]));
    }

    #[test]
    fn test_env_normalizes_to_chain_hash() {
        let state = Arc::new(EnvState::new(
            EnvIdentity::new(None, "/tmp/env"),
            "abc123".to_string(),
        ));
        let normalizer = Normalizer::new();

        assert_eq!(
            normalizer.normalize(&Arg::Env(Arc::clone(&state))).unwrap(),
            json!("abc123")
        );

        state.set_hash("def456".to_string());
        assert_eq!(normalizer.normalize(&Arg::Env(state)).unwrap(), json!("def456"));
    }

    #[test]
    fn test_path_normalizes_to_fingerprint() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("weights.bin");
        fs::write(&file, "v1").unwrap();

        let transport: Arc<dyn Transport> = Arc::new(LocalTransport::default());
        let path = ContentPath::new(Location::local(file.to_string_lossy()), transport);
        let normalizer = Normalizer::new();

        let before = normalizer.normalize(&Arg::from(&path)).unwrap();
        assert_eq!(before, json!(crate::fingerprint::sampled(&file).unwrap()));

        let exact = normalizer.normalize(&Arg::from(path.clone().exact())).unwrap();
        assert_eq!(exact, json!(crate::fingerprint::exact(&file).unwrap()));

        fs::write(&file, "v2 is longer").unwrap();
        assert_ne!(before, normalizer.normalize(&Arg::from(&path)).unwrap());
    }

    #[test]
    fn test_nested_containers() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), Arg::from(vec![Arg::from(1i64), Arg::named("f")]));
        map.insert("a".to_string(), Arg::from("x"));

        let value = Normalizer::new().normalize(&Arg::Map(map)).unwrap();
        assert_eq!(value, json!({"a": "x", "b": [1, "f"]}));
    }

    #[test]
    fn test_tagged_requires_registration() {
        let arg = Arg::tagged("frame", json!({"rows": [[1, 2]]}));

        let err = Normalizer::new().normalize(&arg).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));

        let normalizer = Normalizer::new().with("frame", |value| {
            Ok(Value::String(value.to_string()))
        });
        assert_eq!(
            normalizer.normalize(&arg).unwrap(),
            json!("{\"rows\":[[1,2]]}")
        );
        assert_eq!(normalizer.tags(), vec!["frame"]);
    }

    #[test]
    fn test_callable_and_type_names_are_stable() {
        fn train() {}
        assert_eq!(
            Normalizer::new().normalize(&Arg::callable(&train)).unwrap(),
            Normalizer::new().normalize(&Arg::callable(&train)).unwrap()
        );
        assert_eq!(
            Normalizer::new().normalize(&Arg::type_ref::<String>()).unwrap(),
            json!("alloc::string::String")
        );
    }

    #[test]
    fn test_call_args_sorts_keywords() {
        let a = CallArgs::new(args!["x"]).kwarg("z", 1i64).kwarg("a", 2i64);
        let b = CallArgs::new(args!["x"]).kwarg("a", 2i64).kwarg("z", 1i64);
        let normalizer = Normalizer::new();

        let value = normalizer.normalize_call(&a).unwrap();
        assert_eq!(value, json!([["x"], [["a", 2], ["z", 1]]]));
        assert_eq!(value, normalizer.normalize_call(&b).unwrap());
    }
}
