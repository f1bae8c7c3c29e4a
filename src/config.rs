use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::fingerprint::{SampleConfig, DEFAULT_SAMPLE_SIZE, DEFAULT_SAMPLE_THRESHOLD};
use crate::xdg;

/// Name of the project-level config file
pub const CONFIG_FILE: &str = "statechain.toml";

/// Complete statechain configuration (loaded from TOML file)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatechainConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub fingerprint: FingerprintConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Which key/value backend holds stage and function caches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// One JSON document per cache
    Json,
    /// Embedded RocksDB database
    Rocksdb,
    /// Process-local, nothing persisted
    Memory,
}

impl std::fmt::Display for CacheBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheBackend::Json => write!(f, "json"),
            CacheBackend::Rocksdb => write!(f, "rocksdb"),
            CacheBackend::Memory => write!(f, "memory"),
        }
    }
}

/// Cache storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache directory path; empty means the XDG cache directory
    #[serde(default)]
    pub dir: String,

    #[serde(default = "default_backend")]
    pub backend: CacheBackend,

    /// Keep each environment's operation cache in a state file inside the
    /// environment instead of the shared cache directory
    #[serde(default)]
    pub operations_in_environment: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: String::new(),
            backend: default_backend(),
            operations_in_environment: false,
        }
    }
}

impl CacheConfig {
    /// Resolved cache directory
    ///
    /// `STATECHAIN_CACHE_DIR` wins over the configured value.
    pub fn resolved_dir(&self) -> PathBuf {
        if std::env::var("STATECHAIN_CACHE_DIR").is_ok() || self.dir.is_empty() {
            xdg::cache_dir()
        } else {
            PathBuf::from(&self.dir)
        }
    }
}

/// Sampled fingerprint tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerprintConfig {
    /// Bytes read at each sample point
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    /// Files smaller than this are hashed whole
    #[serde(default = "default_sample_threshold")]
    pub sample_threshold: u64,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            sample_size: default_sample_size(),
            sample_threshold: default_sample_threshold(),
        }
    }
}

impl FingerprintConfig {
    pub fn sample_config(&self) -> SampleConfig {
        SampleConfig {
            sample_size: self.sample_size,
            threshold: self.sample_threshold,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: pretty, compact, json
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_backend() -> CacheBackend {
    CacheBackend::Json
}

fn default_sample_size() -> usize {
    DEFAULT_SAMPLE_SIZE
}

fn default_sample_threshold() -> u64 {
    DEFAULT_SAMPLE_THRESHOLD
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl StatechainConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: StatechainConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Generate example configuration as TOML string
    pub fn example() -> Result<String> {
        let config = StatechainConfig {
            cache: CacheConfig {
                dir: ".statechain/cache".to_string(),
                backend: CacheBackend::Json,
                operations_in_environment: false,
            },
            ..Default::default()
        };

        toml::to_string_pretty(&config).context("Failed to render example config")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.fingerprint.sample_size == 0 {
            anyhow::bail!("fingerprint.sample_size must be greater than zero");
        }

        // Three samples must fit below the threshold or they would overlap
        if self.fingerprint.sample_threshold < self.fingerprint.sample_size as u64 * 3 {
            anyhow::bail!("fingerprint.sample_threshold must be at least 3 * sample_size");
        }

        if !["trace", "debug", "info", "warn", "error"]
            .contains(&self.observability.log_level.as_str())
        {
            anyhow::bail!("observability.log_level must be one of: trace, debug, info, warn, error");
        }

        if !["pretty", "compact", "json"].contains(&self.observability.log_format.as_str()) {
            anyhow::bail!("observability.log_format must be one of: pretty, compact, json");
        }

        Ok(())
    }
}

/// Discovers configuration by traversing up the directory tree
pub fn discover_config(start_dir: &Path) -> Result<Option<PathBuf>> {
    let mut current = start_dir.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_FILE);
        if config_path.exists() {
            return Ok(Some(config_path));
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    // Fallback to global config
    let global_config = xdg::config_dir().join("config.toml");
    if global_config.exists() {
        return Ok(Some(global_config));
    }

    Ok(None)
}

/// Loads configuration with auto-discovery support
///
/// If `explicit_path` is provided, loads config from that path. Otherwise
/// auto-discovers from the current directory, falling back to defaults.
pub fn load_config_with_discovery(explicit_path: Option<&str>) -> Result<StatechainConfig> {
    let config = if let Some(config_path) = explicit_path {
        StatechainConfig::from_file(config_path)?
    } else {
        let current_dir = std::env::current_dir()
            .context("Failed to get current directory for config discovery")?;

        match discover_config(&current_dir)? {
            Some(discovered_path) => StatechainConfig::from_file(&discovered_path)?,
            None => StatechainConfig::default(),
        }
    };

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = StatechainConfig::default();
        assert_eq!(config.cache.backend, CacheBackend::Json);
        assert_eq!(config.fingerprint.sample_size, 16 * 1024);
        assert_eq!(config.fingerprint.sample_threshold, 128 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(CONFIG_FILE);
        fs::write(
            &path,
            r#"
[cache]
dir = "/var/cache/pipeline"
backend = "rocksdb"

[fingerprint]
sample_size = 4096
"#,
        )
        .unwrap();

        let config = StatechainConfig::from_file(&path).unwrap();
        assert_eq!(config.cache.backend, CacheBackend::Rocksdb);
        assert_eq!(config.fingerprint.sample_size, 4096);
        assert_eq!(config.fingerprint.sample_threshold, 128 * 1024);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_invalid_sampling() {
        let mut config = StatechainConfig::default();
        config.fingerprint.sample_threshold = config.fingerprint.sample_size as u64;
        assert!(config.validate().is_err());

        config.fingerprint.sample_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_format() {
        let mut config = StatechainConfig::default();
        config.observability.log_format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_example_round_trips() {
        let example = StatechainConfig::example().unwrap();
        let parsed: StatechainConfig = toml::from_str(&example).unwrap();
        assert_eq!(parsed.cache.dir, ".statechain/cache");
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_discover_walks_up() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("a/b/c");
        fs::create_dir_all(&nested).unwrap();
        fs::write(temp.path().join("a").join(CONFIG_FILE), "").unwrap();

        let found = discover_config(&nested).unwrap().unwrap();
        assert_eq!(found, temp.path().join("a").join(CONFIG_FILE));
    }

    #[test]
    #[serial]
    fn test_env_overrides_cache_dir() {
        let config: StatechainConfig =
            toml::from_str(&StatechainConfig::example().unwrap()).unwrap();
        assert_eq!(config.cache.resolved_dir(), PathBuf::from(".statechain/cache"));

        std::env::set_var("STATECHAIN_CACHE_DIR", "/tmp/override");
        assert_eq!(config.cache.resolved_dir(), PathBuf::from("/tmp/override"));
        std::env::remove_var("STATECHAIN_CACHE_DIR");
    }
}
