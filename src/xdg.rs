//! XDG Base Directory support
//!
//! - `$XDG_CACHE_HOME/statechain/` (default: `~/.cache/statechain/`) - Stage and function caches
//! - `$XDG_CONFIG_HOME/statechain/` (default: `~/.config/statechain/`) - Global configuration

use std::path::PathBuf;

/// Cache directory, honoring `STATECHAIN_CACHE_DIR` then `XDG_CACHE_HOME`
pub fn cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STATECHAIN_CACHE_DIR") {
        PathBuf::from(dir)
    } else if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
        PathBuf::from(xdg_cache).join("statechain")
    } else if let Some(cache) = dirs::cache_dir() {
        cache.join("statechain")
    } else if let Some(home) = dirs::home_dir() {
        home.join(".cache").join("statechain")
    } else {
        PathBuf::from(".statechain-cache")
    }
}

/// Directory holding the global config file
pub fn config_dir() -> PathBuf {
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config).join("statechain")
    } else if let Some(home) = dirs::home_dir() {
        home.join(".config").join("statechain")
    } else {
        PathBuf::from(".statechain-config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_cache_dir_overrides() {
        std::env::set_var("STATECHAIN_CACHE_DIR", "/tmp/sc-explicit");
        assert_eq!(cache_dir(), PathBuf::from("/tmp/sc-explicit"));
        std::env::remove_var("STATECHAIN_CACHE_DIR");

        std::env::set_var("XDG_CACHE_HOME", "/tmp/xdg-cache");
        assert_eq!(cache_dir(), PathBuf::from("/tmp/xdg-cache/statechain"));
        std::env::remove_var("XDG_CACHE_HOME");
    }

    #[test]
    #[serial]
    fn test_config_dir_respects_xdg() {
        std::env::set_var("XDG_CONFIG_HOME", "/tmp/xdg-config");
        assert_eq!(config_dir(), PathBuf::from("/tmp/xdg-config/statechain"));
        std::env::remove_var("XDG_CONFIG_HOME");
    }
}
