/// `statechain cache` command implementation
///
/// Read-only inspection of stage, function and operation stores.
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::cli::CacheCommands;
use crate::cli_utils::{format_bytes, statechain_prefix};
use statechain::store::{self, JsonFileStore, KvStore, RocksStore};

pub fn run(command: CacheCommands) -> Result<()> {
    match command {
        CacheCommands::List { store, verbose } => list(&store, verbose),
        CacheCommands::Show { store, key } => show(&store, &key),
        CacheCommands::Stats { store } => stats(&store),
    }
}

/// A directory holding `entries/` is a RocksDB cache, anything else a JSON document
fn open(path: &str) -> Result<Box<dyn KvStore>> {
    let path = Path::new(path);
    if !path.exists() {
        anyhow::bail!("Store not found: {}", path.display());
    }

    if path.is_dir() {
        if !path.join("entries").is_dir() {
            anyhow::bail!("Not a statechain cache directory: {}", path.display());
        }
        let store = RocksStore::open(path)
            .with_context(|| format!("Failed to open RocksDB store: {}", path.display()))?;
        Ok(Box::new(store))
    } else {
        let store = JsonFileStore::open(path)
            .with_context(|| format!("Failed to open JSON store: {}", path.display()))?;
        Ok(Box::new(store))
    }
}

fn created_at(value: &Value) -> Option<&str> {
    value.get("created_at").and_then(Value::as_str)
}

fn list(path: &str, verbose: bool) -> Result<()> {
    let store = open(path)?;
    let keys = store.keys().context("Failed to list cache entries")?;

    if keys.is_empty() {
        println!("No cache entries.");
        return Ok(());
    }

    println!("Cache entries ({} entries):", keys.len());
    println!();

    for key in keys {
        println!("  {}", key);
        if !verbose {
            continue;
        }

        if let Some(value) = store.get(&key)? {
            if let Some(created) = created_at(&value) {
                println!("    Created: {}", created);
            }
            if let Some(deltas) = value.get("deltas").and_then(Value::as_array) {
                println!("    Environments changed: {}", deltas.len());
            }
            if value.get("coroutine").and_then(Value::as_bool) == Some(true) {
                println!("    Async producer");
            }
        }
    }

    Ok(())
}

fn show(path: &str, key: &str) -> Result<()> {
    let store = open(path)?;

    match store.get(key)? {
        Some(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        None => anyhow::bail!("No entry for key: {}", key),
    }
}

fn stats(path: &str) -> Result<()> {
    let store = open(path)?;
    let stats = store::stats(store.as_ref(), Some(PathBuf::from(path)))
        .context("Failed to compute store statistics")?;

    println!("{} Cache statistics", statechain_prefix());
    println!();
    println!("  Store: {}", store.describe());
    if let Some(location) = &stats.location {
        println!("  Location: {}", location.display());
    }
    println!("  Total entries: {}", stats.total_entries);
    println!("  Total size: {}", format_bytes(stats.total_bytes));

    Ok(())
}
