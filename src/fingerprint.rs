//! Content fingerprints for files and directories
//!
//! Two notions of sameness are provided:
//!
//! - [`exact`]: SHA-256 over the full content. Collision resistant; use it when
//!   deduplication has to be correct.
//! - [`sampled`]: SHA-256 over the size plus three fixed-size samples taken
//!   from the start, middle and end of the file. Cost is bounded by the sample
//!   size regardless of the file size. It catches most changes, not all: an
//!   edit that keeps the size and falls between samples goes unnoticed.
//!
//! Directories fingerprint as a digest over the sorted list of
//! `(relative path, per-file digest)` pairs. The location of the input is never
//! part of the address, so byte-identical content at two paths has the same
//! fingerprint.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::debug;
use walkdir::WalkDir;

use crate::digest::digest_json;
use crate::error::{Error, Result};

/// Default number of bytes read per sample
pub const DEFAULT_SAMPLE_SIZE: usize = 16 * 1024;

/// Files smaller than this are hashed in full by the sampled fingerprint
pub const DEFAULT_SAMPLE_THRESHOLD: u64 = 128 * 1024;

/// Which fingerprint to compute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintMode {
    Exact,
    Sampled,
}

impl std::fmt::Display for FingerprintMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FingerprintMode::Exact => write!(f, "exact"),
            FingerprintMode::Sampled => write!(f, "sampled"),
        }
    }
}

/// Sampling parameters for [`FingerprintMode::Sampled`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleConfig {
    pub sample_size: usize,
    pub threshold: u64,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            sample_size: DEFAULT_SAMPLE_SIZE,
            threshold: DEFAULT_SAMPLE_THRESHOLD,
        }
    }
}

/// Full-content digest of a file or directory
pub fn exact(path: &Path) -> Result<String> {
    fingerprint(path, FingerprintMode::Exact, &SampleConfig::default())
}

/// Sampled digest of a file or directory using the default sampling parameters
pub fn sampled(path: &Path) -> Result<String> {
    fingerprint(path, FingerprintMode::Sampled, &SampleConfig::default())
}

/// Fingerprint a path with an explicit mode and sampling configuration
pub fn fingerprint(path: &Path, mode: FingerprintMode, config: &SampleConfig) -> Result<String> {
    let metadata = stat(path)?;

    if metadata.is_dir() {
        return hash_directory(path, mode, config);
    }

    match mode {
        FingerprintMode::Exact => hash_file_exact(path),
        FingerprintMode::Sampled => hash_file_sampled(path, metadata.len(), config),
    }
}

fn stat(path: &Path) -> Result<fs::Metadata> {
    fs::metadata(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::NotFound(path.to_path_buf())
        } else {
            Error::Io(e)
        }
    })
}

fn hash_file_exact(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn hash_file_sampled(path: &Path, size: u64, config: &SampleConfig) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();

    // Size is always part of the digest so appends are detected even when
    // they land outside every sample
    hasher.update(size.to_le_bytes());

    let sample = config.sample_size as u64;
    if size < config.threshold || sample == 0 || size < sample * 3 {
        let mut content = Vec::with_capacity(size as usize);
        file.read_to_end(&mut content)?;
        hasher.update(&content);
    } else {
        let mut buf = vec![0u8; config.sample_size];
        for offset in [0, size / 2, size - sample] {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
            hasher.update(&buf);
        }
    }

    Ok(hex::encode(hasher.finalize()))
}

fn hash_directory(root: &Path, mode: FingerprintMode, config: &SampleConfig) -> Result<String> {
    let mut entries: Vec<(String, String)> = Vec::new();

    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io(io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");

        let digest = match mode {
            FingerprintMode::Exact => hash_file_exact(entry.path())?,
            FingerprintMode::Sampled => {
                let size = entry.metadata().map_err(|e| Error::Io(io::Error::other(e)))?.len();
                hash_file_sampled(entry.path(), size, config)?
            }
        };
        entries.push((rel, digest));
    }

    entries.sort();
    debug!(
        path = %root.display(),
        mode = %mode,
        entry_count = entries.len(),
        "fingerprinted directory"
    );

    digest_json(&entries)
}

#[derive(Debug, Clone)]
struct MemoEntry {
    modified: SystemTime,
    size: u64,
    digest: String,
}

/// Fingerprinter that memoizes file digests
///
/// A memoized digest is reused only while the file's modification time and
/// size are unchanged. Directories are always recomputed.
pub struct Fingerprinter {
    config: SampleConfig,
    memo: Mutex<HashMap<(PathBuf, FingerprintMode), MemoEntry>>,
}

impl Fingerprinter {
    pub fn new(config: SampleConfig) -> Self {
        Self {
            config,
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SampleConfig {
        &self.config
    }

    pub fn fingerprint(&self, path: &Path, mode: FingerprintMode) -> Result<String> {
        let metadata = stat(path)?;
        if metadata.is_dir() {
            return hash_directory(path, mode, &self.config);
        }

        let modified = metadata.modified()?;
        let size = metadata.len();
        let key = (path.to_path_buf(), mode);

        if let Ok(memo) = self.memo.lock() {
            if let Some(entry) = memo.get(&key) {
                if entry.modified == modified && entry.size == size {
                    return Ok(entry.digest.clone());
                }
            }
        }

        let digest = fingerprint(path, mode, &self.config)?;

        if let Ok(mut memo) = self.memo.lock() {
            memo.insert(
                key,
                MemoEntry {
                    modified,
                    size,
                    digest: digest.clone(),
                },
            );
        }

        Ok(digest)
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(SampleConfig::default())
    }
}
