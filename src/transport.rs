/// Execution and file-transfer collaborators
///
/// The cache core never moves bytes or runs commands itself. It asks a
/// [`Transport`] to run an opaque command inside an environment, to copy
/// content between two locations, and to fingerprint a path where it lives.
/// How a transport reaches a host (ssh, an agent, a container exec) is its own
/// business.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Instant;
use tracing::debug;
use walkdir::WalkDir;

use crate::environment::EnvIdentity;
use crate::error::{Error, Result};
use crate::fingerprint::{FingerprintMode, Fingerprinter, SampleConfig};

/// A path on some host. `host == None` means the local machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Location {
    pub host: Option<String>,
    pub path: String,
}

impl Location {
    pub fn new(host: Option<&str>, path: impl Into<String>) -> Self {
        Self {
            host: normalize_host(host),
            path: path.into(),
        }
    }

    pub fn local(path: impl Into<String>) -> Self {
        Self::new(None, path)
    }

    pub fn is_local(&self) -> bool {
        self.host.is_none()
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.host {
            Some(host) => write!(f, "{}:{}", host, self.path),
            None => write!(f, "{}", self.path),
        }
    }
}

/// Loopback names collapse to the local host
pub fn normalize_host(host: Option<&str>) -> Option<String> {
    match host {
        None | Some("") | Some("localhost") | Some("127.0.0.1") => None,
        Some(host) => Some(host.to_string()),
    }
}

/// Collaborator that runs commands and moves content
pub trait Transport: Send + Sync {
    /// Run `command` in the environment's working directory and return its
    /// trimmed standard output. A non-zero exit is an [`Error::Shell`].
    fn execute(&self, env: &EnvIdentity, command: &str) -> Result<String>;

    /// Copy a file or directory tree from one location to another
    fn transfer(&self, from: &Location, to: &Location) -> Result<()>;

    /// Fingerprint a path where it lives
    fn fingerprint(&self, location: &Location, mode: FingerprintMode) -> Result<String>;
}

/// Transport for environments on the local machine
pub struct LocalTransport {
    shell: String,
    fingerprinter: Fingerprinter,
}

impl LocalTransport {
    pub fn new(sample: SampleConfig) -> Self {
        Self {
            shell: "bash".to_string(),
            fingerprinter: Fingerprinter::new(sample),
        }
    }

    /// Use a different shell binary (it must accept `-c <command>`)
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    fn require_local(location: &Location) -> Result<PathBuf> {
        if !location.is_local() {
            return Err(Error::UnsupportedLocation(location.to_string()));
        }
        Ok(expand_home(&location.path))
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new(SampleConfig::default())
    }
}

impl Transport for LocalTransport {
    fn execute(&self, env: &EnvIdentity, command: &str) -> Result<String> {
        let cwd = Self::require_local(&env.location())?;
        fs::create_dir_all(&cwd)?;

        let start = Instant::now();
        let output = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .output()?;

        let stdout = String::from_utf8_lossy(&output.stdout).replace("\r\n", "\n");
        debug!(
            env = %env,
            exit_code = output.status.code().unwrap_or(-1),
            duration_ms = start.elapsed().as_millis() as u64,
            "executed command"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Shell {
                status: output.status.code().unwrap_or(-1),
                output: format!("{}{}", stdout, stderr).trim().to_string(),
            });
        }

        Ok(stdout.trim().to_string())
    }

    fn transfer(&self, from: &Location, to: &Location) -> Result<()> {
        let src = Self::require_local(from)?;
        let dest = Self::require_local(to)?;

        if !src.exists() {
            return Err(Error::NotFound(src));
        }

        if src.is_dir() {
            copy_tree(&src, &dest)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&src, &dest)?;
        }

        debug!(from = %from, to = %to, "transferred");
        Ok(())
    }

    fn fingerprint(&self, location: &Location, mode: FingerprintMode) -> Result<String> {
        let path = Self::require_local(location)?;
        self.fingerprinter.fingerprint(&path, mode)
    }
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e)))?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Expand a leading `~` to the current user's home directory
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
