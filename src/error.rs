use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the execution cache.
///
/// Cache misses are not errors: stores report them as `Ok(None)` and the
/// wrappers handle them internally.
#[derive(Error, Debug)]
pub enum Error {
    /// Fingerprinting a path that does not exist
    #[error("Path not found: {0}")]
    NotFound(PathBuf),

    /// An argument could not be normalized into a hashable JSON value
    #[error("Failed to normalize argument: {0}")]
    Serialization(String),

    /// The execution collaborator reported a failed command
    #[error("Command failed with exit status {status}")]
    Shell { status: i32, output: String },

    /// A transport was asked to reach a location it cannot address
    #[error("Unsupported location: {0}")]
    UnsupportedLocation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Backing key/value store failure
    #[error("Cache store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl Error {
    /// Exit status of a failed command, if this is a shell failure
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            Error::Shell { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub(crate) fn serialization(err: impl std::fmt::Display) -> Self {
        Error::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
