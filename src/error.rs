use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the harness.
///
/// None of these are retried. They propagate up to the scenario that
/// triggered them; the supervisor still tears the service down.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A readiness or marker wait ran past its deadline
    #[error("timed out after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    /// An expected configuration field or file is missing
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A network call returned a non-success status
    #[error("{endpoint} returned {status}")]
    ExternalCall {
        endpoint: String,
        status: reqwest::StatusCode,
    },

    /// A verification scenario found a property that does not hold
    #[error("assertion failed: {0}")]
    Assertion(String),

    /// The tailer hit a read error while the process was still alive
    #[error("output tailer for {name} failed: {source}")]
    Tailer {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// An operation was attempted from the wrong lifecycle state
    #[error("invalid supervisor state: {0}")]
    State(String),

    #[error("{path}: {source}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Nix(#[from] nix::Error),

    #[error(transparent)]
    Archive(#[from] zip::result::ZipError),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

impl HarnessError {
    /// Wraps an I/O error with the path it happened on.
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
