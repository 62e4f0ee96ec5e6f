//! Error types for driftwood-source.

use std::path::PathBuf;

use thiserror::Error;

/// Source fetch failures. All are non-fatal to the process: the owning unit
/// is marked failed and retried with backoff.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("source {url} is unreachable: {message}")]
    Unreachable { url: String, message: String },

    #[error("authentication to {url} failed")]
    AuthFailed { url: String },

    #[error("ref '{reference}' not found in {url}")]
    RefNotFound { url: String, reference: String },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> FetchError {
    FetchError::Io {
        path: path.into(),
        source,
    }
}
