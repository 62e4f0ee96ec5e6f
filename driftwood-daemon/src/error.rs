use std::path::PathBuf;

use thiserror::Error;

use driftwood_core::UnitName;

/// Error surface for the daemon runtime, scheduler and control protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("registry error: {0}")]
    Registry(#[from] driftwood_core::RegistryError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] driftwood_apply::PipelineError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unit '{0}' is not loaded")]
    UnknownUnit(UnitName),

    #[error("unit '{0}' is suspended")]
    Suspended(UnitName),

    #[error("unit '{unit}' is blocked: {reason}")]
    Blocked { unit: UnitName, reason: String },

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
