//! Error types for driftwood-apply.

use std::path::PathBuf;

use thiserror::Error;

use driftwood_core::{
    DependencyError, ErrorClass, ObjectId, RegistryError, Revision, UnitName,
};
use driftwood_renderer::RenderError;
use driftwood_source::FetchError;

/// Failures reported by a target API for a single operation.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("{0} not found")]
    NotFound(ObjectId),

    #[error("{0} already exists")]
    AlreadyExists(ObjectId),

    /// The target refused the object (validation, admission, quota).
    #[error("{id} rejected: {message}")]
    Rejected { id: ObjectId, message: String },

    /// Target-side rate limiting.
    #[error("target throttled the request for {0}")]
    Throttled(ObjectId),

    #[error("target unavailable: {0}")]
    Unavailable(String),

    #[error("target I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("target object at {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors that abort a unit's apply as a whole.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Target(#[from] TargetError),

    /// The revision was applied before and a newer one has been applied since.
    #[error("unit '{unit}' refuses revision {revision}: newer revision {latest} already applied")]
    StaleRevision {
        unit: UnitName,
        revision: Revision,
        latest: Revision,
    },

    /// I/O error in the applied-record store, with annotated path.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON error in the applied-record store.
    #[error("record store JSON error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// YAML rendering of a payload for diff output.
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Everything that can stop a fetch → render → apply run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(#[from] FetchError),

    #[error("render error: {0}")]
    Render(#[from] RenderError),

    #[error("dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("apply error: {0}")]
    Apply(#[from] ApplyError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Dependencies have not (re-)succeeded.
    #[error("dependencies not ready: {}", .waiting.iter().map(|u| u.0.as_str()).collect::<Vec<_>>().join(", "))]
    NotReady { waiting: Vec<UnitName> },

    /// The run's cancel flag was raised before the unit finished.
    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Taxonomy class used for retry decisions and reporting.
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::Source(_) => ErrorClass::Source,
            PipelineError::Render(_) => ErrorClass::Render,
            PipelineError::Dependency(_) | PipelineError::NotReady { .. } => ErrorClass::Dependency,
            PipelineError::Apply(ApplyError::Target(TargetError::Throttled(_))) => {
                ErrorClass::Throttle
            }
            PipelineError::Apply(_) | PipelineError::Registry(_) | PipelineError::Cancelled => {
                ErrorClass::Apply
            }
        }
    }
}

/// Convenience constructor for [`ApplyError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ApplyError {
    ApplyError::Io {
        path: path.into(),
        source,
    }
}

/// Convenience constructor for [`TargetError::Io`].
pub(crate) fn target_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> TargetError {
    TargetError::Io {
        path: path.into(),
        source,
    }
}
