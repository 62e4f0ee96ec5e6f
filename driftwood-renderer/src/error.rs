//! Error types for driftwood-renderer.

use std::path::PathBuf;

use thiserror::Error;

use driftwood_core::ObjectId;

/// All errors that abort rendering for a unit. Nothing is applied when any
/// of these is returned.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The unit's path does not exist in the fetched tree.
    #[error("path {} not found in source", .path.display())]
    PathNotFound { path: PathBuf },

    /// A document could not be parsed, or is not a mapping.
    #[error("malformed document in {file}: {message}")]
    MalformedDocument { file: String, message: String },

    /// A required identity field is absent or empty.
    #[error("document {index} in {file} is missing {field}")]
    MissingIdentity {
        file: String,
        index: usize,
        field: &'static str,
    },

    /// Two documents resolve to the same object identity.
    #[error("object {0} is declared more than once")]
    DuplicateObject(ObjectId),

    /// A cluster-scoped object in a namespace-scoped unit.
    #[error("object {id} violates the unit's target scope: {message}")]
    ScopeViolation { id: ObjectId, message: String },

    /// Tera failed to render a templated manifest.
    #[error("template {file} failed: {message}")]
    Template { file: String, message: String },

    /// JSON serialization error (building tera context).
    #[error("context serialization error: {0}")]
    Serialization(#[from] tera::Error),
}

impl RenderError {
    /// Tera nests the useful message in its source chain; flatten it.
    pub(crate) fn template(file: &str, err: &tera::Error) -> Self {
        let mut message = err.to_string();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        RenderError::Template {
            file: file.to_string(),
            message,
        }
    }

    pub(crate) fn malformed(file: &str, message: impl Into<String>) -> Self {
        RenderError::MalformedDocument {
            file: file.to_string(),
            message: message.into(),
        }
    }
}
