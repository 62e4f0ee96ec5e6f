//! Error types for driftwood-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::UnitName;

/// All errors that can arise from registry and config operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Underlying I/O failure (file not found, permission denied, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (write/save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON error in the status history store.
    #[error("status store JSON error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// YAML parse error on load: includes file path and line context from serde_yaml.
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`: cannot locate `~/.driftwood/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    #[error("unit '{name}' not found at {path}")]
    UnitNotFound { name: UnitName, path: PathBuf },

    #[error("unit '{0}' already exists")]
    DuplicateUnit(UnitName),

    #[error("invalid unit name '{0}': use lowercase letters, digits and '-'")]
    InvalidName(UnitName),

    /// The file stem and the `name:` field disagree.
    #[error("unit file {path} declares name '{declared}'")]
    NameMismatch { path: PathBuf, declared: UnitName },

    #[error(transparent)]
    Dependency(#[from] DependencyError),
}

/// Configuration errors in the dependency graph. Fatal at load time, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    /// Inserting the unit would close a cycle; `cycle` starts and ends at the same unit.
    #[error("cyclic dependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<UnitName> },

    #[error("unit '{unit}' depends on unknown unit(s): {}", format_names(.missing))]
    MissingDependency {
        unit: UnitName,
        missing: Vec<UnitName>,
    },

    #[error("unit '{unit}' is still referenced by: {}", format_names(.dependents))]
    StillReferenced {
        unit: UnitName,
        dependents: Vec<UnitName>,
    },
}

fn format_cycle(cycle: &[UnitName]) -> String {
    cycle
        .iter()
        .map(|n| n.0.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn format_names(names: &[UnitName]) -> String {
    names
        .iter()
        .map(|n| n.0.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
