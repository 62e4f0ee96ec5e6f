//! driftwood core library: domain types, unit registry, engine config,
//! dependency graph and status history.
//!
//! - [`types`]: newtypes and domain structs
//! - [`error`]: [`RegistryError`], [`DependencyError`]
//! - [`registry`]: load / save / add / remove units
//! - [`config`]: [`EngineConfig`] load / init
//! - [`graph`]: [`DependencyGraph`]
//! - [`status`]: [`StatusReporter`]

pub mod config;
pub mod error;
pub mod graph;
pub mod registry;
pub mod status;
pub mod types;

pub use config::{EngineConfig, LogRotationConfig, TargetConfig, ThrottleConfig};
pub use error::{DependencyError, RegistryError};
pub use graph::{DependencyGraph, GraphBuild, UnitSetDiff};
pub use status::StatusReporter;
pub use types::{
    AppliedRecord, ApplyCounts, DesiredObject, ErrorClass, GitRef, Gvk, Interval, ObjectId,
    ReconcileStatus, ReconciliationResult, ReconciliationUnit, Revision, SourceRef, SourceSpec,
    TargetScope, UnitName,
};
