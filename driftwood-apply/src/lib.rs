//! # driftwood-apply
//!
//! Diff-and-apply of rendered objects against a target, and the shared
//! fetch → render → apply pipeline.
//!
//! Call [`Pipeline::reconcile`] to run one unit, or
//! [`Pipeline::reconcile_all`] to walk a fleet in dependency order.

pub mod diff;
pub mod drift;
pub mod engine;
pub mod error;
pub mod merge;
pub mod pipeline;
pub mod record_store;
pub mod target;
pub mod throttle;

pub use diff::{diff_unit, DiffKind, ObjectDiff};
pub use drift::{DriftReport, DriftSignal};
pub use engine::{apply, ApplyOptions, ApplyOutcome, ObjectAction, ObjectOutcome};
pub use error::{ApplyError, PipelineError, TargetError};
pub use pipeline::{open_at, DefaultPipeline, Pipeline, RunOptions, Step, UnitRun};
pub use record_store::RecordStoreFile;
pub use target::{
    open_target, DirectoryTarget, ListSelector, MemoryTarget, TargetApi, OWNER_LABEL,
};
pub use throttle::ThrottledTarget;
