//! # driftwood-source
//!
//! Source tracking: fetch a versioned source (local directory or git ref),
//! expose it as an immutable [`ContentTree`] keyed by [`Revision`], and
//! short-circuit unchanged revisions.
//!
//! [`Revision`]: driftwood_core::Revision

pub mod error;
pub mod fetch;
pub mod git;
pub mod tracker;
pub mod tree;

pub use error::FetchError;
pub use fetch::{local_path, CompositeFetcher, LocalFetcher, Snapshot, SourceFetcher};
pub use git::GitFetcher;
pub use tracker::{FetchOutcome, SourceTracker};
pub use tree::ContentTree;
