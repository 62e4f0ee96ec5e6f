//! # driftwood-renderer
//!
//! Turns a fetched source tree plus a unit's path into an ordered list of
//! [`DesiredObject`]s. Expansion of raw documents is delegated to a
//! [`TemplateEngine`]; the [`Renderer`] validates identity fields, applies
//! the unit's target scope and imposes the kind-priority apply order.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use driftwood_core::ReconciliationUnit;
//! use driftwood_renderer::Renderer;
//! use driftwood_source::{LocalFetcher, SourceFetcher};
//!
//! fn render(unit: &ReconciliationUnit) {
//!     let Ok(snapshot) = LocalFetcher.fetch(&unit.source.url, &unit.source.reference) else {
//!         return;
//!     };
//!     let renderer = Renderer::new();
//!     if let Ok(objects) = renderer.render(&snapshot.tree, &snapshot.revision, unit) {
//!         for obj in objects {
//!             println!("{}", obj.id);
//!         }
//!     }
//! }
//! ```
//!
//! [`DesiredObject`]: driftwood_core::DesiredObject

pub mod context;
pub mod engine;
pub mod error;
pub mod order;
pub mod resolver;

pub use context::RenderContext;
pub use engine::{DirectoryEngine, RawDocument, TemplateEngine};
pub use error::RenderError;
pub use order::{is_cluster_scoped, kind_priority};
pub use resolver::Renderer;
