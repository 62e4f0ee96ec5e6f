//! Render context: variables visible to templated manifests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use driftwood_core::{ReconciliationUnit, Revision};

use crate::error::RenderError;

/// Payload handed to tera for `*.tera` manifests.
///
/// Templates see `unit`, `revision`, `namespace` (empty for cluster scope)
/// and `vars`; every entry of `vars` is also exposed at top level so
/// `{{ image }}` and `{{ vars.image }}` are equivalent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RenderContext {
    pub unit: String,
    pub revision: String,
    pub namespace: String,
    pub vars: BTreeMap<String, String>,
}

impl RenderContext {
    pub fn for_unit(unit: &ReconciliationUnit, revision: &Revision) -> Self {
        RenderContext {
            unit: unit.name.0.clone(),
            revision: revision.0.clone(),
            namespace: unit.target_namespace.clone().unwrap_or_default(),
            vars: unit.substitute.clone(),
        }
    }

    /// Convert to a [`tera::Context`] for rendering.
    pub fn to_tera_context(&self) -> Result<tera::Context, RenderError> {
        let mut ctx = tera::Context::new();
        for (k, v) in &self.vars {
            ctx.insert(k.as_str(), v);
        }
        ctx.extend(tera::Context::from_serialize(self)?);
        Ok(ctx)
    }
}
