//! Dry-run unified diff support for `driftwood diff`.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::Value;
use similar::TextDiff;

use driftwood_core::{DesiredObject, ObjectId, TargetScope};

use crate::engine::{labelled, plan, scope_namespace, Plan};
use crate::error::ApplyError;
use crate::record_store::RecordStoreFile;
use crate::target::{ListSelector, TargetApi};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    Create,
    Update,
    Prune,
    /// Live object belongs to another unit; an apply would fail.
    Conflict,
}

/// A single object diff, live on the left and what apply would send on the right.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectDiff {
    pub id: ObjectId,
    pub kind: DiffKind,
    pub unified_diff: String,
}

/// Compare `desired` with the target. Unchanged objects are omitted.
///
/// Nothing is written.
pub fn diff_unit<T: TargetApi + ?Sized>(
    target: &T,
    store: &RecordStoreFile,
    scope: &TargetScope,
    desired: &[DesiredObject],
    prune: bool,
) -> Result<Vec<ObjectDiff>, ApplyError> {
    let mut diffs = Vec::new();
    for object in desired {
        let payload = labelled(object, &store.unit);
        let live = target.get(&object.id)?;
        let last = store.get(&object.id).map(|r| &r.payload);
        let (kind, after) = match plan(&store.unit, last, &payload, live.as_ref()) {
            Plan::Unchanged => continue,
            Plan::Create => (DiffKind::Create, payload),
            Plan::Update(merged) => (DiffKind::Update, merged),
            Plan::Conflict(_) => (DiffKind::Conflict, payload),
        };
        diffs.push(ObjectDiff {
            id: object.id.clone(),
            kind,
            unified_diff: unified(&object.id, live.as_ref(), Some(&after))?,
        });
    }

    if prune {
        let wanted: BTreeSet<&ObjectId> = desired.iter().map(|o| &o.id).collect();
        let owned = target.list(&ListSelector::owned_by(&store.unit).in_namespace(scope_namespace(scope)))?;
        for (id, live) in owned {
            if wanted.contains(&id) {
                continue;
            }
            let unified_diff = unified(&id, Some(&live), None)?;
            diffs.push(ObjectDiff {
                id,
                kind: DiffKind::Prune,
                unified_diff,
            });
        }
    }
    Ok(diffs)
}

fn unified(id: &ObjectId, before: Option<&Value>, after: Option<&Value>) -> Result<String, ApplyError> {
    let before = to_yaml(before)?;
    let after = to_yaml(after)?;
    let old_header = format!("live/{id}");
    let new_header = format!("desired/{id}");
    Ok(TextDiff::from_lines(&before, &after)
        .unified_diff()
        .header(&old_header, &new_header)
        .context_radius(3)
        .to_string())
}

fn to_yaml(value: Option<&Value>) -> Result<String, ApplyError> {
    match value {
        Some(v) => Ok(serde_yaml::to_string(v)?),
        None => Ok(String::new()),
    }
}
