//! Drift detection between applied records and live objects.
//!
//! Signal precedence:
//! 1. `NeverApplied` (no records and no applied revision)
//! 2. `Missing` (a recorded object no longer exists in the target)
//! 3. `Drifted` (a field this unit owns differs on the live object)
//! 4. `InSync`

use chrono::{DateTime, Utc};
use serde::Serialize;

use driftwood_core::{ObjectId, Revision, UnitName};

use crate::error::ApplyError;
use crate::merge;
use crate::record_store::RecordStoreFile;
use crate::target::TargetApi;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum DriftSignal {
    NeverApplied,
    InSync,
    Drifted { objects: Vec<ObjectId> },
    Missing { objects: Vec<ObjectId> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    pub unit: UnitName,
    pub revision: Option<Revision>,
    pub applied_at: DateTime<Utc>,
    #[serde(flatten)]
    pub signal: DriftSignal,
}

/// Compare every applied record with the object the target holds now.
pub fn check<T: TargetApi + ?Sized>(
    target: &T,
    store: &RecordStoreFile,
) -> Result<DriftReport, ApplyError> {
    let report = |signal| DriftReport {
        unit: store.unit.clone(),
        revision: store.latest_revision().cloned(),
        applied_at: store.updated_at,
        signal,
    };
    if store.records.is_empty() && store.latest_revision().is_none() {
        return Ok(report(DriftSignal::NeverApplied));
    }

    let mut missing = Vec::new();
    let mut drifted = Vec::new();
    for record in store.records.values() {
        match target.get(&record.id)? {
            None => missing.push(record.id.clone()),
            Some(live) if merge::has_drifted(&record.payload, &live) => {
                drifted.push(record.id.clone())
            }
            Some(_) => {}
        }
    }

    let signal = if !missing.is_empty() {
        DriftSignal::Missing { objects: missing }
    } else if !drifted.is_empty() {
        DriftSignal::Drifted { objects: drifted }
    } else {
        DriftSignal::InSync
    };
    Ok(report(signal))
}

/// Format age from a chrono timestamp (record store `updated_at`).
pub fn format_age(timestamp: DateTime<Utc>) -> String {
    let seconds = Utc::now()
        .signed_duration_since(timestamp)
        .num_seconds()
        .max(0) as u64;
    if seconds < 60 {
        return format!("{seconds}s");
    }
    if seconds < 60 * 60 {
        return format!("{}m", seconds / 60);
    }
    if seconds < 60 * 60 * 24 {
        return format!("{}h", seconds / (60 * 60));
    }
    format!("{}d", seconds / (60 * 60 * 24))
}

/// Up to three ids, then `+N more`.
pub fn preview_objects(ids: &[ObjectId]) -> String {
    let mut shown: Vec<String> = ids.iter().take(3).map(ToString::to_string).collect();
    if ids.len() > shown.len() {
        shown.push(format!("+{} more", ids.len() - shown.len()));
    }
    shown.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{apply, ApplyOptions};
    use crate::target::MemoryTarget;
    use chrono::Duration as ChronoDuration;
    use driftwood_core::{DesiredObject, Gvk, TargetScope};
    use serde_json::json;

    fn cm(name: &str) -> DesiredObject {
        DesiredObject {
            id: ObjectId::new(Gvk::from_api_version("v1", "ConfigMap"), Some("shop".into()), name),
            payload: json!({"apiVersion": "v1", "kind": "ConfigMap", "data": {"k": name}}),
            owner: "apps".into(),
        }
    }

    fn applied(target: &MemoryTarget) -> RecordStoreFile {
        let mut store = RecordStoreFile::empty(&"apps".into());
        apply(
            target,
            &mut store,
            &TargetScope::Cluster,
            &"c1".into(),
            &[cm("a"), cm("b")],
            &ApplyOptions::default(),
        )
        .expect("apply");
        store
    }

    #[test]
    fn never_applied_store() {
        let target = MemoryTarget::new();
        let store = RecordStoreFile::empty(&"apps".into());
        assert_eq!(check(&target, &store).unwrap().signal, DriftSignal::NeverApplied);
    }

    #[test]
    fn in_sync_then_drifted_then_missing() {
        let target = MemoryTarget::new();
        let store = applied(&target);
        assert_eq!(check(&target, &store).unwrap().signal, DriftSignal::InSync);

        let a = cm("a").id;
        let mut live = target.get(&a).unwrap().unwrap();
        live["data"]["k"] = json!("edited");
        target.put_external(&a, live);
        assert_eq!(
            check(&target, &store).unwrap().signal,
            DriftSignal::Drifted { objects: vec![a.clone()] }
        );

        target.remove_external(&cm("b").id);
        assert!(matches!(
            check(&target, &store).unwrap().signal,
            DriftSignal::Missing { .. }
        ));
    }

    #[test]
    fn foreign_fields_are_not_drift() {
        let target = MemoryTarget::new();
        let store = applied(&target);
        let a = cm("a").id;
        let mut live = target.get(&a).unwrap().unwrap();
        live["status"] = json!({"observed": 1});
        target.put_external(&a, live);
        assert_eq!(check(&target, &store).unwrap().signal, DriftSignal::InSync);
    }

    #[test]
    fn ages_and_previews_format_compactly() {
        assert_eq!(format_age(Utc::now() - ChronoDuration::seconds(90)), "1m");
        assert_eq!(format_age(Utc::now() - ChronoDuration::hours(5)), "5h");
        let ids: Vec<ObjectId> = ["a", "b", "c", "d"].iter().map(|n| cm(n).id).collect();
        assert!(preview_objects(&ids).ends_with("+1 more"));
    }
}
