//! Three-way merge of desired, last-applied and live payloads.
//!
//! Field ownership follows the last-applied field set: a field this unit
//! applied before is ours to change or remove; a field only present on the
//! live object belongs to someone else and is preserved. Arrays are atomic.

use serde_json::{Map, Value};

/// Payload to send so that live converges on `desired`.
///
/// `live`, minus fields present in `last_applied` but absent from `desired`,
/// overlaid with `desired`.
pub fn three_way(last_applied: Option<&Value>, desired: &Value, live: &Value) -> Value {
    let mut merged = live.clone();
    if let Some(last) = last_applied {
        remove_dropped(&mut merged, last, desired);
    }
    overlay(&mut merged, desired);
    merged
}

/// `live` restricted to the field set of `shape`.
pub fn restrict(live: &Value, shape: &Value) -> Value {
    match (live, shape) {
        (Value::Object(l), Value::Object(s)) => {
            let mut out = Map::new();
            for (k, sv) in s {
                if let Some(lv) = l.get(k) {
                    out.insert(k.clone(), restrict(lv, sv));
                }
            }
            Value::Object(out)
        }
        (l, _) => l.clone(),
    }
}

/// Live has diverged from what was last applied, on the fields we own.
pub fn has_drifted(last_applied: &Value, live: &Value) -> bool {
    restrict(live, last_applied) != *last_applied
}

fn remove_dropped(target: &mut Value, last: &Value, desired: &Value) {
    let (Some(t), Some(l)) = (target.as_object_mut(), last.as_object()) else {
        return;
    };
    let d = desired.as_object();
    for (k, lv) in l {
        match d.and_then(|d| d.get(k)) {
            None => {
                t.remove(k);
            }
            Some(dv) if lv.is_object() && dv.is_object() => {
                if let Some(tv) = t.get_mut(k) {
                    remove_dropped(tv, lv, dv);
                }
            }
            Some(_) => {}
        }
    }
}

fn overlay(target: &mut Value, desired: &Value) {
    match (target, desired) {
        (Value::Object(t), Value::Object(d)) => {
            for (k, dv) in d {
                let nested = dv.is_object() && t.get(k).is_some_and(Value::is_object);
                if nested {
                    if let Some(tv) = t.get_mut(k) {
                        overlay(tv, dv);
                    }
                } else {
                    t.insert(k.clone(), dv.clone());
                }
            }
        }
        (t, d) => *t = d.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn foreign_fields_survive_and_owned_fields_follow_desired() {
        let last = json!({"spec": {"replicas": 2, "paused": false}});
        let desired = json!({"spec": {"replicas": 3}});
        let live = json!({"spec": {"replicas": 2, "paused": false}, "status": {"ready": 2}});
        let merged = three_way(Some(&last), &desired, &live);
        assert_eq!(merged, json!({"spec": {"replicas": 3}, "status": {"ready": 2}}));
    }

    #[test]
    fn drift_on_owned_field_is_corrected() {
        let last = json!({"spec": {"replicas": 2}});
        let live = json!({"spec": {"replicas": 5}, "status": {}});
        assert!(has_drifted(&last, &live));
        let merged = three_way(Some(&last), &last, &live);
        assert_eq!(merged["spec"]["replicas"], 2);
    }

    #[test]
    fn foreign_changes_are_not_drift() {
        let last = json!({"spec": {"replicas": 2}});
        let live = json!({"spec": {"replicas": 2, "nodeName": "n1"}, "status": {"x": 1}});
        assert!(!has_drifted(&last, &live));
    }

    #[test]
    fn removed_owned_field_is_drift() {
        let last = json!({"data": {"a": "1", "b": "2"}});
        let live = json!({"data": {"a": "1"}});
        assert!(has_drifted(&last, &live));
    }

    #[test]
    fn arrays_are_atomic() {
        let last = json!({"args": ["a", "b"]});
        let desired = json!({"args": ["c"]});
        let live = json!({"args": ["a", "b", "injected"]});
        assert_eq!(three_way(Some(&last), &desired, &live), json!({"args": ["c"]}));
        assert!(has_drifted(&last, &live));
    }

    #[test]
    fn adoption_without_last_applied_keeps_everything_live() {
        let desired = json!({"data": {"a": "1"}});
        let live = json!({"data": {"a": "0", "z": "9"}});
        assert_eq!(
            three_way(None, &desired, &live),
            json!({"data": {"a": "1", "z": "9"}})
        );
    }
}
