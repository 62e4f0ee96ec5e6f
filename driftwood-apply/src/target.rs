//! Target-apply interface and the two bundled targets.
//!
//! - [`MemoryTarget`]: process-local map; supports failure injection and
//!   operation counting for tests.
//! - [`DirectoryTarget`]: one JSON file per object at
//!   `<root>/<group>/<version>/<Kind>/<namespace>/<name>.json` (`_` for the
//!   core group and for cluster scope).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};

use driftwood_core::{EngineConfig, Gvk, ObjectId, UnitName};

use crate::error::{target_io_err, TargetError};

/// Label stamped into `metadata.labels` of every object a unit applies.
pub const OWNER_LABEL: &str = "driftwood.io/unit";

/// The owning unit recorded on a payload, if any.
pub fn owner_of(payload: &Value) -> Option<&str> {
    payload
        .get("metadata")?
        .get("labels")?
        .get(OWNER_LABEL)?
        .as_str()
}

/// Stamp the ownership label into `metadata.labels`.
pub fn set_owner(payload: &mut Value, unit: &UnitName) {
    let Some(root) = payload.as_object_mut() else {
        return;
    };
    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(meta) = metadata.as_object_mut() else {
        return;
    };
    let labels = meta
        .entry("labels")
        .or_insert_with(|| Value::Object(Map::new()));
    if !labels.is_object() {
        *labels = Value::Object(Map::new());
    }
    if let Some(labels) = labels.as_object_mut() {
        labels.insert(OWNER_LABEL.to_string(), Value::String(unit.0.clone()));
    }
}

/// Filter for [`TargetApi::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListSelector {
    pub gvk: Option<Gvk>,
    pub namespace: Option<String>,
    pub owner: Option<UnitName>,
}

impl ListSelector {
    pub fn owned_by(unit: &UnitName) -> Self {
        Self {
            owner: Some(unit.clone()),
            ..Default::default()
        }
    }

    pub fn in_namespace(mut self, namespace: Option<&str>) -> Self {
        self.namespace = namespace.map(str::to_string);
        self
    }

    pub fn matches(&self, id: &ObjectId, payload: &Value) -> bool {
        if let Some(gvk) = &self.gvk {
            if &id.gvk != gvk {
                return false;
            }
        }
        if let Some(ns) = &self.namespace {
            if id.namespace.as_deref() != Some(ns.as_str()) {
                return false;
            }
        }
        if let Some(owner) = &self.owner {
            if owner_of(payload) != Some(owner.0.as_str()) {
                return false;
            }
        }
        true
    }
}

/// External orchestration API.
pub trait TargetApi: Send + Sync {
    fn get(&self, id: &ObjectId) -> Result<Option<Value>, TargetError>;
    fn create(&self, id: &ObjectId, payload: &Value) -> Result<(), TargetError>;
    fn update(&self, id: &ObjectId, payload: &Value) -> Result<(), TargetError>;
    fn delete(&self, id: &ObjectId) -> Result<(), TargetError>;
    fn list(&self, selector: &ListSelector) -> Result<Vec<(ObjectId, Value)>, TargetError>;
}

impl<T: TargetApi + ?Sized> TargetApi for Arc<T> {
    fn get(&self, id: &ObjectId) -> Result<Option<Value>, TargetError> {
        (**self).get(id)
    }
    fn create(&self, id: &ObjectId, payload: &Value) -> Result<(), TargetError> {
        (**self).create(id, payload)
    }
    fn update(&self, id: &ObjectId, payload: &Value) -> Result<(), TargetError> {
        (**self).update(id, payload)
    }
    fn delete(&self, id: &ObjectId) -> Result<(), TargetError> {
        (**self).delete(id)
    }
    fn list(&self, selector: &ListSelector) -> Result<Vec<(ObjectId, Value)>, TargetError> {
        (**self).list(selector)
    }
}

impl<T: TargetApi + ?Sized> TargetApi for Box<T> {
    fn get(&self, id: &ObjectId) -> Result<Option<Value>, TargetError> {
        (**self).get(id)
    }
    fn create(&self, id: &ObjectId, payload: &Value) -> Result<(), TargetError> {
        (**self).create(id, payload)
    }
    fn update(&self, id: &ObjectId, payload: &Value) -> Result<(), TargetError> {
        (**self).update(id, payload)
    }
    fn delete(&self, id: &ObjectId) -> Result<(), TargetError> {
        (**self).delete(id)
    }
    fn list(&self, selector: &ListSelector) -> Result<Vec<(ObjectId, Value)>, TargetError> {
        (**self).list(selector)
    }
}

/// Build the target named in the engine config.
pub fn open_target(config: &EngineConfig, home: &Path) -> Arc<dyn TargetApi> {
    match config.directory_target_root(home) {
        Some(root) => Arc::new(DirectoryTarget::new(root)),
        None => Arc::new(MemoryTarget::new()),
    }
}

// ---------------------------------------------------------------------------
// MemoryTarget
// ---------------------------------------------------------------------------

/// Mutating operations seen by a [`MemoryTarget`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl OpCounts {
    pub fn total(&self) -> usize {
        self.creates + self.updates + self.deletes
    }
}

#[derive(Debug, Default)]
pub struct MemoryTarget {
    objects: Mutex<BTreeMap<ObjectId, Value>>,
    rejected: Mutex<BTreeMap<ObjectId, String>>,
    throttle_budget: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every create/update of `id` fail with `Rejected`.
    pub fn reject(&self, id: &ObjectId, message: impl Into<String>) {
        self.lock_rejected().insert(id.clone(), message.into());
    }

    pub fn clear_rejections(&self) {
        self.lock_rejected().clear();
    }

    /// Answer the next `n` mutating calls with `Throttled`.
    pub fn throttle_next(&self, n: usize) {
        self.throttle_budget.store(n, Ordering::SeqCst);
    }

    /// Write an object as some other actor would, bypassing counters.
    pub fn put_external(&self, id: &ObjectId, payload: Value) {
        self.lock_objects().insert(id.clone(), payload);
    }

    pub fn remove_external(&self, id: &ObjectId) {
        self.lock_objects().remove(id);
    }

    pub fn snapshot(&self) -> BTreeMap<ObjectId, Value> {
        self.lock_objects().clone()
    }

    pub fn ops(&self) -> OpCounts {
        OpCounts {
            creates: self.creates.load(Ordering::SeqCst),
            updates: self.updates.load(Ordering::SeqCst),
            deletes: self.deletes.load(Ordering::SeqCst),
        }
    }

    pub fn reset_ops(&self) {
        self.creates.store(0, Ordering::SeqCst);
        self.updates.store(0, Ordering::SeqCst);
        self.deletes.store(0, Ordering::SeqCst);
    }

    fn lock_objects(&self) -> std::sync::MutexGuard<'_, BTreeMap<ObjectId, Value>> {
        self.objects.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_rejected(&self) -> std::sync::MutexGuard<'_, BTreeMap<ObjectId, String>> {
        self.rejected.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn admit(&self, id: &ObjectId) -> Result<(), TargetError> {
        let throttled = self
            .throttle_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            return Err(TargetError::Throttled(id.clone()));
        }
        if let Some(message) = self.lock_rejected().get(id) {
            return Err(TargetError::Rejected {
                id: id.clone(),
                message: message.clone(),
            });
        }
        Ok(())
    }
}

impl TargetApi for MemoryTarget {
    fn get(&self, id: &ObjectId) -> Result<Option<Value>, TargetError> {
        Ok(self.lock_objects().get(id).cloned())
    }

    fn create(&self, id: &ObjectId, payload: &Value) -> Result<(), TargetError> {
        self.admit(id)?;
        let mut objects = self.lock_objects();
        if objects.contains_key(id) {
            return Err(TargetError::AlreadyExists(id.clone()));
        }
        objects.insert(id.clone(), payload.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn update(&self, id: &ObjectId, payload: &Value) -> Result<(), TargetError> {
        self.admit(id)?;
        let mut objects = self.lock_objects();
        let Some(slot) = objects.get_mut(id) else {
            return Err(TargetError::NotFound(id.clone()));
        };
        *slot = payload.clone();
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, id: &ObjectId) -> Result<(), TargetError> {
        if self.lock_objects().remove(id).is_none() {
            return Err(TargetError::NotFound(id.clone()));
        }
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn list(&self, selector: &ListSelector) -> Result<Vec<(ObjectId, Value)>, TargetError> {
        Ok(self
            .lock_objects()
            .iter()
            .filter(|(id, payload)| selector.matches(id, payload))
            .map(|(id, payload)| (id.clone(), payload.clone()))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// DirectoryTarget
// ---------------------------------------------------------------------------

/// Objects materialized as JSON files; writes use `.tmp` + rename.
#[derive(Debug)]
pub struct DirectoryTarget {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl DirectoryTarget {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<ObjectId::key>.json`. Every identity component must be a
    /// single normal path segment, so no object lands outside `root`.
    pub fn object_path(&self, id: &ObjectId) -> Result<PathBuf, TargetError> {
        let group = if id.gvk.group.is_empty() { "_" } else { &id.gvk.group };
        let namespace = id.namespace.as_deref().unwrap_or("_");
        for segment in [group, &id.gvk.version, &id.gvk.kind, namespace, &id.name] {
            if !is_single_segment(segment) {
                return Err(TargetError::Rejected {
                    id: id.clone(),
                    message: format!("'{segment}' is not a valid path segment"),
                });
            }
        }
        Ok(self.root.join(format!("{}.json", id.key())))
    }

    fn read(path: &Path) -> Result<Option<Value>, TargetError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map(Some)
                .map_err(|source| TargetError::Json {
                    path: path.to_path_buf(),
                    source,
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(target_io_err(path, e)),
        }
    }

    fn write(path: &Path, payload: &Value) -> Result<(), TargetError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| target_io_err(parent, e))?;
        }
        let json = serde_json::to_string_pretty(payload).map_err(|source| TargetError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| target_io_err(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(target_io_err(path, e));
        }
        Ok(())
    }

    /// Rebuild an id from `<group>/<version>/<Kind>/<ns>/<name>.json`.
    fn id_from_path(&self, path: &Path) -> Option<ObjectId> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let [group, version, kind, ns, file] = parts.as_slice() else {
            return None;
        };
        let name = file.strip_suffix(".json")?;
        let group = if group == "_" { String::new() } else { group.clone() };
        let namespace = if ns == "_" { None } else { Some(ns.clone()) };
        Some(ObjectId::new(
            Gvk {
                group,
                version: version.clone(),
                kind: kind.clone(),
            },
            namespace,
            name,
        ))
    }

    fn walk(&self, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), TargetError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(target_io_err(dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| target_io_err(dir, e))?;
            let path = entry.path();
            let ty = entry.file_type().map_err(|e| target_io_err(&path, e))?;
            if ty.is_dir() {
                self.walk(&path, out)?;
            } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
                out.push(path);
            }
        }
        Ok(())
    }
}

fn is_single_segment(segment: &str) -> bool {
    if segment.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(segment).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(part)), None) if part == segment
    )
}

impl TargetApi for DirectoryTarget {
    fn get(&self, id: &ObjectId) -> Result<Option<Value>, TargetError> {
        Self::read(&self.object_path(id)?)
    }

    fn create(&self, id: &ObjectId, payload: &Value) -> Result<(), TargetError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let path = self.object_path(id)?;
        if path.exists() {
            return Err(TargetError::AlreadyExists(id.clone()));
        }
        Self::write(&path, payload)
    }

    fn update(&self, id: &ObjectId, payload: &Value) -> Result<(), TargetError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let path = self.object_path(id)?;
        if !path.exists() {
            return Err(TargetError::NotFound(id.clone()));
        }
        Self::write(&path, payload)
    }

    fn delete(&self, id: &ObjectId) -> Result<(), TargetError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let path = self.object_path(id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TargetError::NotFound(id.clone()))
            }
            Err(e) => Err(target_io_err(&path, e)),
        }
    }

    fn list(&self, selector: &ListSelector) -> Result<Vec<(ObjectId, Value)>, TargetError> {
        let mut files = Vec::new();
        self.walk(&self.root, &mut files)?;
        files.sort();
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for path in files {
            let Some(id) = self.id_from_path(&path) else {
                continue;
            };
            let Some(payload) = Self::read(&path)? else {
                continue;
            };
            if selector.matches(&id, &payload) && seen.insert(id.clone()) {
                out.push((id, payload));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn cm(ns: &str, name: &str) -> ObjectId {
        ObjectId::new(Gvk::from_api_version("v1", "ConfigMap"), Some(ns.into()), name)
    }

    fn owned(unit: &str) -> Value {
        let mut v = json!({"apiVersion": "v1", "kind": "ConfigMap", "data": {"k": "v"}});
        set_owner(&mut v, &unit.into());
        v
    }

    #[test]
    fn owner_label_roundtrip() {
        let mut v = json!({"metadata": {"labels": "garbage"}});
        set_owner(&mut v, &"apps".into());
        assert_eq!(owner_of(&v), Some("apps"));
        assert_eq!(owner_of(&json!({})), None);
    }

    #[test]
    fn memory_target_counts_and_injects_failures() {
        let t = MemoryTarget::new();
        let id = cm("shop", "cfg");
        t.create(&id, &owned("apps")).unwrap();
        assert!(matches!(t.create(&id, &owned("apps")), Err(TargetError::AlreadyExists(_))));
        t.reject(&id, "quota exceeded");
        assert!(matches!(t.update(&id, &owned("apps")), Err(TargetError::Rejected { .. })));
        t.clear_rejections();
        t.throttle_next(1);
        assert!(matches!(t.update(&id, &owned("apps")), Err(TargetError::Throttled(_))));
        t.update(&id, &owned("apps")).unwrap();
        assert_eq!(t.ops(), OpCounts { creates: 1, updates: 1, deletes: 0 });
    }

    #[test]
    fn list_filters_by_owner_and_namespace() {
        let t = MemoryTarget::new();
        t.create(&cm("shop", "a"), &owned("apps")).unwrap();
        t.create(&cm("ops", "b"), &owned("apps")).unwrap();
        t.create(&cm("shop", "c"), &owned("infra")).unwrap();
        let apps = t.list(&ListSelector::owned_by(&"apps".into())).unwrap();
        assert_eq!(apps.len(), 2);
        let shop = t
            .list(&ListSelector::owned_by(&"apps".into()).in_namespace(Some("shop")))
            .unwrap();
        assert_eq!(shop.len(), 1);
        assert_eq!(shop[0].0.name, "a");
    }

    #[test]
    fn directory_target_persists_objects_as_files() {
        let dir = TempDir::new().unwrap();
        let t = DirectoryTarget::new(dir.path());
        let id = cm("shop", "cfg");
        let ns = ObjectId::new(Gvk::from_api_version("v1", "Namespace"), None, "shop");
        t.create(&id, &owned("apps")).unwrap();
        t.create(&ns, &owned("infra")).unwrap();
        assert!(dir.path().join("_/v1/ConfigMap/shop/cfg.json").exists());
        assert!(dir.path().join("_/v1/Namespace/_/shop.json").exists());

        let listed = t.list(&ListSelector::default()).unwrap();
        let ids: Vec<_> = listed.iter().map(|(id, _)| id.clone()).collect();
        assert!(ids.contains(&id) && ids.contains(&ns));

        assert!(matches!(t.update(&cm("shop", "nope"), &json!({})), Err(TargetError::NotFound(_))));
        t.delete(&id).unwrap();
        assert!(t.get(&id).unwrap().is_none());
        assert!(!dir.path().join("_/v1/ConfigMap/shop/cfg.json.tmp").exists());
    }

    #[test]
    fn directory_target_list_on_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let t = DirectoryTarget::new(dir.path().join("cluster"));
        assert!(t.list(&ListSelector::default()).unwrap().is_empty());
    }

    #[test]
    fn directory_target_refuses_ids_that_escape_the_root() {
        let home = TempDir::new().unwrap();
        let root = home.path().join("cluster");
        let t = DirectoryTarget::new(&root);

        for name in ["../../escaped", "..", ".", "a/b", "/abs"] {
            let id = cm("shop", name);
            assert!(
                matches!(t.create(&id, &owned("apps")), Err(TargetError::Rejected { .. })),
                "{name} accepted"
            );
            assert!(matches!(t.get(&id), Err(TargetError::Rejected { .. })));
        }
        assert!(matches!(
            t.create(&cm("../..", "cfg"), &owned("apps")),
            Err(TargetError::Rejected { .. })
        ));
        let sneaky_kind = ObjectId::new(Gvk::from_api_version("v1", ".."), None, "x");
        assert!(t.delete(&sneaky_kind).is_err());

        assert!(!home.path().join("escaped.json").exists());
        assert!(!root.exists());
    }
}
