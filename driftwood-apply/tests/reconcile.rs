//! End-to-end reconciliation against the in-memory target.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use driftwood_apply::{
    record_store, DirectoryTarget, MemoryTarget, Pipeline, RunOptions, Step, TargetApi,
    ThrottledTarget,
};
use driftwood_core::{
    EngineConfig, ErrorClass, GitRef, Gvk, Interval, ObjectId, ReconcileStatus,
    ReconciliationUnit, Revision, SourceSpec, ThrottleConfig,
};
use driftwood_source::{ContentTree, FetchError, Snapshot, SourceFetcher};
use serde_json::json;
use tempfile::TempDir;

/// Serves whatever revision the test last published.
#[derive(Default)]
struct Scripted {
    current: Mutex<Option<Snapshot>>,
}

impl Scripted {
    fn publish(&self, revision: &str, files: &[(&str, &str)]) {
        let mut tree = ContentTree::new();
        for (path, content) in files {
            tree.insert(path, content.as_bytes().to_vec());
        }
        *self.current.lock().unwrap() = Some(Snapshot {
            revision: Revision::from(revision),
            tree: Arc::new(tree),
        });
    }
}

impl SourceFetcher for Scripted {
    fn fetch(&self, url: &str, _reference: &GitRef) -> Result<Snapshot, FetchError> {
        self.current
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| FetchError::Unreachable {
                url: url.to_string(),
                message: "nothing published".to_string(),
            })
    }
}

const NAMESPACE: &str = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: shop\n";

fn config_map(name: &str, value: &str) -> String {
    format!(
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n  namespace: shop\ndata:\n  value: \"{value}\"\n"
    )
}

fn cm_id(name: &str) -> ObjectId {
    ObjectId::new(Gvk::from_api_version("v1", "ConfigMap"), Some("shop".into()), name)
}

fn unit(name: &str, prune: bool) -> ReconciliationUnit {
    let mut u = ReconciliationUnit::new(
        name,
        SourceSpec {
            url: "https://git.example.com/fleet.git".to_string(),
            reference: GitRef::default(),
        },
    );
    u.path = PathBuf::from("./deploy");
    u.prune = prune;
    u
}

struct Harness {
    home: TempDir,
    source: Arc<Scripted>,
    target: Arc<MemoryTarget>,
    pipeline: Pipeline<Arc<Scripted>, Arc<MemoryTarget>>,
}

fn harness() -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let home = TempDir::new().expect("home");
    let source = Arc::new(Scripted::default());
    let target = Arc::new(MemoryTarget::new());
    let config = EngineConfig {
        source_poll_interval: Interval::from_secs(0),
        ..EngineConfig::default()
    };
    let pipeline = Pipeline::new(home.path(), source.clone(), target.clone(), &config);
    Harness {
        home,
        source,
        target,
        pipeline,
    }
}

#[test]
fn second_reconcile_of_same_revision_is_a_no_op() {
    let h = harness();
    h.source.publish(
        "c1",
        &[
            ("deploy/ns.yaml", NAMESPACE),
            ("deploy/cm.yaml", config_map("settings", "1").as_str()),
        ],
    );
    let u = unit("apps", true);

    let first = h.pipeline.run(&u, &RunOptions::default(), &|_| {});
    assert_eq!(first.status, ReconcileStatus::Succeeded, "{first:?}");
    assert_eq!(first.counts.created, 2);

    h.target.reset_ops();
    let second = h.pipeline.run(&u, &RunOptions::default(), &|_| {});
    assert_eq!(second.status, ReconcileStatus::Succeeded);
    assert_eq!(second.counts.unchanged, 2);
    assert_eq!(h.target.ops().total(), 0, "idempotent pass must not call the target");
}

#[test]
fn drift_is_corrected_and_foreign_fields_survive() {
    let h = harness();
    h.source.publish("c1", &[("deploy/cm.yaml", config_map("settings", "1").as_str())]);
    let u = unit("apps", true);
    h.pipeline.run(&u, &RunOptions::default(), &|_| {});

    let id = cm_id("settings");
    let mut live = h.target.get(&id).unwrap().unwrap();
    live["data"]["value"] = json!("tampered");
    live["status"] = json!({"seen": true});
    h.target.put_external(&id, live);

    let result = h.pipeline.run(&u, &RunOptions::default(), &|_| {});
    assert_eq!(result.counts.updated, 1);
    let live = h.target.get(&id).unwrap().unwrap();
    assert_eq!(live["data"]["value"], "1");
    assert_eq!(live["status"]["seen"], true);
}

#[test]
fn removed_object_is_pruned_with_its_record() {
    let h = harness();
    let u = unit("apps", true);
    h.source.publish(
        "c1",
        &[
            ("deploy/a.yaml", config_map("a", "1").as_str()),
            ("deploy/b.yaml", config_map("b", "1").as_str()),
        ],
    );
    h.pipeline.run(&u, &RunOptions::default(), &|_| {});

    h.source.publish("c2", &[("deploy/a.yaml", config_map("a", "1").as_str())]);
    let result = h.pipeline.run(&u, &RunOptions::default(), &|_| {});
    assert_eq!(result.status, ReconcileStatus::Succeeded);
    assert_eq!(result.counts.pruned, 1);
    assert!(h.target.get(&cm_id("b")).unwrap().is_none());

    let store = record_store::load_at(h.home.path(), &u.name).unwrap();
    assert!(store.get(&cm_id("b")).is_none());
    assert!(store.get(&cm_id("a")).is_some());
}

#[test]
fn orphans_are_retained_when_prune_is_off() {
    let h = harness();
    let u = unit("apps", false);
    h.source.publish(
        "c1",
        &[
            ("deploy/a.yaml", config_map("a", "1").as_str()),
            ("deploy/b.yaml", config_map("b", "1").as_str()),
        ],
    );
    h.pipeline.run(&u, &RunOptions::default(), &|_| {});
    h.source.publish("c2", &[("deploy/a.yaml", config_map("a", "1").as_str())]);

    let result = h.pipeline.run(&u, &RunOptions::default(), &|_| {});
    assert_eq!(result.status, ReconcileStatus::Succeeded);
    assert_eq!(result.counts.retained, 1);
    assert!(h.target.get(&cm_id("b")).unwrap().is_some());
}

#[test]
fn one_rejected_object_does_not_roll_back_the_rest() {
    let h = harness();
    let u = unit("apps", true);
    h.source.publish(
        "c1",
        &[
            ("deploy/ns.yaml", NAMESPACE),
            ("deploy/a.yaml", config_map("a", "1").as_str()),
            ("deploy/b.yaml", config_map("b", "1").as_str()),
        ],
    );
    h.target.reject(&cm_id("b"), "quota exceeded");

    let failed = h.pipeline.run(&u, &RunOptions::default(), &|_| {});
    assert_eq!(failed.status, ReconcileStatus::Failed);
    assert_eq!(failed.error_class, Some(ErrorClass::Apply));
    assert!(failed.error.as_deref().unwrap().contains("quota exceeded"));
    assert_eq!(failed.counts.created, 2);
    assert_eq!(failed.counts.failed, 1);
    assert!(h.target.get(&cm_id("a")).unwrap().is_some());

    h.target.clear_rejections();
    h.target.reset_ops();
    let retried = h.pipeline.run(&u, &RunOptions::default(), &|_| {});
    assert_eq!(retried.status, ReconcileStatus::Succeeded);
    assert_eq!(h.target.ops().creates, 1);
}

#[test]
fn superseded_revision_is_refused_unless_forced() {
    let h = harness();
    let mut u = unit("apps", true);
    h.source.publish("c1", &[("deploy/a.yaml", config_map("a", "1").as_str())]);
    h.pipeline.run(&u, &RunOptions::default(), &|_| {});
    h.source.publish("c2", &[("deploy/a.yaml", config_map("a", "2").as_str())]);
    h.pipeline.run(&u, &RunOptions::default(), &|_| {});

    h.source.publish("c1", &[("deploy/a.yaml", config_map("a", "1").as_str())]);
    let refused = h.pipeline.run(&u, &RunOptions::default(), &|_| {});
    assert_eq!(refused.status, ReconcileStatus::Failed);
    assert!(refused.error.as_deref().unwrap().contains("c2"));
    assert_eq!(h.target.get(&cm_id("a")).unwrap().unwrap()["data"]["value"], "2");

    u.force = true;
    let forced = h.pipeline.run(&u, &RunOptions::default(), &|_| {});
    assert_eq!(forced.status, ReconcileStatus::Succeeded);
    assert_eq!(h.target.get(&cm_id("a")).unwrap().unwrap()["data"]["value"], "1");
}

#[test]
fn dry_run_reports_without_touching_anything() {
    let h = harness();
    let u = unit("apps", true);
    h.source.publish("c1", &[("deploy/a.yaml", config_map("a", "1").as_str())]);
    let opts = RunOptions {
        dry_run: true,
        ..Default::default()
    };
    let run = h.pipeline.reconcile(&u, &opts).expect("dry run");
    assert_eq!(run.outcome.changes(), 1);
    assert!(h.target.snapshot().is_empty());
    assert!(!record_store::store_path_at(h.home.path(), &u.name).exists());
}

#[test]
fn persistent_target_throttling_reports_progressing() {
    let _ = env_logger::builder().is_test(true).try_init();
    let home = TempDir::new().unwrap();
    let source = Arc::new(Scripted::default());
    let memory = Arc::new(MemoryTarget::new());
    let target = ThrottledTarget::new(memory.clone(), &ThrottleConfig::default())
        .with_retry_base(Duration::from_millis(1));
    let pipeline = Pipeline::new(home.path(), source.clone(), target, &EngineConfig::default());
    source.publish("c1", &[("deploy/a.yaml", config_map("a", "1").as_str())]);
    memory.throttle_next(100);

    let result = pipeline.run(&unit("apps", true), &RunOptions::default(), &|_| {});
    assert_eq!(result.status, ReconcileStatus::Progressing);
    assert_eq!(result.error_class, Some(ErrorClass::Throttle));
}

#[test]
fn raised_cancel_flag_stops_the_run() {
    let h = harness();
    h.source.publish("c1", &[("deploy/a.yaml", config_map("a", "1").as_str())]);
    let opts = RunOptions {
        cancel: Some(Arc::new(AtomicBool::new(true))),
        ..Default::default()
    };
    let result = h.pipeline.run(&unit("apps", true), &opts, &|_| {});
    assert_eq!(result.status, ReconcileStatus::Failed);
    assert!(h.target.snapshot().is_empty());
}

#[test]
fn unlabelled_live_object_is_adopted() {
    let h = harness();
    let id = cm_id("legacy");
    h.target.put_external(
        &id,
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "legacy", "namespace": "shop", "annotations": {"team": "ops"}},
            "data": {"value": "old"},
        }),
    );
    h.source.publish("c1", &[("deploy/legacy.yaml", config_map("legacy", "new").as_str())]);

    let result = h.pipeline.run(&unit("apps", true), &RunOptions::default(), &|_| {});
    assert_eq!(result.counts.updated, 1);
    let live = h.target.get(&id).unwrap().unwrap();
    assert_eq!(live["data"]["value"], "new");
    assert_eq!(live["metadata"]["annotations"]["team"], "ops");
    assert_eq!(live["metadata"]["labels"]["driftwood.io/unit"], "apps");
}

#[test]
fn render_failure_applies_nothing() {
    let h = harness();
    h.source.publish(
        "c1",
        &[
            ("deploy/a.yaml", config_map("a", "1").as_str()),
            ("deploy/bad.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n"),
        ],
    );
    let result = h.pipeline.run(&unit("apps", true), &RunOptions::default(), &|_| {});
    assert_eq!(result.error_class, Some(ErrorClass::Render));
    assert!(h.target.snapshot().is_empty());
}

#[test]
fn manifest_names_cannot_write_outside_the_target_root() {
    let _ = env_logger::builder().is_test(true).try_init();
    let home = TempDir::new().unwrap();
    let source = Arc::new(Scripted::default());
    let target = DirectoryTarget::new(home.path().join("cluster"));
    let pipeline = Pipeline::new(home.path(), source.clone(), target, &EngineConfig::default());
    source.publish(
        "c1",
        &[("deploy/a.yaml", config_map("../../../../../escaped", "1").as_str())],
    );

    let result = pipeline.run(&unit("apps", true), &RunOptions::default(), &|_| {});
    assert_eq!(result.status, ReconcileStatus::Failed);
    assert_eq!(result.error_class, Some(ErrorClass::Render));
    assert!(!home.path().join("escaped.json").exists());
    assert!(!home.path().join("cluster").exists());
}

#[test]
fn steps_are_observed_in_order() {
    let h = harness();
    h.source.publish("c1", &[("deploy/a.yaml", config_map("a", "1").as_str())]);
    let seen = Mutex::new(Vec::new());
    h.pipeline
        .reconcile_observed(&unit("apps", true), &RunOptions::default(), &|s| {
            seen.lock().unwrap().push(s)
        })
        .expect("reconcile");
    assert_eq!(*seen.lock().unwrap(), vec![Step::Fetch, Step::Render, Step::Apply]);
}

#[test]
fn dependents_wait_for_failed_dependencies() {
    let h = harness();
    h.source.publish("c1", &[("deploy/a.yaml", config_map("a", "1").as_str())]);
    let mut infra = unit("infra", true);
    infra.path = PathBuf::from("./missing");
    let mut apps = unit("apps", true);
    apps.depends_on.insert("infra".into());

    let results = h.pipeline.reconcile_all(&[apps, infra], &RunOptions::default());
    let infra_result = results.iter().find(|r| r.unit.0 == "infra").unwrap();
    let apps_result = results.iter().find(|r| r.unit.0 == "apps").unwrap();
    assert_eq!(infra_result.error_class, Some(ErrorClass::Render));
    assert_eq!(apps_result.error_class, Some(ErrorClass::Dependency));
    assert!(h.target.snapshot().is_empty());
}
