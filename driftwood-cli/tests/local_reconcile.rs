use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;
use serde_json::Value;
use tempfile::TempDir;

use driftwood_core::{registry, UnitName};

const NAMESPACE: &str = "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: shop\n";

fn config_map(replicas: &str) -> String {
    format!(
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: web\n  namespace: shop\ndata:\n  replicas: \"{replicas}\"\n"
    )
}

fn driftwood_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("driftwood"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env("NO_COLOR", "1");
    cmd
}

fn json_of(home: &Path, args: &[&str]) -> Value {
    let out = driftwood_cmd(home).args(args).output().unwrap();
    assert!(
        out.status.success(),
        "{args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    serde_json::from_slice(&out.stdout).unwrap()
}

fn web_object_path(home: &Path) -> PathBuf {
    home.join(".driftwood/cluster/_/v1/ConfigMap/shop/web.json")
}

/// infra (namespace) and apps (config map, depends on infra) over one local source.
fn fleet() -> (TempDir, TempDir) {
    let home = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    fs::create_dir_all(source.path().join("infra")).unwrap();
    fs::create_dir_all(source.path().join("apps")).unwrap();
    fs::write(source.path().join("infra/namespace.yaml"), NAMESPACE).unwrap();
    fs::write(source.path().join("apps/web.yaml"), config_map("2")).unwrap();

    driftwood_cmd(home.path()).arg("init").assert().success();
    for (name, path, deps) in [("infra", "./infra", None), ("apps", "./apps", Some("infra"))] {
        let mut cmd = driftwood_cmd(home.path());
        cmd.args(["unit", "add", name, "--path", path, "--source"])
            .arg(source.path());
        if let Some(dep) = deps {
            cmd.args(["--depends-on", dep]);
        }
        cmd.assert().success();
    }
    (home, source)
}

#[test]
fn single_unit_waits_for_its_dependency() {
    let (home, _source) = fleet();

    driftwood_cmd(home.path())
        .args(["reconcile", "apps", "--local"])
        .assert()
        .failure()
        .stdout(contains("dependencies not ready: infra"));
    assert!(!web_object_path(home.path()).exists());

    let status = json_of(home.path(), &["get", "apps", "--json"]);
    assert_eq!(status["daemon"], false);
    assert_eq!(status["last"]["status"], "failed");
    assert_eq!(status["last"]["error_class"], "dependency");
}

#[test]
fn local_reconcile_applies_in_dependency_order_and_records_history() {
    let (home, _source) = fleet();

    driftwood_cmd(home.path())
        .args(["reconcile", "--local"])
        .assert()
        .success()
        .stdout(contains("SUCCEEDED"));
    assert!(web_object_path(home.path()).exists());
    assert!(home
        .path()
        .join(".driftwood/cluster/_/v1/Namespace/_/shop.json")
        .exists());

    let apps = json_of(home.path(), &["get", "apps", "--json"]);
    assert_eq!(apps["last"]["status"], "succeeded");
    assert_eq!(apps["last"]["counts"]["created"], 1);

    // Nothing changed: the second pass is a no-op but still recorded.
    driftwood_cmd(home.path())
        .args(["reconcile", "apps", "--local"])
        .assert()
        .success();
    let history = json_of(home.path(), &["history", "apps", "--json"]);
    let history = history.as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["counts"]["unchanged"], 1);

    let limited = json_of(home.path(), &["history", "apps", "--limit", "1", "--json"]);
    assert_eq!(limited.as_array().unwrap().len(), 1);
}

#[test]
fn dry_run_writes_nothing() {
    let (home, _source) = fleet();

    let results = json_of(home.path(), &["reconcile", "--dry-run", "--json"]);
    let statuses: Vec<&str> = results
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|r| r["status"].as_str())
        .collect();
    assert_eq!(statuses, vec!["succeeded", "succeeded"]);
    assert!(!web_object_path(home.path()).exists());

    let status = json_of(home.path(), &["get", "apps", "--json"]);
    assert!(status["last"].is_null(), "dry runs are not recorded");
}

#[test]
fn diff_shows_pending_source_changes() {
    let (home, source) = fleet();
    driftwood_cmd(home.path())
        .args(["reconcile", "--local"])
        .assert()
        .success();

    driftwood_cmd(home.path())
        .args(["diff", "apps"])
        .assert()
        .success()
        .stdout(contains("No differences for 'apps'."));

    fs::write(source.path().join("apps/web.yaml"), config_map("3")).unwrap();
    let assert = driftwood_cmd(home.path())
        .args(["diff", "apps"])
        .assert()
        .success()
        .stdout(contains("update"));
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    assert!(stdout
        .lines()
        .any(|l| l.starts_with('+') && l.contains("replicas") && l.contains('3')));
    assert!(stdout
        .lines()
        .any(|l| l.starts_with('-') && l.contains("replicas") && l.contains('2')));

    let diffs = json_of(home.path(), &["diff", "apps", "--json"]);
    assert_eq!(diffs[0]["kind"], "update");
}

#[test]
fn drift_detects_edits_and_deletions_of_applied_objects() {
    let (home, _source) = fleet();

    let before = json_of(home.path(), &["drift", "--json"]);
    assert!(before
        .as_array()
        .unwrap()
        .iter()
        .all(|r| r["signal"] == "never_applied"));

    driftwood_cmd(home.path())
        .args(["reconcile", "--local"])
        .assert()
        .success();
    let synced = json_of(home.path(), &["drift", "apps", "--json"]);
    assert_eq!(synced[0]["signal"], "in_sync");

    let path = web_object_path(home.path());
    let mut live: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    live["data"]["replicas"] = Value::from("9");
    fs::write(&path, serde_json::to_string_pretty(&live).unwrap()).unwrap();

    driftwood_cmd(home.path())
        .args(["drift", "apps"])
        .assert()
        .success()
        .stdout(contains("DRIFTED"))
        .stdout(contains("ConfigMap/shop/web"));

    fs::remove_file(&path).unwrap();
    let missing = json_of(home.path(), &["drift", "apps", "--json"]);
    assert_eq!(missing[0]["signal"], "missing");

    // A reconcile puts the object back.
    driftwood_cmd(home.path())
        .args(["reconcile", "apps", "--local"])
        .assert()
        .success();
    assert!(path.exists());
}

#[test]
fn suspend_and_resume_without_a_daemon_persist_the_flag() {
    let (home, _source) = fleet();
    let apps = UnitName::from("apps");

    driftwood_cmd(home.path())
        .args(["suspend", "apps"])
        .assert()
        .success()
        .stdout(contains("Suspended 'apps'"));
    assert!(registry::load_unit_at(home.path(), &apps).unwrap().suspended);

    let results = json_of(home.path(), &["reconcile", "--local", "--json"]);
    let apps_result = results
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["unit"] == "apps")
        .unwrap();
    assert_eq!(apps_result["status"], "suspended");
    assert!(!web_object_path(home.path()).exists());

    let status = json_of(home.path(), &["get", "apps", "--json"]);
    assert_eq!(status["phase"], "suspended");

    driftwood_cmd(home.path())
        .args(["resume", "apps"])
        .assert()
        .success();
    assert!(!registry::load_unit_at(home.path(), &apps).unwrap().suspended);

    driftwood_cmd(home.path())
        .args(["suspend", "ghost"])
        .assert()
        .failure()
        .stderr(contains("suspend 'ghost' failed"));
}

#[test]
fn reconcile_without_daemon_falls_back_to_local() {
    let (home, _source) = fleet();
    driftwood_cmd(home.path())
        .arg("reconcile")
        .assert()
        .success()
        .stdout(contains("daemon is not running"));
    assert!(web_object_path(home.path()).exists());
}
