use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use predicates::str::contains;
use serde_json::Value;
use tempfile::TempDir;

use driftwood_core::{registry, UnitName};

fn driftwood_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("driftwood"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env("NO_COLOR", "1");
    cmd
}

fn init(home: &TempDir) {
    driftwood_cmd(home.path())
        .arg("init")
        .assert()
        .success()
        .stdout(contains("Initialized driftwood"));
}

fn add_unit(home: &TempDir, source: &Path, name: &str, extra: &[&str]) -> assert_cmd::assert::Assert {
    driftwood_cmd(home.path())
        .args(["unit", "add", name, "--source"])
        .arg(source)
        .args(extra)
        .assert()
}

#[test]
fn init_is_idempotent_and_writes_config() {
    let home = TempDir::new().unwrap();
    init(&home);
    assert!(home.path().join(".driftwood/config.yaml").exists());
    assert!(home.path().join(".driftwood/units").is_dir());

    driftwood_cmd(home.path())
        .arg("init")
        .assert()
        .success()
        .stdout(contains("Already initialized"));
}

#[test]
fn add_list_and_remove_units() {
    let home = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    init(&home);

    add_unit(&home, source.path(), "infra", &["--path", "./infra", "--interval", "5m"])
        .success()
        .stdout(contains("Added unit 'infra'"));
    add_unit(
        &home,
        source.path(),
        "apps",
        &["--depends-on", "infra", "--prune", "--set", "env=prod"],
    )
    .success();

    let apps = registry::load_unit_at(home.path(), &UnitName::from("apps")).unwrap();
    assert!(apps.prune);
    assert!(apps.depends_on.contains(&UnitName::from("infra")));
    assert_eq!(apps.substitute.get("env").map(String::as_str), Some("prod"));
    assert_eq!(
        Path::new(&apps.source.url),
        source.path().canonicalize().unwrap()
    );

    let out = driftwood_cmd(home.path())
        .args(["unit", "list", "--json"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let listed: Value = serde_json::from_slice(&out.stdout).unwrap();
    let names: Vec<&str> = listed
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|u| u["name"].as_str())
        .collect();
    assert_eq!(names, vec!["apps", "infra"]);

    add_unit(&home, source.path(), "apps", &[])
        .failure()
        .stderr(contains("already exists"));

    driftwood_cmd(home.path())
        .args(["unit", "remove", "infra"])
        .assert()
        .failure()
        .stderr(contains("still referenced by: apps"));

    driftwood_cmd(home.path())
        .args(["unit", "remove", "apps"])
        .assert()
        .success();
    driftwood_cmd(home.path())
        .args(["unit", "remove", "infra"])
        .assert()
        .success();
    driftwood_cmd(home.path())
        .args(["unit", "list"])
        .assert()
        .success()
        .stdout(contains("No units registered."));
}

#[test]
fn adding_a_cycle_is_refused() {
    let home = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    init(&home);

    add_unit(&home, source.path(), "a", &["--depends-on", "b"])
        .success()
        .stdout(contains("not registered yet: b"));
    add_unit(&home, source.path(), "b", &["--depends-on", "a"])
        .failure()
        .stderr(contains("cyclic dependency"));
    assert!(!registry::unit_path_at(home.path(), &UnitName::from("b")).exists());
}

#[test]
fn bad_arguments_are_rejected_before_writing() {
    let home = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    init(&home);

    add_unit(&home, source.path(), "Bad_Name", &[])
        .failure()
        .stderr(contains("invalid unit name"));
    add_unit(&home, source.path(), "web", &["--interval", "soon"]).failure();
    add_unit(&home, source.path(), "web", &["--branch", "main", "--tag", "v1"]).failure();
    add_unit(&home, &source.path().join("missing"), "web", &[])
        .failure()
        .stderr(contains("does not exist"));
}

#[test]
fn validate_reports_cycles_and_unknown_dependencies() {
    let home = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    init(&home);

    // Written directly: the CLI refuses to create these.
    let units = home.path().join(".driftwood/units");
    let url = source.path().display();
    fs::write(
        units.join("a.yaml"),
        format!("name: a\nsource:\n  url: {url}\ndepends_on: [b]\n"),
    )
    .unwrap();
    fs::write(
        units.join("b.yaml"),
        format!("name: b\nsource:\n  url: {url}\ndepends_on: [a]\n"),
    )
    .unwrap();
    fs::write(
        units.join("c.yaml"),
        format!("name: c\nsource:\n  url: {url}\ndepends_on: [ghost]\n"),
    )
    .unwrap();
    fs::write(units.join("broken.yaml"), "name: [").unwrap();

    driftwood_cmd(home.path())
        .arg("validate")
        .assert()
        .failure()
        .stdout(contains("cyclic dependency"))
        .stdout(contains("missing dependencies: ghost"))
        .stdout(contains("broken.yaml"))
        .stderr(contains("problem(s) found"));
}

#[test]
fn validate_with_render_counts_objects() {
    let home = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    fs::write(
        source.path().join("ns.yaml"),
        "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: shop\n",
    )
    .unwrap();
    init(&home);
    add_unit(&home, source.path(), "infra", &[]).success();

    driftwood_cmd(home.path())
        .args(["validate", "--render"])
        .assert()
        .success()
        .stdout(contains("1 object(s)"))
        .stdout(contains("1 unit(s) valid"));

    fs::write(source.path().join("bad.yaml"), "kind: ConfigMap\n").unwrap();
    driftwood_cmd(home.path())
        .args(["validate", "--render"])
        .assert()
        .failure()
        .stdout(contains("INVALID"));
}

#[test]
fn daemon_commands_without_a_daemon() {
    let home = TempDir::new().unwrap();
    driftwood_cmd(home.path())
        .args(["daemon", "stop"])
        .assert()
        .success()
        .stdout(contains("daemon is not running"));

    let out = driftwood_cmd(home.path())
        .args(["daemon", "status", "--json"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let status: Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(status["running"], false);

    driftwood_cmd(home.path())
        .args(["daemon", "logs", "--lines", "5"])
        .assert()
        .success()
        .stdout(contains("log file not found").and(contains("daemon.log")));
}
