//! serde_yaml roundtrips for unit definitions.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use driftwood_core::{GitRef, Interval, ReconciliationUnit, SourceSpec, UnitName};
use rstest::rstest;

fn base(reference: GitRef) -> ReconciliationUnit {
    ReconciliationUnit::new(
        "apps",
        SourceSpec {
            url: "https://git.example.com/fleet.git".into(),
            reference,
        },
    )
}

fn full() -> ReconciliationUnit {
    let mut u = base(GitRef::Commit("0f3c2a9".into()));
    u.path = PathBuf::from("./apps/production");
    u.interval = Interval::from_secs(90);
    u.depends_on = BTreeSet::from([UnitName::from("infra"), UnitName::from("crds")]);
    u.prune = true;
    u.suspended = true;
    u.target_namespace = Some("production".into());
    u.timeout = Some(Interval::from_secs(120));
    u.substitute = BTreeMap::from([("cluster".to_string(), "eu-1".to_string())]);
    u.force = true;
    u
}

#[rstest]
#[case("branch", base(GitRef::Branch("main".into())))]
#[case("tag", base(GitRef::Tag("v1.4.2".into())))]
#[case("commit", base(GitRef::Commit("9fceb02".into())))]
#[case("all_fields", full())]
fn unit_roundtrip(#[case] label: &str, #[case] unit: ReconciliationUnit) {
    let yaml = serde_yaml::to_string(&unit)
        .unwrap_or_else(|e| panic!("[{label}] serialize failed: {e}"));
    let back: ReconciliationUnit = serde_yaml::from_str(&yaml)
        .unwrap_or_else(|e| panic!("[{label}] deserialize failed: {e}"));
    assert_eq!(unit, back, "[{label}] roundtrip mismatch\n{yaml}");
}

#[rstest]
#[case("30s", 30)]
#[case("10m", 600)]
#[case("2h", 7200)]
#[case("1h1m1s", 3661)]
#[case("600", 600)]
fn interval_forms(#[case] text: &str, #[case] secs: u64) {
    let yaml = format!("name: apps\nsource:\n  url: ./fleet\ninterval: {text}\n");
    let unit: ReconciliationUnit = serde_yaml::from_str(&yaml).expect("parse");
    assert_eq!(unit.interval, Interval::from_secs(secs));
}

#[test]
fn interval_serializes_as_human_string() {
    let yaml = serde_yaml::to_string(&base(GitRef::default())).expect("serialize");
    assert!(yaml.contains("interval: 10m"), "{yaml}");
    assert!(yaml.contains("branch: main"), "{yaml}");
}
