//! Tracking a local directory source end to end.

use std::time::Duration;

use driftwood_core::{GitRef, SourceSpec};
use driftwood_source::{CompositeFetcher, GitFetcher, SourceTracker};
use tempfile::TempDir;

#[test]
fn local_directory_edits_move_the_revision() {
    let fleet = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    std::fs::create_dir_all(fleet.path().join("infra")).unwrap();
    std::fs::write(
        fleet.path().join("infra/ns.yaml"),
        "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: apps\n",
    )
    .unwrap();

    let tracker = SourceTracker::new(
        CompositeFetcher::new(GitFetcher::new(cache.path())),
        Duration::ZERO,
    );
    let spec = SourceSpec {
        url: fleet.path().display().to_string(),
        reference: GitRef::default(),
    };

    let first = tracker.fetch(&spec).unwrap();
    assert!(first.changed);
    assert!(first.source_ref.revision.0.starts_with("sha256:"));

    let unchanged = tracker.fetch(&spec).unwrap();
    assert!(!unchanged.changed);
    assert_eq!(unchanged.source_ref.revision, first.source_ref.revision);

    std::fs::write(fleet.path().join("infra/extra.yaml"), "kind: ConfigMap\n").unwrap();
    let edited = tracker.fetch(&spec).unwrap();
    assert!(edited.changed);
    assert_eq!(edited.tree.len(), 2);

    // The git cache stays untouched for local sources.
    assert_eq!(std::fs::read_dir(cache.path()).unwrap().count(), 0);
}
