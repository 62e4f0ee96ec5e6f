//! Rendering a small fleet checkout from disk.

use std::path::PathBuf;

use driftwood_core::{ReconciliationUnit, SourceSpec};
use driftwood_renderer::{RenderError, Renderer};
use driftwood_source::{LocalFetcher, SourceFetcher};
use tempfile::TempDir;

fn write(root: &TempDir, rel: &str, content: &str) {
    let path = root.path().join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn unit(root: &TempDir, name: &str, path: &str) -> ReconciliationUnit {
    let mut u = ReconciliationUnit::new(
        name,
        SourceSpec {
            url: root.path().display().to_string(),
            reference: Default::default(),
        },
    );
    u.path = PathBuf::from(path);
    u
}

fn fleet() -> TempDir {
    let root = TempDir::new().unwrap();
    write(
        &root,
        "infra/namespaces.yaml",
        "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: shop\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: monitoring\n",
    );
    write(
        &root,
        "infra/crds/widget.yaml",
        "apiVersion: apiextensions.k8s.io/v1\nkind: CustomResourceDefinition\nmetadata:\n  name: widgets.example.com\n",
    );
    write(
        &root,
        "apps/production/web.yaml.tera",
        "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  namespace: shop\nspec:\n  replicas: {{ replicas }}\n  template:\n    spec:\n      containers:\n      - name: web\n        image: {{ image }}\n",
    );
    write(
        &root,
        "apps/production/svc.json",
        r#"{"apiVersion":"v1","kind":"Service","metadata":{"name":"web","namespace":"shop"}}"#,
    );
    write(&root, "apps/production/kustomization.yaml", "resources: [web.yaml]\n");
    root
}

#[test]
fn infra_renders_namespaces_before_crds() {
    let root = fleet();
    let u = unit(&root, "infra", "./infra");
    let snap = LocalFetcher.fetch(&u.source.url, &u.source.reference).unwrap();
    let objs = Renderer::new().render(&snap.tree, &snap.revision, &u).unwrap();
    let ids: Vec<_> = objs.iter().map(|o| o.id.to_string()).collect();
    assert_eq!(
        ids,
        vec![
            "Namespace/monitoring",
            "Namespace/shop",
            "CustomResourceDefinition/widgets.example.com",
        ]
    );
}

#[test]
fn apps_render_substitutes_variables() {
    let root = fleet();
    let mut u = unit(&root, "apps", "./apps/production");
    u.substitute.insert("replicas".into(), "2".into());
    u.substitute.insert("image".into(), "shop/web:1.4".into());
    let snap = LocalFetcher.fetch(&u.source.url, &u.source.reference).unwrap();
    let objs = Renderer::new().render(&snap.tree, &snap.revision, &u).unwrap();
    assert_eq!(objs.len(), 2);
    assert_eq!(objs[0].id.gvk.kind, "Service");
    let deploy = &objs[1];
    assert_eq!(deploy.payload["spec"]["replicas"], 2);
    assert_eq!(
        deploy.payload["spec"]["template"]["spec"]["containers"][0]["image"],
        "shop/web:1.4"
    );
}

#[test]
fn one_bad_document_aborts_the_unit() {
    let root = fleet();
    write(
        &root,
        "apps/production/broken.yaml",
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  labels: {}\n",
    );
    let mut u = unit(&root, "apps", "./apps/production");
    u.substitute.insert("replicas".into(), "2".into());
    u.substitute.insert("image".into(), "web".into());
    let snap = LocalFetcher.fetch(&u.source.url, &u.source.reference).unwrap();
    let err = Renderer::new()
        .render(&snap.tree, &snap.revision, &u)
        .unwrap_err();
    assert!(matches!(err, RenderError::MissingIdentity { .. }), "{err}");
}
