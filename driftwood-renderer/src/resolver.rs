//! Resolver: raw documents to typed, validated, ordered [`DesiredObject`]s.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use driftwood_core::{DesiredObject, Gvk, ObjectId, ReconciliationUnit, Revision, TargetScope};
use driftwood_source::ContentTree;

use crate::context::RenderContext;
use crate::engine::{DirectoryEngine, RawDocument, TemplateEngine};
use crate::error::RenderError;
use crate::order::{apply_order, is_cluster_scoped};

/// Namespace given to namespaced objects that declare none in a cluster-scoped unit.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Renders a unit's path of a fetched tree. Create once and reuse.
pub struct Renderer<E: TemplateEngine = DirectoryEngine> {
    engine: E,
}

impl Renderer<DirectoryEngine> {
    pub fn new() -> Self {
        Renderer {
            engine: DirectoryEngine::new(),
        }
    }
}

impl Default for Renderer<DirectoryEngine> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: TemplateEngine> Renderer<E> {
    /// Use a custom templating collaborator.
    pub fn with_engine(engine: E) -> Self {
        Renderer { engine }
    }

    /// Expand, validate and order. Any error aborts the whole unit; no
    /// partial object list is ever returned.
    pub fn render(
        &self,
        tree: &ContentTree,
        revision: &Revision,
        unit: &ReconciliationUnit,
    ) -> Result<Vec<DesiredObject>, RenderError> {
        let ctx = RenderContext::for_unit(unit, revision);
        let raw = self.engine.expand(tree, &unit.path, &ctx)?;
        let scope = unit.target_scope();

        let mut seen = BTreeSet::new();
        let mut objects = Vec::with_capacity(raw.len());
        for doc in flatten_lists(raw)? {
            let obj = resolve(doc, &scope, unit)?;
            if !seen.insert(obj.id.clone()) {
                return Err(RenderError::DuplicateObject(obj.id));
            }
            objects.push(obj);
        }
        objects.sort_by(apply_order);
        tracing::debug!(unit = %unit.name, objects = objects.len(), "rendered unit");
        Ok(objects)
    }
}

/// Expand `kind: List` documents into their items.
fn flatten_lists(docs: Vec<RawDocument>) -> Result<Vec<RawDocument>, RenderError> {
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        let is_list = doc.value.get("kind").and_then(Value::as_str) == Some("List");
        if !is_list {
            out.push(doc);
            continue;
        }
        let Some(items) = doc.value.get("items").and_then(Value::as_array) else {
            return Err(RenderError::malformed(
                &doc.file,
                format!("document {} is a List without items", doc.index),
            ));
        };
        for item in items {
            if !item.is_object() {
                return Err(RenderError::malformed(
                    &doc.file,
                    format!("document {} has a non-mapping list item", doc.index),
                ));
            }
            out.push(RawDocument {
                file: doc.file.clone(),
                index: doc.index,
                value: item.clone(),
            });
        }
    }
    Ok(out)
}

fn required_str<'a>(
    doc: &'a RawDocument,
    value: Option<&'a Value>,
    field: &'static str,
) -> Result<&'a str, RenderError> {
    match value.and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(RenderError::MissingIdentity {
            file: doc.file.clone(),
            index: doc.index,
            field,
        }),
    }
}

fn resolve(
    doc: RawDocument,
    scope: &TargetScope,
    unit: &ReconciliationUnit,
) -> Result<DesiredObject, RenderError> {
    let api_version = required_str(&doc, doc.value.get("apiVersion"), "apiVersion")?;
    let kind = required_str(&doc, doc.value.get("kind"), "kind")?;
    let metadata = doc.value.get("metadata");
    let name = required_str(&doc, metadata.and_then(|m| m.get("name")), "metadata.name")?;
    let declared_ns = metadata
        .and_then(|m| m.get("namespace"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());

    check_identity(&doc, api_version, kind, name)?;
    let gvk = Gvk::from_api_version(api_version, kind);
    let cluster_scoped = is_cluster_scoped(kind);
    let namespace = match (cluster_scoped, scope) {
        (true, TargetScope::Cluster) => None,
        (true, TargetScope::Namespace(ns)) => {
            return Err(RenderError::ScopeViolation {
                id: ObjectId::new(gvk, None, name),
                message: format!("cluster-scoped kind in a unit pinned to namespace '{ns}'"),
            });
        }
        (false, TargetScope::Namespace(ns)) => Some(ns.clone()),
        (false, TargetScope::Cluster) => {
            Some(declared_ns.unwrap_or(DEFAULT_NAMESPACE).to_string())
        }
    };

    if let Some(ns) = namespace.as_deref().filter(|ns| !is_dns_label(ns)) {
        return Err(RenderError::malformed(
            &doc.file,
            format!("document {} has invalid namespace '{ns}'", doc.index),
        ));
    }

    let id = ObjectId::new(gvk, namespace, name);
    let mut payload = doc.value;
    set_namespace(&mut payload, id.namespace.as_deref());
    Ok(DesiredObject {
        id,
        payload,
        owner: unit.name.clone(),
    })
}

/// Object names are DNS-1123 subdomains (`:` allowed for RBAC names); kinds
/// are alphanumeric; the apiVersion group is a subdomain.
fn check_identity(
    doc: &RawDocument,
    api_version: &str,
    kind: &str,
    name: &str,
) -> Result<(), RenderError> {
    let invalid = |what: &str, value: &str| {
        RenderError::malformed(
            &doc.file,
            format!("document {} has invalid {what} '{value}'", doc.index),
        )
    };
    if !is_dns_subdomain(name, true) {
        return Err(invalid("metadata.name", name));
    }
    if !kind.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(invalid("kind", kind));
    }
    let (group, version) = api_version.rsplit_once('/').unwrap_or(("", api_version));
    let version_ok = !version.is_empty() && version.chars().all(|c| c.is_ascii_alphanumeric());
    if !version_ok || !(group.is_empty() || is_dns_subdomain(group, false)) {
        return Err(invalid("apiVersion", api_version));
    }
    Ok(())
}

fn is_dns_subdomain(value: &str, allow_colon: bool) -> bool {
    value.len() <= 253
        && value
            .split('.')
            .all(|part| is_dns_label_chars(part, allow_colon))
}

fn is_dns_label(value: &str) -> bool {
    value.len() <= 63 && is_dns_label_chars(value, false)
}

fn is_dns_label_chars(part: &str, allow_colon: bool) -> bool {
    let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    part.starts_with(alnum)
        && part.ends_with(alnum)
        && part
            .chars()
            .all(|c| alnum(c) || c == '-' || (allow_colon && c == ':'))
}

fn set_namespace(payload: &mut Value, namespace: Option<&str>) {
    let Some(root) = payload.as_object_mut() else {
        return;
    };
    let metadata = root
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(meta) = metadata.as_object_mut() else {
        return;
    };
    match namespace {
        Some(ns) => {
            meta.insert("namespace".to_string(), Value::String(ns.to_string()));
        }
        None => {
            meta.remove("namespace");
        }
    }
}
