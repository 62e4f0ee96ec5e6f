//! Templating interface and the default directory expander.
//!
//! # File handling
//!
//! | File                         | Treatment                                   |
//! |------------------------------|---------------------------------------------|
//! | `*.yaml`, `*.yml`            | multi-document YAML stream                  |
//! | `*.json`                     | one JSON document                           |
//! | `*.yaml.tera`, `*.json.tera` | rendered through tera, then parsed as above |
//! | `_*.tera`                    | partial: includable, never emitted          |
//! | `kustomization.yaml`, dotfiles, anything else | skipped                    |

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tera::Tera;

use driftwood_source::ContentTree;

use crate::context::RenderContext;
use crate::error::RenderError;

/// One raw structured document before identity validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    /// Source-relative file the document came from.
    pub file: String,
    /// Position of the document within its file.
    pub index: usize,
    pub value: Value,
}

/// External overlay/template collaborator: `expand(tree, path) -> raw documents`.
pub trait TemplateEngine: Send + Sync {
    fn expand(
        &self,
        tree: &ContentTree,
        path: &Path,
        ctx: &RenderContext,
    ) -> Result<Vec<RawDocument>, RenderError>;
}

impl<E: TemplateEngine + ?Sized> TemplateEngine for Box<E> {
    fn expand(
        &self,
        tree: &ContentTree,
        path: &Path,
        ctx: &RenderContext,
    ) -> Result<Vec<RawDocument>, RenderError> {
        (**self).expand(tree, path, ctx)
    }
}

// ---------------------------------------------------------------------------
// File classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Yaml,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileKind {
    format: Format,
    templated: bool,
}

fn classify(file: &str) -> Option<FileKind> {
    let base = file.rsplit('/').next().unwrap_or(file);
    if base.starts_with('.') {
        return None;
    }
    let (stem, templated) = match base.strip_suffix(".tera") {
        Some(stem) => (stem, true),
        None => (base, false),
    };
    if matches!(stem, "kustomization.yaml" | "kustomization.yml") {
        return None;
    }
    let format = if stem.ends_with(".yaml") || stem.ends_with(".yml") {
        Format::Yaml
    } else if stem.ends_with(".json") {
        Format::Json
    } else {
        return None;
    };
    Some(FileKind { format, templated })
}

fn is_partial(file: &str) -> bool {
    file.rsplit('/').next().is_some_and(|b| b.starts_with('_'))
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn parse_documents(file: &str, text: &str, format: Format) -> Result<Vec<RawDocument>, RenderError> {
    let mut docs = Vec::new();
    match format {
        Format::Json => {
            let value: Value = serde_json::from_str(text)
                .map_err(|e| RenderError::malformed(file, e.to_string()))?;
            push_document(file, 0, value, &mut docs)?;
        }
        Format::Yaml => {
            for (index, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
                let value = Value::deserialize(doc)
                    .map_err(|e| RenderError::malformed(file, format!("document {index}: {e}")))?;
                push_document(file, index, value, &mut docs)?;
            }
        }
    }
    Ok(docs)
}

fn push_document(
    file: &str,
    index: usize,
    value: Value,
    out: &mut Vec<RawDocument>,
) -> Result<(), RenderError> {
    match value {
        Value::Null => Ok(()),
        Value::Object(_) => {
            out.push(RawDocument {
                file: file.to_string(),
                index,
                value,
            });
            Ok(())
        }
        other => Err(RenderError::malformed(
            file,
            format!("document {index} is a {}, expected a mapping", type_name(&other)),
        )),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

// ---------------------------------------------------------------------------
// DirectoryEngine
// ---------------------------------------------------------------------------

/// Collects manifests under a directory in lexical path order, rendering
/// `.tera` files with the unit's variables.
#[derive(Debug, Clone, Default)]
pub struct DirectoryEngine;

impl DirectoryEngine {
    pub fn new() -> Self {
        DirectoryEngine
    }

    fn select<'a>(tree: &'a ContentTree, path: &Path) -> Result<Vec<(String, &'a [u8])>, RenderError> {
        if let Some(bytes) = tree.get(path) {
            let name = path.to_string_lossy().trim_start_matches("./").to_string();
            return Ok(vec![(name, bytes)]);
        }
        if !tree.contains_dir(path) {
            return Err(RenderError::PathNotFound {
                path: path.to_path_buf(),
            });
        }
        Ok(tree
            .files_under(path)
            .map(|(name, bytes)| (name.to_string(), bytes))
            .collect())
    }

    fn build_tera(files: &[(String, &str)]) -> Result<Tera, RenderError> {
        let mut tera = Tera::default();
        let templates: Vec<(&str, &str)> = files
            .iter()
            .filter(|(name, _)| name.ends_with(".tera"))
            .map(|(name, text)| (name.as_str(), *text))
            .collect();
        if let Err(e) = tera.add_raw_templates(templates) {
            let file = files
                .iter()
                .find(|(name, _)| name.ends_with(".tera"))
                .map(|(name, _)| name.as_str())
                .unwrap_or("<templates>");
            return Err(RenderError::template(file, &e));
        }
        Ok(tera)
    }
}

impl TemplateEngine for DirectoryEngine {
    fn expand(
        &self,
        tree: &ContentTree,
        path: &Path,
        ctx: &RenderContext,
    ) -> Result<Vec<RawDocument>, RenderError> {
        let selected = Self::select(tree, path)?;

        let mut texts: Vec<(String, &str)> = Vec::with_capacity(selected.len());
        for (name, bytes) in &selected {
            if classify(name).is_none() && !name.ends_with(".tera") {
                continue;
            }
            let text = std::str::from_utf8(bytes)
                .map_err(|_| RenderError::malformed(name, "file is not valid UTF-8"))?;
            texts.push((name.clone(), text));
        }

        let any_templates = texts.iter().any(|(name, _)| name.ends_with(".tera"));
        let tera = if any_templates {
            Some((Self::build_tera(&texts)?, ctx.to_tera_context()?))
        } else {
            None
        };

        let mut docs = Vec::new();
        for (name, text) in &texts {
            let Some(kind) = classify(name) else { continue };
            if kind.templated {
                if is_partial(name) {
                    continue;
                }
                let Some((tera, tera_ctx)) = &tera else { continue };
                let rendered = tera
                    .render(name, tera_ctx)
                    .map_err(|e| RenderError::template(name, &e))?;
                docs.extend(parse_documents(name, &rendered, kind.format)?);
            } else {
                docs.extend(parse_documents(name, text, kind.format)?);
            }
        }
        tracing::debug!(path = %path.display(), documents = docs.len(), "expanded manifests");
        Ok(docs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
