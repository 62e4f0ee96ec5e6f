//! In-memory content tree of a fetched source.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use sha2::{Digest, Sha256};

use driftwood_core::Revision;

use crate::error::{io_err, FetchError};

/// Files of a snapshot keyed by `/`-separated path relative to the source root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentTree {
    files: BTreeMap<String, Vec<u8>>,
}

impl ContentTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read every regular file under `root`, skipping `.git` and hidden directories.
    pub fn from_dir(root: &Path) -> Result<Self, FetchError> {
        let mut tree = Self::new();
        let mut dirs = vec![root.to_path_buf()];
        while let Some(dir) = dirs.pop() {
            let entries = std::fs::read_dir(&dir).map_err(|e| io_err(&dir, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| io_err(&dir, e))?;
                let path = entry.path();
                let ty = entry.file_type().map_err(|e| io_err(&path, e))?;
                let hidden = entry.file_name().to_string_lossy().starts_with('.');
                if ty.is_dir() {
                    if !hidden {
                        dirs.push(path);
                    }
                } else if ty.is_file() {
                    let rel = path.strip_prefix(root).unwrap_or(&path);
                    let bytes = std::fs::read(&path).map_err(|e| io_err(&path, e))?;
                    tree.insert(rel, bytes);
                }
            }
        }
        Ok(tree)
    }

    pub fn insert(&mut self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        self.files.insert(normalize(path.as_ref()), content.into());
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<&[u8]> {
        self.files.get(&normalize(path.as_ref())).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// True when `dir` is the root or a prefix of at least one file.
    pub fn contains_dir(&self, dir: impl AsRef<Path>) -> bool {
        let prefix = normalize(dir.as_ref());
        if prefix.is_empty() {
            return true;
        }
        let with_slash = format!("{prefix}/");
        self.files.keys().any(|k| k.starts_with(&with_slash))
    }

    /// Files under `dir` (recursively), in lexical path order.
    pub fn files_under(&self, dir: impl AsRef<Path>) -> impl Iterator<Item = (&str, &[u8])> {
        let prefix = normalize(dir.as_ref());
        let with_slash = if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix}/")
        };
        self.files
            .iter()
            .filter(move |(k, _)| k.starts_with(&with_slash))
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// `sha256:<hex>` over every (path, length, bytes) triple in path order.
    pub fn content_revision(&self) -> Revision {
        let mut h = Sha256::new();
        for (path, bytes) in &self.files {
            h.update(path.as_bytes());
            h.update([0u8]);
            h.update((bytes.len() as u64).to_be_bytes());
            h.update(bytes);
        }
        Revision(format!("sha256:{}", hex::encode(h.finalize())))
    }
}

/// `./a/../b\\c.yaml` → `b/c.yaml`; the root is the empty string.
fn normalize(path: &Path) -> String {
    let mut parts: Vec<String> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(p) => parts.push(p.to_string_lossy().replace('\\', "/")),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn revision_is_stable_and_content_sensitive() {
        let mut a = ContentTree::new();
        a.insert("apps/web.yaml", "kind: Deployment");
        a.insert("infra/ns.yaml", "kind: Namespace");
        let mut b = ContentTree::new();
        b.insert("infra/ns.yaml", "kind: Namespace");
        b.insert("apps/web.yaml", "kind: Deployment");
        assert_eq!(a.content_revision(), b.content_revision());

        b.insert("apps/web.yaml", "kind: StatefulSet");
        assert_ne!(a.content_revision(), b.content_revision());
        assert!(a.content_revision().0.starts_with("sha256:"));
    }

    #[test]
    fn paths_are_normalized() {
        let mut t = ContentTree::new();
        t.insert("./apps/../apps/web.yaml", "x");
        assert_eq!(t.get("apps/web.yaml"), Some(&b"x"[..]));
        assert!(t.contains_dir("./apps"));
        assert!(t.contains_dir("."));
        assert!(!t.contains_dir("app"));
    }

    #[test]
    fn files_under_respects_directory_boundaries() {
        let mut t = ContentTree::new();
        t.insert("apps/production/web.yaml", "a");
        t.insert("apps/production-eu/web.yaml", "b");
        t.insert("apps/staging/web.yaml", "c");
        let under: Vec<_> = t.files_under("apps/production").map(|(p, _)| p).collect();
        assert_eq!(under, vec!["apps/production/web.yaml"]);
        assert_eq!(t.files_under(".").count(), 3);
    }

    #[test]
    fn from_dir_skips_hidden_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".git/objects")).unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "ref").unwrap();
        std::fs::create_dir_all(dir.path().join("infra")).unwrap();
        std::fs::write(dir.path().join("infra/ns.yaml"), "kind: Namespace").unwrap();

        let tree = ContentTree::from_dir(dir.path()).unwrap();
        assert_eq!(tree.len(), 1);
        assert!(tree.get("infra/ns.yaml").is_some());
    }
}
