//! Source fetch interface and the local-directory fetcher.

use std::path::PathBuf;
use std::sync::Arc;

use driftwood_core::{GitRef, Revision};

use crate::error::FetchError;
use crate::git::GitFetcher;
use crate::tree::ContentTree;

/// A fetched revision and its content.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub revision: Revision,
    pub tree: Arc<ContentTree>,
}

/// External version-control collaborator: `fetch(url, ref) -> (revision, tree)`.
pub trait SourceFetcher: Send + Sync {
    fn fetch(&self, url: &str, reference: &GitRef) -> Result<Snapshot, FetchError>;
}

impl<F: SourceFetcher + ?Sized> SourceFetcher for Box<F> {
    fn fetch(&self, url: &str, reference: &GitRef) -> Result<Snapshot, FetchError> {
        (**self).fetch(url, reference)
    }
}

impl<F: SourceFetcher + ?Sized> SourceFetcher for Arc<F> {
    fn fetch(&self, url: &str, reference: &GitRef) -> Result<Snapshot, FetchError> {
        (**self).fetch(url, reference)
    }
}

/// Filesystem path behind a `file://` URL or a bare path; `None` for remote URLs.
pub fn local_path(url: &str) -> Option<PathBuf> {
    if let Some(rest) = url.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if is_remote(url) {
        return None;
    }
    Some(PathBuf::from(url))
}

fn is_remote(url: &str) -> bool {
    ["http://", "https://", "ssh://", "git://", "git@"]
        .iter()
        .any(|p| url.starts_with(p))
        || url.ends_with(".git")
}

/// Reads a directory tree straight from disk. The ref is not consulted: a
/// working directory has exactly one revision, its content hash.
#[derive(Debug, Clone, Default)]
pub struct LocalFetcher;

impl SourceFetcher for LocalFetcher {
    fn fetch(&self, url: &str, _reference: &GitRef) -> Result<Snapshot, FetchError> {
        let Some(root) = local_path(url) else {
            return Err(FetchError::Unreachable {
                url: url.to_string(),
                message: "not a local path".to_string(),
            });
        };
        if !root.is_dir() {
            return Err(FetchError::Unreachable {
                url: url.to_string(),
                message: format!("{} is not a directory", root.display()),
            });
        }
        let tree = ContentTree::from_dir(&root)?;
        Ok(Snapshot {
            revision: tree.content_revision(),
            tree: Arc::new(tree),
        })
    }
}

/// Dispatches remote URLs to git and everything else to the local fetcher.
pub struct CompositeFetcher {
    local: LocalFetcher,
    git: GitFetcher,
}

impl CompositeFetcher {
    pub fn new(git: GitFetcher) -> Self {
        Self {
            local: LocalFetcher,
            git,
        }
    }
}

impl SourceFetcher for CompositeFetcher {
    fn fetch(&self, url: &str, reference: &GitRef) -> Result<Snapshot, FetchError> {
        if is_remote(url) {
            self.git.fetch(url, reference)
        } else {
            self.local.fetch(url, reference)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    #[rstest]
    #[case("file:///srv/fleet", Some("/srv/fleet"))]
    #[case("./fleet", Some("./fleet"))]
    #[case("https://github.com/acme/fleet", None)]
    #[case("git@github.com:acme/fleet.git", None)]
    #[case("/srv/mirror/fleet.git", None)]
    fn local_path_detection(#[case] url: &str, #[case] expected: Option<&str>) {
        assert_eq!(local_path(url), expected.map(PathBuf::from));
    }

    #[test]
    fn local_fetch_hashes_content() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ns.yaml"), "kind: Namespace").unwrap();
        let url = format!("file://{}", dir.path().display());

        let first = LocalFetcher.fetch(&url, &GitRef::default()).unwrap();
        let second = LocalFetcher.fetch(&url, &GitRef::default()).unwrap();
        assert_eq!(first.revision, second.revision);

        std::fs::write(dir.path().join("ns.yaml"), "kind: Namespace\n# edit").unwrap();
        let third = LocalFetcher.fetch(&url, &GitRef::default()).unwrap();
        assert_ne!(first.revision, third.revision);
    }

    #[test]
    fn missing_directory_is_unreachable() {
        let dir = TempDir::new().unwrap();
        let url = dir.path().join("nope").display().to_string();
        let err = LocalFetcher.fetch(&url, &GitRef::default()).unwrap_err();
        assert!(matches!(err, FetchError::Unreachable { .. }));
    }
}
