//! Git fetcher: drives the `git` CLI to keep one shallow checkout per
//! (url, ref) under a cache directory.
//!
//! Fetch flow:
//! 1. `git init` + `remote add origin <url>` on first use.
//! 2. `git fetch --depth 1 origin <refspec>`.
//! 3. `git checkout --force FETCH_HEAD`.
//! 4. `git rev-parse HEAD` → revision; working tree → [`ContentTree`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};

use driftwood_core::{GitRef, Revision};

use crate::error::{io_err, FetchError};
use crate::fetch::{Snapshot, SourceFetcher};
use crate::tree::ContentTree;

pub struct GitFetcher {
    cache_dir: PathBuf,
    binary: String,
    checkout_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl GitFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            binary: "git".to_string(),
            checkout_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Use a specific git executable.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// `<cache>/<sha256(url ref)[..16]>`: one checkout per (url, ref).
    pub fn checkout_dir(&self, url: &str, reference: &GitRef) -> PathBuf {
        let mut h = Sha256::new();
        h.update(url.as_bytes());
        h.update([0u8]);
        h.update(reference.to_string().as_bytes());
        let digest = hex::encode(h.finalize());
        self.cache_dir.join(&digest[..16])
    }

    fn lock_for(&self, dir: &Path) -> Arc<Mutex<()>> {
        let mut locks = self
            .checkout_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(dir.to_path_buf()).or_default().clone()
    }

    fn git(&self, dir: &Path, args: &[&str], url: &str, reference: &GitRef) -> Result<String, FetchError> {
        let output = Command::new(&self.binary)
            .arg("-C")
            .arg(dir)
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .map_err(|e| FetchError::Unreachable {
                url: url.to_string(),
                message: format!("failed to run {}: {e}", self.binary),
            })?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify_git_failure(url, reference, &stderr))
    }
}

/// git `fetch` refspec for a ref.
pub fn refspec(reference: &GitRef) -> String {
    match reference {
        GitRef::Branch(b) => format!("refs/heads/{b}"),
        GitRef::Tag(t) => format!("refs/tags/{t}"),
        GitRef::Commit(c) => c.clone(),
    }
}

/// Map git's stderr onto the fetch error taxonomy.
pub fn classify_git_failure(url: &str, reference: &GitRef, stderr: &str) -> FetchError {
    let lower = stderr.to_ascii_lowercase();
    let auth_markers = [
        "authentication failed",
        "could not read username",
        "permission denied (publickey",
        "access denied",
    ];
    let ref_markers = [
        "couldn't find remote ref",
        "not our ref",
        "unknown revision",
        "no such remote ref",
        "invalid refspec",
    ];
    if auth_markers.iter().any(|m| lower.contains(m)) {
        FetchError::AuthFailed {
            url: url.to_string(),
        }
    } else if ref_markers.iter().any(|m| lower.contains(m)) {
        FetchError::RefNotFound {
            url: url.to_string(),
            reference: reference.to_string(),
        }
    } else {
        FetchError::Unreachable {
            url: url.to_string(),
            message: stderr.lines().last().unwrap_or("git failed").to_string(),
        }
    }
}

impl SourceFetcher for GitFetcher {
    fn fetch(&self, url: &str, reference: &GitRef) -> Result<Snapshot, FetchError> {
        let dir = self.checkout_dir(url, reference);
        let lock = self.lock_for(&dir);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        if !dir.join(".git").exists() {
            std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
            self.git(&dir, &["init", "-q"], url, reference)?;
            self.git(&dir, &["remote", "add", "origin", url], url, reference)?;
        }

        let spec = refspec(reference);
        self.git(
            &dir,
            &["fetch", "-q", "--depth", "1", "origin", spec.as_str()],
            url,
            reference,
        )?;
        self.git(&dir, &["checkout", "-q", "--force", "FETCH_HEAD"], url, reference)?;
        self.git(&dir, &["clean", "-q", "-f", "-d"], url, reference)?;
        let head = self.git(&dir, &["rev-parse", "HEAD"], url, reference)?;
        tracing::debug!(url, reference = %reference, revision = %head, "git fetch complete");

        let tree = ContentTree::from_dir(&dir)?;
        Ok(Snapshot {
            revision: Revision(head),
            tree: Arc::new(tree),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    #[rstest]
    #[case("fatal: Authentication failed for 'https://x'", "auth")]
    #[case("fatal: could not read Username for 'https://github.com'", "auth")]
    #[case("git@github.com: Permission denied (publickey).", "auth")]
    #[case("fatal: couldn't find remote ref refs/heads/nope", "ref")]
    #[case("error: Server does not allow request for unadvertised object abc: not our ref", "ref")]
    #[case("fatal: unable to access 'https://x/': Could not resolve host: x", "unreachable")]
    fn stderr_classification(#[case] stderr: &str, #[case] expected: &str) {
        let err = classify_git_failure("https://x", &GitRef::default(), stderr);
        let got = match err {
            FetchError::AuthFailed { .. } => "auth",
            FetchError::RefNotFound { .. } => "ref",
            FetchError::Unreachable { .. } => "unreachable",
            FetchError::Io { .. } => "io",
        };
        assert_eq!(got, expected, "stderr: {stderr}");
    }

    #[test]
    fn refspecs() {
        assert_eq!(refspec(&GitRef::Branch("main".into())), "refs/heads/main");
        assert_eq!(refspec(&GitRef::Tag("v1".into())), "refs/tags/v1");
        assert_eq!(refspec(&GitRef::Commit("abc".into())), "abc");
    }

    #[test]
    fn checkout_dir_is_per_url_and_ref() {
        let cache = TempDir::new().unwrap();
        let f = GitFetcher::new(cache.path());
        let a = f.checkout_dir("https://x/fleet.git", &GitRef::Branch("main".into()));
        let b = f.checkout_dir("https://x/fleet.git", &GitRef::Tag("main".into()));
        let c = f.checkout_dir("https://x/fleet.git", &GitRef::Branch("main".into()));
        assert_ne!(a, b);
        assert_eq!(a, c);
        assert!(a.starts_with(cache.path()));
    }

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn run(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.name=driftwood", "-c", "user.email=driftwood@example.com"])
            .args(args)
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?} failed");
    }

    #[test]
    fn fetches_branch_from_local_repository() {
        if !git_available() {
            return;
        }
        let upstream = TempDir::new().unwrap();
        run(upstream.path(), &["init", "-q"]);
        run(upstream.path(), &["checkout", "-q", "-b", "main"]);
        std::fs::create_dir_all(upstream.path().join("infra")).unwrap();
        std::fs::write(upstream.path().join("infra/ns.yaml"), "kind: Namespace\n").unwrap();
        run(upstream.path(), &["add", "."]);
        run(upstream.path(), &["commit", "-q", "-m", "init"]);

        let cache = TempDir::new().unwrap();
        let fetcher = GitFetcher::new(cache.path());
        let url = format!("file://{}", upstream.path().display());
        let snap = fetcher
            .fetch(&url, &GitRef::Branch("main".into()))
            .expect("fetch");
        assert_eq!(snap.revision.0.len(), 40);
        assert!(snap.tree.get("infra/ns.yaml").is_some());

        let missing = fetcher.fetch(&url, &GitRef::Branch("nope".into()));
        assert!(matches!(missing, Err(FetchError::RefNotFound { .. })));
    }
}
