//! Source tracker: caches the latest snapshot per source and reports whether
//! the revision moved since the previous fetch.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;

use driftwood_core::{SourceRef, SourceSpec};

use crate::error::FetchError;
use crate::fetch::SourceFetcher;
use crate::tree::ContentTree;

/// Result of a tracked fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub source_ref: SourceRef,
    pub tree: Arc<ContentTree>,
    /// False when the revision equals the previously fetched one.
    pub changed: bool,
}

#[derive(Debug, Clone)]
struct Cached {
    source_ref: SourceRef,
    tree: Arc<ContentTree>,
    checked_at: Instant,
}

/// Wraps a [`SourceFetcher`] with a per-source cache. Sources shared by
/// several units are fetched at most once per `poll_interval`.
pub struct SourceTracker<F: SourceFetcher> {
    fetcher: F,
    poll_interval: Duration,
    cache: Mutex<HashMap<SourceSpec, Cached>>,
}

impl<F: SourceFetcher> SourceTracker<F> {
    pub fn new(fetcher: F, poll_interval: Duration) -> Self {
        Self {
            fetcher,
            poll_interval,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    /// Fetch `spec`, reusing the cached snapshot if it was checked within
    /// the poll interval.
    pub fn fetch(&self, spec: &SourceSpec) -> Result<FetchOutcome, FetchError> {
        if let Some(hit) = self.cached(spec) {
            if hit.checked_at.elapsed() < self.poll_interval {
                return Ok(FetchOutcome {
                    source_ref: hit.source_ref,
                    tree: hit.tree,
                    changed: false,
                });
            }
        }
        self.fetch_fresh(spec)
    }

    /// Always consult the fetcher, bypassing the poll interval.
    pub fn fetch_fresh(&self, spec: &SourceSpec) -> Result<FetchOutcome, FetchError> {
        let snapshot = self.fetcher.fetch(&spec.url, &spec.reference)?;
        let now = Instant::now();

        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(prev) = cache.get_mut(spec) {
            if prev.source_ref.revision == snapshot.revision {
                prev.checked_at = now;
                tracing::debug!(url = %spec.url, revision = %snapshot.revision, "source unchanged");
                return Ok(FetchOutcome {
                    source_ref: prev.source_ref.clone(),
                    tree: prev.tree.clone(),
                    changed: false,
                });
            }
        }

        let source_ref = SourceRef {
            url: spec.url.clone(),
            reference: spec.reference.clone(),
            revision: snapshot.revision,
            fetched_at: Utc::now(),
        };
        tracing::info!(
            url = %spec.url,
            reference = %spec.reference,
            revision = %source_ref.revision,
            "new source revision"
        );
        cache.insert(
            spec.clone(),
            Cached {
                source_ref: source_ref.clone(),
                tree: snapshot.tree.clone(),
                checked_at: now,
            },
        );
        Ok(FetchOutcome {
            source_ref,
            tree: snapshot.tree,
            changed: true,
        })
    }

    /// The last fetched reference for `spec`, if any.
    pub fn latest(&self, spec: &SourceSpec) -> Option<SourceRef> {
        self.cached(spec).map(|c| c.source_ref)
    }

    /// Forget a source so the next fetch goes to the fetcher.
    pub fn invalidate(&self, spec: &SourceSpec) {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.remove(spec);
    }

    fn cached(&self, spec: &SourceSpec) -> Option<Cached> {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.get(spec).cloned()
    }
}
