//! Shared fetch → render → apply pipeline used by the CLI and the daemon.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use driftwood_core::{
    registry, DependencyError, DependencyGraph, DesiredObject, EngineConfig, ErrorClass,
    ReconcileStatus, ReconciliationResult, ReconciliationUnit, SourceRef, UnitName,
};
use driftwood_renderer::{DirectoryEngine, Renderer, TemplateEngine};
use driftwood_source::{CompositeFetcher, FetchOutcome, GitFetcher, SourceFetcher, SourceTracker};

use crate::diff::{diff_unit, ObjectDiff};
use crate::drift::{self, DriftReport};
use crate::engine::{self, ApplyOptions, ApplyOutcome};
use crate::error::PipelineError;
use crate::record_store;
use crate::target::{open_target, TargetApi};
use crate::throttle::ThrottledTarget;

/// Pipeline stage, reported to observers as a run progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Fetch,
    Render,
    Apply,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Bypass the source poll cache.
    pub fresh_source: bool,
    pub dry_run: bool,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl RunOptions {
    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|c| c.load(Ordering::SeqCst))
    }
}

/// A completed (possibly partially failed) run.
#[derive(Debug, Clone)]
pub struct UnitRun {
    pub source: SourceRef,
    /// The source revision moved since the previous fetch.
    pub source_changed: bool,
    pub outcome: ApplyOutcome,
}

impl UnitRun {
    pub fn to_result(&self) -> ReconciliationResult {
        let counts = self.outcome.counts();
        match self.outcome.failure() {
            None => ReconciliationResult::succeeded(
                self.outcome.unit.clone(),
                self.source.revision.clone(),
                counts,
            ),
            Some((class, message)) => {
                let mut result = ReconciliationResult::failed(
                    self.outcome.unit.clone(),
                    Some(self.source.revision.clone()),
                    class,
                    message,
                );
                result.counts = counts;
                result
            }
        }
    }
}

/// The pipeline wired to the configured target and the default fetchers.
pub type DefaultPipeline = Pipeline<CompositeFetcher, ThrottledTarget<Arc<dyn TargetApi>>>;

/// `<home>/.driftwood/sources`
pub fn sources_dir_at(home: &Path) -> PathBuf {
    registry::driftwood_root(home).join("sources")
}

/// Build the pipeline described by `config`.
pub fn open_at(home: &Path, config: &EngineConfig) -> DefaultPipeline {
    let fetcher = CompositeFetcher::new(GitFetcher::new(sources_dir_at(home)));
    let target = ThrottledTarget::new(open_target(config, home), &config.throttle);
    Pipeline::new(home, fetcher, target, config)
}

pub struct Pipeline<F: SourceFetcher, T: TargetApi, E: TemplateEngine = DirectoryEngine> {
    home: PathBuf,
    tracker: SourceTracker<F>,
    renderer: Renderer<E>,
    target: T,
    parallelism: usize,
}

impl<F: SourceFetcher, T: TargetApi> Pipeline<F, T, DirectoryEngine> {
    pub fn new(home: &Path, fetcher: F, target: T, config: &EngineConfig) -> Self {
        Self {
            home: home.to_path_buf(),
            tracker: SourceTracker::new(fetcher, config.source_poll_interval.as_duration()),
            renderer: Renderer::new(),
            target,
            parallelism: config.apply_parallelism.max(1),
        }
    }
}

impl<F: SourceFetcher, T: TargetApi, E: TemplateEngine> Pipeline<F, T, E> {
    pub fn with_renderer<E2: TemplateEngine>(self, renderer: Renderer<E2>) -> Pipeline<F, T, E2> {
        Pipeline {
            home: self.home,
            tracker: self.tracker,
            renderer,
            target: self.target,
            parallelism: self.parallelism,
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn tracker(&self) -> &SourceTracker<F> {
        &self.tracker
    }

    /// Fetch and render without applying.
    pub fn render(
        &self,
        unit: &ReconciliationUnit,
        fresh: bool,
    ) -> Result<(FetchOutcome, Vec<DesiredObject>), PipelineError> {
        let fetched = if fresh {
            self.tracker.fetch_fresh(&unit.source)?
        } else {
            self.tracker.fetch(&unit.source)?
        };
        let objects = self
            .renderer
            .render(&fetched.tree, &fetched.source_ref.revision, unit)?;
        Ok((fetched, objects))
    }

    /// One full reconciliation of `unit`.
    pub fn reconcile(
        &self,
        unit: &ReconciliationUnit,
        opts: &RunOptions,
    ) -> Result<UnitRun, PipelineError> {
        self.reconcile_observed(unit, opts, &|_| {})
    }

    /// [`Pipeline::reconcile`] with a callback at each stage boundary.
    pub fn reconcile_observed(
        &self,
        unit: &ReconciliationUnit,
        opts: &RunOptions,
        on_step: &(dyn Fn(Step) + Sync),
    ) -> Result<UnitRun, PipelineError> {
        on_step(Step::Fetch);
        let fetched = if opts.fresh_source {
            self.tracker.fetch_fresh(&unit.source)?
        } else {
            self.tracker.fetch(&unit.source)?
        };
        if opts.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        on_step(Step::Render);
        let revision = fetched.source_ref.revision.clone();
        let objects = self.renderer.render(&fetched.tree, &revision, unit)?;
        if opts.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        on_step(Step::Apply);
        let mut store = record_store::load_at(&self.home, &unit.name)?;
        let apply_opts = ApplyOptions {
            prune: unit.prune,
            force: unit.force,
            dry_run: opts.dry_run,
            parallelism: self.parallelism,
            cancel: opts.cancel.clone(),
        };
        let outcome = engine::apply(
            &self.target,
            &mut store,
            &unit.target_scope(),
            &revision,
            &objects,
            &apply_opts,
        )?;
        if !opts.dry_run {
            record_store::save_at(&self.home, &store)?;
        }
        tracing::info!(
            "unit '{}' at {}: {} change(s), {} failed",
            unit.name,
            revision.short(),
            outcome.changes(),
            outcome.failed().len()
        );
        Ok(UnitRun {
            source: fetched.source_ref,
            source_changed: fetched.changed,
            outcome,
        })
    }

    /// Run `unit` and fold any error into a history entry.
    pub fn run(
        &self,
        unit: &ReconciliationUnit,
        opts: &RunOptions,
        on_step: &(dyn Fn(Step) + Sync),
    ) -> ReconciliationResult {
        if unit.suspended {
            return ReconciliationResult::suspended(unit.name.clone());
        }
        match self.reconcile_observed(unit, opts, on_step) {
            Ok(run) => run.to_result(),
            Err(err) => {
                tracing::warn!("unit '{}' failed: {}", unit.name, err);
                let revision = match &err {
                    PipelineError::Source(_) => None,
                    _ => self.tracker.latest(&unit.source).map(|s| s.revision),
                };
                ReconciliationResult::failed(unit.name.clone(), revision, err.class(), err.to_string())
            }
        }
    }

    /// Reconcile a whole fleet once, dependencies first. A unit whose
    /// dependency did not succeed in this pass is not attempted.
    pub fn reconcile_all(
        &self,
        units: &[ReconciliationUnit],
        opts: &RunOptions,
    ) -> Vec<ReconciliationResult> {
        let build = DependencyGraph::build(units);
        let by_name: BTreeMap<&UnitName, &ReconciliationUnit> =
            units.iter().map(|u| (&u.name, u)).collect();
        let mut results = Vec::with_capacity(units.len());

        for (name, err) in &build.rejected {
            results.push(ReconciliationResult::failed(
                name.clone(),
                None,
                ErrorClass::Dependency,
                err.to_string(),
            ));
        }

        let order = build.graph.topological_order();
        let mut succeeded = BTreeSet::new();
        for name in &order {
            let Some(unit) = by_name.get(name) else {
                continue;
            };
            let waiting: Vec<UnitName> = unit
                .depends_on
                .iter()
                .filter(|d| !succeeded.contains(*d))
                .cloned()
                .collect();
            let result = if unit.suspended {
                ReconciliationResult::suspended(name.clone())
            } else if !waiting.is_empty() {
                let err = PipelineError::NotReady { waiting };
                ReconciliationResult::failed(name.clone(), None, err.class(), err.to_string())
            } else {
                self.run(unit, opts, &|_| {})
            };
            if result.status == ReconcileStatus::Succeeded {
                succeeded.insert(name.clone());
            }
            results.push(result);
        }

        let ordered: BTreeSet<&UnitName> = order.iter().collect();
        for name in build.graph.units() {
            if ordered.contains(name) {
                continue;
            }
            let missing = build.graph.missing_dependencies(name);
            let err = if missing.is_empty() {
                PipelineError::NotReady {
                    waiting: build
                        .graph
                        .dependencies(name)
                        .map(|d| d.iter().cloned().collect())
                        .unwrap_or_default(),
                }
            } else {
                PipelineError::Dependency(DependencyError::MissingDependency {
                    unit: name.clone(),
                    missing,
                })
            };
            results.push(ReconciliationResult::failed(
                name.clone(),
                None,
                err.class(),
                err.to_string(),
            ));
        }
        results
    }

    /// Per-object diff of what a reconcile would change.
    pub fn diff(&self, unit: &ReconciliationUnit) -> Result<Vec<ObjectDiff>, PipelineError> {
        let (_, objects) = self.render(unit, true)?;
        let store = record_store::load_at(&self.home, &unit.name)?;
        Ok(diff_unit(
            &self.target,
            &store,
            &unit.target_scope(),
            &objects,
            unit.prune,
        )?)
    }

    pub fn drift(&self, unit: &UnitName) -> Result<DriftReport, PipelineError> {
        let store = record_store::load_at(&self.home, unit)?;
        Ok(drift::check(&self.target, &store)?)
    }

    /// Drop the applied records of a unit that left the fleet.
    pub fn forget(&self, unit: &UnitName) -> Result<(), PipelineError> {
        record_store::remove_at(&self.home, unit)?;
        Ok(())
    }
}
