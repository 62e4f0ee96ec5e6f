//! Per-unit reconciliation state machine.
//!
//! The scheduler owns no threads and performs no I/O beyond persisting
//! suspension and status history. The runtime asks it which units are
//! [`Scheduler::due`], runs them, and reports every stage and the final
//! result back. Time is passed in so tests can drive it directly.
//!
//! ```text
//! Idle -> Fetching -> Rendering -> Applying -> Succeeded | Failed
//!   ^                                              |
//!   +---------------- timer / trigger -------------+
//! Suspended <-> any state (a running unit suspends once its run completes)
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;

use driftwood_apply::Step;
use driftwood_core::graph::diff_units;
use driftwood_core::{
    registry, DependencyGraph, EngineConfig, ErrorClass, ReconcileStatus, ReconciliationResult,
    ReconciliationUnit, StatusReporter, UnitName,
};
use driftwood_source::local_path;

use crate::error::DaemonError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Fetching,
    Rendering,
    Applying,
    Succeeded,
    Failed,
    Suspended,
}

impl From<Step> for Phase {
    fn from(step: Step) -> Self {
        match step {
            Step::Fetch => Phase::Fetching,
            Step::Render => Phase::Rendering,
            Step::Apply => Phase::Applying,
        }
    }
}

/// Exponential retry delay: `base * 2^(failures-1)`, jittered ±10%, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            base: config.backoff_base.as_duration(),
            max: config.backoff_max.as_duration(),
        }
    }

    /// Delay before the retry following the `failures`-th consecutive failure.
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = rand::thread_rng().gen_range(0.9..=1.1);
        self.undithered(failures).mul_f64(factor).min(self.max)
    }

    fn undithered(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(20);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }
}

/// An out-of-band request to run a unit now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Trigger {
    /// Bypass the stale-revision guard for this one run.
    force_revision: bool,
    /// Bypass the source poll cache.
    fresh: bool,
}

#[derive(Debug)]
struct UnitState {
    unit: ReconciliationUnit,
    phase: Phase,
    failures: u32,
    next_due: Option<Instant>,
    last_started: Option<DateTime<Utc>>,
    pending: Option<Trigger>,
    /// Present while a run is in flight.
    cancel: Option<Arc<AtomicBool>>,
    blocked: Option<String>,
    waiting: Vec<UnitName>,
    suspend_pending: bool,
    /// Gone from `units/` but still depended upon.
    retained: bool,
    /// Gone from `units/`; dropped once its in-flight run completes.
    removed: bool,
}

impl UnitState {
    fn new(unit: ReconciliationUnit, now: Instant) -> Self {
        let suspended = unit.suspended;
        Self {
            unit,
            phase: if suspended { Phase::Suspended } else { Phase::Idle },
            failures: 0,
            next_due: (!suspended).then_some(now),
            last_started: None,
            pending: None,
            cancel: None,
            blocked: None,
            waiting: Vec::new(),
            suspend_pending: false,
            retained: false,
            removed: false,
        }
    }

    fn is_running(&self) -> bool {
        self.cancel.is_some()
    }

    fn schedulable(&self) -> bool {
        !self.is_running() && !self.removed && !self.unit.suspended && self.blocked.is_none()
    }
}

/// A unit the runtime should run now.
#[derive(Debug, Clone)]
pub struct Dispatch {
    /// Snapshot of the unit, with `force` raised for a forced-revision trigger.
    pub unit: ReconciliationUnit,
    pub fresh_source: bool,
    /// Started by a trigger rather than the interval timer.
    pub triggered: bool,
    pub cancel: Arc<AtomicBool>,
}

/// Queryable view of one unit's scheduler state.
#[derive(Debug, Clone, Serialize)]
pub struct UnitStatus {
    pub unit: UnitName,
    pub phase: Phase,
    pub suspended: bool,
    pub failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_in_secs: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub waiting_on: Vec<UnitName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub retained: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<ReconciliationResult>,
}

/// What a reload changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    pub added: Vec<UnitName>,
    pub removed: Vec<UnitName>,
    pub changed: Vec<UnitName>,
    pub retained: Vec<UnitName>,
    pub rejected: BTreeMap<UnitName, String>,
}

impl ReloadReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.changed.is_empty()
            && self.retained.is_empty()
            && self.rejected.is_empty()
    }
}

pub struct Scheduler {
    home: PathBuf,
    states: BTreeMap<UnitName, UnitState>,
    graph: DependencyGraph,
    status: StatusReporter,
    backoff: Backoff,
    forgotten: Vec<UnitName>,
}

impl Scheduler {
    /// An empty scheduler; load units with [`Scheduler::reload`].
    pub fn new(home: &Path, status: StatusReporter, backoff: Backoff) -> Self {
        Self {
            home: home.to_path_buf(),
            states: BTreeMap::new(),
            graph: DependencyGraph::new(),
            status,
            backoff,
            forgotten: Vec::new(),
        }
    }

    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn unit(&self, name: &UnitName) -> Option<&ReconciliationUnit> {
        self.states
            .get(name)
            .filter(|s| !s.removed)
            .map(|s| &s.unit)
    }

    pub fn running(&self) -> usize {
        self.states.values().filter(|s| s.is_running()).count()
    }

    // -----------------------------------------------------------------------
    // Unit set lifecycle
    // -----------------------------------------------------------------------

    /// Replace the unit set. Unaffected units keep their timers and history.
    pub fn reload(&mut self, units: Vec<ReconciliationUnit>, now: Instant) -> ReloadReport {
        let current: BTreeMap<UnitName, ReconciliationUnit> = self
            .states
            .iter()
            .filter(|(_, s)| !s.removed)
            .map(|(n, s)| (n.clone(), s.unit.clone()))
            .collect();
        let diff = diff_units(&current, &units);

        let mut keep: BTreeMap<UnitName, ReconciliationUnit> =
            units.iter().map(|u| (u.name.clone(), u.clone())).collect();
        let mut retained = BTreeSet::new();
        loop {
            let referenced: Vec<UnitName> = diff
                .removed
                .iter()
                .filter(|name| !keep.contains_key(*name))
                .filter(|name| keep.values().any(|u| u.depends_on.contains(*name)))
                .cloned()
                .collect();
            if referenced.is_empty() {
                break;
            }
            for name in referenced {
                if let Some(unit) = current.get(&name) {
                    keep.insert(name.clone(), unit.clone());
                    retained.insert(name);
                }
            }
        }

        let build = DependencyGraph::build(keep.values());
        let rejected: BTreeMap<UnitName, String> = build
            .rejected
            .iter()
            .map(|(name, err)| (name.clone(), err.to_string()))
            .collect();

        let mut report = ReloadReport {
            rejected: rejected.clone(),
            ..Default::default()
        };

        for name in &diff.removed {
            if retained.contains(name) {
                if let Some(state) = self.states.get_mut(name) {
                    if !state.retained {
                        tracing::warn!(unit = %name, "removed unit is still referenced; retained");
                    }
                    state.retained = true;
                }
                report.retained.push(name.clone());
            } else {
                self.drop_unit(name);
                report.removed.push(name.clone());
            }
        }

        for name in &diff.added {
            let Some(unit) = keep.get(name).cloned() else {
                continue;
            };
            // Re-added while its previous incarnation is still running.
            match self.states.get_mut(name).filter(|s| s.removed) {
                Some(state) => {
                    state.removed = false;
                    state.unit = unit;
                    state.pending.get_or_insert_with(Trigger::default);
                }
                None => {
                    self.states.insert(name.clone(), UnitState::new(unit, now));
                }
            }
            report.added.push(name.clone());
        }

        for name in &diff.changed {
            let (Some(unit), Some(state)) = (keep.get(name), self.states.get_mut(name)) else {
                continue;
            };
            state.unit = unit.clone();
            state.retained = false;
            state.failures = 0;
            if unit.suspended {
                state.pending = None;
                state.next_due = None;
                if state.is_running() {
                    state.suspend_pending = true;
                } else {
                    state.phase = Phase::Suspended;
                }
            } else {
                state.suspend_pending = false;
                if state.is_running() {
                    state.pending.get_or_insert_with(Trigger::default);
                } else {
                    if state.phase == Phase::Suspended {
                        state.phase = Phase::Idle;
                    }
                    state.next_due = Some(now);
                }
            }
            report.changed.push(name.clone());
        }

        for name in &diff.unchanged {
            if let Some(state) = self.states.get_mut(name) {
                state.retained = false;
            }
        }

        let mut newly_blocked = Vec::new();
        for (name, state) in self.states.iter_mut().filter(|(_, s)| !s.removed) {
            match rejected.get(name) {
                Some(reason) if state.blocked.as_ref() != Some(reason) => {
                    tracing::error!(unit = %name, reason = %reason, "unit blocked by dependency error");
                    state.blocked = Some(reason.clone());
                    state.pending = None;
                    state.next_due = None;
                    if !state.is_running() {
                        state.phase = Phase::Failed;
                    }
                    newly_blocked.push((name.clone(), reason.clone()));
                }
                Some(_) => {}
                None => {
                    if state.blocked.take().is_some() && !state.unit.suspended {
                        state.phase = Phase::Idle;
                        state.next_due = Some(now);
                    }
                }
            }
        }
        for (name, reason) in newly_blocked {
            self.record(ReconciliationResult::failed(
                name,
                None,
                ErrorClass::Dependency,
                reason,
            ));
        }

        self.graph = build.graph;
        report
    }

    fn drop_unit(&mut self, name: &UnitName) {
        let Some(state) = self.states.get_mut(name) else {
            return;
        };
        if state.is_running() {
            state.removed = true;
            state.pending = None;
            state.next_due = None;
            return;
        }
        self.states.remove(name);
        self.forget(name);
    }

    fn forget(&mut self, name: &UnitName) {
        if let Err(err) = self.status.forget(name) {
            tracing::warn!(unit = %name, error = %err, "failed to drop status history");
        }
        self.forgotten.push(name.clone());
    }

    /// Units removed since the last call, whose applied records can go.
    pub fn take_forgotten(&mut self) -> Vec<UnitName> {
        std::mem::take(&mut self.forgotten)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Start up to `slots` units whose timer elapsed or that were triggered,
    /// dependencies first. Starting a unit moves it to `Fetching`.
    pub fn due(&mut self, now: Instant, slots: usize) -> Vec<Dispatch> {
        let mut order = self.graph.topological_order();
        let ordered: BTreeSet<UnitName> = order.iter().cloned().collect();
        order.extend(self.states.keys().filter(|n| !ordered.contains(*n)).cloned());

        let mut dispatched = Vec::new();
        for name in order {
            if dispatched.len() >= slots {
                break;
            }
            let Some(state) = self.states.get(&name) else {
                continue;
            };
            if !state.schedulable() {
                continue;
            }
            let triggered = state.pending.is_some();
            let timer = state.next_due.is_some_and(|due| due <= now);
            if !triggered && !timer {
                continue;
            }

            let waiting = self.unmet_dependencies(&name, triggered);
            let Some(state) = self.states.get_mut(&name) else {
                continue;
            };
            if !waiting.is_empty() {
                if state.waiting != waiting {
                    tracing::debug!(unit = %name, waiting = ?waiting, "waiting on dependencies");
                }
                state.waiting = waiting;
                continue;
            }

            let trigger = state.pending.take().unwrap_or_default();
            let cancel = Arc::new(AtomicBool::new(false));
            state.waiting.clear();
            state.cancel = Some(Arc::clone(&cancel));
            state.phase = Phase::Fetching;
            state.last_started = Some(Utc::now());
            state.next_due = None;

            let mut unit = state.unit.clone();
            unit.force |= trigger.force_revision;
            dispatched.push(Dispatch {
                unit,
                fresh_source: trigger.fresh,
                triggered,
                cancel,
            });
        }
        dispatched
    }

    /// Dependencies of `name` that do not allow it to start.
    ///
    /// Every dependency's latest result must be `Succeeded`. A timer run also
    /// needs that success to be no older than this unit's previous start.
    fn unmet_dependencies(&self, name: &UnitName, triggered: bool) -> Vec<UnitName> {
        let Some(state) = self.states.get(name) else {
            return Vec::new();
        };
        let since = if triggered { None } else { state.last_started };
        state
            .unit
            .depends_on
            .iter()
            .filter(|dep| !self.dependency_ready(dep, since))
            .cloned()
            .collect()
    }

    fn dependency_ready(&self, dep: &UnitName, since: Option<DateTime<Utc>>) -> bool {
        let known = self.graph.contains(dep)
            && self
                .states
                .get(dep)
                .is_some_and(|s| s.blocked.is_none() && !s.removed);
        if !known {
            return false;
        }
        if self.status.get(dep).map(|r| r.status) != Some(ReconcileStatus::Succeeded) {
            return false;
        }
        match since {
            None => true,
            Some(started) => self
                .status
                .last_success(dep)
                .is_some_and(|r| r.timestamp >= started),
        }
    }

    /// Earliest timer among units that could start without outside help.
    pub fn next_wake(&self) -> Option<Instant> {
        self.states
            .values()
            .filter(|s| s.schedulable() && s.waiting.is_empty())
            .filter_map(|s| s.next_due)
            .min()
    }

    /// Record that a running unit reached `step`.
    pub fn step(&mut self, name: &UnitName, step: Step) {
        if let Some(state) = self.states.get_mut(name).filter(|s| s.is_running()) {
            state.phase = step.into();
        }
    }

    /// Record a finished run and re-arm the unit's timer.
    pub fn complete(&mut self, name: &UnitName, result: ReconciliationResult, now: Instant) {
        let Some(state) = self.states.get_mut(name) else {
            self.record(result);
            return;
        };
        state.cancel = None;
        if state.removed {
            self.states.remove(name);
            self.forget(name);
            return;
        }

        match result.status {
            ReconcileStatus::Succeeded => {
                state.failures = 0;
                state.phase = Phase::Succeeded;
                state.next_due = Some(now + state.unit.interval.as_duration());
            }
            ReconcileStatus::Suspended => {
                state.phase = Phase::Suspended;
                state.next_due = None;
            }
            ReconcileStatus::Failed | ReconcileStatus::Progressing => {
                state.failures = state.failures.saturating_add(1);
                state.phase = Phase::Failed;
                state.next_due = match result.error_class {
                    Some(class) if !class.is_transient() => None,
                    _ => Some(now + self.backoff.delay(state.failures)),
                };
            }
        }

        let suspend = std::mem::take(&mut state.suspend_pending);
        if suspend {
            state.phase = Phase::Suspended;
            state.next_due = None;
            state.pending = None;
        }
        if state.blocked.is_some() {
            state.phase = Phase::Failed;
            state.next_due = None;
        }

        self.record(result);
        if suspend {
            self.record(ReconciliationResult::suspended(name.clone()));
        }
    }

    fn record(&mut self, result: ReconciliationResult) {
        let unit = result.unit.clone();
        if let Err(err) = self.status.record(result) {
            tracing::warn!(unit = %unit, error = %err, "failed to persist reconciliation result");
        }
    }

    // -----------------------------------------------------------------------
    // Control operations
    // -----------------------------------------------------------------------

    fn active_mut(&mut self, name: &UnitName) -> Result<&mut UnitState, DaemonError> {
        self.states
            .get_mut(name)
            .filter(|s| !s.removed)
            .ok_or_else(|| DaemonError::UnknownUnit(name.clone()))
    }

    /// Queue an immediate run. `force_revision` lifts the stale-revision
    /// guard for that run only.
    pub fn trigger(&mut self, name: &UnitName, force_revision: bool) -> Result<(), DaemonError> {
        let state = self.active_mut(name)?;
        if state.unit.suspended {
            return Err(DaemonError::Suspended(name.clone()));
        }
        if let Some(reason) = &state.blocked {
            return Err(DaemonError::Blocked {
                unit: name.clone(),
                reason: reason.clone(),
            });
        }
        let pending = state.pending.get_or_insert_with(Trigger::default);
        pending.force_revision |= force_revision;
        pending.fresh = true;
        Ok(())
    }

    /// Trigger every unit that can run. Returns the units queued.
    pub fn trigger_all(&mut self, force_revision: bool) -> Vec<UnitName> {
        let names: Vec<UnitName> = self.states.keys().cloned().collect();
        names
            .into_iter()
            .filter(|name| self.trigger(name, force_revision).is_ok())
            .collect()
    }

    /// Local directories backing active units' sources.
    pub fn local_source_roots(&self) -> BTreeSet<PathBuf> {
        self.states
            .values()
            .filter(|s| !s.removed && !s.unit.suspended)
            .filter_map(|s| local_path(&s.unit.source.url))
            .map(canonical)
            .collect()
    }

    /// A file under `changed` moved: re-fetch every unit sourced from it.
    pub fn trigger_source(&mut self, changed: &Path) -> Vec<UnitName> {
        let mut queued = Vec::new();
        for (name, state) in self.states.iter_mut() {
            if state.removed || state.unit.suspended || state.blocked.is_some() {
                continue;
            }
            let Some(root) = local_path(&state.unit.source.url).map(canonical) else {
                continue;
            };
            if changed.starts_with(&root) {
                state.pending.get_or_insert_with(Trigger::default).fresh = true;
                queued.push(name.clone());
            }
        }
        queued
    }

    /// Stop scheduling `name`. A run in flight completes first.
    pub fn suspend(&mut self, name: &UnitName) -> Result<(), DaemonError> {
        let retained = self.active_mut(name)?.retained;
        if !retained {
            registry::set_suspended_at(&self.home, name, true)?;
        }
        let state = self.active_mut(name)?;
        state.unit.suspended = true;
        state.pending = None;
        state.next_due = None;
        state.waiting.clear();
        if state.is_running() {
            state.suspend_pending = true;
            return Ok(());
        }
        if state.phase == Phase::Suspended {
            return Ok(());
        }
        state.phase = Phase::Suspended;
        self.record(ReconciliationResult::suspended(name.clone()));
        tracing::info!(unit = %name, "unit suspended");
        Ok(())
    }

    /// Return a suspended unit to `Idle`, due immediately.
    pub fn resume(&mut self, name: &UnitName, now: Instant) -> Result<(), DaemonError> {
        let retained = self.active_mut(name)?.retained;
        if !retained {
            registry::set_suspended_at(&self.home, name, false)?;
        }
        let state = self.active_mut(name)?;
        state.unit.suspended = false;
        state.suspend_pending = false;
        if !state.is_running() && state.phase == Phase::Suspended {
            state.phase = Phase::Idle;
            state.failures = 0;
            if state.blocked.is_none() {
                state.next_due = Some(now);
            }
        }
        tracing::info!(unit = %name, "unit resumed");
        Ok(())
    }

    /// Raise every in-flight cancel flag. Returns how many were raised.
    pub fn cancel_all(&self) -> usize {
        let mut raised = 0;
        for cancel in self.states.values().filter_map(|s| s.cancel.as_ref()) {
            cancel.store(true, Ordering::SeqCst);
            raised += 1;
        }
        raised
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get(&self, name: &UnitName, now: Instant) -> Option<UnitStatus> {
        self.states
            .get(name)
            .filter(|s| !s.removed)
            .map(|s| self.view(name, s, now))
    }

    /// Every loaded unit, by name.
    pub fn snapshot(&self, now: Instant) -> Vec<UnitStatus> {
        self.states
            .iter()
            .filter(|(_, s)| !s.removed)
            .map(|(name, s)| self.view(name, s, now))
            .collect()
    }

    pub fn history(&self, name: &UnitName, limit: usize) -> Vec<ReconciliationResult> {
        self.status.history(name, limit)
    }

    fn view(&self, name: &UnitName, state: &UnitState, now: Instant) -> UnitStatus {
        UnitStatus {
            unit: name.clone(),
            phase: state.phase,
            suspended: state.unit.suspended,
            failures: state.failures,
            next_run_in_secs: state
                .next_due
                .filter(|_| state.schedulable())
                .map(|due| due.saturating_duration_since(now).as_secs()),
            waiting_on: state.waiting.clone(),
            blocked: state.blocked.clone(),
            retained: state.retained,
            last: self.status.get(name).cloned(),
        }
    }
}

fn canonical(path: PathBuf) -> PathBuf {
    std::fs::canonicalize(&path).unwrap_or(path)
}
