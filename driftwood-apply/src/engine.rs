//! Diff-and-apply of one unit's desired objects against the target.
//!
//! ## `apply` protocol
//!
//! 1. Refuse a superseded revision (unless forced).
//! 2. List the live objects carrying this unit's ownership label.
//! 3. Apply desired objects tier by tier in kind-priority order; objects in
//!    one tier go out in parallel. Each object is created when absent and
//!    updated with the three-way merge only when the merge changes it.
//! 4. Orphans (owned live objects or records no longer desired) are deleted
//!    when the unit prunes, in reverse priority order, and retained otherwise.
//! 5. Upsert applied records for every object that reached its desired state.
//!
//! A failed object never rolls back its siblings. The caller saves the store.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use driftwood_core::{
    AppliedRecord, ApplyCounts, DesiredObject, ErrorClass, ObjectId, ReconciliationUnit, Revision,
    TargetScope, UnitName,
};
use driftwood_renderer::kind_priority;

use crate::error::{ApplyError, TargetError};
use crate::merge;
use crate::record_store::RecordStoreFile;
use crate::target::{owner_of, set_owner, ListSelector, TargetApi};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What happened to one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ObjectAction {
    Created,
    Updated,
    /// Live already matches; no call was made.
    Unchanged,
    Pruned,
    /// Orphan kept because the unit does not prune.
    Retained,
    Failed { error: String },
    /// Target-side throttling that outlasted the client retries.
    Throttled { error: String },
    /// Not attempted: the run was cancelled first.
    Skipped,
    WouldCreate,
    WouldUpdate,
    WouldPrune,
}

impl ObjectAction {
    fn from_error(err: TargetError) -> Self {
        match err {
            TargetError::Throttled(_) => ObjectAction::Throttled {
                error: err.to_string(),
            },
            other => ObjectAction::Failed {
                error: other.to_string(),
            },
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ObjectAction::Failed { error } | ObjectAction::Throttled { error } => Some(error),
            _ => None,
        }
    }

    /// The object now matches what this run wanted.
    fn settled(&self) -> bool {
        matches!(
            self,
            ObjectAction::Created | ObjectAction::Updated | ObjectAction::Unchanged
        )
    }
}

impl fmt::Display for ObjectAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectAction::Created => write!(f, "created"),
            ObjectAction::Updated => write!(f, "updated"),
            ObjectAction::Unchanged => write!(f, "unchanged"),
            ObjectAction::Pruned => write!(f, "pruned"),
            ObjectAction::Retained => write!(f, "retained"),
            ObjectAction::Failed { error } => write!(f, "failed: {error}"),
            ObjectAction::Throttled { error } => write!(f, "throttled: {error}"),
            ObjectAction::Skipped => write!(f, "skipped"),
            ObjectAction::WouldCreate => write!(f, "would create"),
            ObjectAction::WouldUpdate => write!(f, "would update"),
            ObjectAction::WouldPrune => write!(f, "would prune"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectOutcome {
    pub id: ObjectId,
    #[serde(flatten)]
    pub action: ObjectAction,
}

/// Result of one apply pass over a unit.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
    pub unit: UnitName,
    pub revision: Revision,
    pub dry_run: bool,
    pub objects: Vec<ObjectOutcome>,
}

impl ApplyOutcome {
    /// Counters for the history entry. Dry-run outcomes count as the change
    /// they would make.
    pub fn counts(&self) -> ApplyCounts {
        let mut counts = ApplyCounts::default();
        for o in &self.objects {
            match o.action {
                ObjectAction::Created | ObjectAction::WouldCreate => counts.created += 1,
                ObjectAction::Updated | ObjectAction::WouldUpdate => counts.updated += 1,
                ObjectAction::Unchanged => counts.unchanged += 1,
                ObjectAction::Pruned | ObjectAction::WouldPrune => counts.pruned += 1,
                ObjectAction::Retained => counts.retained += 1,
                ObjectAction::Failed { .. } | ObjectAction::Throttled { .. } => counts.failed += 1,
                ObjectAction::Skipped => {}
            }
        }
        counts
    }

    pub fn failed(&self) -> Vec<&ObjectOutcome> {
        self.objects
            .iter()
            .filter(|o| o.action.error().is_some())
            .collect()
    }

    pub fn cancelled(&self) -> bool {
        self.objects
            .iter()
            .any(|o| o.action == ObjectAction::Skipped)
    }

    /// Target calls this pass made (or would make, on a dry run).
    pub fn changes(&self) -> usize {
        self.objects
            .iter()
            .filter(|o| {
                !matches!(
                    o.action,
                    ObjectAction::Unchanged | ObjectAction::Retained | ObjectAction::Skipped
                ) && o.action.error().is_none()
            })
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.failed().is_empty() && !self.cancelled()
    }

    /// Error class and message when the pass did not fully succeed. All
    /// failures being throttling makes the run `Throttle`, else `Apply`.
    pub fn failure(&self) -> Option<(ErrorClass, String)> {
        let failed = self.failed();
        if failed.is_empty() {
            if self.cancelled() {
                let skipped = self
                    .objects
                    .iter()
                    .filter(|o| o.action == ObjectAction::Skipped)
                    .count();
                return Some((
                    ErrorClass::Apply,
                    format!("cancelled with {skipped} object(s) not applied"),
                ));
            }
            return None;
        }
        let class = if failed
            .iter()
            .all(|o| matches!(o.action, ObjectAction::Throttled { .. }))
        {
            ErrorClass::Throttle
        } else {
            ErrorClass::Apply
        };
        let detail: Vec<&str> = failed.iter().filter_map(|o| o.action.error()).collect();
        Some((
            class,
            format!(
                "{} of {} object(s) failed: {}",
                failed.len(),
                self.objects.len(),
                detail.join("; ")
            ),
        ))
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    pub prune: bool,
    /// Apply even a superseded revision.
    pub force: bool,
    pub dry_run: bool,
    /// Concurrent target calls within one priority tier.
    pub parallelism: usize,
    /// Checked before every target call; once raised, the rest is skipped.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl ApplyOptions {
    pub fn for_unit(unit: &ReconciliationUnit) -> Self {
        Self {
            prune: unit.prune,
            force: unit.force,
            parallelism: 1,
            ..Default::default()
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|c| c.load(Ordering::SeqCst))
    }
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// What one desired object needs, given its live state.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Plan {
    Create,
    /// Send the merged payload.
    Update(Value),
    Unchanged,
    /// Live object carries another unit's ownership label.
    Conflict(String),
}

/// `desired` must already carry this unit's ownership label.
pub(crate) fn plan(
    unit: &UnitName,
    last_applied: Option<&Value>,
    desired: &Value,
    live: Option<&Value>,
) -> Plan {
    let Some(live) = live else {
        return Plan::Create;
    };
    if let Some(owner) = owner_of(live) {
        if owner != unit.0 {
            return Plan::Conflict(owner.to_string());
        }
    }
    let merged = merge::three_way(last_applied, desired, live);
    if merged == *live {
        Plan::Unchanged
    } else {
        Plan::Update(merged)
    }
}

/// `payload` with the ownership label of `unit` stamped in.
pub(crate) fn labelled(object: &DesiredObject, unit: &UnitName) -> Value {
    let mut payload = object.payload.clone();
    set_owner(&mut payload, unit);
    payload
}

/// Namespace to restrict owned-object listings to.
pub(crate) fn scope_namespace(scope: &TargetScope) -> Option<&str> {
    match scope {
        TargetScope::Namespace(ns) => Some(ns.as_str()),
        TargetScope::Cluster => None,
    }
}

struct Work<'a> {
    object: &'a DesiredObject,
    payload: Value,
    last: Option<&'a Value>,
    /// Live state from the owned listing; `None` means ask the target.
    listed: Option<&'a Value>,
}

fn apply_object<T: TargetApi + ?Sized>(
    target: &T,
    unit: &UnitName,
    work: &Work<'_>,
    opts: &ApplyOptions,
) -> ObjectAction {
    if opts.is_cancelled() {
        return ObjectAction::Skipped;
    }
    let id = &work.object.id;
    let fetched;
    let live = match work.listed {
        Some(live) => Some(live),
        None => {
            fetched = match target.get(id) {
                Ok(v) => v,
                Err(e) => return ObjectAction::from_error(e),
            };
            fetched.as_ref()
        }
    };

    match plan(unit, work.last, &work.payload, live) {
        Plan::Conflict(owner) => ObjectAction::Failed {
            error: format!("{id} is owned by unit '{owner}'"),
        },
        Plan::Unchanged => {
            tracing::debug!("unchanged: {}", id);
            ObjectAction::Unchanged
        }
        Plan::Create if opts.dry_run => {
            tracing::info!("[dry-run] would create: {}", id);
            ObjectAction::WouldCreate
        }
        Plan::Update(_) if opts.dry_run => {
            tracing::info!("[dry-run] would update: {}", id);
            ObjectAction::WouldUpdate
        }
        Plan::Create => match target.create(id, &work.payload) {
            Ok(()) => {
                tracing::info!("created: {}", id);
                ObjectAction::Created
            }
            Err(e) => ObjectAction::from_error(e),
        },
        Plan::Update(merged) => {
            if work.last.is_none() {
                tracing::info!("adopting: {}", id);
            }
            match target.update(id, &merged) {
                Ok(()) => {
                    tracing::info!("updated: {}", id);
                    ObjectAction::Updated
                }
                Err(e) => ObjectAction::from_error(e),
            }
        }
    }
}

/// Apply one priority tier, fanning out over up to `parallelism` threads.
fn run_tier<T: TargetApi + ?Sized>(
    target: &T,
    unit: &UnitName,
    tier: &[Work<'_>],
    opts: &ApplyOptions,
) -> Vec<ObjectAction> {
    let workers = opts.parallelism.max(1).min(tier.len());
    if workers <= 1 {
        return tier
            .iter()
            .map(|work| apply_object(target, unit, work, opts))
            .collect();
    }

    let next = AtomicUsize::new(0);
    let next = &next;
    let mut slots: Vec<Option<ObjectAction>> = vec![None; tier.len()];
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                s.spawn(move || {
                    let mut done = Vec::new();
                    loop {
                        let i = next.fetch_add(1, Ordering::SeqCst);
                        let Some(work) = tier.get(i) else {
                            break;
                        };
                        done.push((i, apply_object(target, unit, work, opts)));
                    }
                    done
                })
            })
            .collect();
        for handle in handles {
            match handle.join() {
                Ok(done) => {
                    for (i, action) in done {
                        slots[i] = Some(action);
                    }
                }
                Err(_) => tracing::error!("apply worker for unit '{}' panicked", unit),
            }
        }
    });
    slots
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| ObjectAction::Failed {
                error: "apply worker panicked".to_string(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// apply
// ---------------------------------------------------------------------------

/// Bring the target in line with `desired` for the store's unit.
///
/// Returns `Err` only when nothing was attempted (stale revision, listing
/// failure). Per-object failures are reported in the outcome.
pub fn apply<T: TargetApi + ?Sized>(
    target: &T,
    store: &mut RecordStoreFile,
    scope: &TargetScope,
    revision: &Revision,
    desired: &[DesiredObject],
    opts: &ApplyOptions,
) -> Result<ApplyOutcome, ApplyError> {
    let unit = store.unit.clone();
    store.check_revision(revision, opts.force)?;

    let owned: BTreeMap<ObjectId, Value> = target
        .list(&ListSelector::owned_by(&unit).in_namespace(scope_namespace(scope)))?
        .into_iter()
        .collect();

    let mut objects = Vec::with_capacity(desired.len());
    let mut settled: Vec<(ObjectId, Value)> = Vec::new();
    {
        let mut tiers: BTreeMap<u8, Vec<Work<'_>>> = BTreeMap::new();
        for object in desired {
            tiers
                .entry(kind_priority(&object.id.gvk.kind))
                .or_default()
                .push(Work {
                    object,
                    payload: labelled(object, &unit),
                    last: store.get(&object.id).map(|r| &r.payload),
                    listed: owned.get(&object.id),
                });
        }
        for (priority, tier) in tiers {
            tracing::debug!("unit '{}': tier {} ({} objects)", unit, priority, tier.len());
            let actions = run_tier(target, &unit, &tier, opts);
            for (work, action) in tier.into_iter().zip(actions) {
                if action.settled() {
                    settled.push((work.object.id.clone(), work.payload));
                }
                objects.push(ObjectOutcome {
                    id: work.object.id.clone(),
                    action,
                });
            }
        }
    }

    let pruned = prune_orphans(target, store, &owned, desired, opts, &mut objects);

    let outcome = ApplyOutcome {
        unit: unit.clone(),
        revision: revision.clone(),
        dry_run: opts.dry_run,
        objects,
    };
    if opts.dry_run {
        return Ok(outcome);
    }

    let now = Utc::now();
    for id in pruned {
        store.remove(&id);
    }
    for (id, payload) in settled {
        store.insert(AppliedRecord {
            unit: unit.clone(),
            id,
            payload,
            revision: revision.clone(),
            applied_at: now,
        });
    }
    if outcome.is_success() {
        store.push_revision(revision);
    }
    store.updated_at = now;
    Ok(outcome)
}

/// Handle objects this unit owns or recorded but no longer desires.
/// Returns the ids whose records should be dropped.
fn prune_orphans<T: TargetApi + ?Sized>(
    target: &T,
    store: &RecordStoreFile,
    owned: &BTreeMap<ObjectId, Value>,
    desired: &[DesiredObject],
    opts: &ApplyOptions,
    objects: &mut Vec<ObjectOutcome>,
) -> Vec<ObjectId> {
    let wanted: BTreeSet<&ObjectId> = desired.iter().map(|o| &o.id).collect();
    let mut forget = Vec::new();
    let mut orphans: Vec<ObjectId> = owned
        .keys()
        .filter(|id| !wanted.contains(id))
        .cloned()
        .collect();

    for record in store.records.values() {
        if wanted.contains(&record.id) || owned.contains_key(&record.id) {
            continue;
        }
        // Recorded but not in the owned listing: label removed, scope moved,
        // or already gone.
        match target.get(&record.id) {
            Ok(Some(live)) if owner_of(&live).map_or(true, |o| o == store.unit.0) => {
                orphans.push(record.id.clone());
            }
            Ok(_) => forget.push(record.id.clone()),
            Err(e) => objects.push(ObjectOutcome {
                id: record.id.clone(),
                action: ObjectAction::from_error(e),
            }),
        }
    }

    orphans.sort_by(|a, b| {
        kind_priority(&b.gvk.kind)
            .cmp(&kind_priority(&a.gvk.kind))
            .then_with(|| a.cmp(b))
    });

    for id in orphans {
        let action = if opts.is_cancelled() {
            ObjectAction::Skipped
        } else if !opts.prune {
            tracing::warn!("unit '{}': retaining orphan {} (prune disabled)", store.unit, id);
            ObjectAction::Retained
        } else if opts.dry_run {
            tracing::info!("[dry-run] would prune: {}", id);
            ObjectAction::WouldPrune
        } else {
            match target.delete(&id) {
                Ok(()) | Err(TargetError::NotFound(_)) => {
                    tracing::info!("pruned: {}", id);
                    forget.push(id.clone());
                    ObjectAction::Pruned
                }
                Err(e) => ObjectAction::from_error(e),
            }
        };
        objects.push(ObjectOutcome { id, action });
    }
    forget
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
