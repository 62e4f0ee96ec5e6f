//! Dependency graph of reconciliation units.
//!
//! Edges point from a unit to the units it depends on. The graph is kept
//! acyclic: [`DependencyGraph::add_unit`] rejects any insertion that would
//! close a cycle. Dependencies on units that are not (yet) in the graph are
//! allowed but keep the dependent out of every ready set.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::DependencyError;
use crate::types::{ReconciliationUnit, UnitName};

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    deps: BTreeMap<UnitName, BTreeSet<UnitName>>,
}

/// Result of building a graph from a full unit set.
#[derive(Debug, Default)]
pub struct GraphBuild {
    pub graph: DependencyGraph,
    /// Units refused at insertion, with the reason.
    pub rejected: Vec<(UnitName, DependencyError)>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert every unit in name order, collecting rejections instead of failing.
    pub fn build<'a>(units: impl IntoIterator<Item = &'a ReconciliationUnit>) -> GraphBuild {
        let mut sorted: Vec<&ReconciliationUnit> = units.into_iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        let mut build = GraphBuild::default();
        for unit in sorted {
            if let Err(err) = build.graph.add_unit(unit) {
                build.rejected.push((unit.name.clone(), err));
            }
        }
        build
    }

    pub fn add_unit(&mut self, unit: &ReconciliationUnit) -> Result<(), DependencyError> {
        self.add(unit.name.clone(), unit.depends_on.iter().cloned())
    }

    /// Insert or replace a node's edges. Fails with `CyclicDependency` when
    /// any dependency can already reach `name`; the graph is left unchanged.
    pub fn add(
        &mut self,
        name: UnitName,
        depends_on: impl IntoIterator<Item = UnitName>,
    ) -> Result<(), DependencyError> {
        let depends_on: BTreeSet<UnitName> = depends_on.into_iter().collect();
        if depends_on.contains(&name) {
            return Err(DependencyError::CyclicDependency {
                cycle: vec![name.clone(), name],
            });
        }
        for dep in &depends_on {
            if let Some(mut path) = self.path_between(dep, &name) {
                let mut cycle = vec![name.clone()];
                cycle.append(&mut path);
                return Err(DependencyError::CyclicDependency { cycle });
            }
        }
        self.deps.insert(name, depends_on);
        Ok(())
    }

    /// Remove a node. Refused while another node depends on it.
    pub fn remove_unit(&mut self, name: &UnitName) -> Result<(), DependencyError> {
        let dependents = self.dependents(name);
        if !dependents.is_empty() {
            return Err(DependencyError::StillReferenced {
                unit: name.clone(),
                dependents,
            });
        }
        self.deps.remove(name);
        Ok(())
    }

    pub fn contains(&self, name: &UnitName) -> bool {
        self.deps.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    pub fn units(&self) -> impl Iterator<Item = &UnitName> {
        self.deps.keys()
    }

    pub fn dependencies(&self, name: &UnitName) -> Option<&BTreeSet<UnitName>> {
        self.deps.get(name)
    }

    /// Units that list `name` as a direct dependency, sorted.
    pub fn dependents(&self, name: &UnitName) -> Vec<UnitName> {
        self.deps
            .iter()
            .filter(|(_, deps)| deps.contains(name))
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Direct dependencies of `name` that are not in the graph.
    pub fn missing_dependencies(&self, name: &UnitName) -> Vec<UnitName> {
        self.deps
            .get(name)
            .map(|deps| deps.iter().filter(|d| !self.contains(d)).cloned().collect())
            .unwrap_or_default()
    }

    /// Every unit whose dependencies are all known and in `completed`, and
    /// which is not itself in `completed`.
    pub fn ready(&self, completed: &BTreeSet<UnitName>) -> BTreeSet<UnitName> {
        self.deps
            .iter()
            .filter(|(name, _)| !completed.contains(*name))
            .filter(|(_, deps)| deps.iter().all(|d| self.contains(d) && completed.contains(d)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Kahn's algorithm with lexical tie-break. Units with missing
    /// dependencies (and their dependents) are left out.
    pub fn topological_order(&self) -> Vec<UnitName> {
        let mut done = BTreeSet::new();
        let mut order = Vec::new();
        loop {
            let wave = self.ready(&done);
            if wave.is_empty() {
                break;
            }
            for name in wave {
                done.insert(name.clone());
                order.push(name);
            }
        }
        order
    }

    /// Depth-first search along dependency edges from `from` to `to`.
    /// Returns the path including both endpoints.
    fn path_between(&self, from: &UnitName, to: &UnitName) -> Option<Vec<UnitName>> {
        let mut stack = vec![(from.clone(), vec![from.clone()])];
        let mut seen = BTreeSet::new();
        while let Some((node, path)) = stack.pop() {
            if &node == to {
                return Some(path);
            }
            if !seen.insert(node.clone()) {
                continue;
            }
            if let Some(deps) = self.deps.get(&node) {
                for dep in deps.iter().rev() {
                    let mut next = path.clone();
                    next.push(dep.clone());
                    stack.push((dep.clone(), next));
                }
            }
        }
        None
    }
}

/// How a freshly loaded unit set differs from the running one.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UnitSetDiff {
    pub added: Vec<UnitName>,
    pub removed: Vec<UnitName>,
    pub changed: Vec<UnitName>,
    pub unchanged: Vec<UnitName>,
}

/// Compare the running unit set with a reloaded one.
pub fn diff_units(
    current: &BTreeMap<UnitName, ReconciliationUnit>,
    reloaded: &[ReconciliationUnit],
) -> UnitSetDiff {
    let mut diff = UnitSetDiff::default();
    let reloaded_names: BTreeSet<&UnitName> = reloaded.iter().map(|u| &u.name).collect();
    for unit in reloaded {
        match current.get(&unit.name) {
            None => diff.added.push(unit.name.clone()),
            Some(existing) if existing != unit => diff.changed.push(unit.name.clone()),
            Some(_) => diff.unchanged.push(unit.name.clone()),
        }
    }
    diff.removed = current
        .keys()
        .filter(|name| !reloaded_names.contains(name))
        .cloned()
        .collect();
    diff.added.sort();
    diff.changed.sort();
    diff.unchanged.sort();
    diff
}
