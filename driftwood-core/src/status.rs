//! Status reporter: bounded, append-only reconciliation history per unit.
//!
//! Persisted as `<home>/.driftwood/status/<unit>.json` (array, most recent
//! first) using the same atomic `.tmp` + rename pattern as the registry.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use crate::error::RegistryError;
use crate::registry::driftwood_root;
use crate::types::{ReconcileStatus, ReconciliationResult, UnitName};

/// `<home>/.driftwood/status/`
pub fn status_dir_at(home: &Path) -> PathBuf {
    driftwood_root(home).join("status")
}

/// `<home>/.driftwood/status/<unit>.json`
pub fn history_path_at(home: &Path, unit: &UnitName) -> PathBuf {
    status_dir_at(home).join(format!("{}.json", unit.0))
}

/// Read one unit's persisted history (most recent first). Missing file → empty.
pub fn load_history_at(
    home: &Path,
    unit: &UnitName,
) -> Result<Vec<ReconciliationResult>, RegistryError> {
    let path = history_path_at(home, unit);
    if !path.exists() {
        return Ok(vec![]);
    }
    let contents = std::fs::read_to_string(&path)?;
    serde_json::from_str(&contents).map_err(|source| RegistryError::Json { path, source })
}

fn save_history_at(
    home: &Path,
    unit: &UnitName,
    history: &VecDeque<ReconciliationResult>,
) -> Result<(), RegistryError> {
    let dir = status_dir_at(home);
    std::fs::create_dir_all(&dir)?;
    let path = history_path_at(home, unit);
    let json = serde_json::to_string_pretty(history).map_err(|source| RegistryError::Json {
        path: path.clone(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

/// Latest result per unit plus bounded history.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    home: Option<PathBuf>,
    limit: usize,
    histories: BTreeMap<UnitName, VecDeque<ReconciliationResult>>,
}

impl StatusReporter {
    /// A reporter that keeps history in memory only.
    pub fn in_memory(limit: usize) -> Self {
        Self {
            home: None,
            limit: limit.max(1),
            histories: BTreeMap::new(),
        }
    }

    /// A persistent reporter, preloaded from `<home>/.driftwood/status/`.
    pub fn load_at(home: &Path, limit: usize) -> Result<Self, RegistryError> {
        let mut reporter = Self {
            home: Some(home.to_path_buf()),
            limit: limit.max(1),
            histories: BTreeMap::new(),
        };
        let dir = status_dir_at(home);
        if !dir.exists() {
            return Ok(reporter);
        }
        let mut entries: Vec<_> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let unit = UnitName::from(stem);
            let mut history: VecDeque<_> = load_history_at(home, &unit)?.into();
            history.truncate(reporter.limit);
            reporter.histories.insert(unit, history);
        }
        Ok(reporter)
    }

    /// Append a result; the oldest entries beyond the limit are dropped.
    pub fn record(&mut self, result: ReconciliationResult) -> Result<(), RegistryError> {
        let unit = result.unit.clone();
        let history = self.histories.entry(unit.clone()).or_default();
        history.push_front(result);
        history.truncate(self.limit);
        if let Some(home) = &self.home {
            save_history_at(home, &unit, history)?;
        }
        Ok(())
    }

    /// Latest result for `unit`.
    pub fn get(&self, unit: &UnitName) -> Option<&ReconciliationResult> {
        self.histories.get(unit).and_then(|h| h.front())
    }

    /// Latest result of every unit that has one, by unit name.
    pub fn list(&self) -> Vec<&ReconciliationResult> {
        self.histories.values().filter_map(|h| h.front()).collect()
    }

    /// Up to `limit` results, most recent first.
    pub fn history(&self, unit: &UnitName, limit: usize) -> Vec<ReconciliationResult> {
        self.histories
            .get(unit)
            .map(|h| h.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent `Succeeded` entry still in the retained history.
    pub fn last_success(&self, unit: &UnitName) -> Option<&ReconciliationResult> {
        self.histories
            .get(unit)
            .and_then(|h| h.iter().find(|r| r.status == ReconcileStatus::Succeeded))
    }

    /// Drop a removed unit's history, including its file.
    pub fn forget(&mut self, unit: &UnitName) -> Result<(), RegistryError> {
        self.histories.remove(unit);
        if let Some(home) = &self.home {
            let path = history_path_at(home, unit);
            if path.exists() {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}
