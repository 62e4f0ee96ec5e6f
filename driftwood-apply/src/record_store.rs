//! Applied-record store: what each unit last applied, per object.
//!
//! Persists a [`RecordStoreFile`] JSON document at
//! `<home>/.driftwood/applied/<unit>.json`. Writes use the same atomic
//! `.tmp` + rename pattern as the registry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use driftwood_core::{AppliedRecord, ObjectId, Revision, UnitName};

use crate::error::{io_err, ApplyError};

/// Successfully applied revisions remembered for the stale-revision guard.
pub const REVISION_MEMORY: usize = 20;

/// On-disk applied-record store for one unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordStoreFile {
    pub unit: UnitName,
    pub updated_at: DateTime<Utc>,
    /// Successfully applied revisions, oldest first.
    #[serde(default)]
    pub revisions: Vec<Revision>,
    /// Keyed by [`ObjectId::key`].
    #[serde(default)]
    pub records: BTreeMap<String, AppliedRecord>,
}

impl RecordStoreFile {
    pub fn empty(unit: &UnitName) -> Self {
        Self {
            unit: unit.clone(),
            updated_at: Utc::now(),
            revisions: Vec::new(),
            records: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: &ObjectId) -> Option<&AppliedRecord> {
        self.records.get(&id.key())
    }

    pub fn insert(&mut self, record: AppliedRecord) {
        self.records.insert(record.id.key(), record);
    }

    pub fn remove(&mut self, id: &ObjectId) -> Option<AppliedRecord> {
        self.records.remove(&id.key())
    }

    /// Last successfully applied revision.
    pub fn latest_revision(&self) -> Option<&Revision> {
        self.revisions.last()
    }

    /// Refuse a revision that was applied before and has since been
    /// superseded. Content-hash revisions (`sha256:`) of working directories
    /// carry no history and are never refused.
    pub fn check_revision(&self, revision: &Revision, force: bool) -> Result<(), ApplyError> {
        if force || revision.0.starts_with("sha256:") {
            return Ok(());
        }
        let Some(latest) = self.latest_revision() else {
            return Ok(());
        };
        if latest != revision && self.revisions.contains(revision) {
            return Err(ApplyError::StaleRevision {
                unit: self.unit.clone(),
                revision: revision.clone(),
                latest: latest.clone(),
            });
        }
        Ok(())
    }

    /// Record a fully successful apply of `revision`.
    pub fn push_revision(&mut self, revision: &Revision) {
        self.revisions.retain(|r| r != revision);
        self.revisions.push(revision.clone());
        if self.revisions.len() > REVISION_MEMORY {
            let excess = self.revisions.len() - REVISION_MEMORY;
            self.revisions.drain(..excess);
        }
    }
}

/// `<home>/.driftwood/applied/<unit>.json`
pub fn store_path_at(home: &Path, unit: &UnitName) -> PathBuf {
    home.join(".driftwood")
        .join("applied")
        .join(format!("{}.json", unit.0))
}

/// Load a unit's store. Returns an empty store if the file does not yet exist.
pub fn load_at(home: &Path, unit: &UnitName) -> Result<RecordStoreFile, ApplyError> {
    let path = store_path_at(home, unit);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(RecordStoreFile::empty(unit));
        }
        Err(e) => return Err(io_err(&path, e)),
    };
    serde_json::from_str(&contents).map_err(|source| ApplyError::Json { path, source })
}

/// Save a unit's store atomically.
pub fn save_at(home: &Path, store: &RecordStoreFile) -> Result<(), ApplyError> {
    let path = store_path_at(home, &store.unit);
    let Some(dir) = path.parent() else {
        return Err(io_err(
            path,
            std::io::Error::other("invalid record store path"),
        ));
    };
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let json = serde_json::to_string_pretty(store).map_err(|source| ApplyError::Json {
        path: path.clone(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

/// Delete a unit's store (unit removed from the fleet).
pub fn remove_at(home: &Path, unit: &UnitName) -> Result<(), ApplyError> {
    let path = store_path_at(home, unit);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(&path, e)),
    }
}
