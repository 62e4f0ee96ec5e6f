//! Per-unit YAML registry.
//!
//! # Storage layout
//!
//! ```text
//! ~/.driftwood/
//!   config.yaml          (engine config: see [`crate::config`])
//!   units/
//!     <unit_name>.yaml   (one file per reconciliation unit: mode 0600)
//! ```
//!
//! # API pattern
//!
//! Every function has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::path::{Path, PathBuf};

use crate::error::{DependencyError, RegistryError};
use crate::types::{ReconciliationUnit, UnitName};

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.driftwood/`
pub fn driftwood_root(home: &Path) -> PathBuf {
    home.join(".driftwood")
}

/// `<home>/.driftwood/units/`: pure, no I/O.
pub fn units_root(home: &Path) -> PathBuf {
    driftwood_root(home).join("units")
}

/// `<home>/.driftwood/units/`
///
/// Creates the directory (mode `0700`) if it does not yet exist.
pub fn units_dir_at(home: &Path) -> Result<PathBuf, RegistryError> {
    let dir = units_root(home);
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        set_dir_permissions(&dir)?;
    }
    Ok(dir)
}

/// `<home>/.driftwood/units/<name>.yaml`: pure, no I/O.
pub fn unit_path_at(home: &Path, name: &UnitName) -> PathBuf {
    units_root(home).join(format!("{}.yaml", name.0))
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load a single unit from `<home>/.driftwood/units/<name>.yaml`.
///
/// Returns `RegistryError::UnitNotFound` if absent,
/// `RegistryError::Parse` (with path + line context) if malformed YAML.
pub fn load_unit_at(home: &Path, name: &UnitName) -> Result<ReconciliationUnit, RegistryError> {
    let path = unit_path_at(home, name);
    if !path.exists() {
        return Err(RegistryError::UnitNotFound {
            name: name.clone(),
            path,
        });
    }
    parse_unit_file(&path)
}

/// `load_unit_at` convenience wrapper.
pub fn load_unit(name: &UnitName) -> Result<ReconciliationUnit, RegistryError> {
    load_unit_at(&home()?, name)
}

/// Read every `*.yaml` under `units/`, sorted by name. Fails on the first
/// unreadable file.
pub fn list_units_at(home: &Path) -> Result<Vec<ReconciliationUnit>, RegistryError> {
    let (units, mut errors) = scan_units_at(home)?;
    if !errors.is_empty() {
        return Err(errors.remove(0).1);
    }
    Ok(units)
}

/// `list_units_at` convenience wrapper.
pub fn list_units() -> Result<Vec<ReconciliationUnit>, RegistryError> {
    list_units_at(&home()?)
}

/// Read every `*.yaml` under `units/`, collecting per-file failures instead of
/// aborting. Used by reload so one broken file does not stop the fleet.
pub fn scan_units_at(
    home: &Path,
) -> Result<(Vec<ReconciliationUnit>, Vec<(PathBuf, RegistryError)>), RegistryError> {
    let dir = units_root(home);
    if !dir.exists() {
        return Ok((vec![], vec![]));
    }

    let mut entries: Vec<_> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let mut units = Vec::new();
    let mut errors = Vec::new();
    for entry in entries {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        match parse_unit_file(&path) {
            Ok(unit) => units.push(unit),
            Err(err) => errors.push((path, err)),
        }
    }
    units.sort_by(|a, b| a.name.cmp(&b.name));
    Ok((units, errors))
}

fn parse_unit_file(path: &Path) -> Result<ReconciliationUnit, RegistryError> {
    let contents = std::fs::read_to_string(path)?;
    let unit: ReconciliationUnit = serde_yaml::from_str(&contents).map_err(|e| {
        RegistryError::Parse {
            path: path.to_path_buf(),
            source: e,
        }
    })?;
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    if unit.name.0 != stem {
        return Err(RegistryError::NameMismatch {
            path: path.to_path_buf(),
            declared: unit.name,
        });
    }
    if !unit.name.is_valid() {
        return Err(RegistryError::InvalidName(unit.name));
    }
    Ok(unit)
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save a unit to `<home>/.driftwood/units/<name>.yaml`.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_unit_at(home: &Path, unit: &ReconciliationUnit) -> Result<(), RegistryError> {
    if !unit.name.is_valid() {
        return Err(RegistryError::InvalidName(unit.name.clone()));
    }
    units_dir_at(home)?;
    let path = unit_path_at(home, &unit.name);
    let tmp_path = path.with_file_name(format!("{}.yaml.tmp", unit.name.0));

    let yaml = serde_yaml::to_string(unit)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

/// `save_unit_at` convenience wrapper.
pub fn save_unit(unit: &ReconciliationUnit) -> Result<(), RegistryError> {
    save_unit_at(&home()?, unit)
}

// ---------------------------------------------------------------------------
// 4. Add / remove
// ---------------------------------------------------------------------------

/// Register a new unit. Fails with `DuplicateUnit` if the file already exists.
pub fn add_unit_at(home: &Path, unit: &ReconciliationUnit) -> Result<(), RegistryError> {
    let path = unit_path_at(home, &unit.name);
    if path.exists() {
        return Err(RegistryError::DuplicateUnit(unit.name.clone()));
    }
    save_unit_at(home, unit)
}

/// `add_unit_at` convenience wrapper.
pub fn add_unit(unit: &ReconciliationUnit) -> Result<(), RegistryError> {
    add_unit_at(&home()?, unit)
}

/// Delete a unit file. Refused while another unit lists it in `depends_on`.
pub fn remove_unit_at(home: &Path, name: &UnitName) -> Result<(), RegistryError> {
    let path = unit_path_at(home, name);
    if !path.exists() {
        return Err(RegistryError::UnitNotFound {
            name: name.clone(),
            path,
        });
    }
    let (units, _) = scan_units_at(home)?;
    let dependents: Vec<UnitName> = units
        .iter()
        .filter(|u| u.depends_on.contains(name))
        .map(|u| u.name.clone())
        .collect();
    if !dependents.is_empty() {
        return Err(DependencyError::StillReferenced {
            unit: name.clone(),
            dependents,
        }
        .into());
    }
    std::fs::remove_file(&path)?;
    Ok(())
}

/// `remove_unit_at` convenience wrapper.
pub fn remove_unit(name: &UnitName) -> Result<(), RegistryError> {
    remove_unit_at(&home()?, name)
}

// ---------------------------------------------------------------------------
// 5. Suspend / resume
// ---------------------------------------------------------------------------

/// Persist the `suspended` flag. Returns the updated unit.
pub fn set_suspended_at(
    home: &Path,
    name: &UnitName,
    suspended: bool,
) -> Result<ReconciliationUnit, RegistryError> {
    let mut unit = load_unit_at(home, name)?;
    if unit.suspended != suspended {
        unit.suspended = suspended;
        save_unit_at(home, &unit)?;
    }
    Ok(unit)
}

/// `set_suspended_at` convenience wrapper.
pub fn set_suspended(name: &UnitName, suspended: bool) -> Result<ReconciliationUnit, RegistryError> {
    set_suspended_at(&home()?, name, suspended)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

pub(crate) fn home() -> Result<PathBuf, RegistryError> {
    dirs::home_dir().ok_or(RegistryError::HomeNotFound)
}

#[cfg(unix)]
pub(crate) fn set_dir_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
pub(crate) fn set_dir_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

#[cfg(unix)]
pub(crate) fn set_file_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
pub(crate) fn set_file_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceSpec;
    use tempfile::TempDir;

    fn make_home() -> TempDir {
        TempDir::new().expect("tempdir")
    }

    fn unit(name: &str) -> ReconciliationUnit {
        ReconciliationUnit::new(
            name,
            SourceSpec {
                url: "./fleet".into(),
                reference: Default::default(),
            },
        )
    }

    #[test]
    fn unit_path_is_correct() {
        let home = make_home();
        let path = unit_path_at(home.path(), &UnitName::from("infra"));
        assert!(path.ends_with(".driftwood/units/infra.yaml"));
    }

    #[test]
    fn units_dir_created_with_perms() {
        let home = make_home();
        let dir = units_dir_at(home.path()).expect("units_dir_at");
        assert!(dir.exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o700);
        }
    }

    #[test]
    fn save_and_load_unit_roundtrip() {
        let home = make_home();
        let mut u = unit("apps");
        u.depends_on.insert(UnitName::from("infra"));
        u.prune = true;
        save_unit_at(home.path(), &u).expect("save");
        let loaded = load_unit_at(home.path(), &u.name).expect("load");
        assert_eq!(loaded, u);
    }

    #[test]
    fn atomic_write_cleans_up_tmp() {
        let home = make_home();
        save_unit_at(home.path(), &unit("infra")).expect("save");
        let tmp = unit_path_at(home.path(), &UnitName::from("infra"))
            .with_file_name("infra.yaml.tmp");
        assert!(!tmp.exists(), ".tmp must be gone after successful save");
    }

    #[test]
    fn add_twice_is_duplicate() {
        let home = make_home();
        add_unit_at(home.path(), &unit("infra")).expect("add");
        let err = add_unit_at(home.path(), &unit("infra")).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateUnit(_)));
    }

    #[test]
    fn remove_refused_while_referenced() {
        let home = make_home();
        add_unit_at(home.path(), &unit("infra")).expect("add infra");
        let mut apps = unit("apps");
        apps.depends_on.insert(UnitName::from("infra"));
        add_unit_at(home.path(), &apps).expect("add apps");

        let err = remove_unit_at(home.path(), &UnitName::from("infra")).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Dependency(DependencyError::StillReferenced { .. })
        ));

        remove_unit_at(home.path(), &UnitName::from("apps")).expect("remove apps");
        remove_unit_at(home.path(), &UnitName::from("infra")).expect("remove infra");
        assert!(list_units_at(home.path()).expect("list").is_empty());
    }

    #[test]
    fn scan_collects_broken_files_separately() {
        let home = make_home();
        add_unit_at(home.path(), &unit("infra")).expect("add");
        let broken = units_root(home.path()).join("broken.yaml");
        std::fs::write(&broken, ": : not yaml [").expect("write");

        let (units, errors) = scan_units_at(home.path()).expect("scan");
        assert_eq!(units.len(), 1);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, broken);
        assert!(list_units_at(home.path()).is_err());
    }

    #[test]
    fn name_must_match_file_stem() {
        let home = make_home();
        units_dir_at(home.path()).expect("dir");
        std::fs::write(
            units_root(home.path()).join("apps.yaml"),
            "name: other\nsource:\n  url: ./fleet\n",
        )
        .expect("write");
        let err = load_unit_at(home.path(), &UnitName::from("apps")).unwrap_err();
        assert!(matches!(err, RegistryError::NameMismatch { .. }));
    }

    #[test]
    fn suspend_flag_persists() {
        let home = make_home();
        add_unit_at(home.path(), &unit("apps")).expect("add");
        let u = set_suspended_at(home.path(), &UnitName::from("apps"), true).expect("suspend");
        assert!(u.suspended);
        let loaded = load_unit_at(home.path(), &UnitName::from("apps")).expect("load");
        assert!(loaded.suspended);
    }

    #[test]
    fn home_not_found_error_message() {
        assert!(RegistryError::HomeNotFound.to_string().contains("home directory"));
    }
}
