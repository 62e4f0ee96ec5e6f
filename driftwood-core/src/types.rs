//! Domain types for the driftwood fleet.
//!
//! Units and engine configuration round-trip through serde_yaml; objects,
//! applied records and results round-trip through serde_json.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed reconciliation unit name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitName(pub String);

impl fmt::Display for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for UnitName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for UnitName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl UnitName {
    /// Unit names double as file stems and label values: lowercase
    /// alphanumerics and `-`, starting and ending alphanumeric, at most 63 chars.
    pub fn is_valid(&self) -> bool {
        let s = self.0.as_str();
        !s.is_empty()
            && s.len() <= 63
            && s.bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
            && !s.starts_with('-')
            && !s.ends_with('-')
    }
}

/// An immutable content identifier for a fetched source snapshot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Revision(pub String);

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Revision {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Revision {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl Revision {
    /// First 12 characters after any `algo:` prefix, for display.
    pub fn short(&self) -> &str {
        let digest = self.0.split_once(':').map(|(_, d)| d).unwrap_or(&self.0);
        &digest[..digest.len().min(12)]
    }
}

// ---------------------------------------------------------------------------
// Interval
// ---------------------------------------------------------------------------

/// A duration written the way operators write them: `30s`, `10m`, `1h30m`, `250ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval(pub Duration);

impl Interval {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl From<Duration> for Interval {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty duration".to_string());
        }
        if let Ok(secs) = s.parse::<u64>() {
            return Ok(Self::from_secs(secs));
        }

        let mut total = Duration::ZERO;
        let mut digits = String::new();
        let mut chars = s.chars().peekable();
        while let Some(c) = chars.next() {
            if c.is_ascii_digit() {
                digits.push(c);
                continue;
            }
            if digits.is_empty() {
                return Err(format!("invalid duration '{s}': unit without a number"));
            }
            let n: u64 = digits
                .parse()
                .map_err(|_| format!("invalid duration '{s}': number out of range"))?;
            digits.clear();
            let step = match c {
                'h' => Duration::from_secs(n * 3600),
                'm' if chars.peek() == Some(&'s') => {
                    chars.next();
                    Duration::from_millis(n)
                }
                'm' => Duration::from_secs(n * 60),
                's' => Duration::from_secs(n),
                other => return Err(format!("invalid duration '{s}': unknown unit '{other}'")),
            };
            total += step;
        }
        if !digits.is_empty() {
            return Err(format!("invalid duration '{s}': trailing number without a unit"));
        }
        Ok(Self(total))
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_ms = self.0.as_millis();
        if total_ms == 0 {
            return write!(f, "0s");
        }
        if total_ms % 1000 != 0 {
            return write!(f, "{total_ms}ms");
        }
        let mut secs = self.0.as_secs();
        let hours = secs / 3600;
        secs %= 3600;
        let minutes = secs / 60;
        secs %= 60;
        if hours > 0 {
            write!(f, "{hours}h")?;
        }
        if minutes > 0 {
            write!(f, "{minutes}m")?;
        }
        if secs > 0 {
            write!(f, "{secs}s")?;
        }
        Ok(())
    }
}

impl Serialize for Interval {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Interval {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Secs(u64),
            Text(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Secs(secs) => Ok(Interval::from_secs(secs)),
            Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Branch, tag or commit to track.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "GitRefRepr", into = "GitRefRepr")]
pub enum GitRef {
    Branch(String),
    Tag(String),
    Commit(String),
}

impl Default for GitRef {
    fn default() -> Self {
        GitRef::Branch("main".to_string())
    }
}

impl fmt::Display for GitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitRef::Branch(b) => write!(f, "branch/{b}"),
            GitRef::Tag(t) => write!(f, "tag/{t}"),
            GitRef::Commit(c) => write!(f, "commit/{c}"),
        }
    }
}

impl GitRef {
    /// The bare ref name (branch, tag or sha).
    pub fn name(&self) -> &str {
        match self {
            GitRef::Branch(s) | GitRef::Tag(s) | GitRef::Commit(s) => s,
        }
    }
}

/// On-disk shape: exactly one of `branch`, `tag`, `commit`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GitRefRepr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    commit: Option<String>,
}

impl TryFrom<GitRefRepr> for GitRef {
    type Error = String;

    fn try_from(repr: GitRefRepr) -> Result<Self, Self::Error> {
        match (repr.branch, repr.tag, repr.commit) {
            (Some(b), None, None) => Ok(GitRef::Branch(b)),
            (None, Some(t), None) => Ok(GitRef::Tag(t)),
            (None, None, Some(c)) => Ok(GitRef::Commit(c)),
            (None, None, None) => Ok(GitRef::default()),
            _ => Err("ref must set exactly one of branch, tag, commit".to_string()),
        }
    }
}

impl From<GitRef> for GitRefRepr {
    fn from(r: GitRef) -> Self {
        match r {
            GitRef::Branch(b) => GitRefRepr { branch: Some(b), ..Default::default() },
            GitRef::Tag(t) => GitRefRepr { tag: Some(t), ..Default::default() },
            GitRef::Commit(c) => GitRefRepr { commit: Some(c), ..Default::default() },
        }
    }
}

/// Where a unit's manifests come from.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceSpec {
    /// `file://` URL, plain directory path, or git remote URL.
    pub url: String,
    #[serde(default, rename = "ref")]
    pub reference: GitRef,
}

/// A fetched source: immutable once fetched, a new fetch produces a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub url: String,
    pub reference: GitRef,
    pub revision: Revision,
    pub fetched_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Units
// ---------------------------------------------------------------------------

/// Whether a unit's objects live cluster-wide or are pinned to one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetScope {
    Cluster,
    Namespace(String),
}

fn default_interval() -> Interval {
    Interval::from_secs(600)
}

fn default_path() -> PathBuf {
    PathBuf::from(".")
}

/// A named, independently scheduled source-to-target sync task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationUnit {
    pub name: UnitName,
    pub source: SourceSpec,
    /// Path inside the source tree to render.
    #[serde(default = "default_path")]
    pub path: PathBuf,
    #[serde(default = "default_interval")]
    pub interval: Interval,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<UnitName>,
    #[serde(default)]
    pub prune: bool,
    #[serde(default)]
    pub suspended: bool,
    /// Pins every namespaced object to this namespace when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
    /// Per-step timeout override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Interval>,
    /// Variables available to templated manifests.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub substitute: BTreeMap<String, String>,
    /// Permit re-applying a revision older than the last applied one.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force: bool,
}

impl ReconciliationUnit {
    /// A unit with defaults for everything but name and source.
    pub fn new(name: impl Into<UnitName>, source: SourceSpec) -> Self {
        Self {
            name: name.into(),
            source,
            path: default_path(),
            interval: default_interval(),
            depends_on: BTreeSet::new(),
            prune: false,
            suspended: false,
            target_namespace: None,
            timeout: None,
            substitute: BTreeMap::new(),
            force: false,
        }
    }

    pub fn target_scope(&self) -> TargetScope {
        match &self.target_namespace {
            Some(ns) => TargetScope::Namespace(ns.clone()),
            None => TargetScope::Cluster,
        }
    }
}

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

/// API group, version and kind of an object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Gvk {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    /// Split an `apiVersion` (`apps/v1`, `v1`) and pair it with `kind`.
    pub fn from_api_version(api_version: &str, kind: &str) -> Self {
        let (group, version) = match api_version.rsplit_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        Self {
            group,
            version,
            kind: kind.to_string(),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// Identity of an object in the target: gvk + namespace + name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    pub gvk: Gvk,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectId {
    pub fn new(gvk: Gvk, namespace: Option<String>, name: impl Into<String>) -> Self {
        Self {
            gvk,
            namespace,
            name: name.into(),
        }
    }

    /// Stable string key: `group/version/Kind/namespace/name`, `_` for cluster scope
    /// and for the core group.
    pub fn key(&self) -> String {
        let group = if self.gvk.group.is_empty() { "_" } else { &self.gvk.group };
        format!(
            "{}/{}/{}/{}/{}",
            group,
            self.gvk.version,
            self.gvk.kind,
            self.namespace.as_deref().unwrap_or("_"),
            self.name
        )
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.gvk.kind, ns, self.name),
            None => write!(f, "{}/{}", self.gvk.kind, self.name),
        }
    }
}

/// One object a unit wants to exist, produced fresh on every render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredObject {
    pub id: ObjectId,
    /// The full document (apiVersion, kind, metadata, spec...).
    pub payload: Value,
    pub owner: UnitName,
}

/// What a unit last applied for one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedRecord {
    pub unit: UnitName,
    pub id: ObjectId,
    pub payload: Value,
    pub revision: Revision,
    pub applied_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome status of a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileStatus {
    Succeeded,
    Failed,
    Suspended,
    Progressing,
}

impl fmt::Display for ReconcileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileStatus::Succeeded => write!(f, "succeeded"),
            ReconcileStatus::Failed => write!(f, "failed"),
            ReconcileStatus::Suspended => write!(f, "suspended"),
            ReconcileStatus::Progressing => write!(f, "progressing"),
        }
    }
}

/// Error taxonomy used for retry decisions and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    Source,
    Render,
    Dependency,
    Apply,
    Throttle,
}

impl ErrorClass {
    /// Dependency errors are configuration errors and never retried on a timer.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ErrorClass::Dependency)
    }

    /// The status a failure of this class is reported as.
    pub fn status(&self) -> ReconcileStatus {
        match self {
            ErrorClass::Throttle => ReconcileStatus::Progressing,
            _ => ReconcileStatus::Failed,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Source => write!(f, "SourceError"),
            ErrorClass::Render => write!(f, "RenderError"),
            ErrorClass::Dependency => write!(f, "DependencyError"),
            ErrorClass::Apply => write!(f, "ApplyError"),
            ErrorClass::Throttle => write!(f, "ThrottleError"),
        }
    }
}

/// Per-run object counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyCounts {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub pruned: usize,
    pub retained: usize,
    pub failed: usize,
}

/// One entry in a unit's append-only reconciliation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub unit: UnitName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
    pub status: ReconcileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub counts: ApplyCounts,
    pub timestamp: DateTime<Utc>,
}

impl ReconciliationResult {
    pub fn succeeded(unit: UnitName, revision: Revision, counts: ApplyCounts) -> Self {
        Self {
            unit,
            revision: Some(revision),
            status: ReconcileStatus::Succeeded,
            error_class: None,
            error: None,
            counts,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(
        unit: UnitName,
        revision: Option<Revision>,
        class: ErrorClass,
        error: impl Into<String>,
    ) -> Self {
        Self {
            unit,
            revision,
            status: class.status(),
            error_class: Some(class),
            error: Some(error.into()),
            counts: ApplyCounts::default(),
            timestamp: Utc::now(),
        }
    }

    pub fn suspended(unit: UnitName) -> Self {
        Self {
            unit,
            revision: None,
            status: ReconcileStatus::Suspended,
            error_class: None,
            error: None,
            counts: ApplyCounts::default(),
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_parses_compound_forms() {
        assert_eq!("10m".parse::<Interval>().unwrap(), Interval::from_secs(600));
        assert_eq!("1h30m".parse::<Interval>().unwrap(), Interval::from_secs(5400));
        assert_eq!("45".parse::<Interval>().unwrap(), Interval::from_secs(45));
        assert_eq!(
            "250ms".parse::<Interval>().unwrap(),
            Interval(Duration::from_millis(250))
        );
        assert!("10x".parse::<Interval>().is_err());
        assert!("m".parse::<Interval>().is_err());
        assert!("10m5".parse::<Interval>().is_err());
    }

    #[test]
    fn interval_displays_canonical_form() {
        assert_eq!(Interval::from_secs(5400).to_string(), "1h30m");
        assert_eq!(Interval::from_secs(30).to_string(), "30s");
        assert_eq!(Interval(Duration::from_millis(1500)).to_string(), "1500ms");
    }

    #[test]
    fn unit_name_validation() {
        assert!(UnitName::from("infra").is_valid());
        assert!(UnitName::from("apps-prod-2").is_valid());
        assert!(!UnitName::from("Apps").is_valid());
        assert!(!UnitName::from("-apps").is_valid());
        assert!(!UnitName::from("a/b").is_valid());
        assert!(!UnitName::from("").is_valid());
    }

    #[test]
    fn gvk_splits_api_version() {
        let core = Gvk::from_api_version("v1", "ConfigMap");
        assert_eq!(core.group, "");
        assert_eq!(core.api_version(), "v1");
        let apps = Gvk::from_api_version("apps/v1", "Deployment");
        assert_eq!(apps.group, "apps");
        assert_eq!(apps.to_string(), "apps/v1/Deployment");
    }

    #[test]
    fn object_key_marks_cluster_scope_and_core_group() {
        let ns = ObjectId::new(Gvk::from_api_version("v1", "Namespace"), None, "apps");
        assert_eq!(ns.key(), "_/v1/Namespace/_/apps");
        let dep = ObjectId::new(
            Gvk::from_api_version("apps/v1", "Deployment"),
            Some("apps".into()),
            "web",
        );
        assert_eq!(dep.key(), "apps/v1/Deployment/apps/web");
    }

    #[test]
    fn git_ref_yaml_shape() {
        let spec: SourceSpec =
            serde_yaml::from_str("url: https://example.com/fleet.git\nref:\n  tag: v1.2.0\n")
                .expect("parse");
        assert_eq!(spec.reference, GitRef::Tag("v1.2.0".into()));

        let defaulted: SourceSpec = serde_yaml::from_str("url: ./fleet\n").expect("parse");
        assert_eq!(defaulted.reference, GitRef::Branch("main".into()));

        let both = serde_yaml::from_str::<SourceSpec>("url: x\nref:\n  tag: a\n  branch: b\n");
        assert!(both.is_err());
    }

    #[test]
    fn unit_yaml_defaults() {
        let unit: ReconciliationUnit = serde_yaml::from_str(
            "name: apps\nsource:\n  url: ./fleet\npath: ./apps/production\ndepends_on: [infra]\n",
        )
        .expect("parse");
        assert_eq!(unit.interval, Interval::from_secs(600));
        assert!(!unit.prune);
        assert!(unit.depends_on.contains(&UnitName::from("infra")));
        assert_eq!(unit.target_scope(), TargetScope::Cluster);
    }

    #[test]
    fn throttle_class_reports_progressing() {
        assert_eq!(ErrorClass::Throttle.status(), ReconcileStatus::Progressing);
        assert_eq!(ErrorClass::Apply.status(), ReconcileStatus::Failed);
        assert!(!ErrorClass::Dependency.is_transient());
    }

    #[test]
    fn revision_short_strips_prefix() {
        assert_eq!(Revision::from("sha256:0123456789abcdef").short(), "0123456789ab");
        assert_eq!(Revision::from("abc").short(), "abc");
    }
}
