//! Engine configuration at `~/.driftwood/config.yaml`.
//!
//! Every field has a default, so a missing file or a partial file is valid.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::registry::{driftwood_root, home, set_dir_permissions, set_file_permissions, units_dir_at};
use crate::types::Interval;

/// Client-side rate limit towards the target API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Sustained requests per second.
    pub qps: f64,
    /// Requests allowed in a burst above the sustained rate.
    pub burst: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self { qps: 20.0, burst: 40 }
    }
}

/// Size-based rotation of the daemon's log files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogRotationConfig {
    /// Rotate a log once it reaches this many bytes.
    pub max_bytes: u64,
    /// Rotated copies kept per log. Zero truncates the log in place.
    pub keep: usize,
}

impl Default for LogRotationConfig {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            keep: 5,
        }
    }
}

/// Which target the engine applies objects to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum TargetConfig {
    /// Objects materialized as JSON files under `root`
    /// (default `~/.driftwood/cluster`).
    Directory {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        root: Option<PathBuf>,
    },
    /// Process-local store; state is lost on exit.
    Memory,
}

fn default_max_in_flight() -> usize {
    4
}
fn default_step_timeout() -> Interval {
    Interval::from_secs(300)
}
fn default_backoff_base() -> Interval {
    Interval::from_secs(5)
}
fn default_backoff_max() -> Interval {
    Interval::from_secs(300)
}
fn default_history_limit() -> usize {
    50
}
fn default_source_poll_interval() -> Interval {
    Interval::from_secs(60)
}
fn default_apply_parallelism() -> usize {
    4
}
fn default_target() -> TargetConfig {
    TargetConfig::Directory { root: None }
}

/// Process-wide engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum reconciliations running at once across all units.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_step_timeout")]
    pub step_timeout: Interval,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: Interval,
    #[serde(default = "default_backoff_max")]
    pub backoff_max: Interval,
    /// Results kept per unit in the status history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Minimum time between two fetches of the same source.
    #[serde(default = "default_source_poll_interval")]
    pub source_poll_interval: Interval,
    /// Objects of the same kind tier applied concurrently.
    #[serde(default = "default_apply_parallelism")]
    pub apply_parallelism: usize,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default = "default_target")]
    pub target: TargetConfig,
    #[serde(default)]
    pub log_rotation: LogRotationConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            step_timeout: default_step_timeout(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            history_limit: default_history_limit(),
            source_poll_interval: default_source_poll_interval(),
            apply_parallelism: default_apply_parallelism(),
            throttle: ThrottleConfig::default(),
            target: default_target(),
            log_rotation: LogRotationConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Resolved directory-target root, defaulting under `~/.driftwood/cluster`.
    pub fn directory_target_root(&self, home: &Path) -> Option<PathBuf> {
        match &self.target {
            TargetConfig::Directory { root } => Some(
                root.clone()
                    .unwrap_or_else(|| driftwood_root(home).join("cluster")),
            ),
            TargetConfig::Memory => None,
        }
    }
}

/// `<home>/.driftwood/config.yaml`
pub fn config_path_at(home: &Path) -> PathBuf {
    driftwood_root(home).join("config.yaml")
}

/// Load the engine config; a missing file yields defaults.
pub fn load_at(home: &Path) -> Result<EngineConfig, RegistryError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    let contents = std::fs::read_to_string(&path)?;
    if contents.trim().is_empty() {
        return Ok(EngineConfig::default());
    }
    serde_yaml::from_str(&contents).map_err(|e| RegistryError::Parse { path, source: e })
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<EngineConfig, RegistryError> {
    load_at(&home()?)
}

/// Atomically write the engine config.
pub fn save_at(home: &Path, config: &EngineConfig) -> Result<(), RegistryError> {
    let root = driftwood_root(home);
    if !root.exists() {
        std::fs::create_dir_all(&root)?;
        set_dir_permissions(&root)?;
    }
    let path = config_path_at(home);
    let tmp = root.join("config.yaml.tmp");
    std::fs::write(&tmp, serde_yaml::to_string(config)?)?;
    set_file_permissions(&tmp)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

/// Scaffold `~/.driftwood/` with a default config and an empty `units/`.
///
/// Idempotent: an existing config is loaded and returned unchanged.
pub fn init_at(home: &Path) -> Result<EngineConfig, RegistryError> {
    units_dir_at(home)?;
    let path = config_path_at(home);
    if path.exists() {
        return load_at(home);
    }
    let config = EngineConfig::default();
    save_at(home, &config)?;
    Ok(config)
}

/// `init_at` convenience wrapper.
pub fn init() -> Result<EngineConfig, RegistryError> {
    init_at(&home()?)
}
