//! Size-based rotation of the daemon log files, driven by the
//! `log_rotation` section of the engine config.
//!
//! A rotated log moves to `<name>.1`; older copies shift up by one and
//! anything numbered past `keep` is removed, including copies left over from
//! a larger `keep` in an earlier config.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use driftwood_core::LogRotationConfig;

use crate::paths::{stderr_log_path, stdout_log_path};

/// What [`RotationPolicy::apply`] did to one log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rotation {
    /// Missing or below the size limit.
    Untouched,
    /// Over the limit with `keep = 0`: emptied in place.
    Truncated,
    /// Moved to the returned `.1` copy; a fresh empty log replaces it.
    Rotated(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    pub keep: usize,
}

impl From<&LogRotationConfig> for RotationPolicy {
    fn from(config: &LogRotationConfig) -> Self {
        Self {
            max_bytes: config.max_bytes.max(1),
            keep: config.keep,
        }
    }
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self::from(&LogRotationConfig::default())
    }
}

impl RotationPolicy {
    pub fn apply(&self, log: &Path) -> io::Result<Rotation> {
        let size = match fs::metadata(log) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Rotation::Untouched),
            Err(err) => return Err(err),
        };
        if size < self.max_bytes {
            return Ok(Rotation::Untouched);
        }
        if self.keep == 0 {
            fs::OpenOptions::new().write(true).open(log)?.set_len(0)?;
            return Ok(Rotation::Truncated);
        }

        // Highest number first, so every rename targets a free slot.
        for (n, copy) in rotated_copies(log)? {
            if n >= self.keep {
                fs::remove_file(&copy)?;
            } else {
                fs::rename(&copy, numbered(log, n + 1))?;
            }
        }
        let first = numbered(log, 1);
        fs::rename(log, &first)?;
        // The append writer reopens the log per event; it only needs to exist.
        fs::File::create(log)?;
        Ok(Rotation::Rotated(first))
    }
}

/// Rotate both daemon logs under `home`. Failures are logged, not returned.
pub fn rotate_logs(home: &Path, policy: &RotationPolicy) {
    for log in [stdout_log_path(home), stderr_log_path(home)] {
        match policy.apply(&log) {
            Ok(Rotation::Untouched) => {}
            Ok(Rotation::Truncated) => tracing::info!(path = %log.display(), "log file truncated"),
            Ok(Rotation::Rotated(copy)) => {
                tracing::info!(path = %log.display(), copy = %copy.display(), "log file rotated")
            }
            Err(err) => tracing::warn!(path = %log.display(), error = %err, "log rotation failed"),
        }
    }
}

fn numbered(log: &Path, n: usize) -> PathBuf {
    let mut name = log.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{n}"));
    log.with_file_name(name)
}

/// Existing `<name>.<n>` copies next to `log`, highest `n` first.
fn rotated_copies(log: &Path) -> io::Result<Vec<(usize, PathBuf)>> {
    let (Some(dir), Some(name)) = (log.parent(), log.file_name().and_then(|n| n.to_str())) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{name}.");
    let mut copies = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let n = file_name
            .to_str()
            .and_then(|f| f.strip_prefix(&prefix))
            .and_then(|suffix| suffix.parse::<usize>().ok())
            .filter(|n| *n > 0);
        if let Some(n) = n {
            copies.push((n, entry.path()));
        }
    }
    copies.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(copies)
}
