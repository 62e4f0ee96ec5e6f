pub mod daemon;
pub mod diff;
pub mod drift;
pub mod init;
pub mod reconcile;
pub mod status;
pub mod unit;
pub mod validate;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;

use driftwood_apply::drift::format_age;

pub(crate) fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to serialize JSON output")?
    );
    Ok(())
}

/// Colored label for a result status or scheduler phase string.
pub(crate) fn status_label(status: &str) -> String {
    let upper = status.to_uppercase();
    match status {
        "succeeded" => upper.green().bold().to_string(),
        "failed" => upper.red().bold().to_string(),
        "progressing" | "fetching" | "rendering" | "applying" => upper.yellow().bold().to_string(),
        "suspended" => upper.bright_black().bold().to_string(),
        _ => upper,
    }
}

/// `5m ago` from an RFC 3339 timestamp, `never` when absent.
pub(crate) fn age_of(timestamp: Option<&str>) -> String {
    timestamp
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| format!("{} ago", format_age(t.with_timezone(&Utc))))
        .unwrap_or_else(|| "never".to_string())
}
