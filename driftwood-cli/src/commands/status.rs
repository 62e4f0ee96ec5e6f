//! `driftwood get`, `history`, `suspend`, `resume`.
//!
//! Each command asks the daemon first. When no daemon is running the answer
//! comes from the unit files and the persisted status history instead.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::{json, Value};
use tabled::{settings::Style, Table, Tabled};

use driftwood_core::{config, registry, ReconciliationResult, StatusReporter, UnitName};
use driftwood_daemon::{request, DaemonError, DaemonRequest};

use super::{age_of, print_json, status_label};

const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Args, Debug)]
pub struct GetArgs {
    pub unit: String,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    pub unit: String,

    /// Number of most recent results to show.
    #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
    pub limit: usize,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct SuspendArgs {
    pub unit: String,
}

#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "when")]
    when: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "revision")]
    revision: String,
    #[tabled(rename = "changes")]
    changes: String,
    #[tabled(rename = "error")]
    error: String,
}

impl GetArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let status = match request(&home, &DaemonRequest::for_unit("get", &self.unit)) {
            Ok(status) => status,
            Err(DaemonError::DaemonNotRunning { .. }) => local_status(&home, &self.unit)?,
            Err(err) => return Err(err).with_context(|| format!("get '{}' failed", self.unit)),
        };

        if self.json {
            return print_json(&status);
        }
        print_status(&status);
        Ok(())
    }
}

impl HistoryArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let req = DaemonRequest {
            limit: Some(self.limit),
            ..DaemonRequest::for_unit("history", &self.unit)
        };
        let history: Vec<ReconciliationResult> = match request(&home, &req) {
            Ok(value) => {
                serde_json::from_value(value).context("daemon sent a malformed history")?
            }
            Err(DaemonError::DaemonNotRunning { .. }) => {
                let name = UnitName::from(self.unit.as_str());
                registry::load_unit_at(&home, &name)
                    .with_context(|| format!("unit '{name}' is not registered"))?;
                load_reporter(&home)?.history(&name, self.limit)
            }
            Err(err) => return Err(err).with_context(|| format!("history '{}' failed", self.unit)),
        };

        if self.json {
            return print_json(&history);
        }
        if history.is_empty() {
            println!("No reconciliations recorded for '{}'.", self.unit);
            return Ok(());
        }
        let rows: Vec<HistoryRow> = history.iter().map(history_row).collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

impl SuspendArgs {
    pub fn run(self, suspend: bool) -> Result<()> {
        let home = super::home()?;
        let cmd = if suspend { "suspend" } else { "resume" };
        match request(&home, &DaemonRequest::for_unit(cmd, &self.unit)) {
            Ok(_) => {}
            Err(DaemonError::DaemonNotRunning { .. }) => {
                registry::set_suspended_at(&home, &UnitName::from(self.unit.as_str()), suspend)
                    .with_context(|| format!("{cmd} '{}' failed", self.unit))?;
            }
            Err(err) => return Err(err).with_context(|| format!("{cmd} '{}' failed", self.unit)),
        }
        if suspend {
            println!("✓ Suspended '{}'", self.unit);
        } else {
            println!("✓ Resumed '{}'", self.unit);
        }
        Ok(())
    }
}

pub(crate) fn load_reporter(home: &Path) -> Result<StatusReporter> {
    let limit = config::load_at(home)
        .context("failed to load ~/.driftwood/config.yaml")?
        .history_limit;
    StatusReporter::load_at(home, limit).context("failed to load status history")
}

/// The daemon's `get` payload, rebuilt from files.
fn local_status(home: &Path, unit: &str) -> Result<Value> {
    let name = UnitName::from(unit);
    let unit = registry::load_unit_at(home, &name)
        .with_context(|| format!("unit '{name}' is not registered"))?;
    let reporter = load_reporter(home)?;
    let phase = if unit.suspended { "suspended" } else { "idle" };
    Ok(json!({
        "unit": name,
        "phase": phase,
        "suspended": unit.suspended,
        "failures": 0,
        "daemon": false,
        "last": reporter.get(&name),
    }))
}

fn print_status(status: &Value) {
    let unit = status["unit"].as_str().unwrap_or_default();
    let phase = status["phase"].as_str().unwrap_or("unknown");
    println!("{}  {}", unit.bold(), status_label(phase));

    if status["daemon"] == Value::Bool(false) {
        println!("  {}", "daemon is not running; showing recorded state".bright_black());
    }
    if let Some(reason) = status["blocked"].as_str() {
        println!("  {} {reason}", "blocked:".red().bold());
    }
    if let Some(waiting) = status["waiting_on"].as_array().filter(|w| !w.is_empty()) {
        let names: Vec<&str> = waiting.iter().filter_map(Value::as_str).collect();
        println!("  waiting on: {}", names.join(", "));
    }
    if let Some(secs) = status["next_run_in_secs"].as_u64() {
        println!("  next run in: {secs}s");
    }
    if let Some(failures) = status["failures"].as_u64().filter(|f| *f > 0) {
        println!("  consecutive failures: {failures}");
    }
    if status["retained"].as_bool() == Some(true) {
        println!("  retained: removed from units/ but still depended on");
    }

    let last = &status["last"];
    if last.is_null() {
        println!("  last reconcile: never");
        return;
    }
    println!(
        "  last reconcile: {} {}",
        status_label(last["status"].as_str().unwrap_or_default()),
        age_of(last["timestamp"].as_str())
    );
    if let Some(revision) = last["revision"].as_str() {
        println!("  revision: {revision}");
    }
    if let Some(error) = last["error"].as_str() {
        let class = last["error_class"].as_str().unwrap_or("error");
        println!("  {} {error}", format!("{class}:").red());
    }
    let counts = &last["counts"];
    if counts.is_object() {
        println!(
            "  objects: {} created, {} updated, {} unchanged, {} pruned, {} failed",
            counts["created"], counts["updated"], counts["unchanged"], counts["pruned"],
            counts["failed"]
        );
    }
}

fn history_row(result: &ReconciliationResult) -> HistoryRow {
    let counts = result.counts;
    HistoryRow {
        when: result.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
        status: status_label(&result.status.to_string()),
        revision: result
            .revision
            .as_ref()
            .map(|r| r.short().to_string())
            .unwrap_or_else(|| "-".to_string()),
        changes: format!(
            "+{} ~{} -{}",
            counts.created, counts.updated, counts.pruned
        ),
        error: result.error.clone().unwrap_or_default(),
    }
}
