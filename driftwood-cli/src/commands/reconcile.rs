//! `driftwood reconcile [<unit>] [--local] [--force] [--dry-run]`
//!
//! Without `--local` the request is queued on the running daemon. With
//! `--local` (or when no daemon is running) the units are reconciled in this
//! process and the results appended to the status history.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use driftwood_apply::{open_at, PipelineError, RunOptions};
use driftwood_core::{
    config, registry, ReconcileStatus, ReconciliationResult, StatusReporter, UnitName,
};
use driftwood_daemon::{request_reconcile, DaemonError};

use super::{print_json, status::load_reporter, status_label};

#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Unit to reconcile; every unit when omitted.
    pub unit: Option<String>,

    /// Run in this process instead of asking the daemon.
    #[arg(long)]
    pub local: bool,

    /// Allow applying a revision older than the last applied one, this run only.
    #[arg(long)]
    pub force: bool,

    /// Compute changes without writing to the target (implies --local).
    #[arg(long)]
    pub dry_run: bool,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct ResultRow {
    #[tabled(rename = "unit")]
    unit: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "revision")]
    revision: String,
    #[tabled(rename = "created")]
    created: usize,
    #[tabled(rename = "updated")]
    updated: usize,
    #[tabled(rename = "unchanged")]
    unchanged: usize,
    #[tabled(rename = "pruned")]
    pruned: usize,
    #[tabled(rename = "error")]
    error: String,
}

impl ReconcileArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;

        if !self.local && !self.dry_run {
            match request_reconcile(&home, self.unit.clone(), self.force) {
                Ok(queued) => return self.print_queued(&queued),
                Err(DaemonError::DaemonNotRunning { .. }) => {
                    if !self.json {
                        println!(
                            "{}",
                            "daemon is not running; reconciling in this process".bright_black()
                        );
                    }
                }
                Err(err) => return Err(err).context("failed to queue reconcile"),
            }
        }

        let results = self.run_local(&home)?;
        if self.json {
            print_json(&results)?;
        } else {
            print_results(&results, self.dry_run);
        }

        let failed = results
            .iter()
            .filter(|r| r.status == ReconcileStatus::Failed)
            .count();
        if failed > 0 {
            bail!("{failed} unit(s) failed to reconcile");
        }
        Ok(())
    }

    fn print_queued(&self, queued: &Value) -> Result<()> {
        if self.json {
            return print_json(queued);
        }
        let names: Vec<&str> = queued["queued"]
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        if names.is_empty() {
            println!("Nothing to reconcile.");
        } else {
            println!("✓ Queued: {}", names.join(", "));
        }
        Ok(())
    }

    fn run_local(&self, home: &Path) -> Result<Vec<ReconciliationResult>> {
        let config = config::load_at(home).context("failed to load ~/.driftwood/config.yaml")?;
        let (mut units, errors) =
            registry::scan_units_at(home).context("failed to read the units directory")?;
        for (path, err) in &errors {
            eprintln!("{} {}: {err}", "skipped".yellow().bold(), path.display());
        }
        if self.force {
            for unit in &mut units {
                unit.force = true;
            }
        }

        let pipeline = open_at(home, &config);
        let opts = RunOptions {
            fresh_source: true,
            dry_run: self.dry_run,
            cancel: None,
        };
        let mut reporter = load_reporter(home)?;

        let results = match &self.unit {
            None => pipeline.reconcile_all(&units, &opts),
            Some(name) => {
                let name = UnitName::from(name.as_str());
                let Some(unit) = units.iter().find(|u| u.name == name) else {
                    bail!("unit '{name}' is not registered");
                };
                let waiting = unsettled_dependencies(&reporter, &unit.depends_on);
                let result = if waiting.is_empty() {
                    pipeline.run(unit, &opts, &|_| {})
                } else {
                    let err = PipelineError::NotReady { waiting };
                    ReconciliationResult::failed(name, None, err.class(), err.to_string())
                };
                vec![result]
            }
        };

        if !self.dry_run {
            for result in &results {
                reporter
                    .record(result.clone())
                    .with_context(|| format!("failed to record result for '{}'", result.unit))?;
            }
        }
        Ok(results)
    }
}

/// Dependencies whose latest recorded result is not a success.
fn unsettled_dependencies(
    reporter: &StatusReporter,
    depends_on: &BTreeSet<UnitName>,
) -> Vec<UnitName> {
    depends_on
        .iter()
        .filter(|dep| {
            reporter
                .get(dep)
                .map_or(true, |r| r.status != ReconcileStatus::Succeeded)
        })
        .cloned()
        .collect()
}

fn print_results(results: &[ReconciliationResult], dry_run: bool) {
    if results.is_empty() {
        println!("No units registered. Run `driftwood unit add` first.");
        return;
    }
    if dry_run {
        println!("{}", "[dry-run] nothing was written to the target".bright_black());
    }
    let rows: Vec<ResultRow> = results
        .iter()
        .map(|r| ResultRow {
            unit: r.unit.to_string(),
            status: status_label(&r.status.to_string()),
            revision: r
                .revision
                .as_ref()
                .map(|rev| rev.short().to_string())
                .unwrap_or_else(|| "-".to_string()),
            created: r.counts.created,
            updated: r.counts.updated,
            unchanged: r.counts.unchanged,
            pruned: r.counts.pruned,
            error: r.error.clone().unwrap_or_default(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}
