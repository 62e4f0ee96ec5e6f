//! `driftwood drift`: compare what each unit applied with the live target.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use driftwood_apply::{
    drift::{format_age, preview_objects},
    open_at, DriftReport, DriftSignal,
};
use driftwood_core::{config, registry, UnitName};

#[derive(Args, Debug)]
pub struct DriftArgs {
    /// Limit the check to one unit.
    pub unit: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct DriftRow {
    #[tabled(rename = "unit")]
    unit: String,
    #[tabled(rename = "signal")]
    signal: String,
    #[tabled(rename = "detail")]
    detail: String,
    #[tabled(rename = "revision")]
    revision: String,
    #[tabled(rename = "last apply")]
    last_apply: String,
}

impl DriftArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let config = config::load_at(&home).context("failed to load ~/.driftwood/config.yaml")?;

        let names: Vec<UnitName> = match self.unit {
            Some(unit) => {
                let name = UnitName::from(unit);
                registry::load_unit_at(&home, &name)
                    .with_context(|| format!("unit '{name}' is not registered"))?;
                vec![name]
            }
            None => registry::scan_units_at(&home)
                .context("failed to read the units directory")?
                .0
                .into_iter()
                .map(|u| u.name)
                .collect(),
        };

        let pipeline = open_at(&home, &config);
        let mut reports = Vec::with_capacity(names.len());
        for name in &names {
            reports.push(
                pipeline
                    .drift(name)
                    .with_context(|| format!("drift check failed for '{name}'"))?,
            );
        }

        if self.json {
            return super::print_json(&reports);
        }
        print_table(reports);
        Ok(())
    }
}

fn print_table(reports: Vec<DriftReport>) {
    if reports.is_empty() {
        println!("No units registered.");
        return;
    }

    let drifting = reports
        .iter()
        .filter(|r| matches!(r.signal, DriftSignal::Drifted { .. } | DriftSignal::Missing { .. }))
        .count();
    println!(
        "Indicators: {} IN SYNC  {} DRIFTED  {} MISSING  {} NEVER APPLIED",
        signal_indicator(&DriftSignal::InSync),
        signal_indicator(&DriftSignal::Drifted { objects: Vec::new() }),
        signal_indicator(&DriftSignal::Missing { objects: Vec::new() }),
        signal_indicator(&DriftSignal::NeverApplied),
    );

    let rows: Vec<DriftRow> = reports
        .into_iter()
        .map(|report| DriftRow {
            unit: report.unit.to_string(),
            signal: format!("{} {}", signal_indicator(&report.signal), signal_label(&report.signal)),
            detail: signal_detail(&report.signal),
            revision: report
                .revision
                .as_ref()
                .map(|r| r.short().to_string())
                .unwrap_or_else(|| "-".to_string()),
            last_apply: match report.signal {
                DriftSignal::NeverApplied => "never".to_string(),
                _ => format!("{} ago", format_age(report.applied_at)),
            },
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    if drifting > 0 {
        println!("Run 'driftwood reconcile' to restore drifted units.");
    }
}

fn signal_label(signal: &DriftSignal) -> &'static str {
    match signal {
        DriftSignal::NeverApplied => "NEVER APPLIED",
        DriftSignal::InSync => "IN SYNC",
        DriftSignal::Drifted { .. } => "DRIFTED",
        DriftSignal::Missing { .. } => "MISSING",
    }
}

fn signal_indicator(signal: &DriftSignal) -> String {
    match signal {
        DriftSignal::NeverApplied => "■".bright_black().bold().to_string(),
        DriftSignal::InSync => "■".green().bold().to_string(),
        DriftSignal::Drifted { .. } => "■".yellow().bold().to_string(),
        DriftSignal::Missing { .. } => "■".red().bold().to_string(),
    }
}

fn signal_detail(signal: &DriftSignal) -> String {
    match signal {
        DriftSignal::NeverApplied => "no applied records".to_string(),
        DriftSignal::InSync => "live objects match".to_string(),
        DriftSignal::Drifted { objects } => format!("{} edited", preview_objects(objects)),
        DriftSignal::Missing { objects } => format!("{} deleted", preview_objects(objects)),
    }
}
