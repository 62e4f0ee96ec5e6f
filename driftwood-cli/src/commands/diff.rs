//! `driftwood diff <unit>`: show unified diffs for what a reconcile would change.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use driftwood_apply::{open_at, DiffKind};
use driftwood_core::{config, registry, UnitName};

#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Unit to diff.
    pub unit: String,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl DiffArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let name = UnitName::from(self.unit.as_str());
        let unit = registry::load_unit_at(&home, &name)
            .with_context(|| format!("unit '{name}' is not registered"))?;
        let config = config::load_at(&home).context("failed to load ~/.driftwood/config.yaml")?;

        let diffs = open_at(&home, &config)
            .diff(&unit)
            .with_context(|| format!("diff failed for '{name}'"))?;

        if self.json {
            return super::print_json(&diffs);
        }
        if diffs.is_empty() {
            println!("No differences for '{name}'.");
            return Ok(());
        }

        for diff in diffs {
            let label = match diff.kind {
                DiffKind::Create => "create".green(),
                DiffKind::Update => "update".yellow(),
                DiffKind::Prune => "prune".red(),
                DiffKind::Conflict => "conflict: owned by another unit".red().bold(),
            };
            println!("{} {}", format!("# {}", diff.id).bold(), label);
            print!("{}", diff.unified_diff);
            if !diff.unified_diff.ends_with('\n') {
                println!();
            }
        }

        Ok(())
    }
}
