//! `driftwood validate [--render]`: check unit files and the dependency graph.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use driftwood_apply::open_at;
use driftwood_core::{config, registry, DependencyGraph, UnitName};

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Also fetch and render every unit.
    #[arg(long)]
    pub render: bool,
}

#[derive(Tabled)]
struct CheckRow {
    #[tabled(rename = "unit")]
    unit: String,
    #[tabled(rename = "result")]
    result: String,
    #[tabled(rename = "detail")]
    detail: String,
}

impl ValidateArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let config = config::load_at(&home).context("failed to load ~/.driftwood/config.yaml")?;
        let (units, errors) =
            registry::scan_units_at(&home).context("failed to read the units directory")?;

        let mut rows = Vec::new();
        let mut problems = 0usize;
        for (path, err) in &errors {
            problems += 1;
            rows.push(CheckRow {
                unit: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                result: "INVALID".red().bold().to_string(),
                detail: err.to_string(),
            });
        }

        let build = DependencyGraph::build(&units);
        let pipeline = self.render.then(|| open_at(&home, &config));
        for unit in &units {
            let rejected = build.rejected.iter().find(|(name, _)| *name == unit.name);
            let missing = build.graph.missing_dependencies(&unit.name);

            let (ok, detail) = if let Some((_, err)) = rejected {
                (false, err.to_string())
            } else if !missing.is_empty() {
                let (blocked, absent): (Vec<_>, Vec<_>) = missing
                    .iter()
                    .partition(|m| build.rejected.iter().any(|(name, _)| name == *m));
                let join = |v: &[&UnitName]| {
                    v.iter().map(|m| m.0.as_str()).collect::<Vec<_>>().join(", ")
                };
                let detail = if absent.is_empty() {
                    format!("depends on invalid unit(s): {}", join(&blocked[..]))
                } else {
                    format!("missing dependencies: {}", join(&absent[..]))
                };
                (false, detail)
            } else if let Some(pipeline) = &pipeline {
                match pipeline.render(unit, true) {
                    Ok((fetched, objects)) => (
                        true,
                        format!(
                            "{} object(s) at {}",
                            objects.len(),
                            fetched.source_ref.revision.short()
                        ),
                    ),
                    Err(err) => (false, err.to_string()),
                }
            } else {
                (true, String::new())
            };

            if !ok {
                problems += 1;
            }
            rows.push(CheckRow {
                unit: unit.name.to_string(),
                result: if ok {
                    "OK".green().bold().to_string()
                } else {
                    "INVALID".red().bold().to_string()
                },
                detail,
            });
        }

        if rows.is_empty() {
            println!("No units registered.");
            return Ok(());
        }
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");

        if problems > 0 {
            bail!("{problems} problem(s) found");
        }
        println!("✓ {} unit(s) valid", units.len());
        Ok(())
    }
}
