//! `driftwood unit list|add|remove`

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use driftwood_core::{
    registry, DependencyGraph, GitRef, Interval, ReconciliationUnit, SourceSpec, UnitName,
};
use driftwood_source::local_path;

use crate::KeyValueArg;

#[derive(Subcommand, Debug)]
pub enum UnitCommand {
    /// List every registered unit.
    List(ListArgs),

    /// Register a new unit.
    Add(AddArgs),

    /// Delete a unit file. Refused while other units depend on it.
    Remove(RemoveArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Unit name: lowercase letters, digits and '-'.
    pub name: String,

    /// Git remote URL, `file://` URL or local directory.
    #[arg(long, short = 's')]
    pub source: String,

    /// Branch to track (default: main).
    #[arg(long, conflicts_with_all = ["tag", "commit"])]
    pub branch: Option<String>,

    #[arg(long, conflicts_with = "commit")]
    pub tag: Option<String>,

    #[arg(long)]
    pub commit: Option<String>,

    /// Directory inside the source to render.
    #[arg(long, default_value = ".")]
    pub path: PathBuf,

    /// Reconcile interval, e.g. `30s`, `10m`, `1h`.
    #[arg(long, default_value = "10m")]
    pub interval: Interval,

    /// Units that must succeed first (repeatable or comma-separated).
    #[arg(long = "depends-on", short = 'd', value_delimiter = ',')]
    pub depends_on: Vec<String>,

    /// Delete objects this unit applied earlier that are no longer declared.
    #[arg(long)]
    pub prune: bool,

    /// Pin every namespaced object to this namespace.
    #[arg(long = "namespace", short = 'n')]
    pub target_namespace: Option<String>,

    /// Per-step timeout override.
    #[arg(long)]
    pub timeout: Option<Interval>,

    /// Template variable (repeatable).
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub substitute: Vec<KeyValueArg>,

    /// Allow applying revisions older than the last applied one.
    #[arg(long)]
    pub force: bool,

    /// Register the unit suspended.
    #[arg(long)]
    pub suspended: bool,
}

#[derive(Args, Debug)]
pub struct RemoveArgs {
    pub name: String,
}

#[derive(Tabled)]
struct UnitRow {
    #[tabled(rename = "unit")]
    name: String,
    #[tabled(rename = "source")]
    source: String,
    #[tabled(rename = "ref")]
    reference: String,
    #[tabled(rename = "path")]
    path: String,
    #[tabled(rename = "interval")]
    interval: String,
    #[tabled(rename = "depends on")]
    depends_on: String,
    #[tabled(rename = "flags")]
    flags: String,
}

pub fn run(cmd: UnitCommand) -> Result<()> {
    match cmd {
        UnitCommand::List(args) => list(args),
        UnitCommand::Add(args) => add(args),
        UnitCommand::Remove(args) => remove(args),
    }
}

fn list(args: ListArgs) -> Result<()> {
    let home = super::home()?;
    let (units, errors) =
        registry::scan_units_at(&home).context("failed to read the units directory")?;

    if args.json {
        return super::print_json(&units);
    }

    if units.is_empty() {
        println!("No units registered.");
        println!("Run: driftwood unit add <name> --source <url>");
    } else {
        let rows: Vec<UnitRow> = units.iter().map(unit_row).collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
    }
    for (path, err) in errors {
        eprintln!("{} {}: {err}", "skipped".yellow().bold(), path.display());
    }
    Ok(())
}

fn unit_row(unit: &ReconciliationUnit) -> UnitRow {
    let mut flags = Vec::new();
    if unit.suspended {
        flags.push("suspended");
    }
    if unit.prune {
        flags.push("prune");
    }
    if unit.force {
        flags.push("force");
    }
    UnitRow {
        name: unit.name.to_string(),
        source: unit.source.url.clone(),
        reference: unit.source.reference.to_string(),
        path: unit.path.display().to_string(),
        interval: unit.interval.to_string(),
        depends_on: unit
            .depends_on
            .iter()
            .map(|d| d.0.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        flags: flags.join(","),
    }
}

fn add(args: AddArgs) -> Result<()> {
    let home = super::home()?;
    let unit = build_unit(args)?;

    // A new unit must not close a cycle with the registered ones.
    let (existing, _) =
        registry::scan_units_at(&home).context("failed to read the units directory")?;
    let mut graph = DependencyGraph::build(&existing).graph;
    graph
        .add_unit(&unit)
        .with_context(|| format!("cannot add unit '{}'", unit.name))?;
    let missing = graph.missing_dependencies(&unit.name);

    registry::add_unit_at(&home, &unit)
        .with_context(|| format!("failed to add unit '{}'", unit.name))?;

    println!("✓ Added unit '{}'", unit.name);
    println!(
        "  Saved to: {}",
        registry::unit_path_at(&home, &unit.name).display()
    );
    if !missing.is_empty() {
        let names: Vec<&str> = missing.iter().map(|m| m.0.as_str()).collect();
        println!(
            "  {} waits on units that are not registered yet: {}",
            "note:".yellow().bold(),
            names.join(", ")
        );
    }
    Ok(())
}

fn build_unit(args: AddArgs) -> Result<ReconciliationUnit> {
    let reference = match (args.branch, args.tag, args.commit) {
        (_, Some(tag), _) => GitRef::Tag(tag),
        (_, _, Some(commit)) => GitRef::Commit(commit),
        (Some(branch), _, _) => GitRef::Branch(branch),
        (None, None, None) => GitRef::default(),
    };
    let url = match local_path(&args.source) {
        Some(dir) => dir
            .canonicalize()
            .with_context(|| format!("source directory '{}' does not exist", dir.display()))?
            .display()
            .to_string(),
        None => args.source,
    };

    let mut unit = ReconciliationUnit::new(args.name, SourceSpec { url, reference });
    unit.path = args.path;
    unit.interval = args.interval;
    unit.depends_on = args
        .depends_on
        .into_iter()
        .map(|d| UnitName::from(d.trim()))
        .filter(|d| !d.0.is_empty())
        .collect::<BTreeSet<_>>();
    unit.prune = args.prune;
    unit.target_namespace = args.target_namespace;
    unit.timeout = args.timeout;
    unit.substitute = args
        .substitute
        .into_iter()
        .map(|kv| (kv.key, kv.value))
        .collect::<BTreeMap<_, _>>();
    unit.force = args.force;
    unit.suspended = args.suspended;
    Ok(unit)
}

fn remove(args: RemoveArgs) -> Result<()> {
    let home = super::home()?;
    let name = UnitName::from(args.name);
    registry::remove_unit_at(&home, &name)
        .with_context(|| format!("failed to remove unit '{name}'"))?;
    println!("✓ Removed unit '{name}'");
    Ok(())
}
