//! Driftwood: GitOps reconciliation engine CLI.
//!
//! # Usage
//!
//! ```text
//! driftwood init
//! driftwood unit list [--json]
//! driftwood unit add <name> --source <url> [--branch|--tag|--commit <ref>] [--path <dir>] ...
//! driftwood unit remove <name>
//! driftwood validate [--render]
//! driftwood get <unit> [--json]
//! driftwood history <unit> [--limit N] [--json]
//! driftwood suspend <unit>
//! driftwood resume <unit>
//! driftwood reconcile [<unit>] [--local] [--force] [--dry-run]
//! driftwood diff <unit>
//! driftwood drift [<unit>] [--json]
//! driftwood daemon start|stop|status|logs
//! ```

mod commands;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand,
    diff::DiffArgs,
    drift::DriftArgs,
    init::InitArgs,
    reconcile::ReconcileArgs,
    status::{GetArgs, HistoryArgs, SuspendArgs},
    unit::UnitCommand,
    validate::ValidateArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "driftwood",
    version,
    about = "Reconcile declared manifests from git sources into a target",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create ~/.driftwood with a default config.
    Init(InitArgs),

    /// Manage reconciliation units.
    Unit {
        #[command(subcommand)]
        command: UnitCommand,
    },

    /// Check unit files and the dependency graph.
    Validate(ValidateArgs),

    /// Show the current status of one unit.
    Get(GetArgs),

    /// Show the reconciliation history of one unit.
    History(HistoryArgs),

    /// Stop scheduling a unit.
    Suspend(SuspendArgs),

    /// Resume a suspended unit.
    Resume(SuspendArgs),

    /// Reconcile now, through the daemon or in-process with --local.
    Reconcile(ReconcileArgs),

    /// Show unified diffs of what a reconcile would change.
    Diff(DiffArgs),

    /// Compare applied objects with the live target.
    Drift(DriftArgs),

    /// Manage the driftwood background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Shared `key=value` argument for template substitutions
// ---------------------------------------------------------------------------

/// Thin wrapper so clap can parse `--set key=value`.
#[derive(Debug, Clone)]
pub struct KeyValueArg {
    pub key: String,
    pub value: String,
}

impl FromStr for KeyValueArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => Ok(Self {
                key: key.trim().to_string(),
                value: value.to_string(),
            }),
            _ => Err(format!("expected key=value, got '{s}'")),
        }
    }
}

impl fmt::Display for KeyValueArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Unit { command } => commands::unit::run(command),
        Commands::Validate(args) => args.run(),
        Commands::Get(args) => args.run(),
        Commands::History(args) => args.run(),
        Commands::Suspend(args) => args.run(true),
        Commands::Resume(args) => args.run(false),
        Commands::Reconcile(args) => args.run(),
        Commands::Diff(args) => args.run(),
        Commands::Drift(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_splits_on_first_equals() {
        let kv: KeyValueArg = "image=nginx:1.25=x".parse().unwrap();
        assert_eq!(kv.key, "image");
        assert_eq!(kv.value, "nginx:1.25=x");
        assert!("=value".parse::<KeyValueArg>().is_err());
        assert!("novalue".parse::<KeyValueArg>().is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
