//! `driftwood daemon`: background reconciler lifecycle.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use serde_json::Value;

use driftwood_daemon::paths::{socket_path, stderr_log_path, stdout_log_path};
use driftwood_daemon::{request_status, request_stop, start_blocking, DaemonError, LogOptions};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (scheduler + watcher + socket server).
    Start(DaemonStartArgs),
    /// Request graceful daemon shutdown over the Unix socket.
    Stop,
    /// Query daemon runtime status over the Unix socket.
    Status(DaemonStatusArgs),
    /// Print recent daemon log lines.
    Logs(DaemonLogsArgs),
}

#[derive(Args, Debug)]
pub struct DaemonStartArgs {
    /// Log to ~/.driftwood/logs/daemon.log instead of stderr.
    #[arg(long)]
    pub log_file: bool,

    /// Emit JSON log lines.
    #[arg(long)]
    pub json_logs: bool,
}

#[derive(Args, Debug)]
pub struct DaemonStatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct DaemonLogsArgs {
    /// Number of trailing lines to show.
    #[arg(long, default_value_t = 100)]
    pub lines: usize,

    /// Show only stderr log file.
    #[arg(long)]
    pub stderr_only: bool,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = super::home()?;

    match command {
        DaemonCommand::Start(args) => {
            let log = LogOptions {
                to_file: args.log_file,
                json: args.json_logs,
            };
            start_blocking(&home, log).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status(args) => {
            let status = match request_status(&home) {
                Ok(status) => status,
                Err(DaemonError::DaemonNotRunning { .. }) => serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                }),
                Err(err) => return Err(err).context("failed to query daemon status"),
            };
            if args.json {
                super::print_json(&status)?;
            } else {
                print_status(&status);
            }
        }
        DaemonCommand::Logs(args) => {
            if args.stderr_only {
                print_tail(&stderr_log_path(&home), args.lines)
                    .context("failed to read daemon stderr log")?;
            } else {
                print_tail(&stdout_log_path(&home), args.lines)
                    .context("failed to read daemon stdout log")?;
                print_tail(&stderr_log_path(&home), args.lines)
                    .context("failed to read daemon stderr log")?;
            }
        }
    }

    Ok(())
}

fn print_status(status: &Value) {
    if status["running"] != Value::Bool(true) {
        println!("{}", "daemon is not running".bright_black());
        println!("  socket: {}", status["socket"].as_str().unwrap_or_default());
        return;
    }
    println!("{} (pid {})", "daemon is running".green().bold(), status["pid"]);
    println!(
        "  units: {}  failing: {}  in flight: {}/{}",
        status["units"], status["failing"], status["in_flight"], status["max_in_flight"]
    );
    println!("  socket: {}", status["socket"].as_str().unwrap_or_default());
    println!("  units dir: {}", status["units_root"].as_str().unwrap_or_default());
}

fn print_tail(path: &std::path::Path, lines: usize) -> Result<()> {
    if !path.exists() {
        println!("log file not found: {}", path.display());
        return Ok(());
    }

    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut tail = VecDeque::<String>::new();
    for line in reader.lines() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        tail.push_back(line);
        if tail.len() > lines {
            tail.pop_front();
        }
    }

    println!("==> {} <==", path.display());
    for line in tail {
        println!("{line}");
    }
    Ok(())
}
