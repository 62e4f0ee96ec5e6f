use std::path::{Path, PathBuf};
use std::time::Duration;

pub use driftwood_core::registry::{driftwood_root, units_root};

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

pub const DAEMON_STDOUT_LOG: &str = "daemon.log";
pub const DAEMON_STDERR_LOG: &str = "daemon-err.log";
pub const DAEMON_SOCKET: &str = "daemon.sock";
pub const DAEMON_PID: &str = "daemon.pid";

pub fn run_dir(home: &Path) -> PathBuf {
    driftwood_root(home).join("run")
}

pub fn socket_path(home: &Path) -> PathBuf {
    driftwood_root(home).join(DAEMON_SOCKET)
}

pub fn pid_path(home: &Path) -> PathBuf {
    run_dir(home).join(DAEMON_PID)
}

pub fn logs_dir(home: &Path) -> PathBuf {
    driftwood_root(home).join("logs")
}

pub fn stdout_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDOUT_LOG)
}

pub fn stderr_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_STDERR_LOG)
}
