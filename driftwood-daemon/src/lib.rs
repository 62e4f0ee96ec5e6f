//! driftwood daemon: reconciliation scheduler, watcher triggers and the
//! control socket.

mod error;
pub mod log_rotation;
pub mod logging;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod scheduler;

pub use error::DaemonError;
pub use logging::init_tracing;
pub use protocol::{
    request, request_reconcile, request_status, request_stop, send_request, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{run, run_with, start_blocking, LogOptions};
pub use scheduler::{Backoff, Dispatch, Phase, ReloadReport, Scheduler, UnitStatus};
