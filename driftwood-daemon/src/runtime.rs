use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time::Instant;

use driftwood_apply::{open_at, Pipeline, RunOptions, Step, TargetApi};
use driftwood_core::{
    config, registry, EngineConfig, ErrorClass, Interval, ReconcileStatus, ReconciliationResult,
    StatusReporter, UnitName,
};
use driftwood_source::SourceFetcher;

use crate::error::{io_err, DaemonError};
use crate::log_rotation::{rotate_logs, RotationPolicy};
use crate::logging::init_tracing;
use crate::paths::{
    logs_dir, pid_path, run_dir, socket_path, stdout_log_path, units_root, DEBOUNCE_WINDOW,
};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::scheduler::{Backoff, Dispatch, ReloadReport, Scheduler};

/// Longest the dispatch loop sleeps when no timer is armed.
const IDLE_POLL: Duration = Duration::from_secs(60);

const DEFAULT_HISTORY_LIMIT: usize = 10;

/// How the daemon process writes its logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    /// Write to `~/.driftwood/logs/daemon.log` instead of stderr.
    pub to_file: bool,
    pub json: bool,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path, log: LogOptions) -> Result<(), DaemonError> {
    ensure_runtime_dirs(home)?;
    let log_file = log.to_file.then(|| stdout_log_path(home));
    init_tracing(log_file.as_deref(), log.json);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon against the configured target until stopped.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    let config = config::load_at(&home)?;
    let pipeline = open_at(&home, &config);
    run_with(home, config, pipeline).await
}

/// Run the daemon with an explicit pipeline.
pub async fn run_with<F, T>(
    home: PathBuf,
    config: EngineConfig,
    pipeline: Pipeline<F, T>,
) -> Result<(), DaemonError>
where
    F: SourceFetcher + 'static,
    T: TargetApi + 'static,
{
    ensure_runtime_dirs(&home)?;
    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let daemon = Daemon::new(&home, config, pipeline, shutdown_tx.clone())?;
    daemon.reload().await?;
    write_pid_file(&home)?;
    tracing::info!(home = %home.display(), "driftwood daemon started");

    let scheduler_handle = {
        let shutdown = shutdown_tx.clone();
        let daemon = daemon.clone();
        tokio::spawn(async move {
            let result = daemon.dispatch_loop(shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let daemon = daemon.clone();
        tokio::spawn(async move {
            let result = watcher_task(daemon, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let daemon = daemon.clone();
        tokio::spawn(async move {
            let result = socket_server_task(daemon, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let rotation_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let policy = RotationPolicy::from(&daemon.config.log_rotation);
        tokio::spawn(async move {
            let result = log_rotation_task(home, policy, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (scheduler_result, watcher_result, socket_result, rotation_result, signal_result) = tokio::join!(
        scheduler_handle,
        watcher_handle,
        socket_handle,
        rotation_handle,
        signal_handle
    );

    let pid = pid_path(&home);
    if pid.exists() {
        let _ = fs::remove_file(&pid);
    }
    tracing::info!("driftwood daemon stopped");

    handle_join("scheduler", scheduler_result)?;
    handle_join("watcher", watcher_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("log_rotation", rotation_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared daemon state
// ---------------------------------------------------------------------------

struct Daemon<F: SourceFetcher, T: TargetApi> {
    home: PathBuf,
    config: Arc<EngineConfig>,
    pipeline: Arc<Pipeline<F, T>>,
    scheduler: Arc<Mutex<Scheduler>>,
    wake: Arc<Notify>,
    roots: Arc<watch::Sender<BTreeSet<PathBuf>>>,
    shutdown: broadcast::Sender<()>,
    started_at_unix: u64,
}

impl<F: SourceFetcher, T: TargetApi> Clone for Daemon<F, T> {
    fn clone(&self) -> Self {
        Self {
            home: self.home.clone(),
            config: Arc::clone(&self.config),
            pipeline: Arc::clone(&self.pipeline),
            scheduler: Arc::clone(&self.scheduler),
            wake: Arc::clone(&self.wake),
            roots: Arc::clone(&self.roots),
            shutdown: self.shutdown.clone(),
            started_at_unix: self.started_at_unix,
        }
    }
}

impl<F, T> Daemon<F, T>
where
    F: SourceFetcher + 'static,
    T: TargetApi + 'static,
{
    fn new(
        home: &Path,
        config: EngineConfig,
        pipeline: Pipeline<F, T>,
        shutdown: broadcast::Sender<()>,
    ) -> Result<Self, DaemonError> {
        let status = StatusReporter::load_at(home, config.history_limit)?;
        let scheduler = Scheduler::new(home, status, Backoff::from_config(&config));
        let (roots, _) = watch::channel(BTreeSet::new());
        Ok(Self {
            home: home.to_path_buf(),
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
            scheduler: Arc::new(Mutex::new(scheduler)),
            wake: Arc::new(Notify::new()),
            roots: Arc::new(roots),
            shutdown,
            started_at_unix: unix_seconds_now(),
        })
    }

    /// Re-read `units/` and hand the result to the scheduler. A unit whose
    /// file no longer parses keeps its previous definition.
    async fn reload(&self) -> Result<ReloadReport, DaemonError> {
        let home = self.home.clone();
        let (mut units, errors) = tokio::task::spawn_blocking(move || registry::scan_units_at(&home))
            .await
            .map_err(|err| DaemonError::Protocol(format!("unit scan join error: {err}")))??;

        let (report, forgotten, roots) = {
            let mut scheduler = self.scheduler.lock().await;
            for (path, err) in &errors {
                tracing::warn!(path = %path.display(), error = %err, "skipping unreadable unit file");
                let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
                if let Some(previous) = scheduler.unit(&UnitName::from(stem)) {
                    units.push(previous.clone());
                }
            }
            let report = scheduler.reload(units, Instant::now());
            (report, scheduler.take_forgotten(), scheduler.local_source_roots())
        };

        if !report.is_empty() {
            tracing::info!(
                added = report.added.len(),
                removed = report.removed.len(),
                changed = report.changed.len(),
                retained = report.retained.len(),
                rejected = report.rejected.len(),
                "unit set reloaded",
            );
        }
        self.forget(forgotten).await;
        self.roots.send_replace(roots);
        self.wake.notify_one();
        Ok(report)
    }

    async fn forget(&self, units: Vec<UnitName>) {
        for unit in units {
            let pipeline = Arc::clone(&self.pipeline);
            let name = unit.clone();
            let result = tokio::task::spawn_blocking(move || pipeline.forget(&name)).await;
            match result {
                Ok(Ok(())) => tracing::info!(unit = %unit, "forgot applied records of removed unit"),
                Ok(Err(err)) => tracing::warn!(unit = %unit, error = %err, "failed to drop applied records"),
                Err(err) => tracing::warn!(unit = %unit, error = %err, "forget task join failure"),
            }
        }
    }

    /// Start due units until shutdown, then cancel and drain in-flight runs.
    async fn dispatch_loop(
        &self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), DaemonError> {
        let max_in_flight = self.config.max_in_flight.max(1);
        let mut tasks = JoinSet::new();

        loop {
            let (dispatches, next_wake) = {
                let mut scheduler = self.scheduler.lock().await;
                let slots = max_in_flight.saturating_sub(scheduler.running());
                let dispatches = scheduler.due(Instant::now(), slots);
                // With every slot taken, a finishing run wakes the loop instead.
                let saturated = scheduler.running() >= max_in_flight;
                (dispatches, scheduler.next_wake().filter(|_| !saturated))
            };
            for dispatch in dispatches {
                let daemon = self.clone();
                tasks.spawn(async move { daemon.run_dispatch(dispatch).await });
            }

            let sleep_until = next_wake
                .unwrap_or_else(|| Instant::now() + IDLE_POLL)
                .min(Instant::now() + IDLE_POLL);
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep_until(sleep_until) => {}
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(err) = joined {
                        tracing::error!(error = %err, "reconcile task join failure");
                    }
                }
            }
        }

        let cancelled = self.scheduler.lock().await.cancel_all();
        if cancelled > 0 {
            tracing::info!(in_flight = cancelled, "waiting for in-flight reconciliations");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "reconcile task join failure");
            }
        }
        Ok(())
    }

    /// One run of one unit, with a per-step watchdog.
    async fn run_dispatch(&self, dispatch: Dispatch) {
        let name = dispatch.unit.name.clone();
        let timeout = dispatch
            .unit
            .timeout
            .unwrap_or(self.config.step_timeout)
            .as_duration();
        tracing::info!(
            unit = %name,
            triggered = dispatch.triggered,
            force = dispatch.unit.force,
            "reconciliation started",
        );

        let (step_tx, mut step_rx) = mpsc::unbounded_channel::<Step>();
        let pipeline = Arc::clone(&self.pipeline);
        let unit = dispatch.unit.clone();
        let opts = RunOptions {
            fresh_source: dispatch.fresh_source,
            dry_run: false,
            cancel: Some(Arc::clone(&dispatch.cancel)),
        };
        let mut handle = tokio::task::spawn_blocking(move || {
            pipeline.run(&unit, &opts, &move |step| {
                let _ = step_tx.send(step);
            })
        });

        let mut current = Step::Fetch;
        let mut deadline = Instant::now() + timeout;
        let mut steps_open = true;
        let mut timed_out = None;
        let joined = loop {
            tokio::select! {
                joined = &mut handle => break joined,
                step = step_rx.recv(), if steps_open => match step {
                    Some(step) => {
                        current = step;
                        deadline = Instant::now() + timeout;
                        self.scheduler.lock().await.step(&name, step);
                    }
                    None => steps_open = false,
                },
                _ = tokio::time::sleep_until(deadline), if timed_out.is_none() => {
                    tracing::warn!(unit = %name, step = ?current, "step timed out; cancelling");
                    dispatch.cancel.store(true, Ordering::SeqCst);
                    timed_out = Some(current);
                }
            }
        };

        let mut result = match joined {
            Ok(result) => result,
            Err(err) => ReconciliationResult::failed(
                name.clone(),
                None,
                ErrorClass::Apply,
                format!("reconcile task failed: {err}"),
            ),
        };
        if let Some(step) = timed_out.filter(|_| result.status != ReconcileStatus::Succeeded) {
            result = timeout_result(&name, result.revision.clone(), step, timeout);
        }

        tracing::info!(
            unit = %name,
            status = %result.status,
            error = result.error.as_deref().unwrap_or(""),
            "reconciliation finished",
        );
        self.scheduler
            .lock()
            .await
            .complete(&name, result, Instant::now());
        self.wake.notify_one();
    }

    // -----------------------------------------------------------------------
    // Control requests
    // -----------------------------------------------------------------------

    async fn handle_request(&self, request: DaemonRequest) -> DaemonResponse {
        match self.execute(&request).await {
            Ok(data) => DaemonResponse::ok(data),
            Err(err) => DaemonResponse::error(err.to_string()),
        }
    }

    async fn execute(&self, request: &DaemonRequest) -> Result<Value, DaemonError> {
        let unit = || {
            request
                .unit
                .as_deref()
                .map(UnitName::from)
                .ok_or_else(|| DaemonError::Protocol(format!("'{}' requires a unit", request.cmd)))
        };

        match request.cmd.as_str() {
            "status" => Ok(self.status_payload().await),
            "list" => {
                let scheduler = self.scheduler.lock().await;
                Ok(json!(scheduler.snapshot(Instant::now())))
            }
            "get" => {
                let name = unit()?;
                let scheduler = self.scheduler.lock().await;
                let status = scheduler
                    .get(&name, Instant::now())
                    .ok_or(DaemonError::UnknownUnit(name))?;
                Ok(json!(status))
            }
            "history" => {
                let name = unit()?;
                let limit = request.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
                let scheduler = self.scheduler.lock().await;
                if scheduler.unit(&name).is_none() {
                    return Err(DaemonError::UnknownUnit(name));
                }
                Ok(json!(scheduler.history(&name, limit)))
            }
            "suspend" => {
                let name = unit()?;
                self.scheduler.lock().await.suspend(&name)?;
                self.publish_roots().await;
                Ok(json!({ "unit": name, "suspended": true }))
            }
            "resume" => {
                let name = unit()?;
                self.scheduler.lock().await.resume(&name, Instant::now())?;
                self.publish_roots().await;
                self.wake.notify_one();
                Ok(json!({ "unit": name, "suspended": false }))
            }
            "reconcile" => {
                let force = request.force.unwrap_or(false);
                let queued = {
                    let mut scheduler = self.scheduler.lock().await;
                    match request.unit.as_deref() {
                        Some(name) => {
                            let name = UnitName::from(name);
                            scheduler.trigger(&name, force)?;
                            vec![name]
                        }
                        None => scheduler.trigger_all(force),
                    }
                };
                self.wake.notify_one();
                Ok(json!({ "queued": queued, "force": force }))
            }
            "reload" => Ok(json!(self.reload().await?)),
            "stop" => {
                let _ = self.shutdown.send(());
                Ok(json!({ "stopping": true }))
            }
            other => Err(DaemonError::Protocol(format!("unknown command '{other}'"))),
        }
    }

    async fn publish_roots(&self) {
        let roots = self.scheduler.lock().await.local_source_roots();
        self.roots.send_replace(roots);
    }

    async fn status_payload(&self) -> Value {
        let scheduler = self.scheduler.lock().await;
        let units = scheduler.snapshot(Instant::now());
        let failing = units
            .iter()
            .filter(|u| {
                u.last
                    .as_ref()
                    .is_some_and(|r| r.status == ReconcileStatus::Failed)
            })
            .count();
        json!({
            "running": true,
            "pid": std::process::id(),
            "started_at_unix": self.started_at_unix,
            "units": units.len(),
            "failing": failing,
            "in_flight": scheduler.running(),
            "max_in_flight": self.config.max_in_flight,
            "socket": socket_path(&self.home).display().to_string(),
            "units_root": units_root(&self.home).display().to_string(),
        })
    }
}

fn timeout_result(
    unit: &UnitName,
    revision: Option<driftwood_core::Revision>,
    step: Step,
    timeout: Duration,
) -> ReconciliationResult {
    let (class, label) = match step {
        Step::Fetch => (ErrorClass::Source, "fetch"),
        Step::Render => (ErrorClass::Render, "render"),
        Step::Apply => (ErrorClass::Apply, "apply"),
    };
    ReconciliationResult::failed(
        unit.clone(),
        revision,
        class,
        format!("{label} step timed out after {}", Interval::from(timeout)),
    )
}

// ---------------------------------------------------------------------------
// File watcher
// ---------------------------------------------------------------------------

/// Watches `units/` (reload) and every local source directory (re-fetch).
async fn watcher_task<F, T>(
    daemon: Daemon<F, T>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError>
where
    F: SourceFetcher + 'static,
    T: TargetApi + 'static,
{
    let units = registry::units_dir_at(&daemon.home)?;
    let units = fs::canonicalize(&units).unwrap_or(units);

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher: RecommendedWatcher = recommended_watcher(move |event| {
        let _ = event_tx.send(event);
    })?;
    watcher.watch(&units, RecursiveMode::NonRecursive)?;

    let mut roots_rx = daemon.roots.subscribe();
    let mut watched_roots = BTreeSet::new();
    sync_source_watches(&mut watcher, &mut watched_roots, &roots_rx.borrow_and_update());

    let mut debounce = HashMap::<PathBuf, Instant>::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            changed = roots_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let roots = roots_rx.borrow_and_update().clone();
                sync_source_watches(&mut watcher, &mut watched_roots, &roots);
            }
            event = event_rx.recv() => {
                let Some(event) = event else { break };
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(error = %err, "watcher event error");
                        continue;
                    }
                };
                if !is_relevant_event_kind(&event.kind) {
                    continue;
                }

                let mut reload = false;
                let mut changed_sources = Vec::new();
                for path in event.paths {
                    if is_unit_yaml(&path, &units) {
                        reload |= should_process_event(&mut debounce, &units, Instant::now());
                    } else if let Some(root) = watched_roots.iter().find(|r| path.starts_with(r)) {
                        if should_process_event(&mut debounce, root, Instant::now()) {
                            changed_sources.push(path);
                        }
                    }
                }

                if reload {
                    if let Err(err) = daemon.reload().await {
                        tracing::error!(error = %err, "watcher-triggered reload failed");
                    }
                }
                if !changed_sources.is_empty() {
                    let mut queued = BTreeSet::new();
                    {
                        let mut scheduler = daemon.scheduler.lock().await;
                        for path in &changed_sources {
                            queued.extend(scheduler.trigger_source(path));
                        }
                    }
                    if !queued.is_empty() {
                        tracing::info!(units = ?queued, "source change queued reconciliation");
                        daemon.wake.notify_one();
                    }
                }
            }
        }
    }

    Ok(())
}

fn sync_source_watches(
    watcher: &mut RecommendedWatcher,
    watched: &mut BTreeSet<PathBuf>,
    wanted: &BTreeSet<PathBuf>,
) {
    for stale in watched.difference(wanted).cloned().collect::<Vec<_>>() {
        if let Err(err) = watcher.unwatch(&stale) {
            tracing::debug!(path = %stale.display(), error = %err, "unwatch failed");
        }
        watched.remove(&stale);
    }
    for root in wanted.difference(watched).cloned().collect::<Vec<_>>() {
        if !root.is_dir() {
            continue;
        }
        match watcher.watch(&root, RecursiveMode::Recursive) {
            Ok(()) => {
                tracing::debug!(path = %root.display(), "watching source directory");
                watched.insert(root);
            }
            Err(err) => {
                tracing::warn!(path = %root.display(), error = %err, "cannot watch source directory")
            }
        }
    }
}

fn is_relevant_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn is_unit_yaml(path: &Path, units: &Path) -> bool {
    path.parent() == Some(units)
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml"))
            .unwrap_or(false)
}

fn should_process_event(debounce: &mut HashMap<PathBuf, Instant>, key: &Path, now: Instant) -> bool {
    should_process_event_with_threshold(debounce, key, now, DEBOUNCE_WINDOW)
}

fn should_process_event_with_threshold(
    debounce: &mut HashMap<PathBuf, Instant>,
    key: &Path,
    now: Instant,
    threshold: Duration,
) -> bool {
    debounce.retain(|_, seen_at| now.duration_since(*seen_at) <= Duration::from_secs(30));
    match debounce.get(key) {
        Some(last_seen) if now.duration_since(*last_seen) < threshold => false,
        _ => {
            debounce.insert(key.to_path_buf(), now);
            true
        }
    }
}

// ---------------------------------------------------------------------------
// Control socket
// ---------------------------------------------------------------------------

async fn socket_server_task<F, T>(
    daemon: Daemon<F, T>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError>
where
    F: SourceFetcher + 'static,
    T: TargetApi + 'static,
{
    let socket = socket_path(&daemon.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let daemon = daemon.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, daemon).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client<F, T>(stream: UnixStream, daemon: Daemon<F, T>) -> Result<(), DaemonError>
where
    F: SourceFetcher + 'static,
    T: TargetApi + 'static,
{
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stop = request.cmd == "stop";
        let response = daemon.handle_request(request).await;
        write_response(&mut writer, &response).await?;
        if stop {
            break;
        }
    }

    Ok(())
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Housekeeping
// ---------------------------------------------------------------------------

async fn log_rotation_task(
    home: PathBuf,
    policy: RotationPolicy,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; never rotate on startup.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let home = home.clone();
                tokio::task::spawn_blocking(move || {
                    rotate_logs(&home, &policy);
                })
                .await
                .ok();
            }
        }
    }
    Ok(())
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    registry::units_dir_at(home)?;
    for dir in [run_dir(home), logs_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

fn write_pid_file(home: &Path) -> Result<(), DaemonError> {
    let path = pid_path(home);
    fs::write(&path, format!("{}\n", std::process::id())).map_err(|e| io_err(&path, e))
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
