//! Background sync daemon
//!
//! `SyncDaemon::start` takes the liveness marker and spawns one worker task
//! driving a timer. Each tick runs on the blocking pool and is awaited by the
//! worker, so ticks never overlap and a stop request is only observed between
//! ticks. `DaemonHandle::stop` waits for the worker, drains notifications,
//! writes the final log line and releases the marker.
//!
//! The marker lease is refreshed before and after the remote step of every
//! tick. If a refresh finds the marker gone or owned by another instance the
//! worker stops on its own and leaves the foreign marker alone.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use libtasklane_core::config::DEFAULT_NOTIFY_CAPACITY;
use libtasklane_core::{DatabaseSource, SyncConfig, TasklaneError};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::error::DaemonError;
use crate::lock::DaemonLock;
use crate::log::DaemonLog;
use crate::notifications::{sink_for, LogSink, Notification, NotificationSink, Notifier, NotifyHandle};
use crate::reconcile::{Reconciler, SyncReport};
use crate::remote::{open_backend, RemoteBackend};

/// Everything a daemon needs to run
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub db: DatabaseSource,
    pub interval: Duration,
    pub offline_mode: bool,
    pub max_retries: u32,
    pub notify_capacity: usize,
    pub backend: Option<Arc<dyn RemoteBackend>>,
    pub sink: Arc<dyn NotificationSink>,
}

impl DaemonConfig {
    pub fn new(data_dir: impl Into<PathBuf>, db: DatabaseSource) -> Self {
        let defaults = SyncConfig::default();
        Self {
            data_dir: data_dir.into(),
            db,
            interval: defaults.interval(),
            offline_mode: defaults.offline_mode,
            max_retries: defaults.max_retries,
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
            backend: None,
            sink: Arc::new(LogSink),
        }
    }

    /// Build from `config.toml` settings, opening the primary backend
    pub fn from_sync_config(
        data_dir: impl Into<PathBuf>,
        db: DatabaseSource,
        config: &SyncConfig,
    ) -> Result<Self, DaemonError> {
        let backend = match config.primary_backend() {
            Some(backend) => Some(open_backend(backend)?),
            None => None,
        };
        Ok(Self {
            interval: config.interval(),
            offline_mode: config.offline_mode,
            max_retries: config.max_retries,
            notify_capacity: config.notify_capacity,
            backend,
            sink: sink_for(config.notify_command.as_deref())?,
            ..Self::new(data_dir, db)
        })
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_offline_mode(mut self, offline: bool) -> Self {
        self.offline_mode = offline;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn RemoteBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Read-only snapshot of a daemon
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub phase: DaemonPhase,
    pub running: bool,
    pub pid: u32,
    pub interval_ms: u64,
    pub offline_mode: bool,
    pub sync_count: u64,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Another instance took the marker; the worker has stopped
    pub marker_lost: bool,
}

pub enum StartOutcome {
    Started(DaemonHandle),
    /// A live daemon already owns the data directory
    AlreadyRunning { pid: u32 },
}

impl std::fmt::Debug for StartOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartOutcome::Started(handle) => f.debug_tuple("Started").field(&handle.status()).finish(),
            StartOutcome::AlreadyRunning { pid } => f.debug_struct("AlreadyRunning").field("pid", pid).finish(),
        }
    }
}

pub struct SyncDaemon;

impl SyncDaemon {
    /// Start a daemon for `config.data_dir`. Must be called within a Tokio runtime.
    ///
    /// Starting while a live daemon owns the directory is not an error; the
    /// owner's pid is reported instead.
    pub fn start(config: DaemonConfig) -> Result<StartOutcome, DaemonError> {
        let lock = match DaemonLock::acquire(&config.data_dir, config.interval, config.offline_mode) {
            Ok(lock) => lock,
            Err(DaemonError::LockHeld { pid, .. }) => {
                info!(pid, "sync daemon already running");
                return Ok(StartOutcome::AlreadyRunning { pid });
            }
            Err(e) => return Err(e),
        };

        let log = match DaemonLog::open(&config.data_dir) {
            Ok(log) => Arc::new(log),
            Err(e) => {
                // Do not leave a marker behind for a daemon that never ran
                let _ = lock.release(&config.data_dir);
                return Err(e);
            }
        };

        let state = Arc::new(Mutex::new(DaemonStatus {
            phase: DaemonPhase::Starting,
            running: true,
            pid: lock.pid,
            interval_ms: config.interval.as_millis() as u64,
            offline_mode: config.offline_mode,
            sync_count: 0,
            last_sync: None,
            last_error: None,
            marker_lost: false,
        }));

        let notifier = Notifier::spawn(config.sink.clone(), config.notify_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (exited_tx, exited_rx) = watch::channel(false);

        log.line(&format!(
            "daemon started (pid {}, interval {}ms, {})",
            lock.pid,
            config.interval.as_millis(),
            if config.offline_mode { "offline mode" } else { "online" }
        ));

        let ticker = Arc::new(Ticker {
            data_dir: config.data_dir.clone(),
            db: config.db,
            backend: config.backend,
            offline_mode: config.offline_mode,
            max_retries: config.max_retries,
            state: Arc::clone(&state),
            lock: Mutex::new(lock.clone()),
            log: Arc::clone(&log),
            notify: notifier.handle(),
            lost: AtomicBool::new(false),
        });
        set_phase(&state, DaemonPhase::Running);
        let worker = tokio::spawn(run_worker(ticker, config.interval, shutdown_rx, exited_tx));

        Ok(StartOutcome::Started(DaemonHandle {
            data_dir: config.data_dir,
            state,
            lock,
            log,
            shutdown_tx,
            exited_rx,
            worker,
            notifier,
        }))
    }
}

/// Owner of a running daemon; dropping it without `stop` lets the worker
/// exit at its next tick boundary but leaves the marker behind until the
/// process exits
pub struct DaemonHandle {
    data_dir: PathBuf,
    state: Arc<Mutex<DaemonStatus>>,
    lock: DaemonLock,
    log: Arc<DaemonLog>,
    shutdown_tx: watch::Sender<bool>,
    exited_rx: watch::Receiver<bool>,
    worker: JoinHandle<()>,
    notifier: Notifier,
}

impl DaemonHandle {
    pub fn status(&self) -> DaemonStatus {
        snapshot(&self.state)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    /// Resolves once the worker has exited: after `stop` was requested or
    /// after the marker was lost. `stop` must still be called to clean up.
    pub async fn exited(&mut self) {
        while !*self.exited_rx.borrow_and_update() {
            if self.exited_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop the daemon and wait for it.
    ///
    /// An in-flight tick always completes first. Returns the final status.
    pub async fn stop(self) -> Result<DaemonStatus, DaemonError> {
        set_phase(&self.state, DaemonPhase::Stopping);
        let _ = self.shutdown_tx.send(true);

        if let Err(e) = self.worker.await {
            error!(error = %e, "sync worker ended abnormally");
        }
        if let Err(e) = self.notifier.shutdown().await {
            warn!(error = %e, "notifier ended abnormally");
        }

        let final_status = {
            let mut state = lock_state(&self.state);
            state.phase = DaemonPhase::Stopped;
            state.running = false;
            state.clone()
        };
        self.log.line(&format!("daemon stopped after {} ticks", final_status.sync_count));
        self.lock.release(&self.data_dir)?;
        Ok(final_status)
    }
}

/// State shared between the worker and its blocking ticks
struct Ticker {
    data_dir: PathBuf,
    db: DatabaseSource,
    backend: Option<Arc<dyn RemoteBackend>>,
    offline_mode: bool,
    max_retries: u32,
    state: Arc<Mutex<DaemonStatus>>,
    lock: Mutex<DaemonLock>,
    log: Arc<DaemonLog>,
    notify: NotifyHandle,
    lost: AtomicBool,
}

impl Ticker {
    fn tick(&self) {
        let tick_no = {
            let mut state = lock_state(&self.state);
            state.sync_count += 1;
            state.last_sync = Some(Utc::now());
            state.sync_count
        };
        if !self.refresh_marker(Some(tick_no)) {
            return;
        }

        if self.offline_mode {
            self.log.line(&format!("heartbeat #{}: offline mode, remote sync skipped", tick_no));
            self.notify.send_async(Notification::heartbeat(tick_no));
            return;
        }

        let result = self.reconcile();
        match result {
            Ok(report) => {
                lock_state(&self.state).last_error = None;
                self.log.line(&format!(
                    "tick #{}: sync completed (pushed {}, pulled {}, conflicts {}, failed {}, skipped {})",
                    tick_no, report.pushed, report.pulled, report.conflicts, report.failed, report.skipped
                ));
                self.notify
                    .send_async(Notification::sync_completed(report.pushed, report.pulled, report.conflicts));
            }
            Err(e) => {
                lock_state(&self.state).last_error = Some(e.to_string());
                self.log.line(&format!("tick #{}: sync failed: {}", tick_no, e));
                self.notify.send_async(Notification::sync_failed(e.to_string()));
            }
        }
        // The remote step may have outlasted the lease
        self.refresh_marker(None);
    }

    fn marker_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    fn reconcile(&self) -> Result<SyncReport, TasklaneError> {
        let backend = self
            .backend
            .as_deref()
            .ok_or_else(|| TasklaneError::Remote("no remote backend configured".to_string()))?;
        let db = self.db.acquire()?;
        Reconciler::new(&db, backend, self.max_retries).run()
    }

    /// Extend the lease, recording `tick_no` if given. Returns false once the
    /// marker belongs to someone else.
    fn refresh_marker(&self, tick_no: Option<u64>) -> bool {
        let mut lock = match self.lock.lock() {
            Ok(lock) => lock,
            Err(poisoned) => poisoned.into_inner(),
        };
        match tick_no {
            Some(n) => lock.record_tick(n),
            None => lock.refresh(),
        }
        match lock.write(&self.data_dir) {
            Ok(()) => true,
            Err(DaemonError::LockLost { owner }) => {
                let owner = owner.unwrap_or_else(|| "nobody".to_string());
                error!(owner = %owner, "daemon marker taken over, stopping");
                self.log.line(&format!("daemon marker lost to {}; stopping", owner));
                {
                    let mut state = lock_state(&self.state);
                    state.marker_lost = true;
                    state.last_error = Some(format!("daemon marker lost to {}", owner));
                }
                self.lost.store(true, Ordering::SeqCst);
                false
            }
            Err(e) => {
                warn!(error = %e, "failed to refresh daemon marker");
                true
            }
        }
    }
}

async fn run_worker(
    ticker: Arc<Ticker>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    exited_tx: watch::Sender<bool>,
) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("sync worker shutting down");
                    break;
                }
            }
            _ = timer.tick() => {
                let ticking = Arc::clone(&ticker);
                if let Err(e) = tokio::task::spawn_blocking(move || ticking.tick()).await {
                    error!(error = %e, "sync tick panicked");
                }
                if ticker.marker_lost() {
                    set_phase(&ticker.state, DaemonPhase::Stopping);
                    break;
                }
            }
        }
    }
    let _ = exited_tx.send(true);
}

fn lock_state(state: &Mutex<DaemonStatus>) -> std::sync::MutexGuard<'_, DaemonStatus> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn set_phase(state: &Mutex<DaemonStatus>, phase: DaemonPhase) {
    lock_state(state).phase = phase;
}

fn snapshot(state: &Mutex<DaemonStatus>) -> DaemonStatus {
    lock_state(state).clone()
}
