//! Human-visible notifications emitted by the daemon
//!
//! Delivery is fire-and-forget: producers push into a bounded queue drained
//! by one notifier task. When the queue is full the newest notification is
//! dropped and a warning is logged.

use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::DaemonError;
use crate::lock::current_time_ms;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// An online tick reconciled successfully
    SyncCompleted {
        pushed: usize,
        pulled: usize,
        conflicts: usize,
        ts_unix_ms: u64,
    },

    /// An online tick failed; the daemon keeps running
    SyncFailed { error: String, ts_unix_ms: u64 },

    /// An offline tick; nothing was pushed or pulled
    Heartbeat { tick: u64, ts_unix_ms: u64 },
}

impl Notification {
    /// Get the notification type as a string (for filtering)
    pub fn notification_type(&self) -> &'static str {
        match self {
            Notification::SyncCompleted { .. } => "SyncCompleted",
            Notification::SyncFailed { .. } => "SyncFailed",
            Notification::Heartbeat { .. } => "Heartbeat",
        }
    }

    pub fn sync_completed(pushed: usize, pulled: usize, conflicts: usize) -> Self {
        Notification::SyncCompleted {
            pushed,
            pulled,
            conflicts,
            ts_unix_ms: current_time_ms(),
        }
    }

    pub fn sync_failed(error: impl Into<String>) -> Self {
        Notification::SyncFailed {
            error: error.into(),
            ts_unix_ms: current_time_ms(),
        }
    }

    pub fn heartbeat(tick: u64) -> Self {
        Notification::Heartbeat {
            tick,
            ts_unix_ms: current_time_ms(),
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Notification::SyncCompleted { conflicts, .. } if *conflicts > 0 => "Tasks synced with conflicts",
            Notification::SyncCompleted { .. } => "Tasks synced",
            Notification::SyncFailed { .. } => "Task sync failed",
            Notification::Heartbeat { .. } => "Task sync paused",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Notification::SyncCompleted { pushed, pulled, conflicts, .. } => {
                let mut msg = format!("{} pushed, {} pulled", pushed, pulled);
                if *conflicts > 0 {
                    msg.push_str(&format!(
                        ", {} conflict(s), run 'tasklane sync conflicts'",
                        conflicts
                    ));
                }
                msg
            }
            Notification::SyncFailed { error, .. } => error.clone(),
            Notification::Heartbeat { tick, .. } => format!("Offline mode, heartbeat #{}", tick),
        }
    }
}

/// Delivers one notification; called from a blocking context
pub trait NotificationSink: Send + Sync {
    fn send(&self, notification: &Notification) -> Result<(), DaemonError>;
}

/// Writes notifications to the tracing log only
#[derive(Debug, Default, Clone)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn send(&self, notification: &Notification) -> Result<(), DaemonError> {
        info!(kind = notification.notification_type(), "{}: {}", notification.title(), notification.message());
        Ok(())
    }
}

/// Runs an external command with title and message appended, e.g. `notify-send`
#[derive(Debug, Clone)]
pub struct ExecSink {
    argv: Vec<String>,
}

impl ExecSink {
    pub fn new(argv: Vec<String>) -> Result<Self, DaemonError> {
        if argv.is_empty() {
            return Err(DaemonError::Notification("notify_command must not be empty".to_string()));
        }
        Ok(Self { argv })
    }
}

impl NotificationSink for ExecSink {
    fn send(&self, notification: &Notification) -> Result<(), DaemonError> {
        let status = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .arg(notification.title())
            .arg(notification.message())
            .status()
            .map_err(|e| DaemonError::Notification(format!("failed to run {}: {}", self.argv[0], e)))?;
        if !status.success() {
            return Err(DaemonError::Notification(format!("{} exited with {}", self.argv[0], status)));
        }
        Ok(())
    }
}

/// Pick the sink for a configured notify command
pub fn sink_for(notify_command: Option<&[String]>) -> Result<Arc<dyn NotificationSink>, DaemonError> {
    match notify_command {
        Some(argv) => Ok(Arc::new(ExecSink::new(argv.to_vec())?)),
        None => Ok(Arc::new(LogSink)),
    }
}

/// Cheap, cloneable producer side of the notifier
#[derive(Clone)]
pub struct NotifyHandle {
    tx: mpsc::Sender<Notification>,
    dropped: Arc<AtomicU64>,
}

impl NotifyHandle {
    /// Queue a notification without waiting.
    ///
    /// Returns false if it was dropped because the queue is full or closed.
    pub fn send_async(&self, notification: Notification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(n)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(kind = n.notification_type(), "notification queue full, dropping newest");
                false
            }
            Err(mpsc::error::TrySendError::Closed(n)) => {
                warn!(kind = n.notification_type(), "notifier closed, dropping notification");
                false
            }
        }
    }

    /// Notifications dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Owns the notifier task
pub struct Notifier {
    handle: NotifyHandle,
    task: JoinHandle<()>,
}

impl Notifier {
    /// Spawn the notifier task. Must be called within a Tokio runtime.
    pub fn spawn(sink: Arc<dyn NotificationSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Notification>(capacity.max(1));
        let task = tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                let sink = Arc::clone(&sink);
                let kind = notification.notification_type();
                let result = tokio::task::spawn_blocking(move || sink.send(&notification)).await;
                match result {
                    Ok(Ok(())) => debug!(kind, "notification delivered"),
                    Ok(Err(e)) => warn!(kind, error = %e, "notification delivery failed"),
                    Err(e) => warn!(kind, error = %e, "notification task failed"),
                }
            }
        });
        Self {
            handle: NotifyHandle {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            task,
        }
    }

    pub fn handle(&self) -> NotifyHandle {
        self.handle.clone()
    }

    /// Close the queue and wait until everything queued has been delivered.
    ///
    /// Other `NotifyHandle` clones must be dropped first or this waits for them.
    pub async fn shutdown(self) -> Result<(), DaemonError> {
        drop(self.handle);
        self.task.await?;
        Ok(())
    }
}
