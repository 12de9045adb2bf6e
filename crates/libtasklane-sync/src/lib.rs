//! Sync engine for tasklane
//!
//! Builds on `libtasklane-core` with the pieces that talk to the outside
//! world: remote backends, the reconciler, conflict resolution and the
//! background daemon.

pub mod daemon;
pub mod error;
pub mod lock;
pub mod log;
pub mod notifications;
pub mod reconcile;
pub mod remote;
pub mod resolver;

pub use daemon::{DaemonConfig, DaemonHandle, DaemonPhase, DaemonStatus, StartOutcome, SyncDaemon};
pub use error::DaemonError;
pub use lock::DaemonLock;
pub use log::DaemonLog;
pub use notifications::{sink_for, LogSink, Notification, NotificationSink, Notifier, NotifyHandle};
pub use reconcile::{Reconciler, SyncReport};
pub use remote::{open_backend, DirectoryRemote, MemoryRemote, RemoteBackend, RemoteTask};
pub use resolver::{ConflictResolver, PreparedResolution, ResolutionOutcome};
