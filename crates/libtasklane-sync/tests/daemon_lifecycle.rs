//! End-to-end daemon behavior against an in-process remote

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use libtasklane_core::{Database, DatabaseSource, SyncCoordinator, Task, TaskStore};
use libtasklane_sync::{
    ConflictResolver, DaemonConfig, DaemonError, DaemonLock, DaemonLog, DaemonPhase, MemoryRemote,
    Notification, NotificationSink, Reconciler, RemoteTask, StartOutcome, SyncDaemon,
};
use tempfile::tempdir;

#[derive(Default)]
struct RecordingSink {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    fn seen(&self) -> Vec<Notification> {
        self.seen.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn send(&self, notification: &Notification) -> Result<(), DaemonError> {
        self.seen.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

fn open_db(dir: &tempfile::TempDir) -> Database {
    Database::open(&dir.path().join("db")).unwrap()
}

fn started(outcome: StartOutcome) -> libtasklane_sync::DaemonHandle {
    match outcome {
        StartOutcome::Started(handle) => handle,
        other => panic!("expected a started daemon, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_offline_daemon_heartbeats() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let config = DaemonConfig::new(dir.path(), DatabaseSource::Shared(db))
        .with_interval(Duration::from_millis(100))
        .with_offline_mode(true);

    let handle = started(SyncDaemon::start(config).unwrap());
    assert_eq!(handle.status().phase, DaemonPhase::Running);
    assert!(DaemonLock::read(dir.path()).unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(250)).await;
    let status = handle.stop().await.unwrap();

    assert!(status.sync_count >= 2, "sync_count = {}", status.sync_count);
    assert!(!status.running);
    assert_eq!(status.phase, DaemonPhase::Stopped);

    let lines = DaemonLog::read_lines(dir.path()).unwrap();
    let heartbeats = lines.iter().filter(|l| l.contains("offline mode, remote sync skipped")).count();
    assert!(heartbeats >= 2, "log was {:?}", lines);
    assert!(lines.last().unwrap().contains("daemon stopped"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_offline_ticks_notify_heartbeats() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let sink = Arc::new(RecordingSink::default());
    let config = DaemonConfig::new(dir.path(), DatabaseSource::Shared(db))
        .with_interval(Duration::from_millis(100))
        .with_offline_mode(true)
        .with_sink(sink.clone());

    let handle = started(SyncDaemon::start(config).unwrap());
    tokio::time::sleep(Duration::from_millis(250)).await;
    let status = handle.stop().await.unwrap();

    let seen = sink.seen();
    assert_eq!(seen.len() as u64, status.sync_count);
    assert!(seen.iter().all(|n| matches!(n, Notification::Heartbeat { .. })));
    assert!(matches!(seen[0], Notification::Heartbeat { tick: 1, .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_daemon_stops_when_marker_taken_over() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let config = DaemonConfig::new(dir.path(), DatabaseSource::Shared(db))
        .with_interval(Duration::from_millis(50))
        .with_offline_mode(true);
    let mut handle = started(SyncDaemon::start(config).unwrap());
    tokio::time::sleep(Duration::from_millis(80)).await;

    // Another instance now owns the directory
    let usurper = DaemonLock::new(std::process::id(), dir.path(), Duration::from_secs(60), true);
    std::fs::write(
        DaemonLock::lock_path(dir.path()),
        serde_json::to_string(&usurper).unwrap(),
    )
    .unwrap();

    tokio::time::timeout(Duration::from_secs(5), handle.exited())
        .await
        .expect("worker should stop after losing the marker");
    let status = handle.stop().await.unwrap();
    assert!(status.marker_lost);
    assert!(status.last_error.unwrap().contains(&usurper.daemon_id));

    let on_disk = DaemonLock::read(dir.path()).unwrap().unwrap();
    assert_eq!(on_disk.daemon_id, usurper.daemon_id);
    assert_eq!(on_disk.sync_count, 0);

    let lines = DaemonLog::read_lines(dir.path()).unwrap();
    assert!(lines.iter().any(|l| l.contains("daemon marker lost")), "log was {:?}", lines);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_start_reports_running_daemon() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let first = DaemonConfig::new(dir.path(), DatabaseSource::Shared(db.clone()))
        .with_interval(Duration::from_secs(60))
        .with_offline_mode(true);
    let handle = started(SyncDaemon::start(first).unwrap());

    let second = DaemonConfig::new(dir.path(), DatabaseSource::Shared(db))
        .with_interval(Duration::from_secs(60))
        .with_offline_mode(true);
    match SyncDaemon::start(second).unwrap() {
        StartOutcome::AlreadyRunning { pid } => assert_eq!(pid, std::process::id()),
        StartOutcome::Started(_) => panic!("two daemons own one data directory"),
    }

    handle.stop().await.unwrap();
    assert!(DaemonLock::read(dir.path()).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_online_tick_pushes_and_notifies_once() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let coord = SyncCoordinator::new(db.task_store(), db.queue());
    let task = coord.create_task(Task::new("L1", "Buy milk")).unwrap();

    let remote = Arc::new(MemoryRemote::new("mem"));
    let sink = Arc::new(RecordingSink::default());
    let config = DaemonConfig::new(dir.path(), DatabaseSource::Shared(db.clone()))
        .with_interval(Duration::from_secs(60))
        .with_backend(remote.clone())
        .with_sink(sink.clone());

    let handle = started(SyncDaemon::start(config).unwrap());
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = handle.stop().await.unwrap();

    assert_eq!(status.sync_count, 1);
    assert!(status.last_error.is_none());
    assert_eq!(db.queue().pending_count().unwrap(), 0);

    let uid = db.task_store().get_task(task.id).unwrap().unwrap().uid;
    assert_eq!(remote.get_remote(&uid).unwrap().unwrap().summary, "Buy milk");

    let seen = sink.seen();
    assert_eq!(seen.len(), 1);
    assert!(matches!(seen[0], Notification::SyncCompleted { pushed: 1, pulled: 0, conflicts: 0, .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_remote_keeps_queue() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let coord = SyncCoordinator::new(db.task_store(), db.queue());
    coord.create_task(Task::new("L1", "Call plumber")).unwrap();

    let remote = Arc::new(MemoryRemote::new("mem"));
    remote.set_reachable(false);
    let sink = Arc::new(RecordingSink::default());
    let config = DaemonConfig::new(dir.path(), DatabaseSource::Shared(db.clone()))
        .with_interval(Duration::from_secs(60))
        .with_backend(remote)
        .with_sink(sink.clone());

    let handle = started(SyncDaemon::start(config).unwrap());
    tokio::time::sleep(Duration::from_millis(200)).await;
    let status = handle.stop().await.unwrap();

    assert!(status.last_error.is_some());
    assert_eq!(db.queue().pending_count().unwrap(), 1);
    let seen = sink.seen();
    assert!(matches!(seen.as_slice(), [Notification::SyncFailed { .. }]));

    let lines = DaemonLog::read_lines(dir.path()).unwrap();
    assert!(lines.iter().any(|l| l.contains("tick #1: sync failed")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_waits_for_in_flight_tick() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let remote = Arc::new(MemoryRemote::new("slow").with_latency(Duration::from_millis(300)));
    let config = DaemonConfig::new(dir.path(), DatabaseSource::Shared(db))
        .with_interval(Duration::from_millis(50))
        .with_backend(remote);

    let handle = started(SyncDaemon::start(config).unwrap());
    // The first tick fires immediately and is still inside the remote call
    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = handle.stop().await.unwrap();
    assert_eq!(status.sync_count, 1);

    let lines = DaemonLog::read_lines(dir.path()).unwrap();
    let n = lines.len();
    assert!(n >= 3, "log was {:?}", lines);
    assert!(lines[n - 2].contains("tick #1: sync completed"), "log was {:?}", lines);
    assert!(lines[n - 1].contains("daemon stopped"));
}

#[test]
fn test_conflict_resolve_then_conflict_again() {
    let dir = tempdir().unwrap();
    let db = open_db(&dir);
    let remote = MemoryRemote::new("mem");
    let coord = SyncCoordinator::new(db.task_store(), db.queue());

    let task = coord.create_task(Task::new("L1", "Plan trip")).unwrap();
    Reconciler::new(&db, &remote, 5).run().unwrap();
    let synced = db.task_store().get_task(task.id).unwrap().unwrap();

    let diverge = |local: &str, server: &str| {
        let mut edited = db.task_store().get_task(task.id).unwrap().unwrap();
        edited.summary = local.to_string();
        coord.update_task(edited).unwrap();

        let mut theirs = Task::new("L1", server);
        theirs.uid = synced.uid.clone();
        let modified = Utc::now() + chrono::Duration::seconds(5);
        remote.put_remote(RemoteTask::from_task(&theirs, &synced.uid, modified)).unwrap();
    };

    diverge("Plan trip (mine)", "Plan trip (theirs)");
    let report = Reconciler::new(&db, &remote, 5).run().unwrap();
    assert_eq!(report.conflicts, 1);
    assert!(db.conflict_store().has_pending(&synced.uid).unwrap());

    let outcome = ConflictResolver::new(&db).resolve(&synced.uid, "server_wins").unwrap();
    assert_eq!(outcome.task.unwrap().summary, "Plan trip (theirs)");
    assert!(!db.conflict_store().has_pending(&synced.uid).unwrap());

    diverge("Plan trip v2 (mine)", "Plan trip v2 (theirs)");
    let report = Reconciler::new(&db, &remote, 5).run().unwrap();
    assert_eq!(report.conflicts, 1);
    assert_eq!(db.conflict_store().conflicts().unwrap().len(), 1);
    assert_eq!(db.conflict_store().all_conflicts().unwrap().len(), 2);
}
