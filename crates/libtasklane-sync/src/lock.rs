//! Daemon liveness marker
//!
//! A JSON lease file at `<data_dir>/daemon.lock` records which process owns
//! the sync daemon for a data directory. The owner refreshes the lease around
//! every tick. Only a marker whose process is gone is stale and may be taken
//! over; an expired lease with a live owner means a slow tick, not a dead
//! daemon. Takeover and refresh run under an fs2 lock on
//! `<data_dir>/daemon.lock.guard`, and a refresh fails once the marker
//! belongs to another daemon instance.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use libtasklane_core::config::daemon_lock_path;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::DaemonError;

/// Minimum lease; longer intervals get three intervals
pub const MIN_LEASE_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonLock {
    /// Process ID of the lock holder
    pub pid: u32,
    /// Unique per daemon instance, so in-process daemons never release each other
    pub daemon_id: String,
    pub data_dir: String,
    /// Unix ms
    pub started_ts: u64,
    pub interval_ms: u64,
    pub offline_mode: bool,
    pub sync_count: u64,
    /// Unix ms of the last tick
    #[serde(default)]
    pub last_sync_ts: Option<u64>,
    pub lease_ms: u64,
    pub last_heartbeat_ts: u64,
    pub expires_ts: u64,
}

impl DaemonLock {
    pub fn new(pid: u32, data_dir: &Path, interval: Duration, offline_mode: bool) -> Self {
        let now = current_time_ms();
        let interval_ms = interval.as_millis() as u64;
        let lease_ms = default_lease_ms(interval);
        Self {
            pid,
            daemon_id: uuid::Uuid::new_v4().to_string(),
            data_dir: data_dir.to_string_lossy().to_string(),
            started_ts: now,
            interval_ms,
            offline_mode,
            sync_count: 0,
            last_sync_ts: None,
            lease_ms,
            last_heartbeat_ts: now,
            expires_ts: now + lease_ms,
        }
    }

    pub fn with_lease(mut self, lease_ms: u64) -> Self {
        self.lease_ms = lease_ms;
        self.expires_ts = current_time_ms() + lease_ms;
        self
    }

    pub fn is_expired(&self) -> bool {
        current_time_ms() > self.expires_ts
    }

    /// Whether the recorded process still exists
    pub fn is_process_alive(&self) -> bool {
        process_alive(self.pid)
    }

    /// Owner process is gone
    pub fn is_stale(&self) -> bool {
        !self.is_process_alive()
    }

    /// Owner is alive but its heartbeat is overdue
    pub fn is_lagging(&self) -> bool {
        self.is_expired() && self.is_process_alive()
    }

    pub fn is_owned_by_current_process(&self) -> bool {
        self.pid == std::process::id()
    }

    pub fn time_remaining_ms(&self) -> u64 {
        self.expires_ts.saturating_sub(current_time_ms())
    }

    /// Refresh the heartbeat and extend the lease
    pub fn refresh(&mut self) {
        let now = current_time_ms();
        self.last_heartbeat_ts = now;
        self.expires_ts = now + self.lease_ms;
    }

    /// Record a finished tick and refresh the lease
    pub fn record_tick(&mut self, sync_count: u64) {
        self.refresh();
        self.sync_count = sync_count;
        self.last_sync_ts = Some(self.last_heartbeat_ts);
    }

    pub fn lock_path(data_dir: &Path) -> PathBuf {
        daemon_lock_path(data_dir)
    }

    pub fn read(data_dir: &Path) -> Result<Option<Self>, DaemonError> {
        let path = Self::lock_path(data_dir);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Refresh the marker on disk.
    ///
    /// Fails with `LockLost` when the marker is missing or belongs to another
    /// daemon instance; the foreign marker is left untouched.
    pub fn write(&self, data_dir: &Path) -> Result<(), DaemonError> {
        let _guard = Self::guard(data_dir)?;
        match Self::read(data_dir)? {
            Some(current) if current.daemon_id == self.daemon_id => self.publish(data_dir),
            current => Err(DaemonError::LockLost {
                owner: current.map(|lock| lock.daemon_id),
            }),
        }
    }

    /// Write to a temp file, then rename over the marker
    fn publish(&self, data_dir: &Path) -> Result<(), DaemonError> {
        let path = Self::lock_path(data_dir);
        let tmp = path.with_extension(format!("lock.{}", self.daemon_id));
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(data_dir: &Path) -> Result<(), DaemonError> {
        match fs::remove_file(Self::lock_path(data_dir)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove `stale` if it is still the marker on disk and its owner is
    /// still dead. Returns whether a marker was removed.
    pub fn remove_stale(data_dir: &Path, stale: &DaemonLock) -> Result<bool, DaemonError> {
        let _guard = Self::guard(data_dir)?;
        Self::remove_if_same_stale(data_dir, stale)
    }

    fn remove_if_same_stale(data_dir: &Path, stale: &DaemonLock) -> Result<bool, DaemonError> {
        match Self::read(data_dir)? {
            Some(current) if current.daemon_id == stale.daemon_id && current.is_stale() => {
                Self::remove(data_dir)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Exclusive fs2 lock serializing marker changes across processes;
    /// released when the returned file is dropped
    fn guard(data_dir: &Path) -> Result<File, DaemonError> {
        let path = Self::lock_path(data_dir).with_extension("lock.guard");
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        file.lock_exclusive()?;
        Ok(file)
    }

    /// Take the marker for this process.
    ///
    /// Fails with `LockHeld` while another live daemon owns it, even one
    /// whose lease has expired; markers of dead daemons are replaced.
    pub fn acquire(data_dir: &Path, interval: Duration, offline_mode: bool) -> Result<Self, DaemonError> {
        fs::create_dir_all(data_dir)?;
        let _guard = Self::guard(data_dir)?;

        if let Some(existing) = Self::read(data_dir)? {
            if !existing.is_stale() {
                return Err(DaemonError::LockHeld {
                    pid: existing.pid,
                    expires_in_ms: existing.time_remaining_ms(),
                });
            }
            warn!(pid = existing.pid, daemon_id = %existing.daemon_id, "taking over marker of a dead daemon");
            Self::remove_if_same_stale(data_dir, &existing)?;
        }

        let lock = DaemonLock::new(std::process::id(), data_dir, interval, offline_mode);

        // Write the full marker aside, then hard-link it into place: the link
        // fails if the marker exists, so racing starters agree on one winner
        // and readers never see a half-written file.
        let path = Self::lock_path(data_dir);
        let tmp = path.with_extension(format!("lock.{}", lock.daemon_id));
        {
            let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
            file.write_all(serde_json::to_string_pretty(&lock)?.as_bytes())?;
            file.sync_all()?;
        }
        let linked = fs::hard_link(&tmp, &path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = Self::read(data_dir)?;
                return Err(DaemonError::LockHeld {
                    pid: holder.as_ref().map(|l| l.pid).unwrap_or(0),
                    expires_in_ms: holder.map(|l| l.time_remaining_ms()).unwrap_or(0),
                });
            }
            Err(e) => return Err(e.into()),
        }

        debug!(daemon_id = %lock.daemon_id, "daemon marker acquired");
        Ok(lock)
    }

    /// Remove the marker if it still belongs to this daemon instance
    pub fn release(&self, data_dir: &Path) -> Result<(), DaemonError> {
        let _guard = Self::guard(data_dir)?;
        if let Some(current) = Self::read(data_dir)? {
            if current.daemon_id == self.daemon_id {
                Self::remove(data_dir)?;
            }
        }
        Ok(())
    }
}

fn default_lease_ms(interval: Duration) -> u64 {
    (interval.as_millis() as u64).saturating_mul(3).max(MIN_LEASE_MS)
}

/// Current time in milliseconds since Unix epoch
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // Signal 0 checks existence without delivering anything
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    pid != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lease_floor_and_scaling() {
        let short = DaemonLock::new(1, Path::new("/d"), Duration::from_millis(100), true);
        assert_eq!(short.lease_ms, MIN_LEASE_MS);

        let long = DaemonLock::new(1, Path::new("/d"), Duration::from_secs(300), false);
        assert_eq!(long.lease_ms, 900_000);
    }

    #[test]
    fn test_lock_expiration() {
        let mut lock = DaemonLock::new(std::process::id(), Path::new("/d"), Duration::from_secs(1), false);
        lock.expires_ts = 0;
        assert!(lock.is_expired());
        assert!(lock.is_lagging());
        assert!(!lock.is_stale());

        lock.refresh();
        assert!(!lock.is_expired());
        assert!(!lock.is_lagging());
    }

    #[test]
    fn test_acquire_release() {
        let temp = TempDir::new().unwrap();
        let data_dir = temp.path();

        let lock = DaemonLock::acquire(data_dir, Duration::from_secs(1), true).unwrap();
        assert!(lock.is_owned_by_current_process());
        assert!(DaemonLock::lock_path(data_dir).exists());

        lock.release(data_dir).unwrap();
        assert!(DaemonLock::read(data_dir).unwrap().is_none());
    }

    #[test]
    fn test_second_acquire_held() {
        let temp = TempDir::new().unwrap();
        let data_dir = temp.path();

        let first = DaemonLock::acquire(data_dir, Duration::from_secs(1), true).unwrap();
        match DaemonLock::acquire(data_dir, Duration::from_secs(1), true).unwrap_err() {
            DaemonError::LockHeld { pid, .. } => assert_eq!(pid, first.pid),
            other => panic!("Expected LockHeld, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_owner_marker_taken_over() {
        let temp = TempDir::new().unwrap();
        let data_dir = temp.path();

        let old = DaemonLock::new(0x3fff_fff0, data_dir, Duration::from_secs(1), true);
        old.publish(data_dir).unwrap();

        let new_lock = DaemonLock::acquire(data_dir, Duration::from_secs(1), false).unwrap();
        let read = DaemonLock::read(data_dir).unwrap().unwrap();
        assert_eq!(read.daemon_id, new_lock.daemon_id);
        assert_ne!(read.daemon_id, old.daemon_id);
    }

    #[test]
    fn test_expired_lease_with_live_owner_still_held() {
        let temp = TempDir::new().unwrap();
        let data_dir = temp.path();

        let owner = DaemonLock::acquire(data_dir, Duration::from_secs(1), true).unwrap();
        let mut slow = owner.clone();
        slow.expires_ts = 0;
        slow.publish(data_dir).unwrap();

        match DaemonLock::acquire(data_dir, Duration::from_secs(1), true).unwrap_err() {
            DaemonError::LockHeld { pid, .. } => assert_eq!(pid, owner.pid),
            other => panic!("Expected LockHeld, got {:?}", other),
        }
        assert_eq!(DaemonLock::read(data_dir).unwrap().unwrap().daemon_id, owner.daemon_id);
    }

    #[test]
    fn test_write_refuses_foreign_marker() {
        let temp = TempDir::new().unwrap();
        let data_dir = temp.path();

        let mut first = DaemonLock::acquire(data_dir, Duration::from_secs(1), true).unwrap();
        let second = DaemonLock::new(std::process::id(), data_dir, Duration::from_secs(1), true);
        second.publish(data_dir).unwrap();

        first.record_tick(1);
        match first.write(data_dir).unwrap_err() {
            DaemonError::LockLost { owner } => assert_eq!(owner.as_deref(), Some(second.daemon_id.as_str())),
            other => panic!("Expected LockLost, got {:?}", other),
        }
        let on_disk = DaemonLock::read(data_dir).unwrap().unwrap();
        assert_eq!(on_disk.daemon_id, second.daemon_id);
        assert_eq!(on_disk.sync_count, 0);

        first.release(data_dir).unwrap();
        assert!(DaemonLock::read(data_dir).unwrap().is_some());
    }

    #[test]
    fn test_write_after_removal_is_lost() {
        let temp = TempDir::new().unwrap();
        let lock = DaemonLock::acquire(temp.path(), Duration::from_secs(1), true).unwrap();
        std::fs::remove_file(DaemonLock::lock_path(temp.path())).unwrap();

        assert!(matches!(lock.write(temp.path()).unwrap_err(), DaemonError::LockLost { owner: None }));
        assert!(DaemonLock::read(temp.path()).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_remove_stale_checks_identity() {
        let temp = TempDir::new().unwrap();
        let data_dir = temp.path();

        let dead = DaemonLock::new(0x3fff_fff0, data_dir, Duration::from_secs(1), true);
        let other_dead = DaemonLock::new(0x3fff_fff1, data_dir, Duration::from_secs(1), true);
        other_dead.publish(data_dir).unwrap();

        assert!(!DaemonLock::remove_stale(data_dir, &dead).unwrap());
        assert!(DaemonLock::read(data_dir).unwrap().is_some());
        assert!(DaemonLock::remove_stale(data_dir, &other_dead).unwrap());
        assert!(DaemonLock::read(data_dir).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_pid_is_stale() {
        let lock = DaemonLock::new(0x3fff_fff0, Path::new("/d"), Duration::from_secs(1), false);
        assert!(!lock.is_expired());
        assert!(lock.is_stale());
    }

    #[test]
    fn test_release_ignores_foreign_marker() {
        let temp = TempDir::new().unwrap();
        let data_dir = temp.path();

        let ours = DaemonLock::new(std::process::id(), data_dir, Duration::from_secs(1), false);
        let theirs = DaemonLock::acquire(data_dir, Duration::from_secs(1), false).unwrap();

        ours.release(data_dir).unwrap();
        assert_eq!(DaemonLock::read(data_dir).unwrap().unwrap().daemon_id, theirs.daemon_id);
    }

    #[test]
    fn test_record_tick() {
        let temp = TempDir::new().unwrap();
        let mut lock = DaemonLock::acquire(temp.path(), Duration::from_secs(1), true).unwrap();
        lock.record_tick(3);
        lock.write(temp.path()).unwrap();

        let read = DaemonLock::read(temp.path()).unwrap().unwrap();
        assert_eq!(read.sync_count, 3);
        assert!(read.last_sync_ts.is_some());
    }
}
