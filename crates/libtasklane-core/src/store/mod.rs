mod tasks;

pub use tasks::{LocalIdIndex, SledTaskStore, StorageMaintenance, TaskStore};

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::conflict::ConflictStore;
use crate::error::TasklaneError;
use crate::metadata::SyncMetadata;
use crate::queue::SyncQueue;

/// Metadata key holding the binary pending-operation counter
pub(crate) const QUEUE_LEN_KEY: &str = "queue_len";

/// Default time foreground commands wait for the database lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Statistics about the database
#[derive(Debug, Clone)]
pub struct DbStats {
    pub path: String,
    pub size_bytes: u64,
    pub task_count: usize,
    pub queue_len: u64,
    pub conflict_count: usize,
    pub pending_conflicts: usize,
}

/// Handle to the sled database shared by every store.
///
/// Cloning is cheap; all clones see the same trees.
#[derive(Clone)]
pub struct Database {
    path: PathBuf,
    db: sled::Db,
    pub(crate) tasks: sled::Tree,
    pub(crate) task_uids: sled::Tree,
    pub(crate) queue: sled::Tree,
    pub(crate) metadata: sled::Tree,
    pub(crate) conflicts: sled::Tree,
    pub(crate) conflict_pending: sled::Tree,
    pub(crate) baselines: sled::Tree,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

/// A Database with a filesystem-level exclusive lock.
///
/// The lock is held for the lifetime of this struct and released on drop,
/// so two processes never open the same sled directory at once.
pub struct LockedDatabase {
    _lock_file: File,
    db: Database,
}

impl std::fmt::Debug for LockedDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedDatabase").field("db", &self.db).finish()
    }
}

impl LockedDatabase {
    pub fn inner(&self) -> &Database {
        &self.db
    }
}

impl std::ops::Deref for LockedDatabase {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self, TasklaneError> {
        let db = sled::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            tasks: db.open_tree("tasks")?,
            task_uids: db.open_tree("task_uids")?,
            queue: db.open_tree("sync_queue")?,
            metadata: db.open_tree("sync_metadata")?,
            conflicts: db.open_tree("sync_conflicts")?,
            conflict_pending: db.open_tree("conflict_pending")?,
            baselines: db.open_tree("sync_baselines")?,
            db,
        })
    }

    /// Open with an exclusive lock at `<path>.lock` (non-blocking).
    ///
    /// Returns `TasklaneError::DbBusy` if another process holds the lock.
    pub fn open_locked(path: &Path) -> Result<LockedDatabase, TasklaneError> {
        let lock_file = create_lock_file(path)?;
        lock_file
            .try_lock_exclusive()
            .map_err(|e| TasklaneError::database_locked(Some(&e.to_string())))?;

        let db = Self::open(path)?;
        Ok(LockedDatabase { _lock_file: lock_file, db })
    }

    /// Open with an exclusive lock, retrying with exponential backoff until
    /// `timeout` expires.
    pub fn open_locked_blocking(path: &Path, timeout: Duration) -> Result<LockedDatabase, TasklaneError> {
        let lock_file = create_lock_file(path)?;

        let start = Instant::now();
        let mut delay = Duration::from_millis(10);

        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if start.elapsed() < timeout => {
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(Duration::from_millis(200));
                }
                Err(e) => {
                    return Err(TasklaneError::DbBusy(format!(
                        "Timeout waiting for database lock: {}",
                        e
                    )))
                }
            }
        }

        let db = Self::open(path)?;
        Ok(LockedDatabase { _lock_file: lock_file, db })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next monotonic id, unique across all trees
    pub(crate) fn next_id(&self) -> Result<u64, TasklaneError> {
        // sled starts at 0; 0 is reserved for "unassigned"
        Ok(self.db.generate_id()? + 1)
    }

    pub fn task_store(&self) -> SledTaskStore {
        SledTaskStore::new(self.clone())
    }

    pub fn queue(&self) -> SyncQueue {
        SyncQueue::new(self.clone())
    }

    pub fn conflict_store(&self) -> ConflictStore {
        ConflictStore::new(self.clone())
    }

    pub fn metadata(&self) -> SyncMetadata {
        SyncMetadata::new(self.clone())
    }

    pub fn stats(&self) -> Result<DbStats, TasklaneError> {
        Ok(DbStats {
            path: self.path.to_string_lossy().to_string(),
            size_bytes: dir_size(&self.path).unwrap_or(0),
            task_count: self.tasks.len(),
            queue_len: read_counter(&self.metadata, QUEUE_LEN_KEY)?,
            conflict_count: self.conflicts.len(),
            pending_conflicts: self.conflict_pending.len(),
        })
    }

    /// Flush pending writes to disk, returning the bytes written
    pub fn flush(&self) -> Result<usize, TasklaneError> {
        Ok(self.db.flush()?)
    }
}

/// Where a component gets its database from.
///
/// In-process callers share one handle; the daemon binary reopens the
/// directory per tick so foreground commands can take the lock in between.
#[derive(Debug, Clone)]
pub enum DatabaseSource {
    Shared(Database),
    OnDisk { path: PathBuf, lock_timeout: Duration },
}

impl DatabaseSource {
    pub fn on_disk(path: impl Into<PathBuf>) -> Self {
        DatabaseSource::OnDisk { path: path.into(), lock_timeout: DEFAULT_LOCK_TIMEOUT }
    }

    pub fn acquire(&self) -> Result<DatabaseGuard, TasklaneError> {
        match self {
            DatabaseSource::Shared(db) => Ok(DatabaseGuard::Shared(db.clone())),
            DatabaseSource::OnDisk { path, lock_timeout } => {
                Database::open_locked_blocking(path, *lock_timeout).map(DatabaseGuard::Locked)
            }
        }
    }
}

/// Database access held for the duration of one unit of work
#[derive(Debug)]
pub enum DatabaseGuard {
    Shared(Database),
    Locked(LockedDatabase),
}

impl std::ops::Deref for DatabaseGuard {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        match self {
            DatabaseGuard::Shared(db) => db,
            DatabaseGuard::Locked(locked) => locked,
        }
    }
}

fn create_lock_file(path: &Path) -> Result<File, TasklaneError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(File::create(path.with_extension("lock"))?)
}

// Key and counter helpers

pub(crate) fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

pub(crate) fn decode_u64(bytes: &[u8]) -> u64 {
    let arr: [u8; 8] = bytes.try_into().unwrap_or([0; 8]);
    u64::from_be_bytes(arr)
}

pub(crate) fn read_counter(tree: &sled::Tree, key: &str) -> Result<u64, TasklaneError> {
    Ok(tree.get(key)?.map(|bytes| decode_u64(&bytes)).unwrap_or(0))
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut size = 0;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                size += dir_size(&entry.path())?;
            } else {
                size += meta.len();
            }
        }
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OperationType, Task};
    use tempfile::tempdir;

    #[test]
    fn test_locked_database_creates_lock_file() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("db");
        let lock_path = dir.path().join("db.lock");

        assert!(!lock_path.exists());
        let _db = Database::open_locked(&db_path).unwrap();
        assert!(lock_path.exists());
    }

    #[test]
    fn test_locked_database_second_open_fails() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("db");

        let _db1 = Database::open_locked(&db_path).unwrap();

        match Database::open_locked(&db_path).unwrap_err() {
            TasklaneError::DbBusy(msg) => assert!(msg.contains("locked")),
            other => panic!("Expected DbBusy error, got {:?}", other),
        }
    }

    #[test]
    fn test_locked_database_released_on_drop() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("db");

        {
            let _db = Database::open_locked(&db_path).unwrap();
        }

        let _db2 = Database::open_locked(&db_path).unwrap();
    }

    #[test]
    fn test_locked_database_blocking_timeout() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("db");

        let _db1 = Database::open_locked(&db_path).unwrap();

        match Database::open_locked_blocking(&db_path, Duration::from_millis(50)).unwrap_err() {
            TasklaneError::DbBusy(msg) => assert!(msg.contains("Timeout")),
            other => panic!("Expected DbBusy timeout error, got {:?}", other),
        }
    }

    #[test]
    fn test_shared_source_hands_out_same_trees() {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("db")).unwrap();
        let source = DatabaseSource::Shared(db.clone());

        db.queue()
            .queue_operation(1, "", "Buy milk", "L1", OperationType::Create)
            .unwrap();

        let guard = source.acquire().unwrap();
        assert_eq!(guard.queue().pending_count().unwrap(), 1);
    }

    #[test]
    fn test_stats_counts() {
        let dir = tempdir().unwrap();
        let db = Database::open(&dir.path().join("db")).unwrap();

        db.task_store().create_task(Task::new("L1", "a")).unwrap();
        db.queue()
            .queue_operation(1, "", "a", "L1", OperationType::Create)
            .unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(stats.task_count, 1);
        assert_eq!(stats.queue_len, 1);
        assert_eq!(stats.pending_conflicts, 0);
    }
}
