//! Stress tests for the sync queue and conflict store under concurrent access

use libtasklane_core::types::{NewConflict, OperationType, Task};
use libtasklane_core::{Database, SyncCoordinator, TaskStore, TasklaneError};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

#[test]
fn test_concurrent_coordinator_mutations_counted_exactly() {
    let dir = tempdir().unwrap();
    let db = Database::open(&dir.path().join("db")).expect("Failed to open database");

    let num_threads = 8;
    let tasks_per_thread = 40;
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|thread_id| {
            let db = db.clone();
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                let coord = SyncCoordinator::new(db.task_store(), db.queue());
                barrier.wait();

                let mut success_count = 0;
                for i in 0..tasks_per_thread {
                    let task = Task::new(format!("L{}", thread_id), format!("task {}-{}", thread_id, i));
                    match coord.create_task(task) {
                        Ok(_) => success_count += 1,
                        Err(e) => eprintln!("Thread {} task {} failed: {:?}", thread_id, i, e),
                    }
                }
                success_count
            })
        })
        .collect();

    let total_success: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    let expected = num_threads * tasks_per_thread;
    assert_eq!(total_success, expected);

    let queue = db.queue();
    assert_eq!(queue.pending_count().unwrap(), expected as u64);

    let ops = queue.pending_operations().unwrap();
    assert_eq!(ops.len(), expected);
    assert!(ops.iter().all(|op| op.operation_type == OperationType::Create));
    assert!(ops.windows(2).all(|w| w[0].processing_key() <= w[1].processing_key()));
}

#[test]
fn test_clear_while_enqueueing_keeps_counter_consistent() {
    let dir = tempdir().unwrap();
    let db = Database::open(&dir.path().join("db")).expect("Failed to open database");

    let writers = 4;
    let ops_per_writer = 100;
    let barrier = Arc::new(Barrier::new(writers + 1));

    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let queue = db.queue();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..ops_per_writer {
                    queue
                        .queue_operation(i as u64 + 1, "", &format!("w{}-{}", w, i), "L1", OperationType::Update)
                        .unwrap();
                }
            })
        })
        .collect();

    let clearer = {
        let queue = db.queue();
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            let mut cleared = 0;
            for _ in 0..10 {
                cleared += queue.clear_queue().unwrap();
                thread::yield_now();
            }
            cleared
        })
    };

    for h in handles {
        h.join().unwrap();
    }
    let cleared = clearer.join().unwrap();

    let queue = db.queue();
    let remaining = queue.pending_operations().unwrap().len() as u64;
    assert_eq!(queue.pending_count().unwrap(), remaining);
    assert_eq!(cleared + remaining, (writers * ops_per_writer) as u64);
}

#[test]
fn test_concurrent_add_conflict_single_winner() {
    let dir = tempdir().unwrap();
    let db = Database::open(&dir.path().join("db")).expect("Failed to open database");

    let num_threads = 8;
    let barrier = Arc::new(Barrier::new(num_threads));

    let handles: Vec<_> = (0..num_threads)
        .map(|thread_id| {
            let store = db.conflict_store();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let now = chrono::Utc::now();
                barrier.wait();
                store.add_conflict(NewConflict {
                    task_uid: "abc".to_string(),
                    task_summary: format!("attempt {}", thread_id),
                    list_id: "L1".to_string(),
                    local_version: "{}".to_string(),
                    remote_version: "{}".to_string(),
                    local_modified: now,
                    remote_modified: now,
                })
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(TasklaneError::Conflict(_))))
        .count();

    assert_eq!(winners, 1);
    assert_eq!(rejected, num_threads - 1);
    assert_eq!(db.conflict_store().conflicts().unwrap().len(), 1);
}
