//! Queue behavior against a real SQLite file.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use stepqueue_core::{Action, Job, JobStep, JobUuid, WorkerIdentity};
use stepqueue_infra::queue::Placement;
use stepqueue_infra::{JobQueue, QueueConfig, SqliteStore};

fn temp_db() -> PathBuf {
    std::env::temp_dir()
        .join("stepqueue-it")
        .join(format!("{}.sqlite3", uuid::Uuid::now_v7()))
}

fn open(path: &PathBuf) -> JobQueue<SqliteStore> {
    let store = SqliteStore::open(path).unwrap();
    JobQueue::new(store, QueueConfig::for_env("test").with_db_path(path))
}

fn job(ordered: bool) -> Job {
    let job = Job::new(vec![JobStep::new(Action::method("noop")).unwrap()]);
    if ordered { job } else { job.unordered() }
}

fn uuids(jobs: &[Job]) -> Vec<u64> {
    jobs.iter().filter_map(|j| j.uuid.map(JobUuid::get)).collect()
}

#[test]
fn first_claim_takes_the_oldest_ordered_job() {
    let path = temp_db();
    let queue = open(&path);
    for _ in 0..3 {
        queue.submit(&mut job(true)).unwrap();
    }

    let claimed = queue.claim(None).unwrap().unwrap();
    assert_eq!(claimed.uuid, Some(JobUuid::new(1)));
    assert_eq!(uuids(&queue.jobs().unwrap().jobs_waiting_ordered), vec![2, 3]);
    assert!(queue.claim(None).unwrap().is_none());

    let _ = std::fs::remove_file(&path);
}

#[test]
fn lanes_keep_submission_order() {
    let path = temp_db();
    let queue = open(&path);
    for ordered in [true, true, false, false, true, false] {
        queue.submit(&mut job(ordered)).unwrap();
    }

    let listing = queue.jobs().unwrap();
    assert_eq!(uuids(&listing.jobs_waiting_ordered), vec![1, 2, 5]);
    assert_eq!(uuids(&listing.jobs_waiting_unordered), vec![3, 4, 6]);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn state_survives_a_restart() {
    let path = temp_db();
    {
        let queue = open(&path);
        queue.submit(&mut job(true)).unwrap();
        queue.submit(&mut job(false).with_metadata("tenant", "acme")).unwrap();
        let mut claimed = queue.claim(Some(&WorkerIdentity::new("h", 1))).unwrap().unwrap();
        queue.complete(&mut claimed).unwrap();
    }

    let queue = open(&path);
    let stats = queue.stats().unwrap();
    assert_eq!(stats.next_uuid, 3);
    assert_eq!(stats.jobs_completed, 1);
    assert_eq!(stats.jobs_waiting_unordered, 1);
    assert!(stats.last_job_completed_at.is_some());
    assert!(stats.min_processing_time < 1.0e16);

    let survivor = queue.job_by_str("2").unwrap().unwrap();
    assert!(!survivor.is_ordered());
    assert_eq!(survivor.metadata["tenant"], "acme");

    queue.hard_reset().unwrap();
    drop(queue);
    let queue = open(&path);
    assert_eq!(queue.stats().unwrap().next_uuid, 1);
    assert_eq!(queue.job(JobUuid::new(2)).unwrap(), None);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn concurrent_claims_never_share_a_job() {
    let path = temp_db();
    {
        let queue = open(&path);
        for i in 0..40 {
            queue.submit(&mut job(i % 4 == 0)).unwrap();
        }
    }

    // One queue handle (and connection) per thread, as separate processes would have.
    let workers = 4;
    let barrier = Arc::new(Barrier::new(workers));
    let claimed = Arc::new(Mutex::new(Vec::new()));
    let threads: Vec<_> = (0..workers)
        .map(|n| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            let claimed = Arc::clone(&claimed);
            thread::spawn(move || {
                let queue = open(&path);
                let me = WorkerIdentity::new("it", n as u32);
                barrier.wait();
                while let Some(mut job) = queue.claim(Some(&me)).unwrap() {
                    let uuid = job.uuid.unwrap();
                    let snapshot = queue.snapshot().unwrap();
                    assert!(matches!(snapshot.placement(uuid), Some(Placement::Processing(_))));
                    claimed.lock().unwrap().push(uuid);
                    queue.complete(&mut job).unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let claimed = claimed.lock().unwrap();
    let unique: HashSet<_> = claimed.iter().collect();
    assert_eq!(claimed.len(), 40);
    assert_eq!(unique.len(), 40);

    let queue = open(&path);
    let stats = queue.stats().unwrap();
    assert_eq!(stats.jobs_completed, 40);
    assert_eq!(stats.jobs_processing_unordered, 0);
    assert_eq!(stats.workers_in_touch.len(), workers);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn ordered_jobs_are_claimed_in_submission_order_across_handles() {
    let path = temp_db();
    let submitter = open(&path);
    for _ in 0..5 {
        submitter.submit(&mut job(true)).unwrap();
    }

    let a = open(&path);
    let b = open(&path);
    let mut order = Vec::new();
    for handle in [&a, &b, &a, &b, &a] {
        let mut claimed = handle.claim(None).unwrap().unwrap();
        // The other handle sees the ordered lane as busy.
        let other = if std::ptr::eq(handle, &a) { &b } else { &a };
        assert!(other.claim(None).unwrap().is_none());
        order.push(claimed.uuid.unwrap().get());
        handle.fail(&mut claimed).unwrap();
    }
    assert_eq!(order, vec![1, 2, 3, 4, 5]);
    assert_eq!(submitter.stats().unwrap().jobs_failed, 5);

    let _ = std::fs::remove_file(&path);
}
