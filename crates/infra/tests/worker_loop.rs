//! Worker loop against a SQLite-backed queue.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use stepqueue_core::{Action, ActionRegistry, Arg, ClassRegistry, ExecutionContext, Job, JobStep, WorkerIdentity};
use stepqueue_infra::{JobQueue, QueueConfig, SqliteStore, Worker, WorkerConfig};

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(10));
    }
}

fn recording_context(seen: &Arc<Mutex<Vec<i64>>>) -> Arc<ExecutionContext> {
    let seen = Arc::clone(seen);
    let actions = ActionRegistry::new().with("record", move |args: &[Arg]| {
        let n = args.first().and_then(Arg::as_value).and_then(Value::as_i64).unwrap_or(-1);
        seen.lock().unwrap().push(n);
        Ok(Value::Null)
    });
    Arc::new(ExecutionContext::new(actions, Arc::new(ClassRegistry::new())))
}

fn record(n: i64) -> Job {
    Job::new(vec![JobStep::new(Action::method("record")).unwrap().do_arg(n)])
}

#[test]
fn worker_runs_ordered_jobs_in_submission_order() {
    let path = std::env::temp_dir()
        .join("stepqueue-it")
        .join(format!("{}.sqlite3", uuid::Uuid::now_v7()));
    let config = QueueConfig::for_env("test")
        .with_db_path(&path)
        .with_worker_sleep(Duration::from_millis(10));
    let queue = Arc::new(JobQueue::new(SqliteStore::open(&path).unwrap(), config.clone()));
    let seen = Arc::new(Mutex::new(Vec::new()));

    for n in 1..=5 {
        queue.submit(&mut record(n)).unwrap();
    }

    let worker_config = WorkerConfig::for_queue(&config)
        .with_name("it-worker")
        .with_identity(WorkerIdentity::new("it-host", 9001));
    let worker = Worker::start(Arc::clone(&queue), recording_context(&seen), worker_config).unwrap();

    wait_for(|| worker.stats().jobs_completed == 5);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);

    // Jobs submitted while the worker idles are picked up too.
    queue.submit(&mut record(6).unordered()).unwrap();
    wait_for(|| worker.stats().jobs_completed == 6);
    assert!(worker.stats().idle_polls > 0);

    let stats = queue.stats().unwrap();
    assert_eq!(stats.jobs_completed, 6);
    assert_eq!(stats.worker_pid, Some(std::process::id()));
    assert!(stats.workers_in_touch.iter().any(|w| w.host == "it-host" && w.pid == 9001));

    worker.stop();
    let stats = queue.stats().unwrap();
    assert_eq!(stats.worker_pid, None);
    assert!(stats.workers_in_touch.is_empty());

    let _ = std::fs::remove_file(&path);
}

#[test]
fn stopping_an_idle_worker_is_prompt() {
    let queue = Arc::new(JobQueue::new(SqliteStore::in_memory().unwrap(), QueueConfig::for_env("test")));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let worker = Worker::start(
        Arc::clone(&queue),
        recording_context(&seen),
        WorkerConfig::default().with_idle_sleep(Duration::from_secs(30)),
    )
    .unwrap();

    let started = Instant::now();
    worker.stop();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(seen.lock().unwrap().is_empty());
}
