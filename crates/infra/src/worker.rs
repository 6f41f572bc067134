//! Background worker draining a [`JobQueue`].

use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use stepqueue_core::{ExecutionContext, WorkerIdentity};

use crate::config::{DEFAULT_WORKER_SLEEP, QueueConfig};
use crate::queue::{JobQueue, QueueError};
use crate::store::QueueStore;

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Thread name, also used in logs.
    pub name: String,
    /// Back-off after a poll that found nothing.
    pub idle_sleep: Duration,
    /// How often the liveness entry is refreshed while a job runs.
    pub heartbeat_interval: Duration,
    /// Minimum gap between two abandoned-job sweeps.
    pub reconcile_interval: Duration,
    pub identity: WorkerIdentity,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "stepqueue-worker".to_string(),
            idle_sleep: DEFAULT_WORKER_SLEEP,
            heartbeat_interval: Duration::from_secs(15),
            reconcile_interval: Duration::from_secs(30),
            identity: WorkerIdentity::current(),
        }
    }
}

impl WorkerConfig {
    /// Defaults, with the idle sleep taken from the queue configuration and
    /// four heartbeats per liveness window.
    pub fn for_queue(config: &QueueConfig) -> Self {
        Self::default()
            .with_idle_sleep(config.worker_sleep)
            .with_heartbeat_interval(heartbeat_for(config.liveness_window))
    }

    /// Heartbeat interval to use against a queue whose liveness window is `window`.
    ///
    /// An interval that does not fit inside the window would let a busy worker
    /// drop out of touch, so it is replaced by a quarter of the window.
    pub fn heartbeat_within(&self, window: Duration) -> Duration {
        if self.heartbeat_interval < window {
            return self.heartbeat_interval.max(MIN_HEARTBEAT);
        }
        let clamped = heartbeat_for(window);
        warn!(
            worker = %self.identity,
            heartbeat_secs = self.heartbeat_interval.as_secs_f64(),
            liveness_window_secs = window.as_secs_f64(),
            clamped_secs = clamped.as_secs_f64(),
            "heartbeat interval does not fit the liveness window; clamping"
        );
        clamped
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep = sleep;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn with_identity(mut self, identity: WorkerIdentity) -> Self {
        self.identity = identity;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub idle_polls: u64,
    pub claim_errors: u64,
    pub jobs_requeued: u64,
}

/// Handle to a running worker. Dropping it stops the worker too.
pub struct WorkerHandle<S: QueueStore + 'static> {
    queue: Arc<JobQueue<S>>,
    identity: WorkerIdentity,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    heartbeat: Option<(mpsc::Sender<()>, thread::JoinHandle<()>)>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<S: QueueStore + 'static> WorkerHandle<S> {
    /// Stop the loop after the current job, wait for it, and unregister the worker.
    pub fn stop(mut self) {
        self.shutdown_and_join();
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|j| !j.is_finished())
    }

    fn shutdown_and_join(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        let _ = self.shutdown.send(());
        if join.join().is_err() {
            error!(worker = %self.identity, "worker thread panicked");
        }
        if let Some((stop, heartbeat)) = self.heartbeat.take() {
            let _ = stop.send(());
            let _ = heartbeat.join();
        }

        if let Err(err) = self.queue.unregister_worker(&self.identity) {
            warn!(worker = %self.identity, error = %err, "failed to unregister worker");
        }
        self.queue.mark_worker_stopped();
        info!(worker = %self.identity, "worker stopped");
    }
}

impl<S: QueueStore + 'static> Drop for WorkerHandle<S> {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

/// Polls a queue, running each claimed job to completion.
#[derive(Debug)]
pub struct Worker;

impl Worker {
    /// Spawn the driver loop on its own thread. At most one worker may run per queue handle.
    pub fn start<S: QueueStore + 'static>(
        queue: Arc<JobQueue<S>>,
        ctx: Arc<ExecutionContext>,
        config: WorkerConfig,
    ) -> Result<WorkerHandle<S>, QueueError> {
        queue.mark_worker_started()?;

        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let identity = config.identity.clone();

        let join = {
            let queue = Arc::clone(&queue);
            let stats = Arc::clone(&stats);
            let config = config.clone();
            thread::Builder::new()
                .name(config.name.clone())
                .spawn(move || worker_loop(&queue, &ctx, &config, &shutdown_rx, &stats))
        };
        let join = match join {
            Ok(join) => join,
            Err(err) => {
                queue.mark_worker_stopped();
                return Err(QueueError::Spawn(err));
            }
        };

        let (heartbeat_tx, heartbeat_rx) = mpsc::channel::<()>();
        let heartbeat = {
            let queue = Arc::clone(&queue);
            let identity = identity.clone();
            let interval = config.heartbeat_within(queue.config().liveness_window);
            thread::Builder::new()
                .name(format!("{}-heartbeat", config.name))
                .spawn(move || heartbeat_loop(&queue, &identity, interval, &heartbeat_rx))
        };
        let heartbeat = match heartbeat {
            Ok(handle) => Some((heartbeat_tx, handle)),
            Err(err) => {
                warn!(worker = %identity, error = %err, "heartbeat thread unavailable; relying on claim polls");
                None
            }
        };

        Ok(WorkerHandle {
            queue,
            identity,
            shutdown: shutdown_tx,
            join: Some(join),
            heartbeat,
            stats,
        })
    }
}

fn stop_requested(shutdown: &mpsc::Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}

fn worker_loop<S: QueueStore>(
    queue: &JobQueue<S>,
    ctx: &ExecutionContext,
    config: &WorkerConfig,
    shutdown: &mpsc::Receiver<()>,
    stats: &Mutex<WorkerStats>,
) {
    let identity = &config.identity;
    let _span = stepqueue_observability::tracing::worker_span(&config.name, &identity.host, identity.pid).entered();
    info!(worker = %identity, name = %config.name, "worker started");

    if let Err(err) = queue.touch_worker(identity) {
        warn!(worker = %identity, error = %err, "failed to register worker");
    }
    let mut last_sweep = None;
    sweep_abandoned(queue, identity, stats, &mut last_sweep);

    while !stop_requested(shutdown) {
        match queue.claim(Some(identity)) {
            Ok(Some(mut job)) => {
                debug!(worker = %identity, job_uuid = ?job.uuid.map(|u| u.get()), "running job");
                let outcome = stepqueue_observability::tracing::job_span(job.uuid.map(|u| u.get()), job.is_ordered())
                    .in_scope(|| job.run(queue, ctx));

                let mut stats = stats.lock().unwrap_or_else(PoisonError::into_inner);
                stats.jobs_processed += 1;
                if outcome.is_completed() {
                    stats.jobs_completed += 1;
                } else {
                    stats.jobs_failed += 1;
                }
                continue;
            }
            Ok(None) => {
                stats.lock().unwrap_or_else(PoisonError::into_inner).idle_polls += 1;
                let due = last_sweep.is_none_or(|at: Instant| at.elapsed() >= config.reconcile_interval);
                if due {
                    sweep_abandoned(queue, identity, stats, &mut last_sweep);
                }
            }
            Err(err) => {
                stats.lock().unwrap_or_else(PoisonError::into_inner).claim_errors += 1;
                error!(worker = %identity, error = %err, "failed to claim job");
            }
        }

        match shutdown.recv_timeout(config.idle_sleep) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn sweep_abandoned<S: QueueStore>(
    queue: &JobQueue<S>,
    identity: &WorkerIdentity,
    stats: &Mutex<WorkerStats>,
    last_sweep: &mut Option<Instant>,
) {
    *last_sweep = Some(Instant::now());
    match queue.reconcile_abandoned() {
        Ok(requeued) if !requeued.is_empty() => {
            info!(worker = %identity, count = requeued.len(), "requeued abandoned jobs");
            stats.lock().unwrap_or_else(PoisonError::into_inner).jobs_requeued += requeued.len() as u64;
        }
        Ok(_) => {}
        Err(err) => warn!(worker = %identity, error = %err, "abandoned-job sweep failed"),
    }
}

fn heartbeat_for(window: Duration) -> Duration {
    (window / 4).max(MIN_HEARTBEAT)
}

fn heartbeat_loop<S: QueueStore>(
    queue: &JobQueue<S>,
    identity: &WorkerIdentity,
    interval: Duration,
    stop: &mpsc::Receiver<()>,
) {
    while let Err(RecvTimeoutError::Timeout) = stop.recv_timeout(interval) {
        if let Err(err) = queue.touch_worker(identity) {
            warn!(worker = %identity, error = %err, "heartbeat failed");
        }
    }
}
