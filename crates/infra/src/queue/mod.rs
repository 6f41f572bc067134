//! The durable two-lane job queue.
//!
//! Every operation is exactly one store transaction, so concurrent callers
//! (threads or processes sharing a SQLite file) never claim the same job and
//! never see two ordered jobs in flight.

pub mod state;

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use stepqueue_core::{ExecutionContext, Job, JobError, JobLifecycle, JobOutcome, JobUuid, WorkerIdentity};

use crate::config::QueueConfig;
use crate::store::{QueueStore, StoreError, Transaction};

pub use state::{
    JobListing, Lane, MAX_PROCESSING_SENTINEL, MIN_PROCESSING_SENTINEL, Placement, QueueState, QueueStats,
    WorkerContact,
};

/// Queue error.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("a worker is already running for this queue")]
    WorkerAlreadyRunning,
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// What [`JobQueue::enqueue`] did with a job.
#[derive(Debug)]
pub enum Enqueued {
    /// Ran in the caller; never persisted as waiting.
    Ran(JobOutcome),
    /// Submitted for a worker to pick up.
    Submitted(Job),
}

/// Persistent scheduler over a [`QueueStore`].
///
/// Construct one per store and share it (e.g. behind an `Arc`) between the
/// callers that submit and the worker that drains it.
pub struct JobQueue<S: QueueStore> {
    store: S,
    config: QueueConfig,
    worker_running: AtomicBool,
}

impl<S: QueueStore> JobQueue<S> {
    pub fn new(store: S, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            worker_running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Assign a uuid and `submitted_at`, append to the job's lane, persist the record.
    pub fn submit(&self, job: &mut Job) -> Result<JobUuid, QueueError> {
        let now = Utc::now();
        let lane = Lane::of(job);
        let mut record = job.clone();

        let uuid = self.store.transaction(|tx| {
            let uuid = tx.state().issue_uuid();
            tx.state().admit(uuid, lane, now);
            record.uuid = Some(uuid);
            record.submitted_at = Some(now);
            tx.save_job(&record)?;
            Ok::<_, QueueError>(uuid)
        })?;

        job.uuid = Some(uuid);
        job.submitted_at = Some(now);
        debug!(job_uuid = %uuid, %lane, "job submitted");
        Ok(uuid)
    }

    /// Run the job now when the queue or the job is synchronous, else submit it.
    pub fn enqueue(&self, mut job: Job, ctx: &ExecutionContext) -> Result<Enqueued, QueueError> {
        if self.config.synchronous || job.synchronous {
            debug!(steps = job.steps.len(), "running job synchronously");
            return Ok(Enqueued::Ran(job.run(self, ctx)));
        }
        self.submit(&mut job)?;
        Ok(Enqueued::Submitted(job))
    }

    /// Claim the next eligible job, stamping `begun_at` (and the claimant, if given).
    ///
    /// Passing a worker identity also refreshes its liveness entry.
    pub fn claim(&self, worker: Option<&WorkerIdentity>) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let window = self.config.liveness_window;

        self.store.transaction(|tx| {
            if let Some(worker) = worker {
                tx.state().touch_worker(worker, now, window);
            }

            while let Some((uuid, lane)) = tx.state().select_next() {
                let Some(mut job) = tx.load_job(uuid)? else {
                    warn!(job_uuid = %uuid, %lane, "dropping queued id with no job record");
                    tx.state().detach(uuid);
                    continue;
                };
                job.begun_at = Some(now);
                job.claimed_by = worker.cloned();
                job.claims += 1;
                tx.save_job(&job)?;
                debug!(job_uuid = %uuid, %lane, "job claimed");
                return Ok(Some(job));
            }
            Ok(None)
        })
    }

    /// Remove a finished job and fold its timing into the statistics.
    ///
    /// A copy whose claim was taken over (requeued, then claimed again) is
    /// ignored: the lanes, the record and the counters stay as they are.
    pub fn complete(&self, job: &mut Job) -> Result<(), QueueError> {
        let now = Utc::now();
        let elapsed = job.begun_at.map(|begun| elapsed_seconds(begun, now));

        let retired = self.store.transaction(|tx| {
            if !holds_claim(tx, job)? {
                return Ok::<_, QueueError>(false);
            }
            if let Some(uuid) = job.uuid {
                tx.state().detach(uuid);
                tx.delete_job(uuid)?;
            }
            tx.state().record_completion(now, elapsed);
            Ok(true)
        })?;

        if !retired {
            warn!(job_uuid = ?job.uuid.map(JobUuid::get), claims = job.claims, "ignoring completion of a job claimed elsewhere");
            return Ok(());
        }

        job.completed_at = Some(now);
        job.elapsed_seconds = elapsed;
        info!(job_uuid = ?job.uuid.map(JobUuid::get), elapsed_seconds = ?elapsed, "job completed");
        Ok(())
    }

    /// Remove a failed job and count it. The counter update is best-effort.
    pub fn fail(&self, job: &mut Job) -> Result<(), QueueError> {
        if !self.release(job)? {
            warn!(job_uuid = ?job.uuid.map(JobUuid::get), claims = job.claims, "ignoring failure of a job claimed elsewhere");
            return Ok(());
        }

        let counted = self.store.transaction(|tx| {
            tx.state().record_failure();
            Ok::<_, StoreError>(())
        });
        if let Err(err) = counted {
            warn!(job_uuid = ?job.uuid.map(JobUuid::get), error = %err, "failed to count failed job");
        }
        info!(job_uuid = ?job.uuid.map(JobUuid::get), "job failed");
        Ok(())
    }

    /// Strip the job from every lane and delete its record. Unknown jobs are a no-op,
    /// as are claimed copies whose claim was taken over.
    pub fn remove(&self, job: &Job) -> Result<(), QueueError> {
        if !self.release(job)? {
            warn!(job_uuid = ?job.uuid.map(JobUuid::get), claims = job.claims, "ignoring removal of a job claimed elsewhere");
        }
        Ok(())
    }

    fn release(&self, job: &Job) -> Result<bool, QueueError> {
        let Some(uuid) = job.uuid else {
            return Ok(true);
        };
        self.store.transaction(|tx| {
            if !holds_claim(tx, job)? {
                return Ok(false);
            }
            tx.state().detach(uuid);
            tx.delete_job(uuid)?;
            Ok(true)
        })
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let worker_pid = self.worker_pid();
        self.store
            .transaction(|tx| Ok(QueueStats::from_state(tx.state(), worker_pid)))
    }

    /// Every job record, grouped by lane.
    pub fn jobs(&self) -> Result<JobListing, QueueError> {
        self.store.transaction(|tx| {
            let state = tx.state().clone();
            let mut load = |ids: Vec<JobUuid>| -> Result<Vec<Job>, QueueError> {
                let mut jobs = Vec::with_capacity(ids.len());
                for uuid in ids {
                    if let Some(job) = tx.load_job(uuid)? {
                        jobs.push(job);
                    }
                }
                Ok(jobs)
            };

            Ok(JobListing {
                jobs_waiting_unordered: load(state.waiting_unordered.into_iter().collect())?,
                jobs_waiting_ordered: load(state.waiting_ordered.into_iter().collect())?,
                jobs_processing_ordered: load(state.processing_ordered.into_iter().collect())?,
                jobs_processing_unordered: load(state.processing_unordered)?,
            })
        })
    }

    /// Copy of the persisted queue state.
    pub fn snapshot(&self) -> Result<QueueState, QueueError> {
        self.store.transaction(|tx| Ok(tx.state().clone()))
    }

    pub fn job(&self, uuid: JobUuid) -> Result<Option<Job>, QueueError> {
        self.store.transaction(|tx| Ok(tx.load_job(uuid)?))
    }

    /// Look a job up by its textual uuid; malformed ids never reach the store.
    pub fn job_by_str(&self, uuid: &str) -> Result<Option<Job>, QueueError> {
        let uuid: JobUuid = uuid.parse()?;
        self.job(uuid)
    }

    /// Drop every job and reset counters, lanes and statistics.
    pub fn hard_reset(&self) -> Result<(), QueueError> {
        self.store.transaction(|tx| Ok::<_, QueueError>(tx.clear()?))?;
        warn!("job queue hard reset");
        Ok(())
    }

    /// Record a liveness heartbeat for `worker`.
    pub fn touch_worker(&self, worker: &WorkerIdentity) -> Result<(), QueueError> {
        let now = Utc::now();
        let window = self.config.liveness_window;
        self.store.transaction(|tx| {
            tx.state().touch_worker(worker, now, window);
            Ok(())
        })
    }

    pub fn unregister_worker(&self, worker: &WorkerIdentity) -> Result<(), QueueError> {
        self.store.transaction(|tx| {
            tx.state().forget_worker(worker);
            Ok(())
        })
    }

    /// Requeue in-flight jobs whose claimant is no longer in touch.
    ///
    /// Requeued jobs go back to the head of their lane with `begun_at` and
    /// `claimed_by` cleared. Anonymously claimed jobs are left alone.
    pub fn reconcile_abandoned(&self) -> Result<Vec<JobUuid>, QueueError> {
        let now = Utc::now();
        let window = self.config.liveness_window;

        let requeued = self.store.transaction(|tx| {
            tx.state().prune_workers(now, window);

            let mut requeued = Vec::new();
            // Reverse so that pushing each to the front keeps claim order.
            for (uuid, lane) in tx.state().in_flight().into_iter().rev() {
                let Some(mut job) = tx.load_job(uuid)? else {
                    warn!(job_uuid = %uuid, %lane, "dropping in-flight id with no job record");
                    tx.state().detach(uuid);
                    continue;
                };
                let Some(claimant) = job.claimed_by.clone() else {
                    continue;
                };
                if tx.state().is_in_touch(&claimant) {
                    continue;
                }

                tx.state().requeue_front(uuid, lane);
                job.begun_at = None;
                job.claimed_by = None;
                tx.save_job(&job)?;
                warn!(job_uuid = %uuid, %lane, worker = %claimant, "requeued job abandoned by its worker");
                requeued.push(uuid);
            }
            requeued.reverse();
            Ok::<_, QueueError>(requeued)
        })?;

        Ok(requeued)
    }

    /// Process id reported by `stats()` while a worker runs from this handle.
    pub fn worker_pid(&self) -> Option<u32> {
        self.worker_running
            .load(Ordering::SeqCst)
            .then(std::process::id)
    }

    pub(crate) fn mark_worker_started(&self) -> Result<(), QueueError> {
        self.worker_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| QueueError::WorkerAlreadyRunning)
    }

    pub(crate) fn mark_worker_stopped(&self) {
        self.worker_running.store(false, Ordering::SeqCst);
    }
}

impl<S: QueueStore> JobLifecycle for JobQueue<S> {
    fn complete(&self, job: &mut Job) -> anyhow::Result<()> {
        Self::complete(self, job)?;
        Ok(())
    }

    fn fail(&self, job: &mut Job) -> anyhow::Result<()> {
        Self::fail(self, job)?;
        Ok(())
    }
}

/// Whether `job` may still retire its record.
///
/// Copies that were never claimed always may. A claimed copy may only while
/// the stored record carries the same claim count.
fn holds_claim(tx: &mut dyn Transaction, job: &Job) -> Result<bool, StoreError> {
    let Some(uuid) = job.uuid else {
        return Ok(true);
    };
    if job.claims == 0 {
        return Ok(true);
    }
    Ok(tx
        .load_job(uuid)?
        .is_some_and(|stored| stored.claims == job.claims))
}

fn elapsed_seconds(begun: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - begun).to_std().map(|d| d.as_secs_f64()).unwrap_or(0.0)
}
