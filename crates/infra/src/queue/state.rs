//! Persisted queue state and the records reported from it.
//!
//! Every method here is a pure in-memory transition; the queue applies them
//! inside a store transaction so they become atomic and durable.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stepqueue_core::{Job, JobUuid, WorkerIdentity};

/// Seed for `max_processing_time`; any real sample replaces it.
pub const MAX_PROCESSING_SENTINEL: f64 = -1.0e16;
/// Seed for `min_processing_time`; any real sample replaces it.
pub const MIN_PROCESSING_SENTINEL: f64 = 1.0e16;

/// The two admission lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Strict FIFO, one job in flight at a time.
    Ordered,
    /// May run concurrently with each other and with the ordered job.
    Unordered,
}

impl Lane {
    pub fn of(job: &Job) -> Self {
        if job.is_ordered() {
            Lane::Ordered
        } else {
            Lane::Unordered
        }
    }
}

impl core::fmt::Display for Lane {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Lane::Ordered => f.write_str("ordered"),
            Lane::Unordered => f.write_str("unordered"),
        }
    }
}

/// Where a job id currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Waiting(Lane),
    Processing(Lane),
}

/// Last time a worker was heard from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerContact {
    pub host: String,
    pub pid: u32,
    pub last_seen: DateTime<Utc>,
}

impl WorkerContact {
    pub fn is(&self, identity: &WorkerIdentity) -> bool {
        self.host == identity.host && self.pid == identity.pid
    }
}

/// Lanes, counters and statistics, persisted key by key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueState {
    pub waiting_ordered: VecDeque<JobUuid>,
    pub waiting_unordered: VecDeque<JobUuid>,
    pub processing_ordered: Option<JobUuid>,
    pub processing_unordered: Vec<JobUuid>,
    pub next_uuid: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub total_time_used: f64,
    pub max_processing_time: f64,
    pub min_processing_time: f64,
    pub last_job_submitted_at: Option<DateTime<Utc>>,
    pub last_job_completed_at: Option<DateTime<Utc>>,
    pub workers_in_touch: Vec<WorkerContact>,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            waiting_ordered: VecDeque::new(),
            waiting_unordered: VecDeque::new(),
            processing_ordered: None,
            processing_unordered: Vec::new(),
            next_uuid: 1,
            jobs_completed: 0,
            jobs_failed: 0,
            total_time_used: 0.0,
            max_processing_time: MAX_PROCESSING_SENTINEL,
            min_processing_time: MIN_PROCESSING_SENTINEL,
            last_job_submitted_at: None,
            last_job_completed_at: None,
            workers_in_touch: Vec::new(),
        }
    }
}

impl QueueState {
    /// Hand out the next job uuid.
    pub fn issue_uuid(&mut self) -> JobUuid {
        let uuid = JobUuid::new(self.next_uuid);
        self.next_uuid += 1;
        uuid
    }

    /// Append a freshly submitted job to the tail of its lane.
    pub fn admit(&mut self, uuid: JobUuid, lane: Lane, at: DateTime<Utc>) {
        match lane {
            Lane::Ordered => self.waiting_ordered.push_back(uuid),
            Lane::Unordered => self.waiting_unordered.push_back(uuid),
        }
        self.last_job_submitted_at = Some(at);
    }

    /// Pick the next eligible job and mark it in flight.
    ///
    /// While an ordered job is in flight only unordered jobs are eligible.
    /// Otherwise the ordered lane wins over the unordered one.
    pub fn select_next(&mut self) -> Option<(JobUuid, Lane)> {
        if self.processing_ordered.is_some() {
            let uuid = self.waiting_unordered.pop_front()?;
            self.processing_unordered.push(uuid);
            return Some((uuid, Lane::Unordered));
        }
        if let Some(uuid) = self.waiting_ordered.pop_front() {
            self.processing_ordered = Some(uuid);
            return Some((uuid, Lane::Ordered));
        }
        let uuid = self.waiting_unordered.pop_front()?;
        self.processing_unordered.push(uuid);
        Some((uuid, Lane::Unordered))
    }

    /// Strip a job id from every lane and in-flight slot. Returns whether it was present.
    pub fn detach(&mut self, uuid: JobUuid) -> bool {
        let before = self.waiting_ordered.len() + self.waiting_unordered.len() + self.processing_unordered.len();
        self.waiting_ordered.retain(|id| *id != uuid);
        self.waiting_unordered.retain(|id| *id != uuid);
        self.processing_unordered.retain(|id| *id != uuid);
        let after = self.waiting_ordered.len() + self.waiting_unordered.len() + self.processing_unordered.len();

        let was_processing_ordered = self.processing_ordered == Some(uuid);
        if was_processing_ordered {
            self.processing_ordered = None;
        }
        was_processing_ordered || before != after
    }

    /// Return an in-flight job to the head of its lane.
    pub fn requeue_front(&mut self, uuid: JobUuid, lane: Lane) {
        self.detach(uuid);
        match lane {
            Lane::Ordered => self.waiting_ordered.push_front(uuid),
            Lane::Unordered => self.waiting_unordered.push_front(uuid),
        }
    }

    pub fn placement(&self, uuid: JobUuid) -> Option<Placement> {
        if self.processing_ordered == Some(uuid) {
            Some(Placement::Processing(Lane::Ordered))
        } else if self.processing_unordered.contains(&uuid) {
            Some(Placement::Processing(Lane::Unordered))
        } else if self.waiting_ordered.contains(&uuid) {
            Some(Placement::Waiting(Lane::Ordered))
        } else if self.waiting_unordered.contains(&uuid) {
            Some(Placement::Waiting(Lane::Unordered))
        } else {
            None
        }
    }

    /// In-flight job ids, ordered job first.
    pub fn in_flight(&self) -> Vec<(JobUuid, Lane)> {
        self.processing_ordered
            .iter()
            .map(|uuid| (*uuid, Lane::Ordered))
            .chain(self.processing_unordered.iter().map(|uuid| (*uuid, Lane::Unordered)))
            .collect()
    }

    /// Account for a completed job. Timing aggregates only take jobs that were claimed.
    pub fn record_completion(&mut self, at: DateTime<Utc>, elapsed: Option<f64>) {
        self.jobs_completed += 1;
        self.last_job_completed_at = Some(at);
        if let Some(elapsed) = elapsed {
            self.total_time_used += elapsed;
            if elapsed > self.max_processing_time {
                self.max_processing_time = elapsed;
            }
            if elapsed < self.min_processing_time {
                self.min_processing_time = elapsed;
            }
        }
    }

    pub fn record_failure(&mut self) {
        self.jobs_failed += 1;
    }

    /// Refresh (or add) a worker's liveness entry, then prune stale ones.
    pub fn touch_worker(&mut self, identity: &WorkerIdentity, now: DateTime<Utc>, window: Duration) {
        match self.workers_in_touch.iter_mut().find(|c| c.is(identity)) {
            Some(contact) => contact.last_seen = now,
            None => self.workers_in_touch.push(WorkerContact {
                host: identity.host.clone(),
                pid: identity.pid,
                last_seen: now,
            }),
        }
        self.prune_workers(now, window);
    }

    /// Drop entries last seen at or before `now - window`.
    pub fn prune_workers(&mut self, now: DateTime<Utc>, window: Duration) {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = now.checked_sub_signed(window) else {
            return;
        };
        self.workers_in_touch.retain(|c| c.last_seen > cutoff);
    }

    pub fn forget_worker(&mut self, identity: &WorkerIdentity) {
        self.workers_in_touch.retain(|c| !c.is(identity));
    }

    pub fn is_in_touch(&self, identity: &WorkerIdentity) -> bool {
        self.workers_in_touch.iter().any(|c| c.is(identity))
    }

    pub fn average_processing_time(&self) -> f64 {
        if self.jobs_completed == 0 {
            0.0
        } else {
            self.total_time_used / self.jobs_completed as f64
        }
    }
}

/// Snapshot returned by `JobQueue::stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub jobs_waiting_unordered: usize,
    pub jobs_waiting_ordered: usize,
    /// 0 or 1.
    pub jobs_processing_ordered: usize,
    pub jobs_processing_unordered: usize,
    pub next_uuid: u64,
    pub last_job_submitted_at: Option<DateTime<Utc>>,
    pub last_job_completed_at: Option<DateTime<Utc>>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub total_time_used: f64,
    pub average_processing_time: f64,
    pub max_processing_time: f64,
    pub min_processing_time: f64,
    /// Process id of the worker started from this queue handle, if any.
    pub worker_pid: Option<u32>,
    pub workers_in_touch: Vec<WorkerContact>,
}

impl QueueStats {
    pub fn from_state(state: &QueueState, worker_pid: Option<u32>) -> Self {
        Self {
            jobs_waiting_unordered: state.waiting_unordered.len(),
            jobs_waiting_ordered: state.waiting_ordered.len(),
            jobs_processing_ordered: usize::from(state.processing_ordered.is_some()),
            jobs_processing_unordered: state.processing_unordered.len(),
            next_uuid: state.next_uuid,
            last_job_submitted_at: state.last_job_submitted_at,
            last_job_completed_at: state.last_job_completed_at,
            jobs_completed: state.jobs_completed,
            jobs_failed: state.jobs_failed,
            total_time_used: state.total_time_used,
            average_processing_time: state.average_processing_time(),
            max_processing_time: state.max_processing_time,
            min_processing_time: state.min_processing_time,
            worker_pid,
            workers_in_touch: state.workers_in_touch.clone(),
        }
    }
}

/// Full contents of every lane, returned by `JobQueue::jobs`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobListing {
    pub jobs_waiting_unordered: Vec<Job>,
    pub jobs_waiting_ordered: Vec<Job>,
    pub jobs_processing_ordered: Vec<Job>,
    pub jobs_processing_unordered: Vec<Job>,
}

impl JobListing {
    pub fn len(&self) -> usize {
        self.jobs_waiting_unordered.len()
            + self.jobs_waiting_ordered.len()
            + self.jobs_processing_ordered.len()
            + self.jobs_processing_unordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
