//! Jobs: ordered lists of steps, run as one unit of work.

use std::backtrace::Backtrace;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::action::Arg;
use crate::context::{ExecutionContext, JobLifecycle};
use crate::descriptor::Descriptor;
use crate::error::{ActionError, JobError};
use crate::id::{JobUuid, WorkerIdentity};
use crate::report::FailureReport;
use crate::step::{JobStep, StepSpec};

/// A background job.
///
/// Built in memory by the caller; the queue assigns `uuid` and the
/// timestamps. The job itself only reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Assigned on submission, never reused.
    pub uuid: Option<JobUuid>,
    ordered: bool,
    pub steps: Vec<JobStep>,
    /// Default retry budget for steps that do not set their own.
    pub tries: Option<u32>,
    /// Run in the caller instead of being queued.
    #[serde(default)]
    pub synchronous: bool,
    /// Method invoked with the triggering error when the job fails.
    pub failure_handler: Option<String>,
    pub failure_target: Option<Descriptor>,
    #[serde(default)]
    pub failure_args: Vec<Value>,
    /// Caller-supplied data, persisted and echoed back, never interpreted.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub begun_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: Option<f64>,
    /// Worker that claimed the job, when it identified itself.
    #[serde(default)]
    pub claimed_by: Option<WorkerIdentity>,
    /// Bumped by every claim. A copy whose count lags the stored record
    /// belongs to a holder that lost the job.
    #[serde(default)]
    pub claims: u32,
}

impl Job {
    /// Create an ordered job.
    pub fn new(steps: Vec<JobStep>) -> Self {
        Self {
            uuid: None,
            ordered: true,
            steps,
            tries: None,
            synchronous: false,
            failure_handler: None,
            failure_target: None,
            failure_args: Vec::new(),
            metadata: BTreeMap::new(),
            submitted_at: None,
            begun_at: None,
            completed_at: None,
            elapsed_seconds: None,
            claimed_by: None,
            claims: 0,
        }
    }

    /// Place the job in the unordered lane.
    pub fn unordered(mut self) -> Self {
        self.ordered = false;
        self
    }

    pub fn synchronous(mut self) -> Self {
        self.synchronous = true;
        self
    }

    pub fn tries(mut self, tries: u32) -> Self {
        self.tries = Some(tries);
        self
    }

    /// Invoke `method` on `target` (or on a registered handler) if the job fails.
    pub fn on_failure<I, V>(mut self, method: impl Into<String>, target: Option<Descriptor>, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.failure_handler = Some(method.into());
        self.failure_target = target;
        self.failure_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    /// Run every step in order, then report the outcome to `lifecycle`.
    ///
    /// Never propagates an error: a failed job is handed to its failure
    /// handler, or to the context's failure log when it has none.
    pub fn run(&mut self, lifecycle: &dyn JobLifecycle, ctx: &ExecutionContext) -> JobOutcome {
        let failure = match self.run_steps(ctx) {
            Ok(()) => match lifecycle.complete(self) {
                Ok(()) => {
                    debug!(job_uuid = ?self.uuid, "job completed");
                    return JobOutcome::Completed;
                }
                Err(err) => {
                    warn!(job_uuid = ?self.uuid, error = %err, "failed to complete job");
                    JobFailure::new(None, ActionError::failed(format!("completion failed: {err}")))
                }
            },
            Err(failure) => failure,
        };

        if let Err(err) = lifecycle.fail(self) {
            warn!(job_uuid = ?self.uuid, error = %err, "failed to mark job as failed");
        }

        match self.failure_handler.clone() {
            Some(handler) => self.invoke_failure_handler(&handler, &failure, ctx),
            None => ctx.failure_log().record(&FailureReport::new(self, &failure)),
        }

        JobOutcome::Failed(failure)
    }

    fn run_steps(&self, ctx: &ExecutionContext) -> Result<(), JobFailure> {
        for (index, step) in self.steps.iter().enumerate() {
            step.run(self.tries, ctx)
                .map_err(|error| JobFailure::new(Some(index), error))?;
        }
        Ok(())
    }

    fn invoke_failure_handler(&self, handler: &str, failure: &JobFailure, ctx: &ExecutionContext) {
        let resolved = match ctx.resolver().resolve_args(&self.failure_args) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(job_uuid = ?self.uuid, handler, error = %err, "failure handler arguments unresolvable");
                return;
            }
        };

        let mut args = Vec::with_capacity(resolved.len() + 1);
        args.push(Arg::Error(failure.error.clone()));
        args.extend(resolved);

        if let Err(err) = ctx.invoke(handler, self.failure_target.as_ref(), &args) {
            warn!(job_uuid = ?self.uuid, handler, error = %err, "failure handler raised");
        }
    }
}

/// Result of [`Job::run`].
#[derive(Debug)]
pub enum JobOutcome {
    Completed,
    Failed(JobFailure),
}

impl JobOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobOutcome::Completed)
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        match self {
            JobOutcome::Failed(failure) => Some(failure),
            JobOutcome::Completed => None,
        }
    }
}

/// The error that made a job fail, and where.
#[derive(Debug)]
pub struct JobFailure {
    pub step: Option<usize>,
    pub error: ActionError,
    pub backtrace: Backtrace,
}

impl JobFailure {
    pub fn new(step: Option<usize>, error: ActionError) -> Self {
        Self {
            step,
            error,
            backtrace: Backtrace::capture(),
        }
    }

    pub fn backtrace_lines(&self) -> Vec<String> {
        match self.backtrace.status() {
            std::backtrace::BacktraceStatus::Captured => {
                self.backtrace.to_string().lines().map(str::to_string).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Declarative form of a job, e.g. as read from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSpec {
    pub steps: Vec<StepSpec>,
    pub unordered: bool,
    pub synchronous: bool,
    pub tries: Option<u32>,
    pub on_failure: Option<String>,
    pub target: Option<Descriptor>,
    pub failure_args: Vec<Value>,
    pub metadata: BTreeMap<String, Value>,
}

impl TryFrom<JobSpec> for Job {
    type Error = JobError;

    fn try_from(spec: JobSpec) -> Result<Self, Self::Error> {
        let steps = spec
            .steps
            .into_iter()
            .map(JobStep::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let mut job = Job::new(steps);
        job.ordered = !spec.unordered;
        job.synchronous = spec.synchronous;
        job.tries = spec.tries;
        job.failure_handler = spec.on_failure;
        job.failure_target = spec.target;
        job.failure_args = spec.failure_args;
        job.metadata = spec.metadata;
        Ok(job)
    }
}
