//! Diagnostic records for jobs that fail without a failure handler.

use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::id::{JobUuid, WorkerIdentity};
use crate::job::{Job, JobFailure};

/// Receives a report for every failed job that has no failure handler.
pub trait FailureLog: Send + Sync {
    fn record(&self, report: &FailureReport);
}

/// Summary of one step, as shown in a failure report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSummary {
    pub target: Option<Value>,
    pub do_action: String,
    pub do_args: Vec<Value>,
    pub rollback_action: Option<String>,
    pub rollback_args: Vec<Value>,
    pub tries: Option<u32>,
}

/// Structured description of a failed job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReport {
    pub uuid: Option<JobUuid>,
    pub ordered: bool,
    pub synchronous: bool,
    pub worker: WorkerIdentity,
    pub error: String,
    /// Index of the step that failed; `None` when completion itself failed.
    pub failed_step: Option<usize>,
    pub steps: Vec<StepSummary>,
    pub backtrace: Vec<String>,
}

impl FailureReport {
    pub fn new(job: &Job, failure: &JobFailure) -> Self {
        let steps = job
            .steps
            .iter()
            .map(|step| StepSummary {
                target: step.target.as_ref().map(|t| t.encode()),
                do_action: step.do_action.to_string(),
                do_args: step.do_args.clone(),
                rollback_action: step.rollback_action.as_ref().map(ToString::to_string),
                rollback_args: step.rollback_args.clone(),
                tries: step.tries,
            })
            .collect();

        Self {
            uuid: job.uuid,
            ordered: job.is_ordered(),
            synchronous: job.synchronous,
            worker: WorkerIdentity::current(),
            error: failure.error.to_string(),
            failed_step: failure.step,
            steps,
            backtrace: failure.backtrace_lines(),
        }
    }
}

/// Default [`FailureLog`]: one structured `error!` event per report.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingFailureLog;

impl FailureLog for TracingFailureLog {
    fn record(&self, report: &FailureReport) {
        let steps = serde_json::to_string(&report.steps).unwrap_or_default();
        let backtrace = if report.backtrace.is_empty() {
            "no backtrace available".to_string()
        } else {
            report.backtrace.join("\n")
        };
        error!(
            job_uuid = ?report.uuid.map(JobUuid::get),
            ordered = report.ordered,
            synchronous = report.synchronous,
            worker = %report.worker,
            failed_step = ?report.failed_step,
            step_count = report.steps.len(),
            steps = %steps,
            error = %report.error,
            backtrace = %backtrace,
            "enqueued job failed"
        );
    }
}
