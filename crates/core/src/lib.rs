//! `stepqueue-core`: jobs, steps and their execution engine.
//!
//! This crate is **pure domain**: it knows how a job runs its steps, retries
//! and rolls them back, and hands failures to a handler or a log. Persistence
//! and scheduling live in `stepqueue-infra`, reached through [`JobLifecycle`].

pub mod action;
pub mod context;
pub mod descriptor;
pub mod error;
pub mod id;
pub mod job;
pub mod report;
pub mod step;

pub use action::{Action, ActionHandler, ActionRegistry, Arg, ClassRegistry, Receiver, Resolver, ScriptEvaluator};
pub use context::{ExecutionContext, JobLifecycle};
pub use descriptor::{Descriptor, DomainObject};
pub use error::{ActionError, JobError, JobResult, ResolveError};
pub use id::{JobUuid, WorkerIdentity};
pub use job::{Job, JobFailure, JobOutcome, JobSpec};
pub use report::{FailureLog, FailureReport, StepSummary, TracingFailureLog};
pub use step::{DEFAULT_TRIES, JobStep, StepSpec};
