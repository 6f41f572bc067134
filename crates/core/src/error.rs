//! Error model for job construction and step execution.

use serde_json::Value;
use thiserror::Error;

/// Result type used when building jobs and steps.
pub type JobResult<T> = Result<T, JobError>;

/// Construction-time error.
///
/// Raised while assembling a job or step, never while running one.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// A step was described without a `do` action.
    #[error("a `do` action is mandatory for each job step")]
    MissingAction,

    /// An action could not be interpreted (e.g. an empty method name).
    #[error("unsupported action: {0}")]
    InvalidAction(String),

    /// A job uuid could not be parsed.
    #[error("invalid job uuid: {0}")]
    InvalidUuid(String),
}

impl JobError {
    pub fn invalid_action(msg: impl Into<String>) -> Self {
        Self::InvalidAction(msg.into())
    }

    pub fn invalid_uuid(msg: impl Into<String>) -> Self {
        Self::InvalidUuid(msg.into())
    }
}

/// Failure to turn a descriptor back into a live receiver.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolveError {
    /// The class is known but no instance has the given id (any more).
    #[error("{class_name} with id {id} not found")]
    NotFound { class_name: String, id: Value },

    /// No class is registered under this name.
    #[error("unknown class `{0}`")]
    UnknownClass(String),
}

/// Error raised by a step action, a rollback action or a failure handler.
///
/// `Timeout` and `Unavailable` form the retriable category: they describe
/// transient transport conditions and make the step engine try again.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ActionError {
    /// A remote call did not answer in time.
    #[error("remote call timed out: {0}")]
    Timeout(String),

    /// A remote service refused or could not take the call.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// A target or argument descriptor could not be resolved.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// The receiver has no handler for the requested method.
    #[error("no handler for method `{0}`")]
    UnknownMethod(String),

    /// A script action was run without an evaluator being installed.
    #[error("script actions are disabled")]
    ScriptsDisabled,

    /// Any other, terminal failure.
    #[error("{0}")]
    Failed(String),
}

impl ActionError {
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Whether the step engine should retry after this error.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ActionError::Timeout(_) | ActionError::Unavailable(_))
    }
}
