//! Execution context shared by all jobs a worker runs.

use std::sync::Arc;

use serde_json::Value;

use crate::action::{Action, ActionRegistry, Arg, ClassRegistry, Receiver, Resolver, ScriptEvaluator};
use crate::descriptor::Descriptor;
use crate::error::ActionError;
use crate::job::Job;
use crate::report::{FailureLog, TracingFailureLog};

/// Completion/failure bookkeeping a job reports to when it finishes.
///
/// Implemented by the job queue; a job never touches the store itself.
pub trait JobLifecycle {
    fn complete(&self, job: &mut Job) -> anyhow::Result<()>;

    fn fail(&self, job: &mut Job) -> anyhow::Result<()>;
}

/// Everything a step needs to dispatch its actions.
#[derive(Clone)]
pub struct ExecutionContext {
    actions: Arc<ActionRegistry>,
    resolver: Arc<dyn Resolver>,
    scripts: Option<Arc<dyn ScriptEvaluator>>,
    failure_log: Arc<dyn FailureLog>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(ActionRegistry::new(), Arc::new(ClassRegistry::new()))
    }
}

impl ExecutionContext {
    pub fn new(actions: ActionRegistry, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            actions: Arc::new(actions),
            resolver,
            scripts: None,
            failure_log: Arc::new(TracingFailureLog),
        }
    }

    /// Opt in to [`Action::Script`] steps.
    pub fn allow_scripts(mut self, evaluator: Arc<dyn ScriptEvaluator>) -> Self {
        self.scripts = Some(evaluator);
        self
    }

    pub fn with_failure_log(mut self, log: Arc<dyn FailureLog>) -> Self {
        self.failure_log = log;
        self
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    pub fn resolver(&self) -> &dyn Resolver {
        self.resolver.as_ref()
    }

    pub fn failure_log(&self) -> &dyn FailureLog {
        self.failure_log.as_ref()
    }

    /// Execute an action against an optional target with encoded arguments.
    ///
    /// An absent action is a no-op returning `null`. Target and arguments are
    /// resolved here, at the moment of execution, never earlier.
    pub fn execute(
        &self,
        action: Option<&Action>,
        target: Option<&Descriptor>,
        args: &[Value],
    ) -> Result<Value, ActionError> {
        match action {
            None => Ok(Value::Null),
            Some(Action::Script(source)) => match &self.scripts {
                Some(evaluator) => evaluator.eval(source),
                None => Err(ActionError::ScriptsDisabled),
            },
            Some(Action::Method(method)) => {
                let args = self.resolver.resolve_args(args)?;
                self.invoke(method, target, &args)
            }
        }
    }

    /// Invoke `method` on the resolved target, or on the registered handlers
    /// when there is no target.
    pub fn invoke(
        &self,
        method: &str,
        target: Option<&Descriptor>,
        args: &[Arg],
    ) -> Result<Value, ActionError> {
        match target {
            Some(descriptor) => {
                let receiver = self.resolver.resolve_descriptor(descriptor)?;
                receiver.invoke(method, args)
            }
            None => self.actions.invoke(method, args),
        }
    }
}

impl core::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("actions", &self.actions)
            .field("scripts", &self.scripts.is_some())
            .finish_non_exhaustive()
    }
}
