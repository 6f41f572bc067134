//! Job steps and their retry/rollback engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::action::Action;
use crate::context::ExecutionContext;
use crate::descriptor::Descriptor;
use crate::error::{ActionError, JobError, JobResult};

/// Retry budget used when neither the step nor its job sets one.
pub const DEFAULT_TRIES: u32 = 3;

/// One action of a job, with an optional compensating rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStep {
    pub do_action: Action,
    #[serde(default)]
    pub do_args: Vec<Value>,
    #[serde(default)]
    pub rollback_action: Option<Action>,
    #[serde(default)]
    pub rollback_args: Vec<Value>,
    /// Receiver of symbolic actions; handlers registered on the execution
    /// context are used when absent.
    #[serde(default)]
    pub target: Option<Descriptor>,
    /// Overrides the job-level retry budget.
    #[serde(default)]
    pub tries: Option<u32>,
}

impl JobStep {
    pub fn new(do_action: Action) -> JobResult<Self> {
        do_action.validate()?;
        Ok(Self {
            do_action,
            do_args: Vec::new(),
            rollback_action: None,
            rollback_args: Vec::new(),
            target: None,
            tries: None,
        })
    }

    pub fn do_arg(mut self, arg: impl Into<Value>) -> Self {
        self.do_args.push(arg.into());
        self
    }

    pub fn do_args<I, V>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.do_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn rollback(mut self, action: Action) -> Self {
        self.rollback_action = Some(action);
        self
    }

    pub fn rollback_args<I, V>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.rollback_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn target(mut self, target: Descriptor) -> Self {
        self.target = Some(target);
        self
    }

    pub fn tries(mut self, tries: u32) -> Self {
        self.tries = Some(tries);
        self
    }

    /// Step override, else job default, else [`DEFAULT_TRIES`].
    pub fn retry_budget(&self, job_tries: Option<u32>) -> u32 {
        self.tries.or(job_tries).unwrap_or(DEFAULT_TRIES)
    }

    /// Run the `do` action.
    ///
    /// Retriable failures roll back, then retry while budget remains.
    /// Non-retriable failures roll back once and propagate. If the rollback
    /// itself fails terminally, its error is what the caller sees.
    pub fn run(&self, job_tries: Option<u32>, ctx: &ExecutionContext) -> Result<Value, ActionError> {
        let mut remaining = self.retry_budget(job_tries);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match ctx.execute(Some(&self.do_action), self.target.as_ref(), &self.do_args) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retriable() => {
                    remaining = remaining.saturating_sub(1);
                    debug!(
                        action = %self.do_action,
                        attempt,
                        remaining,
                        error = %err,
                        "retriable step failure"
                    );
                    self.rollback_with_retries(job_tries, ctx)?;
                    if remaining > 0 {
                        continue;
                    }
                    return Err(err);
                }
                Err(err) => {
                    debug!(action = %self.do_action, attempt, error = %err, "step failed");
                    self.rollback_with_retries(job_tries, ctx)?;
                    return Err(err);
                }
            }
        }
    }

    /// Run the rollback action, if any, under the same retry budget.
    pub fn rollback_with_retries(
        &self,
        job_tries: Option<u32>,
        ctx: &ExecutionContext,
    ) -> Result<(), ActionError> {
        let Some(rollback) = self.rollback_action.as_ref() else {
            return Ok(());
        };
        let mut remaining = self.retry_budget(job_tries);

        loop {
            match ctx.execute(Some(rollback), self.target.as_ref(), &self.rollback_args) {
                Ok(_) => return Ok(()),
                Err(err) if err.is_retriable() => {
                    remaining = remaining.saturating_sub(1);
                    if remaining > 0 {
                        continue;
                    }
                    warn!(action = %rollback, error = %err, "rollback gave up after retries");
                    return Err(err);
                }
                Err(err) => {
                    warn!(action = %rollback, error = %err, "rollback failed");
                    return Err(err);
                }
            }
        }
    }
}

/// Declarative form of a step, e.g. as read from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepSpec {
    #[serde(rename = "do")]
    pub do_action: Option<Action>,
    pub do_args: Vec<Value>,
    pub rollback: Option<Action>,
    pub rollback_args: Vec<Value>,
    pub target: Option<Descriptor>,
    pub tries: Option<u32>,
}

impl TryFrom<StepSpec> for JobStep {
    type Error = JobError;

    fn try_from(spec: StepSpec) -> Result<Self, Self::Error> {
        let do_action = spec.do_action.ok_or(JobError::MissingAction)?;
        if let Some(rollback) = &spec.rollback {
            rollback.validate()?;
        }
        let mut step = JobStep::new(do_action)?;
        step.do_args = spec.do_args;
        step.rollback_action = spec.rollback;
        step.rollback_args = spec.rollback_args;
        step.target = spec.target;
        step.tries = spec.tries;
        Ok(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionRegistry, Arg, ClassRegistry, Receiver};
    use crate::error::ResolveError;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn ctx_with(actions: ActionRegistry) -> ExecutionContext {
        ExecutionContext::new(actions, Arc::new(ClassRegistry::new()))
    }

    fn counting<F>(
        count: &Arc<AtomicUsize>,
        result: F,
    ) -> impl Fn(&[Arg]) -> Result<Value, ActionError> + Send + Sync + 'static + use<F>
    where
        F: Fn() -> Result<Value, ActionError> + Send + Sync + 'static,
    {
        let count = count.clone();
        move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            result()
        }
    }

    #[test]
    fn requires_a_do_action() {
        let err = JobStep::try_from(StepSpec::default()).unwrap_err();
        assert_eq!(err, JobError::MissingAction);
        assert_eq!(err.to_string(), "a `do` action is mandatory for each job step");
    }

    #[test]
    fn declarative_step_converts() {
        let spec: StepSpec = serde_json::from_value(json!({
            "do": {"kind": "method", "name": "foo"},
            "do_args": [18, 0],
            "target": ["object_ref", "MyClass", 24],
            "tries": 2
        }))
        .unwrap();
        let step = JobStep::try_from(spec).unwrap();
        assert_eq!(step.do_action, Action::method("foo"));
        assert_eq!(step.do_args, vec![json!(18), json!(0)]);
        assert_eq!(step.target, Some(Descriptor::object("MyClass", 24)));
        assert_eq!(step.tries, Some(2));
    }

    #[test]
    fn returns_the_action_result() {
        let ctx = ctx_with(ActionRegistry::new().with("add", |args: &[Arg]| {
            let sum: i64 = args.iter().filter_map(|a| a.as_value()?.as_i64()).sum();
            Ok(json!(sum))
        }));
        let step = JobStep::new(Action::method("add")).unwrap().do_args([300, 45]);
        assert_eq!(step.run(None, &ctx).unwrap(), json!(345));
    }

    #[test]
    fn invokes_named_method_on_resolved_target() {
        let instance: Arc<dyn Receiver> = Arc::new(ActionRegistry::new().with("foo", |args: &[Arg]| {
            assert_eq!(args[0].as_value(), Some(&json!(18)));
            Ok(json!(10000018))
        }));
        let mut classes = ClassRegistry::new();
        classes.register(
            "MyClass",
            Arc::new(ActionRegistry::new()),
            move |id| (id == &json!(24)).then(|| instance.clone()),
        );
        let ctx = ExecutionContext::new(ActionRegistry::new(), Arc::new(classes));

        let step = JobStep::new(Action::method("foo"))
            .unwrap()
            .target(Descriptor::object("MyClass", 24))
            .do_args([18, 0]);
        assert_eq!(step.run(None, &ctx).unwrap(), json!(10000018));
    }

    #[test]
    fn retry_budget_falls_back_from_step_to_job_to_default() {
        let step = JobStep::new(Action::method("x")).unwrap();
        assert_eq!(step.retry_budget(None), DEFAULT_TRIES);
        assert_eq!(step.retry_budget(Some(2)), 2);
        assert_eq!(step.clone().tries(5).retry_budget(Some(2)), 5);
    }

    #[test]
    fn gives_up_after_step_tries_on_retriable_errors() {
        let calls = counter();
        let ctx = ctx_with(
            ActionRegistry::new().with("add", counting(&calls, || Err(ActionError::timeout("add")))),
        );
        let step = JobStep::new(Action::method("add")).unwrap().tries(5);

        assert_eq!(step.run(Some(2), &ctx).unwrap_err(), ActionError::timeout("add"));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn uses_job_tries_when_step_has_none() {
        let calls = counter();
        let ctx = ctx_with(
            ActionRegistry::new().with("add", counting(&calls, || Err(ActionError::timeout("add")))),
        );
        let step = JobStep::new(Action::method("add")).unwrap();

        assert!(step.run(Some(2), &ctx).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn uses_three_tries_when_nothing_is_specified() {
        let calls = counter();
        let ctx = ctx_with(
            ActionRegistry::new().with("add", counting(&calls, || Err(ActionError::unavailable("add")))),
        );
        let step = JobStep::new(Action::method("add")).unwrap();

        assert!(step.run(None, &ctx).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn recovers_when_a_retry_succeeds() {
        let calls = counter();
        let seen = calls.clone();
        let ctx = ctx_with(ActionRegistry::new().with("flaky", move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ActionError::timeout("flaky"))
            } else {
                Ok(json!("done"))
            }
        }));
        let step = JobStep::new(Action::method("flaky")).unwrap();

        assert_eq!(step.run(None, &ctx).unwrap(), json!("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn rolls_back_once_per_failed_attempt() {
        let calls = counter();
        let rollbacks = counter();
        let ctx = ctx_with(
            ActionRegistry::new()
                .with("add", counting(&calls, || Err(ActionError::timeout("add"))))
                .with("cleanup", counting(&rollbacks, || Ok(Value::Null))),
        );
        let step = JobStep::new(Action::method("add"))
            .unwrap()
            .rollback(Action::method("cleanup"))
            .rollback_args([88, 99]);

        assert_eq!(step.run(Some(2), &ctx).unwrap_err(), ActionError::timeout("add"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(rollbacks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn non_retriable_failure_rolls_back_then_stops() {
        let calls = counter();
        let rollbacks = counter();
        let ctx = ctx_with(
            ActionRegistry::new()
                .with("add", counting(&calls, || Err(ActionError::failed("boom"))))
                .with("cleanup", counting(&rollbacks, || Ok(Value::Null))),
        );
        let step = JobStep::new(Action::method("add"))
            .unwrap()
            .rollback(Action::method("cleanup"));

        assert_eq!(step.run(Some(2), &ctx).unwrap_err(), ActionError::failed("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retries_a_retriable_rollback_and_surfaces_its_error() {
        let calls = counter();
        let rollbacks = counter();
        let ctx = ctx_with(
            ActionRegistry::new()
                .with("add", counting(&calls, || Err(ActionError::timeout("add"))))
                .with("fixit", counting(&rollbacks, || Err(ActionError::unavailable("fixit")))),
        );
        let step = JobStep::new(Action::method("add"))
            .unwrap()
            .rollback(Action::method("fixit"))
            .tries(10);

        assert_eq!(step.run(None, &ctx).unwrap_err(), ActionError::unavailable("fixit"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rollbacks.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn non_retriable_rollback_failure_stops_immediately() {
        let calls = counter();
        let rollbacks = counter();
        let ctx = ctx_with(
            ActionRegistry::new()
                .with("add", counting(&calls, || Err(ActionError::timeout("add"))))
                .with("fixit", counting(&rollbacks, || Err(ActionError::failed("broken")))),
        );
        let step = JobStep::new(Action::method("add"))
            .unwrap()
            .rollback(Action::method("fixit"))
            .tries(10);

        assert_eq!(step.run(None, &ctx).unwrap_err(), ActionError::failed("broken"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_argument_object_fails_like_any_action_error() {
        let mut classes = ClassRegistry::new();
        classes.register_class("MyClass", Arc::new(ActionRegistry::new().with("foo", |_| Ok(json!(1)))));
        let ctx = ExecutionContext::new(ActionRegistry::new(), Arc::new(classes));

        let step = JobStep::new(Action::method("foo"))
            .unwrap()
            .target(Descriptor::class("MyClass"))
            .do_arg(Descriptor::object("MyClass", 24))
            .do_args([1, 2, 3]);
        assert_eq!(step.do_args[0], json!(["object_ref", "MyClass", 24]));

        let err = step.run(None, &ctx).unwrap_err();
        assert!(matches!(err, ActionError::Resolve(ResolveError::NotFound { .. })));
    }
}
