//! Actions, receivers and the resolver seam.
//!
//! A step names what to do as an [`Action`]. Symbolic actions are dispatched
//! to a [`Receiver`]: the step's resolved target if it has one, otherwise the
//! [`ActionRegistry`] of handlers registered up front. Free-form script text
//! is a separate, opt-in action kind that only runs when a
//! [`ScriptEvaluator`] has been installed.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::descriptor::Descriptor;
use crate::error::{ActionError, JobError, ResolveError};

/// What a step (or its rollback) executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Action {
    /// Invoke a named method on the step target, or on a registered handler
    /// when the step has no target.
    Method(String),
    /// Evaluate free-form source text. Unsafe; requires an evaluator.
    Script(String),
}

impl Action {
    pub fn method(name: impl Into<String>) -> Self {
        Self::Method(name.into())
    }

    pub fn script(source: impl Into<String>) -> Self {
        Self::Script(source.into())
    }

    /// Reject actions that can never be dispatched.
    pub fn validate(&self) -> Result<(), JobError> {
        match self {
            Action::Method(name) if name.trim().is_empty() => {
                Err(JobError::invalid_action("empty method name"))
            }
            Action::Script(source) if source.trim().is_empty() => {
                Err(JobError::invalid_action("empty script"))
            }
            _ => Ok(()),
        }
    }
}

impl core::fmt::Display for Action {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Action::Method(name) => write!(f, ":{name}"),
            Action::Script(source) => write!(f, "script {source:?}"),
        }
    }
}

/// An argument as seen by a handler, after descriptors were resolved.
#[derive(Clone)]
pub enum Arg {
    Value(Value),
    Object {
        descriptor: Descriptor,
        receiver: Arc<dyn Receiver>,
    },
    /// The error that made a job fail; first argument of failure handlers.
    Error(ActionError),
}

impl Arg {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Arg::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_receiver(&self) -> Option<&Arc<dyn Receiver>> {
        match self {
            Arg::Object { receiver, .. } => Some(receiver),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ActionError> {
        match self {
            Arg::Error(err) => Some(err),
            _ => None,
        }
    }
}

impl core::fmt::Debug for Arg {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Arg::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Arg::Object { descriptor, .. } => f.debug_tuple("Object").field(descriptor).finish(),
            Arg::Error(err) => f.debug_tuple("Error").field(err).finish(),
        }
    }
}

/// Something named methods can be invoked on: a live domain object, a class,
/// or a table of registered handlers.
pub trait Receiver: Send + Sync {
    fn invoke(&self, method: &str, args: &[Arg]) -> Result<Value, ActionError>;
}

/// Handler function type.
pub type ActionHandler = Arc<dyn Fn(&[Arg]) -> Result<Value, ActionError> + Send + Sync>;

/// Lookup table of named handlers.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, ActionHandler>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a method name, replacing any previous one.
    pub fn register<F>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(&[Arg]) -> Result<Value, ActionError> + Send + Sync + 'static,
    {
        self.handlers.insert(method.into(), Arc::new(handler));
    }

    pub fn with<F>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&[Arg]) -> Result<Value, ActionError> + Send + Sync + 'static,
    {
        self.register(method, handler);
        self
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }
}

impl Receiver for ActionRegistry {
    fn invoke(&self, method: &str, args: &[Arg]) -> Result<Value, ActionError> {
        let handler = self
            .handlers
            .get(method)
            .ok_or_else(|| ActionError::UnknownMethod(method.to_string()))?;
        handler(args)
    }
}

impl core::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("ActionRegistry").field("handlers", &names).finish()
    }
}

/// Turns descriptors back into live receivers.
///
/// Implementations stand in for the application's data-access layer.
/// `resolve` must fail with [`ResolveError::NotFound`] when the id no longer
/// resolves.
pub trait Resolver: Send + Sync {
    fn resolve(&self, class_name: &str, id: &Value) -> Result<Arc<dyn Receiver>, ResolveError>;

    fn resolve_class(&self, class_name: &str) -> Result<Arc<dyn Receiver>, ResolveError>;

    fn resolve_descriptor(&self, descriptor: &Descriptor) -> Result<Arc<dyn Receiver>, ResolveError> {
        match descriptor {
            Descriptor::Object { class_name, id } => self.resolve(class_name, id),
            Descriptor::Class { class_name } => self.resolve_class(class_name),
        }
    }

    /// Resolve every descriptor in an encoded argument list; other values pass through.
    fn resolve_args(&self, args: &[Value]) -> Result<Vec<Arg>, ResolveError> {
        args.iter()
            .map(|value| match Descriptor::decode(value) {
                Some(descriptor) => {
                    let receiver = self.resolve_descriptor(&descriptor)?;
                    Ok(Arg::Object {
                        descriptor,
                        receiver,
                    })
                }
                None => Ok(Arg::Value(value.clone())),
            })
            .collect()
    }
}

type Finder = Arc<dyn Fn(&Value) -> Option<Arc<dyn Receiver>> + Send + Sync>;

struct ClassEntry {
    class: Arc<dyn Receiver>,
    finder: Option<Finder>,
}

/// In-process [`Resolver`] backed by registered classes and finder functions.
#[derive(Default)]
pub struct ClassRegistry {
    classes: HashMap<String, ClassEntry>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class whose instances cannot be looked up.
    pub fn register_class(&mut self, class_name: impl Into<String>, class: Arc<dyn Receiver>) {
        self.classes
            .insert(class_name.into(), ClassEntry { class, finder: None });
    }

    /// Register a class together with a finder for its instances.
    pub fn register<F>(&mut self, class_name: impl Into<String>, class: Arc<dyn Receiver>, finder: F)
    where
        F: Fn(&Value) -> Option<Arc<dyn Receiver>> + Send + Sync + 'static,
    {
        self.classes.insert(
            class_name.into(),
            ClassEntry {
                class,
                finder: Some(Arc::new(finder)),
            },
        );
    }
}

impl Resolver for ClassRegistry {
    fn resolve(&self, class_name: &str, id: &Value) -> Result<Arc<dyn Receiver>, ResolveError> {
        let entry = self
            .classes
            .get(class_name)
            .ok_or_else(|| ResolveError::UnknownClass(class_name.to_string()))?;
        entry
            .finder
            .as_ref()
            .and_then(|find| find(id))
            .ok_or_else(|| ResolveError::NotFound {
                class_name: class_name.to_string(),
                id: id.clone(),
            })
    }

    fn resolve_class(&self, class_name: &str) -> Result<Arc<dyn Receiver>, ResolveError> {
        self.classes
            .get(class_name)
            .map(|entry| entry.class.clone())
            .ok_or_else(|| ResolveError::UnknownClass(class_name.to_string()))
    }
}

impl core::fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut names: Vec<_> = self.classes.keys().collect();
        names.sort();
        f.debug_struct("ClassRegistry").field("classes", &names).finish()
    }
}

/// Evaluates [`Action::Script`] source text.
///
/// Installing one is an explicit opt-in: script text is arbitrary code.
pub trait ScriptEvaluator: Send + Sync {
    fn eval(&self, source: &str) -> Result<Value, ActionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sum(args: &[Arg]) -> Result<Value, ActionError> {
        let total: i64 = args
            .iter()
            .filter_map(|a| a.as_value().and_then(Value::as_i64))
            .sum();
        Ok(json!(total))
    }

    #[test]
    fn registry_dispatches_by_method_name() {
        let registry = ActionRegistry::new().with("sum", sum);
        let args = vec![Arg::Value(json!(18)), Arg::Value(json!(24))];
        assert_eq!(registry.invoke("sum", &args).unwrap(), json!(42));
        assert_eq!(
            registry.invoke("product", &args).unwrap_err(),
            ActionError::UnknownMethod("product".into())
        );
    }

    #[test]
    fn action_validation_rejects_blank_names() {
        assert!(Action::method("foo").validate().is_ok());
        assert!(matches!(
            Action::method("  ").validate(),
            Err(JobError::InvalidAction(_))
        ));
        assert!(Action::script("").validate().is_err());
    }

    #[test]
    fn actions_serialize_with_their_kind() {
        let encoded = serde_json::to_value(Action::method("foo")).unwrap();
        assert_eq!(encoded, json!({"kind": "method", "name": "foo"}));
        assert!(serde_json::from_value::<Action>(json!({"kind": "lambda", "name": "x"})).is_err());
    }

    #[test]
    fn class_registry_resolves_classes_instances_and_arguments() {
        let class: Arc<dyn Receiver> = Arc::new(ActionRegistry::new().with("kind", |_| Ok(json!("class"))));
        let instance: Arc<dyn Receiver> =
            Arc::new(ActionRegistry::new().with("kind", |_| Ok(json!("instance"))));

        let mut classes = ClassRegistry::new();
        classes.register("Order", class, move |id| {
            (id == &json!(24)).then(|| instance.clone())
        });

        let found = classes.resolve("Order", &json!(24)).unwrap();
        assert_eq!(found.invoke("kind", &[]).unwrap(), json!("instance"));
        let class = classes.resolve_class("Order").unwrap();
        assert_eq!(class.invoke("kind", &[]).unwrap(), json!("class"));

        assert_eq!(
            classes.resolve("Order", &json!(25)).err(),
            Some(ResolveError::NotFound {
                class_name: "Order".into(),
                id: json!(25)
            })
        );
        assert!(matches!(
            classes.resolve_class("Invoice"),
            Err(ResolveError::UnknownClass(_))
        ));

        let args = classes
            .resolve_args(&[json!(1), json!(["object_ref", "Order", 24]), json!("x")])
            .unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args[0].as_value(), Some(&json!(1)));
        let receiver = args[1].as_receiver().unwrap();
        assert_eq!(receiver.invoke("kind", &[]).unwrap(), json!("instance"));
        assert!(classes
            .resolve_args(&[json!(["object_ref", "Order", 99])])
            .is_err());
    }
}
