//! Serializable stand-ins for references to external domain objects.
//!
//! Jobs never persist live objects. A target or argument that refers to a
//! domain object is turned into a [`Descriptor`] when the job is built, and
//! turned back into a live receiver only when the step actually runs, so the
//! receiver always reflects current state.
//!
//! Wire forms (JSON arrays):
//! - instance: `["object_ref", "<class>", <id>]`
//! - class:    `["class_ref", "<class>"]`

use serde::{Deserialize, Serialize};
use serde_json::Value;

const OBJECT_MARKER: &str = "object_ref";
const CLASS_MARKER: &str = "class_ref";

/// Reference to a domain object instance or to a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "Value", try_from = "Value")]
pub enum Descriptor {
    Object { class_name: String, id: Value },
    Class { class_name: String },
}

/// Implemented by domain objects that can be referenced from a job.
pub trait DomainObject {
    /// Name the resolver knows the object's class by.
    fn class_name(&self) -> &str;

    /// Identifier the resolver can look the object up by.
    fn object_id(&self) -> Value;
}

impl Descriptor {
    pub fn object(class_name: impl Into<String>, id: impl Into<Value>) -> Self {
        Self::Object {
            class_name: class_name.into(),
            id: id.into(),
        }
    }

    pub fn class(class_name: impl Into<String>) -> Self {
        Self::Class {
            class_name: class_name.into(),
        }
    }

    /// Describe a domain object instance.
    pub fn of<T: DomainObject + ?Sized>(object: &T) -> Self {
        Self::object(object.class_name(), object.object_id())
    }

    pub fn class_name(&self) -> &str {
        match self {
            Descriptor::Object { class_name, .. } | Descriptor::Class { class_name } => class_name,
        }
    }

    /// Recognise a descriptor in an encoded argument. Any other value yields `None`.
    pub fn decode(value: &Value) -> Option<Self> {
        let items = value.as_array()?;
        match items.as_slice() {
            [Value::String(marker), Value::String(class_name), id] if marker == OBJECT_MARKER => {
                Some(Self::object(class_name.clone(), id.clone()))
            }
            [Value::String(marker), Value::String(class_name)] if marker == CLASS_MARKER => {
                Some(Self::class(class_name.clone()))
            }
            _ => None,
        }
    }

    pub fn encode(&self) -> Value {
        match self {
            Descriptor::Object { class_name, id } => {
                Value::Array(vec![OBJECT_MARKER.into(), class_name.clone().into(), id.clone()])
            }
            Descriptor::Class { class_name } => {
                Value::Array(vec![CLASS_MARKER.into(), class_name.clone().into()])
            }
        }
    }
}

impl From<Descriptor> for Value {
    fn from(value: Descriptor) -> Self {
        value.encode()
    }
}

impl TryFrom<Value> for Descriptor {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Descriptor::decode(&value).ok_or_else(|| format!("not a descriptor: {value}"))
    }
}

impl core::fmt::Display for Descriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Descriptor::Object { class_name, id } => write!(f, "{class_name}#{id}"),
            Descriptor::Class { class_name } => f.write_str(class_name),
        }
    }
}
