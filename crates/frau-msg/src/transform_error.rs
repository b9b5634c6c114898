//! ---
//! frau_section: "02-messaging-protocol"
//! frau_subsection: "module"
//! frau_type: "source"
//! frau_scope: "code"
//! frau_description: "Message protocol core: envelopes, ports, requests and services."
//! frau_version: "v0.0.0-prealpha"
//! frau_owner: "tbd"
//! ---
//! Conversion between local values (which may contain native errors and
//! callables) and their structurally cloneable wire form.
//!
//! The translation is deliberately lossy:
//!
//! * callables become `null`;
//! * only an error's `name`, `message` and own properties survive. The
//!   receiving side always rebuilds a plain [`NativeError`], so a
//!   `TypeError` arrives as a `NativeError` whose `name` is `"TypeError"`.
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Number, Value};

/// Marker key identifying a transferred error object.
pub const ERROR_OBJECT_SENTINEL: &str = "_ifrau-error-object";

/// Error name used when a request arrives for a type nobody handles.
pub const REQUEST_TYPE_ERROR: &str = "RequestTypeError";

/// Callable value; cannot cross the boundary.
pub type Callable = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// A value on one side of the boundary.
#[derive(Clone)]
pub enum LocalValue {
    /// `null`.
    Null,
    /// Boolean scalar.
    Bool(bool),
    /// Numeric scalar.
    Number(Number),
    /// String scalar.
    String(String),
    /// Ordered list.
    Array(Vec<LocalValue>),
    /// Plain object with own enumerable properties.
    Object(IndexMap<String, LocalValue>),
    /// Native error object.
    Error(Box<NativeError>),
    /// Function-typed value.
    Function(Callable),
}

impl LocalValue {
    /// Wrap a closure as a function-typed value.
    pub fn function(f: impl Fn(&[Value]) -> Value + Send + Sync + 'static) -> Self {
        LocalValue::Function(Arc::new(f))
    }

    /// The native error, when this value is one.
    pub fn as_error(&self) -> Option<&NativeError> {
        match self {
            LocalValue::Error(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Debug for LocalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalValue::Null => f.write_str("Null"),
            LocalValue::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            LocalValue::Number(n) => f.debug_tuple("Number").field(n).finish(),
            LocalValue::String(s) => f.debug_tuple("String").field(s).finish(),
            LocalValue::Array(items) => f.debug_tuple("Array").field(items).finish(),
            LocalValue::Object(fields) => f.debug_tuple("Object").field(fields).finish(),
            LocalValue::Error(err) => f.debug_tuple("Error").field(err).finish(),
            LocalValue::Function(_) => f.write_str("Function"),
        }
    }
}

impl PartialEq for LocalValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LocalValue::Null, LocalValue::Null) => true,
            (LocalValue::Bool(a), LocalValue::Bool(b)) => a == b,
            (LocalValue::Number(a), LocalValue::Number(b)) => a == b,
            (LocalValue::String(a), LocalValue::String(b)) => a == b,
            (LocalValue::Array(a), LocalValue::Array(b)) => a == b,
            (LocalValue::Object(a), LocalValue::Object(b)) => a == b,
            (LocalValue::Error(a), LocalValue::Error(b)) => a == b,
            (LocalValue::Function(a), LocalValue::Function(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<Value> for LocalValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => LocalValue::Null,
            Value::Bool(b) => LocalValue::Bool(b),
            Value::Number(n) => LocalValue::Number(n),
            Value::String(s) => LocalValue::String(s),
            Value::Array(items) => LocalValue::Array(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                LocalValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<NativeError> for LocalValue {
    fn from(err: NativeError) -> Self {
        LocalValue::Error(Box::new(err))
    }
}

impl From<&str> for LocalValue {
    fn from(s: &str) -> Self {
        LocalValue::String(s.to_owned())
    }
}

impl From<String> for LocalValue {
    fn from(s: String) -> Self {
        LocalValue::String(s)
    }
}

impl From<bool> for LocalValue {
    fn from(b: bool) -> Self {
        LocalValue::Bool(b)
    }
}

impl From<i64> for LocalValue {
    fn from(n: i64) -> Self {
        LocalValue::Number(n.into())
    }
}

/// Native error object: a name, a message and arbitrary own properties.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeError {
    /// Error kind, e.g. `"TypeError"`.
    pub name: String,
    /// Human readable message.
    pub message: String,
    /// Own enumerable properties.
    pub props: IndexMap<String, LocalValue>,
}

impl NativeError {
    /// Error with the given name and message.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            props: IndexMap::new(),
        }
    }

    /// Base `Error` kind.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    /// `TypeError` kind.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    /// Error synthesized for a request type without a handler.
    pub fn no_handler(request_type: &str) -> Self {
        let message = if request_type.is_empty() {
            "No handler defined for request".to_owned()
        } else {
            format!("No onRequest handler for type \"{}\"", request_type)
        };
        Self::new(REQUEST_TYPE_ERROR, message)
    }

    /// Capture any std error as a base `Error`.
    pub fn from_std<E: std::error::Error + ?Sized>(err: &E) -> Self {
        Self::error(err.to_string())
    }

    /// Whether this is the missing-handler kind.
    pub fn is_no_handler(&self) -> bool {
        self.name == REQUEST_TYPE_ERROR
    }

    /// Attach an own property.
    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<LocalValue>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    /// Look up an own property.
    pub fn prop(&self, key: &str) -> Option<&LocalValue> {
        self.props.get(key)
    }
}

impl fmt::Display for NativeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

impl std::error::Error for NativeError {}

/// Convert a local value into its transferable form.
pub fn to_transferable(value: &LocalValue) -> Value {
    match value {
        LocalValue::Null => Value::Null,
        LocalValue::Bool(b) => Value::Bool(*b),
        LocalValue::Number(n) => Value::Number(n.clone()),
        LocalValue::String(s) => Value::String(s.clone()),
        LocalValue::Array(items) => Value::Array(items.iter().map(to_transferable).collect()),
        LocalValue::Object(fields) => Value::Object(transfer_fields(fields)),
        LocalValue::Error(err) => {
            let mut object = Map::new();
            object.insert("name".into(), Value::String(err.name.clone()));
            object.insert("message".into(), Value::String(err.message.clone()));
            object.insert("props".into(), Value::Object(transfer_fields(&err.props)));
            object.insert(ERROR_OBJECT_SENTINEL.into(), Value::Bool(true));
            Value::Object(object)
        }
        LocalValue::Function(_) => Value::Null,
    }
}

fn transfer_fields(fields: &IndexMap<String, LocalValue>) -> Map<String, Value> {
    fields
        .iter()
        .map(|(key, value)| (key.clone(), to_transferable(value)))
        .collect()
}

/// Rebuild a local value from its transferable form.
pub fn from_transferable(value: &Value) -> LocalValue {
    match value {
        Value::Array(items) => LocalValue::Array(items.iter().map(from_transferable).collect()),
        Value::Object(map) if map.get(ERROR_OBJECT_SENTINEL) == Some(&Value::Bool(true)) => {
            let mut err = NativeError::new(
                text_or(map.get("name"), "Error"),
                text_or(map.get("message"), ""),
            );
            if let Some(props) = map.get("props").and_then(Value::as_object) {
                err.props = restore_fields(props);
            }
            LocalValue::Error(Box::new(err))
        }
        Value::Object(map) => LocalValue::Object(restore_fields(map)),
        scalar => scalar.clone().into(),
    }
}

fn restore_fields(map: &Map<String, Value>) -> IndexMap<String, LocalValue> {
    map.iter()
        .map(|(key, value)| (key.clone(), from_transferable(value)))
        .collect()
}

fn text_or(value: Option<&Value>, fallback: &str) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        None | Some(Value::Null) => fallback.to_owned(),
        Some(other) => other.to_string(),
    }
}
