//! ---
//! frau_section: "02-messaging-protocol"
//! frau_subsection: "module"
//! frau_type: "source"
//! frau_scope: "code"
//! frau_description: "Message protocol core: envelopes, ports, requests and services."
//! frau_version: "v0.0.0-prealpha"
//! frau_owner: "tbd"
//! ---
//! Wire envelope codec.
//!
//! On the wire every message is `{ "key": "frau.<class>.<subtype>", "payload": .. }`.
//! Inbound keys are parsed once into an [`Envelope`]; nothing downstream
//! re-slices the key string.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::PortError;

/// Fixed prefix of every envelope key.
pub const KEY_PREFIX: &str = "frau.";

/// Message class multiplexed over one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// Fire-and-forget event (`evt`).
    Event,
    /// Correlated request (`req`).
    Request,
    /// Reply to a request (`res`).
    Response,
}

impl MessageClass {
    /// Three letter wire code.
    pub const fn code(self) -> &'static str {
        match self {
            MessageClass::Event => "evt",
            MessageClass::Request => "req",
            MessageClass::Response => "res",
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for MessageClass {
    type Err = PortError;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        if code.len() != 3 {
            return Err(PortError::InvalidMessageClass(code.to_owned()));
        }
        match code {
            "evt" => Ok(MessageClass::Event),
            "req" => Ok(MessageClass::Request),
            "res" => Ok(MessageClass::Response),
            other => Err(PortError::InvalidMessageClass(other.to_owned())),
        }
    }
}

/// Parsed envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Message class.
    pub class: MessageClass,
    /// Event name or request type.
    pub subtype: String,
    /// Opaque payload.
    pub payload: Value,
}

impl Envelope {
    /// Construct an envelope.
    pub fn new(class: MessageClass, subtype: impl Into<String>, payload: Value) -> Self {
        Self {
            class,
            subtype: subtype.into(),
            payload,
        }
    }

    /// Wire key, `frau.<class>.<subtype>`.
    pub fn key(&self) -> String {
        format!("{}{}.{}", KEY_PREFIX, self.class.code(), self.subtype)
    }

    /// Encode into the two-field wire value.
    pub fn to_value(&self) -> Value {
        json!({
            "key": self.key(),
            "payload": self.payload,
        })
    }

    /// Decode a wire value. Malformed data yields `None`, never an error.
    pub fn decode(data: &Value) -> Option<Self> {
        let key = data.get("key")?.as_str()?;
        let (class, subtype) = split_key(key)?;
        let payload = data.get("payload").cloned().unwrap_or(Value::Null);
        Some(Self::new(class, subtype, payload))
    }
}

/// Split a wire key into its class and a non-empty subtype.
pub fn split_key(key: &str) -> Option<(MessageClass, &str)> {
    let rest = key.strip_prefix(KEY_PREFIX)?;
    let class = rest.get(..3)?.parse::<MessageClass>().ok()?;
    let subtype = rest.get(3..)?.strip_prefix('.')?;
    if subtype.is_empty() {
        return None;
    }
    Some((class, subtype))
}

/// `req` payload: `{ id, args }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    /// Correlation id, `<port id>_<counter>`.
    pub id: String,
    /// Positional call arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

impl RequestPayload {
    /// Encode as a payload value.
    pub fn to_value(&self) -> Value {
        json!({ "id": self.id, "args": self.args })
    }

    /// Decode from a payload value.
    pub fn from_value(payload: Value) -> Option<Self> {
        serde_json::from_value(payload).ok()
    }
}

/// Result half of a `res` payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseOutcome {
    /// `val` field.
    Value(Value),
    /// `err` field, still in transferable form.
    Error(Value),
}

/// `res` payload: `{ id, val }` or `{ id, err }`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponsePayload {
    /// Id of the request being answered.
    pub id: String,
    /// Value or transferable error.
    pub outcome: ResponseOutcome,
}

impl ResponsePayload {
    /// Successful reply.
    pub fn success(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: id.into(),
            outcome: ResponseOutcome::Value(value),
        }
    }

    /// Failed reply carrying a transferable error.
    pub fn failure(id: impl Into<String>, err: Value) -> Self {
        Self {
            id: id.into(),
            outcome: ResponseOutcome::Error(err),
        }
    }

    /// Encode as a payload value.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".into(), Value::String(self.id.clone()));
        match &self.outcome {
            ResponseOutcome::Value(value) => map.insert("val".into(), value.clone()),
            ResponseOutcome::Error(err) => map.insert("err".into(), err.clone()),
        };
        Value::Object(map)
    }

    /// Decode from a payload value. The presence of `err`, not its
    /// truthiness, marks a failure; a missing `val` reads as null.
    pub fn from_value(payload: &Value) -> Option<Self> {
        let map = payload.as_object()?;
        let id = map.get("id")?.as_str()?.to_owned();
        let outcome = match map.get("err") {
            Some(err) => ResponseOutcome::Error(err.clone()),
            None => ResponseOutcome::Value(map.get("val").cloned().unwrap_or(Value::Null)),
        };
        Some(Self { id, outcome })
    }
}
